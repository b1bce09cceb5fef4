//! Model Loader
//!
//! Loads the pretrained NSFW classifier once per process and publishes its
//! readiness through a one-shot broadcast (`ModelGate`). Pending pipeline
//! tasks park on the gate instead of polling a timer.
//!
//! Lifecycle: `Unloaded -> Loading -> Ready`, or `Loading -> Failed` when the
//! artifact cannot be fetched or parsed. `Ready` and `Failed` are terminal.

use ndarray::Array4;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Value;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::ModelConfig;
use crate::error::{FilterError, Result};

/// A loaded classifier: a pure function from a `[1, H, W, 3]` pixel tensor to
/// the output score vector.
pub trait ImageModel: Send + Sync {
    fn predict(&self, input: Array4<f32>) -> Result<Vec<f32>>;
}

#[derive(Clone)]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready(Arc<dyn ImageModel>),
    Failed(String),
}

impl ModelState {
    pub fn label(&self) -> &'static str {
        match self {
            ModelState::Unloaded => "unloaded",
            ModelState::Loading => "loading",
            ModelState::Ready(_) => "ready",
            ModelState::Failed(_) => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ModelState::Ready(_) | ModelState::Failed(_))
    }
}

impl std::fmt::Debug for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelState::Failed(reason) => f.debug_tuple("Failed").field(reason).finish(),
            other => f.write_str(other.label()),
        }
    }
}

/// Process-wide readiness signal for the model handle.
#[derive(Clone)]
pub struct ModelGate {
    tx: Arc<watch::Sender<ModelState>>,
}

impl ModelGate {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ModelState::Unloaded);
        Self { tx: Arc::new(tx) }
    }

    pub fn state(&self) -> ModelState {
        self.tx.borrow().clone()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.tx.borrow(), ModelState::Ready(_))
    }

    /// The ready model, without waiting.
    pub fn current(&self) -> Option<Arc<dyn ImageModel>> {
        match &*self.tx.borrow() {
            ModelState::Ready(model) => Some(model.clone()),
            _ => None,
        }
    }

    pub fn mark_loading(&self) {
        self.transition(ModelState::Loading);
    }

    pub fn mark_ready(&self, model: Arc<dyn ImageModel>) {
        if self.transition(ModelState::Ready(model)) {
            crate::metrics::MODEL_READY.set(1);
        }
    }

    pub fn mark_failed(&self, reason: impl Into<String>) {
        self.transition(ModelState::Failed(reason.into()));
    }

    fn transition(&self, next: ModelState) -> bool {
        let mut applied = false;
        self.tx.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            info!("Model state transition: {:?} -> {:?}", current, next);
            *current = next;
            applied = true;
            true
        });
        applied
    }

    /// Wait until the model is ready. Resolves immediately when it already is,
    /// and with `ModelUnavailable` once loading has failed for good.
    pub async fn wait_ready(&self) -> Result<Arc<dyn ImageModel>> {
        let mut rx = self.tx.subscribe();
        let state = rx
            .wait_for(ModelState::is_terminal)
            .await
            .map_err(|e| FilterError::InternalError(format!("Model gate closed: {}", e)))?
            .clone();

        match state {
            ModelState::Ready(model) => Ok(model),
            ModelState::Failed(reason) => Err(FilterError::ModelUnavailable(reason)),
            _ => Err(FilterError::InternalError("Model gate in non-terminal state".to_string())),
        }
    }
}

impl Default for ModelGate {
    fn default() -> Self {
        Self::new()
    }
}

/// ONNX Runtime backed classifier
pub struct OnnxModel {
    session: Mutex<Session>,
    input_name: String,
}

impl std::fmt::Debug for OnnxModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnnxModel")
            .field("input_name", &self.input_name)
            .finish_non_exhaustive()
    }
}

impl OnnxModel {
    pub fn from_file(model_path: &Path, intra_threads: usize) -> Result<Self> {
        if !model_path.exists() {
            return Err(FilterError::ModelLoadError(format!(
                "Model not found: {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(|e| load_error(model_path, e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| load_error(model_path, e))?
            .with_intra_threads(intra_threads.max(1))
            .map_err(|e| load_error(model_path, e))?
            .commit_from_file(model_path)
            .map_err(|e| load_error(model_path, e))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .unwrap_or_else(|| "input".to_string());

        debug!(input = %input_name, "ONNX session created");

        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }
}

fn load_error(model_path: &Path, e: impl std::fmt::Display) -> FilterError {
    FilterError::ModelLoadError(format!(
        "Failed to load ONNX model from {}: {}",
        model_path.display(),
        e
    ))
}

impl ImageModel for OnnxModel {
    fn predict(&self, input: Array4<f32>) -> Result<Vec<f32>> {
        let input_value = Value::from_array(input)
            .map_err(|e| FilterError::InferenceError(format!("Failed to create input tensor: {}", e)))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| FilterError::InternalError(format!("Lock error: {}", e)))?;

        let outputs = session
            .run(ort::inputs![&self.input_name => input_value])
            .map_err(|e| FilterError::InferenceError(format!("Model run failed: {}", e)))?;

        let scores = outputs[0]
            .try_extract_array::<f32>()
            .map_err(|e| FilterError::InferenceError(format!("Failed to extract output tensor: {}", e)))?;
        let values: Vec<f32> = scores.iter().copied().collect();

        Ok(values)
    }
}

/// Maximum model size to download (200MB)
pub const MAX_MODEL_DOWNLOAD_SIZE: u64 = 200 * 1024 * 1024;

/// Resolve the configured model URI to a local file, downloading remote
/// artifacts into `model_dir` on first use.
pub async fn resolve_model_artifact(model_uri: &str, model_dir: &Path) -> Result<PathBuf> {
    if let Some(path) = model_uri.strip_prefix("file://") {
        return Ok(PathBuf::from(path));
    }

    if !(model_uri.starts_with("http://") || model_uri.starts_with("https://")) {
        return Ok(PathBuf::from(model_uri));
    }

    let file_name = model_uri
        .rsplit('/')
        .next()
        .map(|name| name.split(['?', '#']).next().unwrap_or(name))
        .filter(|name| !name.is_empty())
        .unwrap_or("model.onnx");
    let model_path = model_dir.join(file_name);

    if model_path.exists() {
        info!("✓ Model already exists at {:?}", model_path);
        return Ok(model_path);
    }

    tokio::fs::create_dir_all(model_dir).await.map_err(|e| {
        FilterError::ModelLoadError(format!("Failed to create {}: {}", model_dir.display(), e))
    })?;

    info!("📥 Downloading model from {}...", model_uri);
    let size = download_model(model_uri, &model_path).await?;
    info!("✅ Downloaded model ({} bytes) to {:?}", size, model_path);

    Ok(model_path)
}

async fn download_model(url: &str, path: &Path) -> Result<u64> {
    download_model_capped(url, path, MAX_MODEL_DOWNLOAD_SIZE).await
}

/// Stream `url` into `path`, aborting once more than `limit` bytes arrive.
async fn download_model_capped(url: &str, path: &Path, limit: u64) -> Result<u64> {
    use tokio::io::AsyncWriteExt;

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .map_err(|e| FilterError::ModelLoadError(e.to_string()))?;

    let mut response = client
        .get(url)
        .send()
        .await
        .map_err(|e| FilterError::ModelLoadError(format!("Download failed: {}", e)))?;

    if !response.status().is_success() {
        return Err(FilterError::ModelLoadError(format!(
            "HTTP error: {}",
            response.status()
        )));
    }

    if let Some(len) = response.content_length() {
        if len > limit {
            return Err(FilterError::ModelLoadError(format!(
                "Model too large: {} bytes (max: {} bytes)",
                len, limit
            )));
        }
    }

    // Write to a temp name first so a partial download is never picked up as the model
    let partial = path.with_extension("part");
    let mut file = tokio::fs::File::create(&partial)
        .await
        .map_err(|e| FilterError::ModelLoadError(e.to_string()))?;

    let mut size: u64 = 0;
    loop {
        let chunk = match response.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(FilterError::ModelLoadError(format!("Download failed: {}", e)));
            }
        };

        size += chunk.len() as u64;
        if size > limit {
            drop(file);
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(FilterError::ModelLoadError(format!(
                "Model too large: more than {} bytes",
                limit
            )));
        }

        file.write_all(&chunk)
            .await
            .map_err(|e| FilterError::ModelLoadError(e.to_string()))?;
    }

    file.flush()
        .await
        .map_err(|e| FilterError::ModelLoadError(e.to_string()))?;
    tokio::fs::rename(&partial, path)
        .await
        .map_err(|e| FilterError::ModelLoadError(e.to_string()))?;

    Ok(size)
}

/// Run one inference on a zero tensor so lazy allocation happens before the
/// first real image. The output is discarded.
pub fn warm_up(model: &dyn ImageModel, image_size: u32) -> Result<()> {
    let side = image_size as usize;
    let zeros = Array4::<f32>::zeros((1, side, side, 3));
    model.predict(zeros).map(|_| ())
}

/// Load and warm up the configured model, publishing the outcome on `gate`.
pub async fn load_model(config: &ModelConfig, gate: &ModelGate) -> Result<()> {
    info!("Loading model...");
    let start = Instant::now();
    gate.mark_loading();

    match load_onnx_model(config).await {
        Ok(model) => {
            gate.mark_ready(model);
            info!(
                "✅ Model loaded and initialized in {}ms",
                start.elapsed().as_millis()
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "❌ Model load failed; images will not be classified");
            gate.mark_failed(e.to_string());
            Err(e)
        }
    }
}

async fn load_onnx_model(config: &ModelConfig) -> Result<Arc<dyn ImageModel>> {
    let model_path = resolve_model_artifact(&config.model_uri, &config.model_dir).await?;
    let image_size = config.image_size;
    let threads = config.inference_threads;

    tokio::task::spawn_blocking(move || -> Result<Arc<dyn ImageModel>> {
        let model = OnnxModel::from_file(&model_path, threads)?;

        let warm_start = Instant::now();
        warm_up(&model, image_size).map_err(|e| {
            FilterError::ModelLoadError(format!("Warm-up inference failed: {}", e))
        })?;
        debug!("Warm-up inference took {}ms", warm_start.elapsed().as_millis());

        Ok(Arc::new(model))
    })
    .await
    .map_err(|e| FilterError::InternalError(format!("Model load task panicked: {}", e)))?
}

/// Start loading in the background; the returned handle resolves when the
/// gate has reached a terminal state.
pub fn spawn_model_loader(config: ModelConfig, gate: ModelGate) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if load_model(&config, &gate).await.is_err() {
            warn!("Model stays unavailable until the process restarts");
        }
    })
}
