use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{FilterError, Result};
use crate::labels::LabelVocabulary;

pub const DEFAULT_IMAGE_SIZE: u32 = 299;
pub const DEFAULT_TOPK_PREDICTIONS: usize = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api_host: String,
    pub api_port: u16,
    pub model_config: ModelConfig,
    pub fetch_config: FetchConfig,
    /// Outbound notification target; None keeps notifications in-process
    pub notify_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub model_uri: String,    // local path, file:// or http(s)://
    pub model_dir: PathBuf,   // download cache
    pub image_size: u32,
    pub top_k: usize,
    pub labels_path: Option<PathBuf>,
    pub inference_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    pub timeout_secs: u64,
    pub max_image_bytes: usize,
    /// Whether `file://` event URLs may be read from local disk
    pub allow_file_urls: bool,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_uri: "models/nsfw_mobilenet.onnx".to_string(),
            model_dir: PathBuf::from("models"),
            image_size: DEFAULT_IMAGE_SIZE,
            top_k: DEFAULT_TOPK_PREDICTIONS,
            labels_path: None,
            inference_threads: 4,
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_image_bytes: 10 * 1024 * 1024, // 10MB
            allow_file_urls: false,
        }
    }
}

impl ModelConfig {
    /// Load the configured label vocabulary and check it against `top_k`.
    pub fn load_vocabulary(&self) -> Result<LabelVocabulary> {
        let vocabulary = match &self.labels_path {
            Some(path) => LabelVocabulary::from_file(path)?,
            None => LabelVocabulary::default(),
        };

        if self.top_k > vocabulary.len() {
            return Err(FilterError::ConfigError(format!(
                "TOPK_PREDICTIONS ({}) exceeds vocabulary size ({})",
                self.top_k,
                vocabulary.len()
            )));
        }

        Ok(vocabulary)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let api_host = env::var("API_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let api_port = parse_var("API_PORT", 8088u16)?;

        let defaults = ModelConfig::default();
        let model_uri = env::var("MODEL_URI").unwrap_or(defaults.model_uri);
        let model_dir = env::var("MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.model_dir);

        let image_size = parse_var("IMAGE_SIZE", DEFAULT_IMAGE_SIZE)?;
        if image_size == 0 {
            return Err(FilterError::ConfigError("IMAGE_SIZE must be at least 1".to_string()));
        }

        let top_k = parse_var("TOPK_PREDICTIONS", DEFAULT_TOPK_PREDICTIONS)?;
        if top_k == 0 {
            return Err(FilterError::ConfigError(
                "TOPK_PREDICTIONS must be at least 1".to_string(),
            ));
        }

        let labels_path = env::var("LABELS_PATH")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let inference_threads = parse_var("INFERENCE_THREADS", defaults.inference_threads)?;

        let fetch_defaults = FetchConfig::default();
        let fetch_config = FetchConfig {
            timeout_secs: parse_var("FETCH_TIMEOUT_SECS", fetch_defaults.timeout_secs)?,
            max_image_bytes: parse_var("MAX_IMAGE_BYTES", fetch_defaults.max_image_bytes)?,
            allow_file_urls: parse_var("ALLOW_FILE_URLS", fetch_defaults.allow_file_urls)?,
        };

        let notify_webhook_url = env::var("NOTIFY_WEBHOOK_URL")
            .ok()
            .filter(|s| !s.trim().is_empty());

        Ok(Self {
            api_host,
            api_port,
            model_config: ModelConfig {
                model_uri,
                model_dir,
                image_size,
                top_k,
                labels_path,
                inference_threads,
            },
            fetch_config,
            notify_webhook_url,
        })
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e| {
            FilterError::ConfigError(format!("Invalid value for {}: {:?} ({})", name, raw, e))
        }),
        Err(_) => Ok(default),
    }
}
