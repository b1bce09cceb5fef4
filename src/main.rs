#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::Result;
use std::sync::Arc;

use nsfw_filter_node::{
    api, metrics, model, ChannelNotifier, Classifier, Config, Dispatcher, HttpImageFetcher,
    ModelGate, Notifier, RequestTracker, TabMessage, WebhookNotifier,
};

/// Notification sink used when no webhook is configured
fn spawn_log_notifier() -> Arc<dyn Notifier> {
    let (notifier, mut rx) = ChannelNotifier::new();

    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let TabMessage::ImageProcessed(record) = &envelope.message;
            let top = record
                .predictions
                .as_ref()
                .and_then(|p| p.first())
                .map(|p| format!("{} ({:.3})", p.class_name, p.probability))
                .unwrap_or_default();
            tracing::info!(tab_id = envelope.tab_id, url = %record.url, top = %top, "IMAGE_PROCESSED");
        }
    });

    Arc::new(notifier)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging with filters
    // ONNX Runtime logs every session option at info; keep it at warn
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                tracing_subscriber::EnvFilter::new("info")
                    .add_directive("ort=warn".parse().unwrap())
            }),
        )
        .init();

    tracing::info!("Starting NSFW image filter node...");

    let config = Config::load()?;
    let vocabulary = Arc::new(config.model_config.load_vocabulary()?);
    tracing::info!(
        "Configuration loaded: image_size={}, top_k={}, classes={}",
        config.model_config.image_size,
        config.model_config.top_k,
        vocabulary.len()
    );

    metrics::init_metrics();

    // Model loads in the background; events arriving meanwhile wait on the gate
    let gate = ModelGate::new();
    model::spawn_model_loader(config.model_config.clone(), gate.clone());

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            tracing::info!("Delivering notifications to {}", url);
            Arc::new(WebhookNotifier::new(url.clone()))
        }
        None => {
            tracing::info!("No NOTIFY_WEBHOOK_URL set, logging notifications");
            spawn_log_notifier()
        }
    };

    let fetcher = Arc::new(HttpImageFetcher::new(
        &config.fetch_config,
        config.model_config.image_size,
    )?);
    let classifier = Classifier::new(vocabulary, config.model_config.top_k);

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(RequestTracker::new()),
        gate,
        fetcher,
        classifier,
        notifier,
    ));

    let router = api::create_router(dispatcher);

    tracing::info!(
        "API listening on http://{}:{}",
        config.api_host,
        config.api_port
    );
    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.api_host, config.api_port)).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown signal received");
        })
        .await?;

    Ok(())
}
