//! HTTP handler tests
//!
//! Handlers are invoked directly with their extractors, no socket involved.

use async_trait::async_trait;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use ndarray::Array4;
use nsfw_filter_node::{
    api::{self, RecordQuery},
    error::Result,
    ChannelNotifier, Classifier, CompletedLoadEvent, DecodedImage, Dispatcher, ImageFetcher,
    ImageModel, LabelVocabulary, ModelGate, RequestTracker, TabEnvelope, TabMessage,
};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

struct UniformModel;

impl ImageModel for UniformModel {
    fn predict(&self, _input: Array4<f32>) -> Result<Vec<f32>> {
        Ok(vec![0.2; 5])
    }
}

struct BlankFetcher;

#[async_trait]
impl ImageFetcher for BlankFetcher {
    async fn fetch(&self, _url: &str) -> Option<DecodedImage> {
        Some(DecodedImage::zeroed(4))
    }
}

fn setup(gate: ModelGate) -> (Arc<Dispatcher>, mpsc::UnboundedReceiver<TabEnvelope>) {
    let (notifier, rx) = ChannelNotifier::new();
    let dispatcher = Dispatcher::new(
        Arc::new(RequestTracker::new()),
        gate,
        Arc::new(BlankFetcher),
        Classifier::new(Arc::new(LabelVocabulary::default()), 3),
        Arc::new(notifier),
    );
    (Arc::new(dispatcher), rx)
}

fn event(json: &str) -> CompletedLoadEvent {
    serde_json::from_str(json).unwrap()
}

#[tokio::test]
async fn test_ingest_classifies_and_records() {
    let gate = ModelGate::new();
    gate.mark_ready(Arc::new(UniformModel));
    let (dispatcher, mut rx) = setup(gate);

    let status = api::ingest_event(
        State(dispatcher.clone()),
        Json(event(r#"{"url":"http://x/cat.png","tabId":7,"type":"image"}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let envelope = timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("notification within timeout")
        .unwrap();
    assert_eq!(envelope.tab_id, 7);
    let TabMessage::ImageProcessed(record) = envelope.message;
    // Uniform scores keep vocabulary order
    let names: Vec<_> = record
        .predictions
        .unwrap()
        .into_iter()
        .map(|p| p.class_name)
        .collect();
    assert_eq!(names, vec!["Drawing", "Hentai", "Neutral"]);

    let Json(stored) = api::get_record(
        State(dispatcher.clone()),
        Query(RecordQuery {
            url: "http://x/cat.png".to_string(),
        }),
    )
    .await
    .unwrap();
    assert_eq!(stored.tab_id, 7);
    assert!(stored.is_classified());
}

#[tokio::test]
async fn test_unknown_record_is_404() {
    let (dispatcher, _rx) = setup(ModelGate::new());
    let result = api::get_record(
        State(dispatcher),
        Query(RecordQuery {
            url: "http://x/none.png".to_string(),
        }),
    )
    .await;
    assert!(matches!(result, Err(StatusCode::NOT_FOUND)));
}

#[tokio::test]
async fn test_ignored_event_is_still_accepted() {
    let (dispatcher, _rx) = setup(ModelGate::new());
    let status = api::ingest_event(
        State(dispatcher.clone()),
        Json(event(r#"{"url":"http://x/style.css","tabId":7,"type":"stylesheet"}"#)),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(dispatcher.tracker().is_empty());
}

#[tokio::test]
async fn test_close_tab_returns_no_content() {
    let (dispatcher, _rx) = setup(ModelGate::new());
    let status = api::close_tab(State(dispatcher), Path(3)).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_health_reflects_model_state() {
    let gate = ModelGate::new();
    let (dispatcher, _rx) = setup(gate.clone());

    let Json(health) = api::health_handler(State(dispatcher.clone())).await;
    assert_eq!(health.status, "ok");
    assert_eq!(health.model, gate.state().label());
    assert_eq!(health.tracked_images, 0);

    gate.mark_failed("artifact missing");
    let Json(health) = api::health_handler(State(dispatcher)).await;
    assert_eq!(health.status, "degraded");
    assert_eq!(health.model, "failed");
}
