pub mod api;
pub mod classifier;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod fetcher;
pub mod labels;
pub mod metrics;
pub mod model;
pub mod notifier;
pub mod tracker;

// Re-export commonly used types for easier testing
pub use crate::classifier::{top_k_classes, ClassificationResult, Classifier, Prediction};
pub use crate::config::{Config, FetchConfig, ModelConfig};
pub use crate::dispatcher::{CompletedLoadEvent, Dispatcher, ProcessOutcome, ResourceType};
pub use crate::error::FilterError;
pub use crate::fetcher::{DecodedImage, HttpImageFetcher, ImageFetcher};
pub use crate::labels::LabelVocabulary;
pub use crate::model::{ImageModel, ModelGate, ModelState, OnnxModel};
pub use crate::notifier::{ChannelNotifier, Notifier, TabEnvelope, TabMessage, WebhookNotifier};
pub use crate::tracker::{ImageRequestRecord, RequestTracker, TabId};
