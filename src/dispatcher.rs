//! Dispatcher
//!
//! Drives each tracked URL through
//! `registered -> waiting-for-model -> fetching -> classifying -> done`:
//! waits for the model gate, fetches the image once, classifies it once,
//! stores the predictions on the record and notifies the owning tab.
//!
//! URLs are processed independently. A per-URL in-flight marker keeps
//! duplicate completed-load events from starting a second classification, and
//! each tab owns a cancellation scope that is tripped when the tab closes.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::classifier::{ClassificationResult, Classifier};
use crate::fetcher::ImageFetcher;
use crate::model::{ImageModel, ModelGate};
use crate::notifier::{Notifier, TabMessage};
use crate::tracker::{is_valid_tab, RequestTracker, TabId};

/// Resource type reported with a completed-load event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Image,
    Object,
    MainFrame,
    SubFrame,
    Stylesheet,
    Script,
    Font,
    Xmlhttprequest,
    Media,
    #[serde(other)]
    Other,
}

impl ResourceType {
    /// Only image-bearing resources are classified.
    pub fn is_image(&self) -> bool {
        matches!(self, ResourceType::Image | ResourceType::Object)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceType::Image => "image",
            ResourceType::Object => "object",
            ResourceType::MainFrame => "main_frame",
            ResourceType::SubFrame => "sub_frame",
            ResourceType::Stylesheet => "stylesheet",
            ResourceType::Script => "script",
            ResourceType::Font => "font",
            ResourceType::Xmlhttprequest => "xmlhttprequest",
            ResourceType::Media => "media",
            ResourceType::Other => "other",
        }
    }
}

/// Completed-load notification from the network layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedLoadEvent {
    pub url: String,
    pub tab_id: TabId,
    #[serde(rename = "type", alias = "resourceType")]
    pub resource_type: ResourceType,
}

/// How a single `process` call ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Predictions are stored and the owning tab was notified
    Notified,
    /// No record exists for the URL
    Untracked,
    /// Record belongs to a non-tab context
    NotDispatchable,
    /// Another task is already classifying this URL; it will notify
    AlreadyInFlight,
    /// Image could not be fetched or decoded; no notification
    FetchFailed,
    /// Model call failed for this image; no notification
    InferenceFailed,
    /// Model failed to load and will never become ready
    ModelUnavailable,
    /// Owning tab closed while work was in flight
    Cancelled,
}

/// Cancellation scope shared by every task a tab currently has running
struct TabScope {
    token: CancellationToken,
    active: usize,
}

type TabScopes = Arc<DashMap<TabId, TabScope>>;

/// Membership of one task in its tab's scope. The scope entry is dropped with
/// the last member, so idle tabs hold no state.
struct TabScopeGuard {
    tab_id: TabId,
    token: CancellationToken,
    scopes: TabScopes,
}

impl TabScopeGuard {
    fn enter(scopes: &TabScopes, tab_id: TabId) -> Self {
        let mut scope = scopes.entry(tab_id).or_insert_with(|| TabScope {
            token: CancellationToken::new(),
            active: 0,
        });
        scope.active += 1;

        Self {
            tab_id,
            token: scope.token.clone(),
            scopes: scopes.clone(),
        }
    }
}

impl Drop for TabScopeGuard {
    fn drop(&mut self) {
        // A cancelled scope was already removed by close_tab; any entry now
        // under this tab id belongs to a newer scope.
        if self.token.is_cancelled() {
            return;
        }

        let idle = match self.scopes.get_mut(&self.tab_id) {
            Some(mut scope) => {
                scope.active = scope.active.saturating_sub(1);
                scope.active == 0
            }
            None => false,
        };
        if idle {
            self.scopes.remove_if(&self.tab_id, |_, scope| scope.active == 0);
        }
    }
}

pub struct Dispatcher {
    tracker: Arc<RequestTracker>,
    gate: ModelGate,
    fetcher: Arc<dyn ImageFetcher>,
    classifier: Classifier,
    notifier: Arc<dyn Notifier>,
    tab_scopes: TabScopes,
}

impl Dispatcher {
    pub fn new(
        tracker: Arc<RequestTracker>,
        gate: ModelGate,
        fetcher: Arc<dyn ImageFetcher>,
        classifier: Classifier,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            tracker,
            gate,
            fetcher,
            classifier,
            notifier,
            tab_scopes: Arc::new(DashMap::new()),
        }
    }

    pub fn tracker(&self) -> &RequestTracker {
        &self.tracker
    }

    pub fn gate(&self) -> &ModelGate {
        &self.gate
    }

    /// Register a completed-load event and, for image loads from a real tab,
    /// start its pipeline on a new task.
    pub fn handle_event(self: &Arc<Self>, event: CompletedLoadEvent) -> Option<JoinHandle<ProcessOutcome>> {
        crate::metrics::EVENTS_RECEIVED
            .with_label_values(&[event.resource_type.as_str()])
            .inc();

        if !event.resource_type.is_image() {
            crate::metrics::EVENTS_IGNORED.inc();
            return None;
        }

        self.tracker.observe(&event.url, event.tab_id);

        // The record keeps the first tab that loaded the URL
        let owner = self
            .tracker
            .get(&event.url)
            .filter(|record| record.is_dispatchable())
            .map(|record| record.tab_id);
        let Some(tab_id) = owner else {
            debug!(url = %event.url, tab_id = event.tab_id, "Tracked non-tab request, not dispatching");
            return None;
        };

        // Join the tab's scope before spawning so a close that lands before
        // the task first runs still cancels it
        let scope = TabScopeGuard::enter(&self.tab_scopes, tab_id);
        let dispatcher = Arc::clone(self);
        Some(tokio::spawn(async move {
            dispatcher.process_in_scope(&event.url, scope).await
        }))
    }

    /// Run the pipeline for one URL under its owning tab's scope.
    pub async fn process(&self, url: &str) -> ProcessOutcome {
        let Some(record) = self.tracker.get(url) else {
            return ProcessOutcome::Untracked;
        };
        if !record.is_dispatchable() {
            return ProcessOutcome::NotDispatchable;
        }

        let scope = TabScopeGuard::enter(&self.tab_scopes, record.tab_id);
        self.process_in_scope(url, scope).await
    }

    async fn process_in_scope(&self, url: &str, scope: TabScopeGuard) -> ProcessOutcome {
        // Covers the model wait as well as fetch and inference
        tokio::select! {
            biased;
            _ = scope.token.cancelled() => {
                crate::metrics::CANCELLATIONS.inc();
                debug!(url = %url, tab_id = scope.tab_id, "Tab closed, classification cancelled");
                ProcessOutcome::Cancelled
            }
            outcome = self.run_pipeline(url) => outcome,
        }
    }

    async fn run_pipeline(&self, url: &str) -> ProcessOutcome {
        let model = match self.gate.current() {
            Some(model) => model,
            None => {
                debug!(url = %url, "Model not ready, waiting");
                match self.gate.wait_ready().await {
                    Ok(model) => model,
                    Err(e) => {
                        warn!(url = %url, error = %e, "Dropping image, model unavailable");
                        return ProcessOutcome::ModelUnavailable;
                    }
                }
            }
        };

        let Some(record) = self.tracker.get(url) else {
            return ProcessOutcome::Untracked;
        };
        if !record.is_dispatchable() {
            return ProcessOutcome::NotDispatchable;
        }

        if !record.is_classified() {
            let Some(_guard) = self.tracker.try_begin(url) else {
                crate::metrics::DUPLICATES_SKIPPED.inc();
                debug!(url = %url, "Classification already in flight");
                return ProcessOutcome::AlreadyInFlight;
            };

            // Re-check under the marker: a task that just finished may have
            // attached predictions between the lookup above and the claim.
            let classified = self
                .tracker
                .get(url)
                .map(|r| r.is_classified())
                .unwrap_or(false);

            if !classified {
                match self.fetch_and_classify(url, model).await {
                    Ok(predictions) => {
                        self.tracker.attach_predictions(url, predictions);
                        crate::metrics::CLASSIFICATIONS.inc();
                    }
                    Err(outcome) => return outcome,
                }
            }
        }

        match self.tracker.get(url) {
            Some(record) if record.is_classified() => {
                let tab_id = record.tab_id;
                self.notifier.notify(tab_id, TabMessage::ImageProcessed(record));
                crate::metrics::NOTIFICATIONS_SENT.inc();
                debug!(url = %url, tab_id, "IMAGE_PROCESSED sent");
                ProcessOutcome::Notified
            }
            _ => ProcessOutcome::Untracked,
        }
    }

    async fn fetch_and_classify(
        &self,
        url: &str,
        model: Arc<dyn ImageModel>,
    ) -> std::result::Result<ClassificationResult, ProcessOutcome> {
        let Some(image) = self.fetcher.fetch(url).await else {
            crate::metrics::FETCH_FAILURES.inc();
            return Err(ProcessOutcome::FetchFailed);
        };

        self.classifier.classify(&image, model).await.map_err(|e| {
            crate::metrics::INFERENCE_FAILURES.inc();
            error!(url = %url, error = %e, "Classification failed");
            ProcessOutcome::InferenceFailed
        })
    }

    /// The tab is gone: cancel everything it has queued or in flight. A
    /// later event from the same tab id starts with a fresh scope.
    pub fn close_tab(&self, tab_id: TabId) {
        if !is_valid_tab(tab_id) {
            return;
        }
        if let Some((_, scope)) = self.tab_scopes.remove(&tab_id) {
            scope.token.cancel();
            info!(tab_id, tasks = scope.active, "Tab closed, pending classifications cancelled");
        }
    }

    /// Number of tabs with queued or in-flight work.
    pub fn active_tab_scopes(&self) -> usize {
        self.tab_scopes.len()
    }
}
