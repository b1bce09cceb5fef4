//! Request Tracker
//!
//! Owned store of every image URL observed in a completed-load event, together
//! with the requesting tab and (once classified) its predictions. Records are
//! created once, receive predictions at most once, and live for the lifetime
//! of the process.

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::classifier::ClassificationResult;

/// Identifier of the browser tab (or other context) that loaded an image.
pub type TabId = i64;

/// Whether a tab id refers to a real tab. Background and extension requests
/// carry -1 (or 0) and are tracked but never notified.
pub fn is_valid_tab(tab_id: TabId) -> bool {
    tab_id > 0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRequestRecord {
    pub url: String,
    pub tab_id: TabId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<ClassificationResult>,
}

impl ImageRequestRecord {
    pub fn new(url: impl Into<String>, tab_id: TabId) -> Self {
        Self {
            url: url.into(),
            tab_id,
            predictions: None,
        }
    }

    pub fn is_dispatchable(&self) -> bool {
        is_valid_tab(self.tab_id)
    }

    pub fn is_classified(&self) -> bool {
        self.predictions.is_some()
    }
}

#[derive(Default)]
pub struct RequestTracker {
    records: DashMap<String, ImageRequestRecord>,
    in_flight: Arc<DashSet<String>>,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `url` for `tab_id`. An existing record is left untouched, so
    /// the first observed tab wins. Returns true if a record was created.
    pub fn observe(&self, url: &str, tab_id: TabId) -> bool {
        if self.records.contains_key(url) {
            return false;
        }

        let mut created = false;
        self.records.entry(url.to_string()).or_insert_with(|| {
            created = true;
            ImageRequestRecord::new(url, tab_id)
        });

        if created {
            crate::metrics::TRACKED_IMAGES.inc();
            tracing::debug!(url = %url, tab_id, "Tracking image request");
        }
        created
    }

    pub fn get(&self, url: &str) -> Option<ImageRequestRecord> {
        self.records.get(url).map(|r| r.value().clone())
    }

    /// Attach predictions to an existing, not yet classified record.
    /// Returns true only when this call stored them.
    pub fn attach_predictions(&self, url: &str, predictions: ClassificationResult) -> bool {
        match self.records.get_mut(url) {
            Some(mut record) if record.predictions.is_none() => {
                record.predictions = Some(predictions);
                true
            }
            Some(_) => {
                tracing::debug!(url = %url, "Predictions already attached, keeping first result");
                false
            }
            None => false,
        }
    }

    /// Claim the per-URL classification slot. Returns None while another task
    /// holds it; the slot is released when the guard is dropped.
    pub fn try_begin(&self, url: &str) -> Option<InFlightGuard> {
        if self.in_flight.insert(url.to_string()) {
            Some(InFlightGuard {
                url: url.to_string(),
                in_flight: self.in_flight.clone(),
            })
        } else {
            None
        }
    }

    pub fn is_in_flight(&self, url: &str) -> bool {
        self.in_flight.contains(url)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// RAII guard for a URL currently being fetched and classified
pub struct InFlightGuard {
    url: String,
    in_flight: Arc<DashSet<String>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight.remove(&self.url);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::Prediction;

    fn predictions(label: &str, probability: f32) -> ClassificationResult {
        vec![Prediction {
            class_name: label.to_string(),
            probability,
        }]
    }

    #[test]
    fn test_observe_keeps_first_tab() {
        let tracker = RequestTracker::new();

        assert!(tracker.observe("http://x/a.jpg", 7));
        assert!(!tracker.observe("http://x/a.jpg", 9));

        let record = tracker.get("http://x/a.jpg").unwrap();
        assert_eq!(record.tab_id, 7);
        assert!(record.predictions.is_none());
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_attach_predictions_is_write_once() {
        let tracker = RequestTracker::new();
        tracker.observe("http://x/a.jpg", 1);

        assert!(tracker.attach_predictions("http://x/a.jpg", predictions("Neutral", 0.9)));
        assert!(!tracker.attach_predictions("http://x/a.jpg", predictions("Porn", 0.8)));

        let stored = tracker.get("http://x/a.jpg").unwrap().predictions.unwrap();
        assert_eq!(stored, predictions("Neutral", 0.9));
    }

    #[test]
    fn test_attach_predictions_missing_record() {
        let tracker = RequestTracker::new();
        assert!(!tracker.attach_predictions("http://x/missing.jpg", predictions("Neutral", 0.9)));
        assert!(tracker.get("http://x/missing.jpg").is_none());
    }

    #[test]
    fn test_observe_does_not_reset_predictions() {
        let tracker = RequestTracker::new();
        tracker.observe("http://x/a.jpg", 1);
        tracker.attach_predictions("http://x/a.jpg", predictions("Drawing", 0.5));

        tracker.observe("http://x/a.jpg", 1);
        assert!(tracker.get("http://x/a.jpg").unwrap().is_classified());
    }

    #[test]
    fn test_non_tab_records_not_dispatchable() {
        let tracker = RequestTracker::new();
        tracker.observe("http://x/bg.png", -1);
        tracker.observe("http://x/zero.png", 0);

        assert!(!tracker.get("http://x/bg.png").unwrap().is_dispatchable());
        assert!(!tracker.get("http://x/zero.png").unwrap().is_dispatchable());
    }

    #[test]
    fn test_in_flight_guard_releases_on_drop() {
        let tracker = RequestTracker::new();

        let guard = tracker.try_begin("http://x/a.jpg");
        assert!(guard.is_some());
        assert!(tracker.try_begin("http://x/a.jpg").is_none());
        assert!(tracker.is_in_flight("http://x/a.jpg"));

        drop(guard);
        assert!(!tracker.is_in_flight("http://x/a.jpg"));
        assert!(tracker.try_begin("http://x/a.jpg").is_some());
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let mut record = ImageRequestRecord::new("http://x/a.jpg", 3);
        record.predictions = Some(predictions("Sexy", 0.25));

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["tabId"], 3);
        assert_eq!(json["predictions"][0]["className"], "Sexy");
        assert_eq!(json["predictions"][0]["probability"], 0.25);
    }
}
