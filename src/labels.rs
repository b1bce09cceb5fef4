//! Label vocabulary
//!
//! Ordered class names, index-aligned with the model's output vector.

use std::path::Path;

use crate::error::{FilterError, Result};

/// nsfwjs class order (index 0..=4)
pub const DEFAULT_NSFW_CLASSES: &[&str] = &["Drawing", "Hentai", "Neutral", "Porn", "Sexy"];

#[derive(Debug, Clone, PartialEq)]
pub struct LabelVocabulary {
    labels: Vec<String>,
}

impl LabelVocabulary {
    pub fn new(labels: Vec<String>) -> Result<Self> {
        if labels.is_empty() {
            return Err(FilterError::ConfigError(
                "Label vocabulary must not be empty".to_string(),
            ));
        }
        Ok(Self { labels })
    }

    /// Load labels from a JSON array file, or a plain file with one label per line.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            FilterError::ConfigError(format!(
                "Failed to read labels file {}: {}",
                path.display(),
                e
            ))
        })?;

        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        if raw.trim_start().starts_with('[') {
            let labels: Vec<String> = serde_json::from_str(raw)
                .map_err(|e| FilterError::ConfigError(format!("Invalid labels JSON: {}", e)))?;
            return Self::new(labels);
        }

        let labels = raw
            .lines()
            .map(|l| l.trim().to_string())
            .filter(|l| !l.is_empty())
            .collect();
        Self::new(labels)
    }

    pub fn get(&self, index: usize) -> Option<&str> {
        self.labels.get(index).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}

impl Default for LabelVocabulary {
    fn default() -> Self {
        Self {
            labels: DEFAULT_NSFW_CLASSES.iter().map(|s| s.to_string()).collect(),
        }
    }
}
