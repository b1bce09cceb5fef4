//! Classifier
//!
//! Turns a decoded image into the top-K labeled scores of the model:
//! NHWC float tensor, `(v - 127.5) / 127.5` normalization, batch of one,
//! model call, then top-K selection over the output vector.

use ndarray::Array4;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::error::{FilterError, Result};
use crate::fetcher::DecodedImage;
use crate::labels::LabelVocabulary;
use crate::model::ImageModel;

const PIXEL_OFFSET: f32 = 127.5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Prediction {
    pub class_name: String,
    /// Raw model output for this class (not renormalized)
    pub probability: f32,
}

/// Exactly K predictions, sorted by non-increasing probability.
pub type ClassificationResult = Vec<Prediction>;

/// Build the `[1, H, W, 3]` input tensor, mapping 0..=255 to roughly [-1, 1].
pub fn to_input_tensor(image: &DecodedImage) -> Array4<f32> {
    let pixels = image.pixels();
    let (width, height) = pixels.dimensions();

    Array4::<f32>::from_shape_fn((1, height as usize, width as usize, 3), |(_, y, x, c)| {
        let p = pixels.get_pixel(x as u32, y as u32);
        (p[c] as f32 - PIXEL_OFFSET) / PIXEL_OFFSET
    })
}

/// Indices and values of the `k` largest entries, largest first.
///
/// The sort is stable, so among exactly equal values the lower index comes
/// first. NaN scores rank below every real number.
pub fn top_k_classes(values: &[f32], k: usize) -> Vec<(usize, f32)> {
    let rank = |v: f32| if v.is_nan() { f32::NEG_INFINITY } else { v };

    let mut indexed: Vec<(usize, f32)> = values.iter().copied().enumerate().collect();
    indexed.sort_by(|a, b| {
        rank(b.1)
            .partial_cmp(&rank(a.1))
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    indexed.truncate(k);
    indexed
}

#[derive(Debug, Clone)]
pub struct Classifier {
    vocabulary: Arc<LabelVocabulary>,
    top_k: usize,
}

impl Classifier {
    pub fn new(vocabulary: Arc<LabelVocabulary>, top_k: usize) -> Self {
        Self { vocabulary, top_k }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub fn vocabulary(&self) -> &LabelVocabulary {
        &self.vocabulary
    }

    /// Map a raw output vector to labeled top-K predictions.
    pub fn label_predictions(&self, scores: &[f32]) -> Result<ClassificationResult> {
        if scores.len() != self.vocabulary.len() {
            return Err(FilterError::InferenceError(format!(
                "Malformed model output: expected {} scores, got {}",
                self.vocabulary.len(),
                scores.len()
            )));
        }

        top_k_classes(scores, self.top_k)
            .into_iter()
            .map(|(index, probability)| {
                let class_name = self.vocabulary.get(index).ok_or_else(|| {
                    FilterError::InferenceError(format!("No label for class index {}", index))
                })?;
                Ok(Prediction {
                    class_name: class_name.to_string(),
                    probability,
                })
            })
            .collect()
    }

    /// Classify one image. Inference runs on the blocking pool; the input
    /// tensor is moved into the model call and freed when it returns.
    pub async fn classify(
        &self,
        image: &DecodedImage,
        model: Arc<dyn ImageModel>,
    ) -> Result<ClassificationResult> {
        let input = to_input_tensor(image);
        let start = Instant::now();

        let scores = tokio::task::spawn_blocking(move || model.predict(input))
            .await
            .map_err(|e| FilterError::InferenceError(format!("Inference task panicked: {}", e)))??;

        let elapsed = start.elapsed();
        crate::metrics::INFERENCE_LATENCY.observe(elapsed.as_secs_f64());
        debug!(latency_ms = elapsed.as_millis() as u64, "Inference completed");

        self.label_predictions(&scores)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedModel(Vec<f32>);

    impl ImageModel for FixedModel {
        fn predict(&self, _input: Array4<f32>) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    fn classifier(top_k: usize) -> Classifier {
        Classifier::new(Arc::new(LabelVocabulary::default()), top_k)
    }

    #[test]
    fn test_normalization_range() {
        let mut img = DecodedImage::zeroed(2);
        img.pixels_mut().put_pixel(1, 0, image::Rgb([255, 127, 0]));

        let tensor = to_input_tensor(&img);
        assert_eq!(tensor.shape(), &[1, 2, 2, 3]);
        assert_eq!(tensor[[0, 0, 0, 0]], -1.0);
        assert_eq!(tensor[[0, 0, 1, 0]], 1.0);
        assert!((tensor[[0, 0, 1, 1]] - (-0.5 / 127.5)).abs() < 1e-6);
        assert_eq!(tensor[[0, 0, 1, 2]], -1.0);
    }

    #[test]
    fn test_top_k_orders_descending() {
        let values = [0.1, 0.7, 0.05, 0.9, 0.15];
        let top = top_k_classes(&values, 3);
        assert_eq!(top, vec![(3, 0.9), (1, 0.7), (4, 0.15)]);
    }

    #[test]
    fn test_top_k_returned_dominate_rest() {
        let values = [0.3, 0.1, 0.8, 0.4, 0.2, 0.6];
        for k in 1..=values.len() {
            let top = top_k_classes(&values, k);
            assert_eq!(top.len(), k);
            let chosen: Vec<usize> = top.iter().map(|(i, _)| *i).collect();
            let min_chosen = top.iter().map(|(_, v)| *v).fold(f32::INFINITY, f32::min);
            for (i, v) in values.iter().enumerate() {
                if !chosen.contains(&i) {
                    assert!(min_chosen >= *v);
                }
            }
        }
    }

    #[test]
    fn test_top_k_ties_keep_index_order() {
        let values = [0.2, 0.5, 0.1, 0.5, 0.5];
        let top = top_k_classes(&values, 3);
        assert_eq!(top, vec![(1, 0.5), (3, 0.5), (4, 0.5)]);
    }

    #[test]
    fn test_top_k_nan_ranks_last() {
        let values = [f32::NAN, 0.1, 0.3];
        let top = top_k_classes(&values, 2);
        assert_eq!(top, vec![(2, 0.3), (1, 0.1)]);
    }

    #[test]
    fn test_label_predictions_rejects_wrong_length() {
        let result = classifier(2).label_predictions(&[0.1, 0.2]);
        assert!(matches!(result, Err(FilterError::InferenceError(_))));
    }

    #[tokio::test]
    async fn test_classify_zero_image_returns_k_sorted() {
        let model: Arc<dyn ImageModel> = Arc::new(FixedModel(vec![0.05, 0.1, 0.7, 0.1, 0.05]));
        let result = classifier(5)
            .classify(&DecodedImage::zeroed(8), model)
            .await
            .unwrap();

        assert_eq!(result.len(), 5);
        assert_eq!(result[0].class_name, "Neutral");
        assert_eq!(result[1].class_name, "Hentai");
        assert_eq!(result[2].class_name, "Porn");
        assert!(result.windows(2).all(|w| w[0].probability >= w[1].probability));
    }
}
