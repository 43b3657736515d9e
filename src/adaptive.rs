use crate::classifier::{cosine_similarity, LeafClassifier, LeafImage};
use crate::config::LearningConfig;
use crate::error::{ClassificationError, LeafcareError, Result};
use crate::types::AdaptivePrediction;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Base classifier plus a per-class memory of confirmed embeddings.
///
/// Each class whose stored patterns contain at least one embedding close to
/// the current image adds one `confidence_boost`, no matter how many of its
/// patterns match. The total is clamped to 1.0.
pub struct AdaptiveClassifier {
    classifier: Arc<dyn LeafClassifier>,
    feature_memory: HashMap<String, VecDeque<Vec<f32>>>,
    confidence_boost: f64,
    boost_threshold: f64,
    similar_threshold: f64,
    per_class_cap: usize,
}

impl AdaptiveClassifier {
    pub fn new(classifier: Arc<dyn LeafClassifier>, learning: &LearningConfig) -> Self {
        Self {
            classifier,
            feature_memory: HashMap::new(),
            confidence_boost: learning.confidence_boost,
            boost_threshold: learning.boost_similarity_threshold,
            similar_threshold: learning.similarity_threshold,
            per_class_cap: learning.feature_memory_cap,
        }
    }

    pub fn predict_with_memory(
        &self,
        image: &LeafImage,
    ) -> std::result::Result<AdaptivePrediction, ClassificationError> {
        let base = self.classifier.predict(image)?;
        let embedding = self.classifier.embed(image)?;

        let mut memory_boost = 0.0;
        let mut similar_cases = 0;
        for (label, patterns) in &self.feature_memory {
            let mut boosted = false;
            for pattern in patterns {
                let similarity = cosine_similarity(&embedding, pattern);
                if similarity > self.boost_threshold && !boosted {
                    memory_boost += self.confidence_boost;
                    boosted = true;
                    debug!("Pattern match for {} ({:.3})", label, similarity);
                }
                if similarity > self.similar_threshold {
                    similar_cases += 1;
                }
            }
        }

        let confidence = (base.confidence + memory_boost).clamp(0.0, 1.0);

        Ok(AdaptivePrediction {
            class: base.label,
            confidence,
            base_confidence: base.confidence,
            memory_boost,
            similar_cases,
            class_index: base.class_index,
            description: base.description,
            recommendation: base.recommendation,
            embedding,
        })
    }

    /// Embed the image and remember it under the confirmed label
    #[allow(dead_code)]
    pub fn update_memory(&mut self, image: &LeafImage, confirmed_label: &str) -> Result<()> {
        let embedding = self.classifier.embed(image)?;
        self.update_memory_with_embedding(embedding, confirmed_label)
    }

    pub fn update_memory_with_embedding(
        &mut self,
        embedding: Vec<f32>,
        confirmed_label: &str,
    ) -> Result<()> {
        let cap = self.per_class_cap;
        let patterns = self
            .feature_memory
            .entry(confirmed_label.to_string())
            .or_default();
        patterns.push_back(embedding);
        while patterns.len() > cap {
            patterns.pop_front();
        }

        if patterns.len() > cap {
            return Err(LeafcareError::CapacityInvariant {
                store: "feature memory",
                len: patterns.len(),
                capacity: cap,
            });
        }
        Ok(())
    }

    /// Number of classes with stored patterns
    pub fn feature_classes(&self) -> usize {
        self.feature_memory.len()
    }

    /// Stored patterns for a class, oldest first
    #[allow(dead_code)]
    pub fn patterns_for(&self, label: &str) -> Option<&VecDeque<Vec<f32>>> {
        self.feature_memory.get(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubClassifier;

    fn adaptive(stub: StubClassifier) -> AdaptiveClassifier {
        AdaptiveClassifier::new(Arc::new(stub), &LearningConfig::default())
    }

    #[test]
    fn test_no_memory_means_no_boost() {
        let clf = adaptive(StubClassifier::new().with_image("a.jpg", "Healthy", 0.6, vec![1.0, 0.0]));
        let p = clf.predict_with_memory(&StubClassifier::image("a.jpg")).unwrap();

        assert_eq!(p.class, "Healthy");
        assert_eq!(p.confidence, 0.6);
        assert_eq!(p.base_confidence, 0.6);
        assert_eq!(p.memory_boost, 0.0);
        assert_eq!(p.similar_cases, 0);
        assert_eq!(p.embedding, vec![1.0, 0.0]);
    }

    #[test]
    fn test_boost_once_per_matching_class() {
        let mut clf = adaptive(StubClassifier::new().with_image("a.jpg", "Healthy", 0.5, vec![1.0, 0.0]));
        // three matching patterns in one class, one in another, one far away
        clf.update_memory_with_embedding(vec![1.0, 0.0], "Healthy").unwrap();
        clf.update_memory_with_embedding(vec![1.0, 0.1], "Healthy").unwrap();
        clf.update_memory_with_embedding(vec![1.0, 0.2], "Healthy").unwrap();
        clf.update_memory_with_embedding(vec![1.0, 0.05], "Rust").unwrap();
        clf.update_memory_with_embedding(vec![0.0, 1.0], "Phoma").unwrap();

        let p = clf.predict_with_memory(&StubClassifier::image("a.jpg")).unwrap();
        assert!((p.memory_boost - 0.2).abs() < 1e-9);
        assert!((p.confidence - 0.7).abs() < 1e-9);
        assert_eq!(p.similar_cases, 4);
        assert_eq!(clf.feature_classes(), 3);
    }

    #[test]
    fn test_confidence_is_clamped() {
        let mut clf = adaptive(StubClassifier::new().with_image("a.jpg", "Healthy", 0.97, vec![1.0, 0.0]));
        for label in ["a", "b", "c", "d", "e"] {
            clf.update_memory_with_embedding(vec![1.0, 0.0], label).unwrap();
        }

        let p = clf.predict_with_memory(&StubClassifier::image("a.jpg")).unwrap();
        assert_eq!(p.confidence, 1.0);
        assert!(p.memory_boost > 0.4);
    }

    #[test]
    fn test_out_of_range_base_confidence_is_clamped() {
        let clf = adaptive(StubClassifier::new().with_image("a.jpg", "Healthy", -0.2, vec![1.0, 0.0]));
        let p = clf.predict_with_memory(&StubClassifier::image("a.jpg")).unwrap();
        assert_eq!(p.confidence, 0.0);
    }

    #[test]
    fn test_per_class_cap_drops_oldest() {
        let mut clf = adaptive(StubClassifier::new());
        for i in 0..150 {
            clf.update_memory_with_embedding(vec![i as f32], "Healthy").unwrap();
        }

        let patterns = clf.patterns_for("Healthy").unwrap();
        assert_eq!(patterns.len(), 100);
        assert_eq!(patterns.front().unwrap(), &vec![50.0]);
        assert_eq!(patterns.back().unwrap(), &vec![149.0]);
    }

    #[test]
    fn test_update_memory_embeds_image() {
        let mut clf = adaptive(StubClassifier::new().with_image("a.jpg", "Healthy", 0.9, vec![0.0, 1.0]));
        clf.update_memory(&StubClassifier::image("a.jpg"), "Rust").unwrap();
        assert_eq!(clf.patterns_for("Rust").unwrap().len(), 1);

        assert!(clf.update_memory(&StubClassifier::image("missing.jpg"), "Rust").is_err());
        assert_eq!(clf.patterns_for("Rust").unwrap().len(), 1);
    }

    #[test]
    fn test_classifier_error_propagates() {
        let clf = adaptive(StubClassifier::new());
        assert!(clf.predict_with_memory(&StubClassifier::image("missing.jpg")).is_err());
    }
}
