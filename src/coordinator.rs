//! Interactive diagnosis: one learning pipeline per diagnostic target.
//!
//! Every pipeline owns an adaptive classifier, a similarity memory, a
//! calibrator and the slot holding its last prediction, all behind a single
//! mutex. `diagnose` and `provide_feedback` hold that lock for their whole
//! read-modify sequence; pipelines are never locked together.

use crate::adaptive::AdaptiveClassifier;
use crate::calibration::ConfidenceCalibrator;
use crate::classifier::{get_classifier, LeafClassifier, LeafImage};
use crate::config::{LeafcareConfig, LearningConfig, MODEL_VERSION};
use crate::error::{LeafcareError, Result};
use crate::memory::BoundedSimilarityMemory;
use crate::types::{
    AdaptivePrediction, CertaintyLevel, DiagnosisResult, DiagnosisStatus, FeedbackResult,
    LearningStats, PipelineDiagnosis, PipelineStats, Target,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

struct PipelineState {
    adaptive: AdaptiveClassifier,
    memory: BoundedSimilarityMemory,
    calibrator: ConfidenceCalibrator,
    last_prediction: Option<AdaptivePrediction>,
    total_predictions: u64,
    feedback_events: u64,
    inference_time: Duration,
}

struct Pipeline {
    target: Target,
    classifier: Arc<dyn LeafClassifier>,
    state: Mutex<PipelineState>,
}

impl Pipeline {
    fn new(target: Target, classifier: Arc<dyn LeafClassifier>, learning: &LearningConfig) -> Self {
        let state = PipelineState {
            adaptive: AdaptiveClassifier::new(classifier.clone(), learning),
            memory: BoundedSimilarityMemory::new(
                learning.memory_capacity,
                learning.memory_add_threshold,
                learning.similarity_threshold,
            ),
            calibrator: ConfidenceCalibrator::new(
                learning.history_capacity,
                learning.min_calibration_samples,
            ),
            last_prediction: None,
            total_predictions: 0,
            feedback_events: 0,
            inference_time: Duration::ZERO,
        };
        Self {
            target,
            classifier,
            state: Mutex::new(state),
        }
    }

    fn diagnose(&self, image: &LeafImage) -> PipelineDiagnosis {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let started = Instant::now();
        let mut prediction = match state.adaptive.predict_with_memory(image) {
            Ok(prediction) => prediction,
            Err(e) => {
                warn!("{} classification failed for {}: {}", self.target, image.path().display(), e);
                state.last_prediction = None;
                return PipelineDiagnosis::degraded(e.to_string());
            }
        };
        state.total_predictions += 1;
        state.inference_time += started.elapsed();

        let similar_previous_cases = state.memory.find_similar(&prediction.embedding).len();
        prediction.confidence = state
            .calibrator
            .apply_calibration(&prediction.class, prediction.confidence);
        let certainty_level = CertaintyLevel::from_confidence(prediction.confidence);

        debug!(
            "{}: {} base {:.4} boost {:.2} calibrated {:.4}",
            self.target,
            prediction.class,
            prediction.base_confidence,
            prediction.memory_boost,
            prediction.confidence
        );

        state.last_prediction = Some(prediction.clone());

        PipelineDiagnosis {
            prediction,
            similar_previous_cases,
            certainty_level,
            error: None,
        }
    }

    /// Apply confirmed feedback; false when there is no prediction to correct
    fn apply_feedback(&self, embedding: Vec<f32>, label: &str) -> Result<bool> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let Some(last) = state.last_prediction.as_ref() else {
            debug!("{}: feedback ignored, no prior prediction", self.target);
            return Ok(false);
        };

        let stored = state
            .memory
            .add(&embedding, &last.class, last.confidence, label);
        let was_correct = last.class == label;
        let (predicted, confidence) = (last.class.clone(), last.confidence);

        state.adaptive.update_memory_with_embedding(embedding, label)?;
        state
            .calibrator
            .record_prediction(&predicted, confidence, was_correct);
        state.feedback_events += 1;

        state.memory.check_capacity()?;
        state.calibrator.check_capacity()?;

        info!(
            "{} feedback: predicted {} confirmed {} (correct: {}, stored: {})",
            self.target, predicted, label, was_correct, stored
        );
        Ok(true)
    }

    fn memory_size(&self) -> usize {
        self.state.lock().memory.len()
    }

    fn stats(&self) -> PipelineStats {
        let state = self.state.lock();
        let average_inference_ms = if state.total_predictions == 0 {
            0.0
        } else {
            state.inference_time.as_secs_f64() * 1000.0 / state.total_predictions as f64
        };
        PipelineStats {
            memory_size: state.memory.len(),
            calibration_classes: state.calibrator.calibration_classes(),
            feature_classes: state.adaptive.feature_classes(),
            history_size: state.calibrator.history_len(),
            total_predictions: state.total_predictions,
            feedback_events: state.feedback_events,
            average_inference_ms,
        }
    }
}

/// Owns the learning pipelines and exposes diagnose / feedback / stats
pub struct InteractionCoordinator {
    pipelines: BTreeMap<Target, Pipeline>,
    model_version: String,
}

impl InteractionCoordinator {
    pub fn new(classifiers: BTreeMap<Target, Arc<dyn LeafClassifier>>, learning: &LearningConfig) -> Self {
        let pipelines = classifiers
            .into_iter()
            .map(|(target, classifier)| (target, Pipeline::new(target, classifier, learning)))
            .collect();
        Self {
            pipelines,
            model_version: MODEL_VERSION.to_string(),
        }
    }

    /// Build both pipelines with the configured classifier backend
    pub fn from_config(config: &LeafcareConfig) -> Result<Self> {
        let mut classifiers = BTreeMap::new();
        for target in Target::ALL {
            let classifier = get_classifier(config, target)?;
            info!("{} pipeline using {}", target, classifier.model_name());
            classifiers.insert(target, classifier);
        }
        Ok(Self::new(classifiers, &config.learning))
    }

    pub fn targets(&self) -> impl Iterator<Item = Target> + '_ {
        self.pipelines.keys().copied()
    }

    #[allow(dead_code)]
    pub fn last_prediction(&self, target: Target) -> Option<AdaptivePrediction> {
        self.pipelines
            .get(&target)
            .and_then(|p| p.state.lock().last_prediction.clone())
    }

    /// Run every pipeline on the same image
    pub fn diagnose(&self, image: &LeafImage) -> DiagnosisResult {
        let inputs: BTreeMap<Target, &LeafImage> = self.targets().map(|t| (t, image)).collect();
        self.diagnose_targets(&inputs)
    }

    /// Run each named pipeline on its own image. Never fails: a pipeline whose
    /// classifier errors yields a degraded entry and the status says so.
    pub fn diagnose_targets(&self, inputs: &BTreeMap<Target, &LeafImage>) -> DiagnosisResult {
        let started = Instant::now();

        let mut predictions = BTreeMap::new();
        for (target, image) in inputs {
            let diagnosis = match self.pipelines.get(target) {
                Some(pipeline) => pipeline.diagnose(image),
                None => PipelineDiagnosis::degraded(format!("No pipeline for {}", target)),
            };
            predictions.insert(*target, diagnosis);
        }

        let status = if predictions.values().any(|p| p.is_degraded()) {
            DiagnosisStatus::FallbackUsed
        } else {
            DiagnosisStatus::Success
        };
        let processing_time = started.elapsed().as_secs_f64();

        let summary: Vec<String> = predictions
            .iter()
            .map(|(t, p)| format!("{}: {}", t, p.prediction.class))
            .collect();
        info!(
            "Analysis completed in {:.4}s - {} ({:?})",
            processing_time,
            summary.join(", "),
            status
        );

        DiagnosisResult {
            predictions,
            learning_stats: self.get_learning_stats(),
            status,
            processing_time,
            model_version: self.model_version.clone(),
        }
    }

    /// Apply confirmed labels from the user.
    ///
    /// All embeddings are computed before any state changes, so a classifier
    /// failure leaves every pipeline untouched.
    pub fn provide_feedback(
        &self,
        image: &LeafImage,
        feedback: &BTreeMap<Target, String>,
    ) -> Result<FeedbackResult> {
        if feedback.is_empty() {
            return Err(LeafcareError::InvalidFeedback("No feedback supplied".to_string()));
        }

        let mut embeddings = BTreeMap::new();
        for (target, label) in feedback {
            let label = label.trim();
            if label.is_empty() {
                return Err(LeafcareError::InvalidFeedback(format!("Empty label for {}", target)));
            }
            let pipeline = self
                .pipelines
                .get(target)
                .ok_or_else(|| LeafcareError::InvalidFeedback(format!("No pipeline for {}", target)))?;
            embeddings.insert(*target, (pipeline.classifier.embed(image)?, label));
        }

        let mut memory_sizes = BTreeMap::new();
        let mut feedback_applied = BTreeMap::new();
        for (target, pipeline) in &self.pipelines {
            let applied = match embeddings.remove(target) {
                Some((embedding, label)) => pipeline.apply_feedback(embedding, label)?,
                None => false,
            };
            feedback_applied.insert(*target, applied);
            memory_sizes.insert(*target, pipeline.memory_size());
        }

        Ok(FeedbackResult {
            status: "success".to_string(),
            memory_sizes,
            feedback_applied,
        })
    }

    pub fn get_learning_stats(&self) -> LearningStats {
        self.pipelines
            .iter()
            .map(|(target, pipeline)| (*target, pipeline.stats()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubClassifier;

    fn coordinator(disease: StubClassifier, deficiency: StubClassifier) -> InteractionCoordinator {
        let mut classifiers: BTreeMap<Target, Arc<dyn LeafClassifier>> = BTreeMap::new();
        classifiers.insert(Target::Disease, Arc::new(disease));
        classifiers.insert(Target::Deficiency, Arc::new(deficiency));
        InteractionCoordinator::new(classifiers, &LearningConfig::default())
    }

    fn stub() -> StubClassifier {
        StubClassifier::new()
            .with_image("a.jpg", "Healthy", 0.9, vec![1.0, 0.0, 0.0])
            .with_image("b.jpg", "Coffee Leaf Rust", 0.88, vec![0.0, 1.0, 0.0])
    }

    fn disease(label: &str) -> BTreeMap<Target, String> {
        BTreeMap::from([(Target::Disease, label.to_string())])
    }

    #[test]
    fn test_end_to_end_learning() {
        let coord = coordinator(stub(), stub());
        let image_a = StubClassifier::image("a.jpg");

        let first = coord.diagnose(&image_a);
        assert_eq!(first.status, DiagnosisStatus::Success);
        assert_eq!(first.predictions[&Target::Disease].similar_previous_cases, 0);
        assert_eq!(first.learning_stats[&Target::Disease].memory_size, 0);
        assert_eq!(first.predictions[&Target::Disease].certainty_level, CertaintyLevel::VeryHigh);

        let fb = coord.provide_feedback(&image_a, &disease("Healthy")).unwrap();
        assert_eq!(fb.status, "success");
        assert_eq!(fb.memory_sizes[&Target::Disease], 1);
        assert_eq!(fb.memory_sizes[&Target::Deficiency], 0);
        assert!(fb.feedback_applied[&Target::Disease]);
        assert!(!fb.feedback_applied[&Target::Deficiency]);

        let stats = coord.get_learning_stats();
        assert_eq!(stats[&Target::Disease].feature_classes, 1);
        assert_eq!(stats[&Target::Disease].history_size, 1);
        {
            let state = coord.pipelines[&Target::Disease].state.lock();
            assert_eq!(state.adaptive.patterns_for("Healthy").unwrap().len(), 1);
        }

        let second = coord.diagnose(&image_a);
        let entry = &second.predictions[&Target::Disease];
        assert!(entry.similar_previous_cases >= 1);
        assert!((entry.prediction.memory_boost - 0.1).abs() < 1e-9);
        assert_eq!(entry.prediction.confidence, 1.0);
        // deficiency pipeline learned nothing
        assert_eq!(second.predictions[&Target::Deficiency].similar_previous_cases, 0);
    }

    #[test]
    fn test_feedback_without_prior_diagnosis_is_a_noop() {
        let coord = coordinator(stub(), stub());
        let fb = coord
            .provide_feedback(&StubClassifier::image("a.jpg"), &disease("Healthy"))
            .unwrap();

        assert!(!fb.feedback_applied[&Target::Disease]);
        let stats = coord.get_learning_stats();
        assert_eq!(stats[&Target::Disease], PipelineStats::default());
    }

    #[test]
    fn test_low_confidence_feedback_skips_memory_but_records_history() {
        let low = StubClassifier::new().with_image("a.jpg", "Healthy", 0.5, vec![1.0, 0.0]);
        let coord = coordinator(low, stub());
        coord.diagnose(&StubClassifier::image("a.jpg"));

        let fb = coord
            .provide_feedback(&StubClassifier::image("a.jpg"), &disease("Phoma"))
            .unwrap();
        assert!(fb.feedback_applied[&Target::Disease]);
        assert_eq!(fb.memory_sizes[&Target::Disease], 0);

        let stats = &coord.get_learning_stats()[&Target::Disease];
        assert_eq!(stats.history_size, 1);
        assert_eq!(stats.feature_classes, 1);
    }

    #[test]
    fn test_classifier_failure_degrades_one_pipeline() {
        let coord = coordinator(stub(), StubClassifier::new());
        let result = coord.diagnose(&StubClassifier::image("a.jpg"));

        assert_eq!(result.status, DiagnosisStatus::FallbackUsed);
        let ok = &result.predictions[&Target::Disease];
        assert!(!ok.is_degraded());
        assert_eq!(ok.prediction.class, "Healthy");

        let failed = &result.predictions[&Target::Deficiency];
        assert!(failed.is_degraded());
        assert_eq!(failed.certainty_level, CertaintyLevel::Unknown);
        assert_eq!(failed.similar_previous_cases, 0);
        assert_eq!(failed.prediction.confidence, 0.0);
        assert!(coord.last_prediction(Target::Deficiency).is_none());
    }

    #[test]
    fn test_failed_diagnosis_clears_last_prediction() {
        let coord = coordinator(stub(), stub());
        coord.diagnose(&StubClassifier::image("a.jpg"));
        assert!(coord.last_prediction(Target::Disease).is_some());

        coord.diagnose(&StubClassifier::image("broken.jpg"));
        assert!(coord.last_prediction(Target::Disease).is_none());
    }

    #[test]
    fn test_feedback_is_all_or_nothing() {
        let deficiency = StubClassifier::new().with_image("a.jpg", "healthy", 0.9, vec![0.0, 0.0, 1.0]);
        let coord = coordinator(stub(), deficiency);
        coord.diagnose(&StubClassifier::image("a.jpg"));

        // the deficiency classifier cannot embed b.jpg
        let feedback = BTreeMap::from([
            (Target::Disease, "Healthy".to_string()),
            (Target::Deficiency, "healthy".to_string()),
        ]);
        assert!(coord
            .provide_feedback(&StubClassifier::image("b.jpg"), &feedback)
            .is_err());

        let stats = coord.get_learning_stats();
        assert_eq!(stats[&Target::Disease].history_size, 0);
        assert_eq!(stats[&Target::Disease].memory_size, 0);
        assert_eq!(stats[&Target::Deficiency].history_size, 0);
    }

    #[test]
    fn test_feedback_validation() {
        let coord = coordinator(stub(), stub());
        let image = StubClassifier::image("a.jpg");
        assert!(matches!(
            coord.provide_feedback(&image, &BTreeMap::new()),
            Err(LeafcareError::InvalidFeedback(_))
        ));
        assert!(matches!(
            coord.provide_feedback(&image, &disease("  ")),
            Err(LeafcareError::InvalidFeedback(_))
        ));
    }

    #[test]
    fn test_calibration_feeds_back_into_diagnosis() {
        let coord = coordinator(stub(), stub());
        let image_b = StubClassifier::image("b.jpg");

        // the model keeps saying rust; the user says healthy every time
        for _ in 0..11 {
            coord.diagnose(&image_b);
            coord.provide_feedback(&image_b, &disease("Healthy")).unwrap();
        }
        let stats = &coord.get_learning_stats()[&Target::Disease];
        assert_eq!(stats.calibration_classes, 1);

        let result = coord.diagnose(&image_b);
        let entry = &result.predictions[&Target::Disease];
        // boosted to 0.98 by the "Healthy" patterns, then averaged with accuracy 0.0
        assert!((entry.prediction.confidence - 0.49).abs() < 1e-9);
        assert_eq!(entry.certainty_level, CertaintyLevel::VeryLow);
    }

    #[test]
    fn test_concurrent_feedback_loses_no_updates() {
        let coord = Arc::new(coordinator(stub(), stub()));
        coord.diagnose(&StubClassifier::image("a.jpg"));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let coord = Arc::clone(&coord);
                std::thread::spawn(move || {
                    let image = StubClassifier::image(if i % 2 == 0 { "a.jpg" } else { "b.jpg" });
                    coord.provide_feedback(&image, &disease("Healthy")).unwrap()
                })
            })
            .collect();
        for handle in handles {
            assert!(handle.join().unwrap().feedback_applied[&Target::Disease]);
        }

        let stats = &coord.get_learning_stats()[&Target::Disease];
        assert_eq!(stats.history_size, 8);
        assert_eq!(stats.feedback_events, 8);
        assert_eq!(stats.memory_size, 8);
        assert!(stats.memory_size <= LearningConfig::default().memory_capacity);
    }

    #[test]
    fn test_diagnose_targets_with_separate_images() {
        let coord = coordinator(stub(), stub());
        let a = StubClassifier::image("a.jpg");
        let b = StubClassifier::image("b.jpg");
        let inputs = BTreeMap::from([(Target::Disease, &a), (Target::Deficiency, &b)]);

        let result = coord.diagnose_targets(&inputs);
        assert_eq!(result.predictions[&Target::Disease].prediction.class, "Healthy");
        assert_eq!(result.predictions[&Target::Deficiency].prediction.class, "Coffee Leaf Rust");
        assert_eq!(result.model_version, MODEL_VERSION);
        assert_eq!(result.learning_stats[&Target::Disease].total_predictions, 1);
    }
}
