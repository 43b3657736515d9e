//! Test helpers shared across modules

use crate::classifier::{ClassMapping, LeafClassifier, LeafImage};
use crate::error::ClassificationError;
use crate::types::{BasePrediction, Target};
use std::collections::HashMap;
use std::path::PathBuf;

/// Classifier with canned answers keyed by image path; unknown paths fail
pub struct StubClassifier {
    answers: HashMap<PathBuf, (String, f64, Vec<f32>)>,
    classes: ClassMapping,
}

impl StubClassifier {
    pub fn new() -> Self {
        Self {
            answers: HashMap::new(),
            classes: ClassMapping::builtin(Target::Disease),
        }
    }

    pub fn with_image(mut self, path: &str, label: &str, confidence: f64, embedding: Vec<f32>) -> Self {
        self.answers
            .insert(PathBuf::from(path), (label.to_string(), confidence, embedding));
        self
    }

    pub fn image(path: &str) -> LeafImage {
        LeafImage::from_bytes(path, Vec::new())
    }

    fn lookup(&self, image: &LeafImage) -> Result<&(String, f64, Vec<f32>), ClassificationError> {
        self.answers
            .get(image.path())
            .ok_or_else(|| ClassificationError::Server(format!("cannot identify {}", image.path().display())))
    }
}

impl LeafClassifier for StubClassifier {
    fn predict(&self, image: &LeafImage) -> Result<BasePrediction, ClassificationError> {
        let (label, confidence, _) = self.lookup(image)?;
        Ok(BasePrediction {
            label: label.clone(),
            confidence: *confidence,
            class_index: 0,
            description: String::new(),
            recommendation: String::new(),
        })
    }

    fn embed(&self, image: &LeafImage) -> Result<Vec<f32>, ClassificationError> {
        self.lookup(image).map(|(_, _, embedding)| embedding.clone())
    }

    fn classes(&self) -> &ClassMapping {
        &self.classes
    }

    fn model_name(&self) -> &str {
        "stub"
    }
}
