use crate::error::{LeafcareError, Result};
use crate::types::PredictionHistoryEntry;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Per-class empirical accuracy learned from feedback.
///
/// A class is calibrated once it has strictly more than `min_samples`
/// entries in the rolling history; its factor is the fraction of those
/// predictions that turned out correct.
#[derive(Debug)]
pub struct ConfidenceCalibrator {
    history: VecDeque<PredictionHistoryEntry>,
    capacity: usize,
    min_samples: usize,
    calibration_map: HashMap<String, f64>,
}

impl ConfidenceCalibrator {
    pub fn new(capacity: usize, min_samples: usize) -> Self {
        Self {
            history: VecDeque::with_capacity(capacity.min(1024)),
            capacity,
            min_samples,
            calibration_map: HashMap::new(),
        }
    }

    /// Record a feedback outcome and recompute the calibration map
    pub fn record_prediction(&mut self, predicted_class: &str, confidence: f64, was_correct: bool) {
        self.history.push_back(PredictionHistoryEntry {
            predicted_class: predicted_class.to_string(),
            confidence,
            correct: was_correct,
        });
        while self.history.len() > self.capacity {
            self.history.pop_front();
        }

        self.recompute();
    }

    fn recompute(&mut self) {
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
        for entry in &self.history {
            let (total, correct) = counts.entry(entry.predicted_class.as_str()).or_default();
            *total += 1;
            if entry.correct {
                *correct += 1;
            }
        }

        let min_samples = self.min_samples;
        self.calibration_map = counts
            .into_iter()
            .filter(|(_, (total, _))| *total > min_samples)
            .map(|(class, (total, correct))| (class.to_string(), correct as f64 / total as f64))
            .collect();

        debug!(
            "Calibration recomputed: {} classes from {} entries",
            self.calibration_map.len(),
            self.history.len()
        );
    }

    /// Nudge a raw confidence halfway toward the class's track record
    pub fn apply_calibration(&self, predicted_class: &str, confidence: f64) -> f64 {
        let calibrated = match self.calibration_factor(predicted_class) {
            Some(factor) => (confidence + factor) / 2.0,
            None => confidence,
        };
        calibrated.clamp(0.0, 1.0)
    }

    pub fn calibration_factor(&self, predicted_class: &str) -> Option<f64> {
        self.calibration_map.get(predicted_class).copied()
    }

    pub fn calibration_classes(&self) -> usize {
        self.calibration_map.len()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    pub fn check_capacity(&self) -> Result<()> {
        if self.history.len() > self.capacity {
            return Err(LeafcareError::CapacityInvariant {
                store: "prediction history",
                len: self.history.len(),
                capacity: self.capacity,
            });
        }
        Ok(())
    }
}
