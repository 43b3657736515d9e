use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Diagnostic target, one learning pipeline each
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    Disease,
    Deficiency,
}

impl Target {
    pub const ALL: [Target; 2] = [Target::Disease, Target::Deficiency];

    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Disease => "disease",
            Target::Deficiency => "deficiency",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Target {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "disease" => Ok(Target::Disease),
            "deficiency" => Ok(Target::Deficiency),
            other => Err(format!("Unknown target: {} (expected disease or deficiency)", other)),
        }
    }
}

/// Raw output of the underlying image classifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasePrediction {
    pub label: String,
    pub confidence: f64,
    pub class_index: i64,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub recommendation: String,
}

/// Prediction augmented by the feature pattern memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptivePrediction {
    pub class: String,
    pub confidence: f64,
    pub base_confidence: f64,
    pub memory_boost: f64,
    pub similar_cases: usize,
    pub class_index: i64,
    pub description: String,
    pub recommendation: String,
    /// Embedding the prediction was made from, reused for memory lookups
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

/// A confirmed high-confidence case kept in the similarity memory
#[derive(Debug, Clone, Serialize)]
pub struct MemoryRecord {
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub prediction: String,
    pub confidence: f64,
    pub true_label: String,
    pub recorded_at: DateTime<Utc>,
}

/// One feedback outcome in the calibrator's rolling history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionHistoryEntry {
    pub predicted_class: String,
    pub confidence: f64,
    pub correct: bool,
}

/// Discrete certainty bucket derived from calibrated confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CertaintyLevel {
    #[serde(rename = "Very High")]
    VeryHigh,
    High,
    Moderate,
    Low,
    #[serde(rename = "Very Low")]
    VeryLow,
    Unknown,
}

impl CertaintyLevel {
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.9 {
            CertaintyLevel::VeryHigh
        } else if confidence >= 0.8 {
            CertaintyLevel::High
        } else if confidence >= 0.7 {
            CertaintyLevel::Moderate
        } else if confidence >= 0.6 {
            CertaintyLevel::Low
        } else {
            CertaintyLevel::VeryLow
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CertaintyLevel::VeryHigh => "Very High",
            CertaintyLevel::High => "High",
            CertaintyLevel::Moderate => "Moderate",
            CertaintyLevel::Low => "Low",
            CertaintyLevel::VeryLow => "Very Low",
            CertaintyLevel::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for CertaintyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-target entry of a diagnosis
#[derive(Debug, Clone, Serialize)]
pub struct PipelineDiagnosis {
    pub prediction: AdaptivePrediction,
    pub similar_previous_cases: usize,
    pub certainty_level: CertaintyLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PipelineDiagnosis {
    /// Degraded entry used when the classifier could not process the image
    pub fn degraded(error: String) -> Self {
        Self {
            prediction: AdaptivePrediction {
                class: "Unknown".to_string(),
                confidence: 0.0,
                base_confidence: 0.0,
                memory_boost: 0.0,
                similar_cases: 0,
                class_index: -1,
                description: String::new(),
                recommendation: String::new(),
                embedding: Vec::new(),
            },
            similar_previous_cases: 0,
            certainty_level: CertaintyLevel::Unknown,
            error: Some(error),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosisStatus {
    Success,
    FallbackUsed,
}

/// Learning state summary of one pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PipelineStats {
    pub memory_size: usize,
    pub calibration_classes: usize,
    pub feature_classes: usize,
    pub history_size: usize,
    pub total_predictions: u64,
    pub feedback_events: u64,
    pub average_inference_ms: f64,
}

pub type LearningStats = BTreeMap<Target, PipelineStats>;

/// Result of `InteractionCoordinator::diagnose`
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosisResult {
    pub predictions: BTreeMap<Target, PipelineDiagnosis>,
    pub learning_stats: LearningStats,
    pub status: DiagnosisStatus,
    pub processing_time: f64,
    pub model_version: String,
}

/// Result of `InteractionCoordinator::provide_feedback`
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackResult {
    pub status: String,
    pub memory_sizes: BTreeMap<Target, usize>,
    pub feedback_applied: BTreeMap<Target, bool>,
}
