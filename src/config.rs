use crate::error::{LeafcareError, Result};
use crate::types::Target;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Classifier backend information
#[derive(Debug, Clone)]
pub struct BackendInfo {
    pub name: &'static str,
    pub description: &'static str,
}

/// Available classifier backends
pub static BACKENDS: &[BackendInfo] = &[
    BackendInfo {
        name: "lite",
        description: "Byte-histogram embeddings and prototype matching, no model needed",
    },
    BackendInfo {
        name: "server",
        description: "Model server over a Unix socket (EfficientNet disease/deficiency models)",
    },
];

pub const DEFAULT_BACKEND: &str = "lite";
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/leafcare-model.sock";
pub const DEFAULT_SERVE_SOCKET: &str = "/tmp/leafcare.sock";
pub const MODEL_VERSION: &str = "interactive_learning_v1.0";

// -----------------------------------------------------------------------------
// Config file location
// -----------------------------------------------------------------------------

fn global_config_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("leafcare")
}

/// Path of the config file, `LEAFCARE_CONFIG` wins over the default location
pub fn config_file() -> PathBuf {
    match std::env::var("LEAFCARE_CONFIG") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => global_config_dir().join("config.yaml"),
    }
}

// -----------------------------------------------------------------------------
// Typed configuration
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// "lite" or "server"
    pub backend: String,
    /// Socket of the external model server
    pub socket_path: PathBuf,
    /// Predictions below this raw confidence are labelled "Uncertain"
    pub confidence_threshold: f64,
    /// Optional class mapping JSON for the disease model
    pub disease_classes: Option<PathBuf>,
    /// Optional class mapping JSON for the deficiency model
    pub deficiency_classes: Option<PathBuf>,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            backend: DEFAULT_BACKEND.to_string(),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            confidence_threshold: 0.3,
            disease_classes: None,
            deficiency_classes: None,
        }
    }
}

impl ClassifierConfig {
    pub fn class_mapping_path(&self, target: Target) -> Option<&Path> {
        match target {
            Target::Disease => self.disease_classes.as_deref(),
            Target::Deficiency => self.deficiency_classes.as_deref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub memory_capacity: usize,
    /// Confidence a prediction must exceed to enter the similarity memory
    pub memory_add_threshold: f64,
    /// Similarity a stored case must exceed to count as similar
    pub similarity_threshold: f64,
    pub confidence_boost: f64,
    /// Similarity that triggers a per-class confidence boost
    pub boost_similarity_threshold: f64,
    pub feature_memory_cap: usize,
    pub history_capacity: usize,
    /// A class needs strictly more samples than this to be calibrated
    pub min_calibration_samples: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            memory_capacity: 1000,
            memory_add_threshold: 0.85,
            similarity_threshold: 0.7,
            confidence_boost: 0.1,
            boost_similarity_threshold: 0.8,
            feature_memory_cap: 100,
            history_capacity: 500,
            min_calibration_samples: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeafcareConfig {
    pub classifier: ClassifierConfig,
    pub learning: LearningConfig,
}

impl LeafcareConfig {
    /// Load from the default location, defaults if the file is missing
    pub fn load() -> Result<Self> {
        Self::load_from(&config_file())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let unit = |name: &str, v: f64| {
            if (0.0..=1.0).contains(&v) {
                Ok(())
            } else {
                Err(LeafcareError::Config(format!("{} must be within [0, 1], got {}", name, v)))
            }
        };
        unit("classifier.confidence_threshold", self.classifier.confidence_threshold)?;
        unit("learning.memory_add_threshold", self.learning.memory_add_threshold)?;
        unit("learning.confidence_boost", self.learning.confidence_boost)?;
        // cosine similarity thresholds live in [-1, 1]
        for (name, v) in [
            ("learning.similarity_threshold", self.learning.similarity_threshold),
            ("learning.boost_similarity_threshold", self.learning.boost_similarity_threshold),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(LeafcareError::Config(format!("{} must be within [-1, 1], got {}", name, v)));
            }
        }
        for (name, v) in [
            ("learning.memory_capacity", self.learning.memory_capacity),
            ("learning.feature_memory_cap", self.learning.feature_memory_cap),
            ("learning.history_capacity", self.learning.history_capacity),
        ] {
            if v == 0 {
                return Err(LeafcareError::Config(format!("{} must be positive", name)));
            }
        }
        if !BACKENDS.iter().any(|b| b.name == self.classifier.backend) {
            return Err(LeafcareError::Config(format!(
                "Unknown classifier backend: {}",
                self.classifier.backend
            )));
        }
        Ok(())
    }

    /// Look up a dotted key such as `learning.memory_capacity`
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let value = serde_yaml::to_value(self)?;
        let mut current = &value;
        for part in key.split('.') {
            match current.get(part) {
                Some(v) => current = v,
                None => return Ok(None),
            }
        }
        Ok(match current {
            serde_yaml::Value::String(s) => Some(s.clone()),
            serde_yaml::Value::Number(n) => Some(n.to_string()),
            serde_yaml::Value::Bool(b) => Some(b.to_string()),
            serde_yaml::Value::Null => Some("(not set)".to_string()),
            other => Some(serde_yaml::to_string(other)?.trim_end().to_string()),
        })
    }

    /// Set a dotted key; the value is parsed as a YAML scalar and the result re-validated
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let mut root = serde_yaml::to_value(&*self)?;
        let parts: Vec<&str> = key.split('.').collect();
        let (last, parents) = parts
            .split_last()
            .ok_or_else(|| LeafcareError::Config("Empty key".to_string()))?;

        let mut current = &mut root;
        for part in parents {
            current = current
                .get_mut(*part)
                .ok_or_else(|| LeafcareError::Config(format!("Unknown config key: {}", key)))?;
        }
        let mapping = current
            .as_mapping_mut()
            .ok_or_else(|| LeafcareError::Config(format!("Unknown config key: {}", key)))?;
        let slot = serde_yaml::Value::String(last.to_string());
        if !mapping.contains_key(&slot) {
            return Err(LeafcareError::Config(format!("Unknown config key: {}", key)));
        }
        let parsed: serde_yaml::Value = serde_yaml::from_str(value)
            .unwrap_or_else(|_| serde_yaml::Value::String(value.to_string()));
        mapping.insert(slot, parsed);

        let updated: Self = serde_yaml::from_value(root)
            .map_err(|e| LeafcareError::Config(format!("Invalid value for {}: {}", key, e)))?;
        updated.validate()?;
        *self = updated;
        Ok(())
    }
}
