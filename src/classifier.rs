use crate::config::LeafcareConfig;
use crate::error::{ClassificationError, LeafcareError, Result};
use crate::types::{BasePrediction, Target};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Embedding dimension for the lite classifier (16x16 nibble pairs)
const LITE_DIM: usize = 256;

/// Softmax temperature over prototype similarities
const LITE_TEMPERATURE: f64 = 0.05;

pub const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp", "tif", "tiff"];
pub const MAX_IMAGE_SIZE: u64 = 10 * 1024 * 1024;

pub const UNCERTAIN_LABEL: &str = "Uncertain";
const UNCERTAIN_DESCRIPTION: &str = "Model confidence too low for reliable prediction";
const UNCERTAIN_RECOMMENDATION: &str = "Please try with a clearer image or consult an expert";

// =============================================================================
// Images
// =============================================================================

/// An image handed to a classifier: its path (for the model server) and bytes
#[derive(Debug, Clone)]
pub struct LeafImage {
    path: PathBuf,
    bytes: Vec<u8>,
}

impl LeafImage {
    /// Read and validate an image file
    pub fn open(path: &Path) -> std::result::Result<Self, ClassificationError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(ClassificationError::UnsupportedImage(path.to_path_buf()));
        }

        let unreadable = |source| ClassificationError::Unreadable {
            path: path.to_path_buf(),
            source,
        };
        let size = fs::metadata(path).map_err(unreadable)?.len();
        if size > MAX_IMAGE_SIZE {
            return Err(ClassificationError::ImageTooLarge {
                path: path.to_path_buf(),
                size,
                max: MAX_IMAGE_SIZE,
            });
        }
        let bytes = fs::read(path).map_err(unreadable)?;
        Ok(Self::from_bytes(path, bytes))
    }

    /// Wrap bytes already in memory
    pub fn from_bytes(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Whether a path looks like an image we accept
    pub fn is_supported(path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| ALLOWED_EXTENSIONS.contains(&e.to_lowercase().as_str()))
            .unwrap_or(false)
    }
}

// =============================================================================
// Class mappings
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassInfo {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub recommendation: String,
}

/// Class index to class info, as in `class_mapping_*.json`
#[derive(Debug, Clone, PartialEq)]
pub struct ClassMapping {
    classes: BTreeMap<i64, ClassInfo>,
}

impl ClassMapping {
    /// Parse `{ "0": { "name": .., "description": .., "recommendation": .. }, .. }`
    pub fn from_json(json: &str) -> Result<Self> {
        let raw: BTreeMap<String, ClassInfo> = serde_json::from_str(json)?;
        let mut classes = BTreeMap::new();
        for (key, info) in raw {
            let index: i64 = key
                .trim()
                .parse()
                .map_err(|_| LeafcareError::Config(format!("Class index is not a number: {}", key)))?;
            classes.insert(index, info);
        }
        let mapping = Self { classes };
        if mapping.is_empty() {
            return Err(LeafcareError::Config("Class mapping is empty".to_string()));
        }
        Ok(mapping)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Mapping from config if set, otherwise the built-in one for the target
    pub fn for_target(config: &LeafcareConfig, target: Target) -> Result<Self> {
        match config.classifier.class_mapping_path(target) {
            Some(path) => Self::load(path),
            None => Ok(Self::builtin(target)),
        }
    }

    pub fn builtin(target: Target) -> Self {
        let names: &[&str] = match target {
            Target::Disease => &[
                "Cercospora Leaf Spot (Cercospora coffeicola)",
                "Healthy",
                "Phoma Leaf Blight (Phoma spp.)",
                "Coffee Leaf Rust (Hemileia vastatrix)",
            ],
            Target::Deficiency => &[
                "healthy",
                "boron_deficiency",
                "calcium_deficiency",
                "iron_deficiency",
                "magnesium_deficiency",
                "manganese_deficiency",
                "nitrogen_deficiency",
                "phosphorus_deficiency",
                "potassium_deficiency",
            ],
        };
        let classes = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                (
                    i as i64,
                    ClassInfo {
                        name: name.to_string(),
                        description: String::new(),
                        recommendation: String::new(),
                    },
                )
            })
            .collect();
        Self { classes }
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn get(&self, index: i64) -> Option<&ClassInfo> {
        self.classes.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (i64, &ClassInfo)> {
        self.classes.iter().map(|(i, info)| (*i, info))
    }

    /// Build the final prediction for a top-1 class, applying the uncertain gate
    pub fn prediction(&self, class_index: i64, confidence: f64, threshold: f64) -> BasePrediction {
        let confidence = confidence.clamp(0.0, 1.0);
        if confidence < threshold {
            return BasePrediction {
                label: UNCERTAIN_LABEL.to_string(),
                confidence,
                class_index,
                description: UNCERTAIN_DESCRIPTION.to_string(),
                recommendation: UNCERTAIN_RECOMMENDATION.to_string(),
            };
        }
        match self.get(class_index) {
            Some(info) => BasePrediction {
                label: info.name.clone(),
                confidence,
                class_index,
                description: info.description.clone(),
                recommendation: info.recommendation.clone(),
            },
            // unmapped indices are reported by number
            None => BasePrediction {
                label: class_index.to_string(),
                confidence,
                class_index,
                description: String::new(),
                recommendation: String::new(),
            },
        }
    }
}

// =============================================================================
// Classifier capability
// =============================================================================

/// The black-box image classifier the learning layer builds on.
///
/// Implementations must be pure with respect to learning state: `predict` and
/// `embed` only run inference.
pub trait LeafClassifier: Send + Sync {
    fn predict(&self, image: &LeafImage) -> std::result::Result<BasePrediction, ClassificationError>;
    fn embed(&self, image: &LeafImage) -> std::result::Result<Vec<f32>, ClassificationError>;
    fn classes(&self) -> &ClassMapping;
    fn model_name(&self) -> &str;
}

// =============================================================================
// LiteClassifier - byte statistics and hashed prototypes (pure Rust)
// =============================================================================

/// Lightweight classifier that needs no model weights.
///
/// Embeddings are normalised histograms of consecutive high-nibble byte pairs.
/// Each class gets a prototype vector seeded from the MD5 digest of its name,
/// and predictions are a softmax over prototype similarities. Useful for
/// development and as a fallback when no model server is running.
pub struct LiteClassifier {
    name: String,
    classes: ClassMapping,
    prototypes: Vec<(i64, Vec<f32>)>,
    confidence_threshold: f64,
}

impl LiteClassifier {
    pub fn new(target: Target, classes: ClassMapping, confidence_threshold: f64) -> Self {
        let prototypes = classes
            .iter()
            .map(|(index, info)| (index, prototype(&info.name)))
            .collect();
        Self {
            name: format!("lite-{}", target),
            classes,
            prototypes,
            confidence_threshold,
        }
    }
}

impl LeafClassifier for LiteClassifier {
    fn predict(&self, image: &LeafImage) -> std::result::Result<BasePrediction, ClassificationError> {
        let embedding = self.embed(image)?;

        let scores: Vec<(i64, f64)> = self
            .prototypes
            .iter()
            .map(|(index, proto)| (*index, cosine_similarity(&embedding, proto) / LITE_TEMPERATURE))
            .collect();

        let max = scores
            .iter()
            .map(|(_, s)| *s)
            .fold(f64::NEG_INFINITY, f64::max);
        let total: f64 = scores.iter().map(|(_, s)| (s - max).exp()).sum();

        let (best_index, best_score) = scores
            .iter()
            .copied()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .ok_or_else(|| ClassificationError::Server("Class mapping is empty".to_string()))?;
        let confidence = (best_score - max).exp() / total;

        Ok(self
            .classes
            .prediction(best_index, confidence, self.confidence_threshold))
    }

    fn embed(&self, image: &LeafImage) -> std::result::Result<Vec<f32>, ClassificationError> {
        let bytes = image.bytes();
        if bytes.len() < 2 {
            return Err(ClassificationError::EmptyImage(image.path().to_path_buf()));
        }

        let mut vector = vec![0.0f32; LITE_DIM];
        for pair in bytes.windows(2) {
            let idx = ((pair[0] >> 4) as usize) << 4 | (pair[1] >> 4) as usize;
            vector[idx] += 1.0;
        }

        normalize(&mut vector);
        Ok(vector)
    }

    fn classes(&self) -> &ClassMapping {
        &self.classes
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

/// Deterministic unit vector derived from a class name
fn prototype(name: &str) -> Vec<f32> {
    let mut vector = Vec::with_capacity(LITE_DIM);
    let mut block = 0u32;
    while vector.len() < LITE_DIM {
        let mut hasher = Md5::new();
        hasher.update(format!("{}:{}", name, block).as_bytes());
        let digest = hasher.finalize();
        vector.extend(digest.iter().map(|b| *b as f32 / 255.0));
        block += 1;
    }
    vector.truncate(LITE_DIM);
    normalize(&mut vector);
    vector
}

fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

// =============================================================================
// ServerClassifier - Unix socket client for the model server
// =============================================================================

#[derive(Serialize)]
struct ImageRequest<'a> {
    cmd: &'a str,
    target: &'a str,
    image: &'a Path,
}

#[derive(Serialize)]
struct PingRequest<'a> {
    cmd: &'a str,
}

#[derive(Deserialize)]
struct PredictResponse {
    ok: bool,
    class_index: Option<i64>,
    confidence: Option<f64>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct EmbedResponse {
    ok: bool,
    embedding: Option<Vec<f32>>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct PingResponse {
    ok: bool,
    model: Option<String>,
    error: Option<String>,
}

/// Classifier backed by the external model server
pub struct ServerClassifier {
    name: String,
    target: Target,
    socket_path: PathBuf,
    classes: ClassMapping,
    confidence_threshold: f64,
    /// Embedding length seen on the first call
    dim: OnceLock<usize>,
}

impl ServerClassifier {
    pub fn new(
        target: Target,
        socket_path: PathBuf,
        classes: ClassMapping,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            name: format!("server-{}", target),
            target,
            socket_path,
            classes,
            confidence_threshold,
            dim: OnceLock::new(),
        }
    }

    /// Check if the server is running
    pub fn is_running(socket_path: &Path) -> bool {
        socket_path.exists() && Self::ping(socket_path).is_ok()
    }

    /// Ping the server and get the model name
    pub fn ping(socket_path: &Path) -> std::result::Result<String, ClassificationError> {
        let response: PingResponse = send_request(socket_path, &PingRequest { cmd: "ping" })?;
        if response.ok {
            Ok(response.model.unwrap_or_default())
        } else {
            Err(server_error(response.error))
        }
    }
}

impl LeafClassifier for ServerClassifier {
    fn predict(&self, image: &LeafImage) -> std::result::Result<BasePrediction, ClassificationError> {
        let request = ImageRequest {
            cmd: "predict",
            target: self.target.as_str(),
            image: image.path(),
        };
        let response: PredictResponse = send_request(&self.socket_path, &request)?;
        if !response.ok {
            return Err(server_error(response.error));
        }

        let class_index = response
            .class_index
            .ok_or_else(|| ClassificationError::Server("No class_index in response".to_string()))?;
        let confidence = response
            .confidence
            .filter(|c| c.is_finite())
            .ok_or_else(|| ClassificationError::Server("No valid confidence in response".to_string()))?;

        Ok(self
            .classes
            .prediction(class_index, confidence, self.confidence_threshold))
    }

    fn embed(&self, image: &LeafImage) -> std::result::Result<Vec<f32>, ClassificationError> {
        let request = ImageRequest {
            cmd: "embed",
            target: self.target.as_str(),
            image: image.path(),
        };
        let response: EmbedResponse = send_request(&self.socket_path, &request)?;
        if !response.ok {
            return Err(server_error(response.error));
        }

        let embedding = response
            .embedding
            .ok_or_else(|| ClassificationError::Server("No embedding in response".to_string()))?;
        let expected = *self.dim.get_or_init(|| embedding.len());
        if embedding.len() != expected {
            return Err(ClassificationError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    fn classes(&self) -> &ClassMapping {
        &self.classes
    }

    fn model_name(&self) -> &str {
        &self.name
    }
}

fn server_error(error: Option<String>) -> ClassificationError {
    ClassificationError::Server(error.unwrap_or_else(|| "Unknown error".to_string()))
}

/// Send a request to the model server and parse the response
fn send_request<R, T>(socket_path: &Path, request: &R) -> std::result::Result<T, ClassificationError>
where
    R: Serialize,
    T: for<'de> Deserialize<'de>,
{
    let fail = |what: &str, e: &dyn std::fmt::Display| {
        ClassificationError::Server(format!("{}: {}", what, e))
    };

    let mut stream =
        UnixStream::connect(socket_path).map_err(|e| fail("Failed to connect to server", &e))?;

    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(60)))
        .map_err(|e| fail("Failed to set timeout", &e))?;

    let json = serde_json::to_vec(request).map_err(|e| fail("Failed to serialize", &e))?;
    stream
        .write_all(&json)
        .map_err(|e| fail("Failed to send", &e))?;

    // Shutdown write side to signal end of request
    stream
        .shutdown(std::net::Shutdown::Write)
        .map_err(|e| fail("Failed to shutdown write", &e))?;

    // Read response (up to 1MB)
    let mut buffer = Vec::new();
    stream
        .take(1024 * 1024)
        .read_to_end(&mut buffer)
        .map_err(|e| fail("Failed to read response", &e))?;

    serde_json::from_slice(&buffer).map_err(|e| fail("Failed to parse response", &e))
}

// =============================================================================
// Cosine similarity
// =============================================================================

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(vec_a: &[f32], vec_b: &[f32]) -> f64 {
    if vec_a.len() != vec_b.len() {
        return 0.0;
    }

    let dot: f32 = vec_a.iter().zip(vec_b.iter()).map(|(a, b)| a * b).sum();
    let norm_a: f32 = vec_a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = vec_b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        ((dot / (norm_a * norm_b)) as f64).clamp(-1.0, 1.0)
    }
}

// =============================================================================
// Classifier factory
// =============================================================================

/// Build the classifier for a target from configuration
pub fn get_classifier(config: &LeafcareConfig, target: Target) -> Result<Arc<dyn LeafClassifier>> {
    let classes = ClassMapping::for_target(config, target)?;
    let threshold = config.classifier.confidence_threshold;

    if config.classifier.backend == "server" {
        let socket = &config.classifier.socket_path;
        if ServerClassifier::is_running(socket) {
            debug!("Using model server at {} for {}", socket.display(), target);
            return Ok(Arc::new(ServerClassifier::new(
                target,
                socket.clone(),
                classes,
                threshold,
            )));
        }
        warn!(
            "Model server not reachable at {}, using lite classifier for {}",
            socket.display(),
            target
        );
    }

    Ok(Arc::new(LiteClassifier::new(target, classes, threshold)))
}
