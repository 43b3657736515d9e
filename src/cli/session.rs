use crate::classifier::LeafImage;
use crate::config::LeafcareConfig;
use crate::coordinator::InteractionCoordinator;
use crate::error::{LeafcareError, Result};
use crate::types::Target;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tracing::{debug, info};

/// One request of the JSON protocol shared by `session` and `serve`
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Diagnose {
        /// Image for every target
        #[serde(default)]
        image: Option<PathBuf>,
        /// Separate image per target
        #[serde(default)]
        images: Option<BTreeMap<Target, PathBuf>>,
    },
    Feedback {
        image: PathBuf,
        feedback: BTreeMap<Target, String>,
    },
    Stats,
}

/// Parse and answer one request line; never fails, errors become `{"ok": false}`
pub fn handle_line(coordinator: &InteractionCoordinator, line: &str) -> Value {
    let outcome = serde_json::from_str::<Request>(line)
        .map_err(LeafcareError::from)
        .and_then(|request| handle_request(coordinator, request));

    match outcome {
        Ok(result) => json!({ "ok": true, "result": result }),
        Err(e) => json!({ "ok": false, "error": e.to_string() }),
    }
}

pub fn handle_request(coordinator: &InteractionCoordinator, request: Request) -> Result<Value> {
    debug!("Handling request: {:?}", request);
    match request {
        Request::Ping => Ok(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        })),
        Request::Diagnose {
            image: Some(path),
            images: None,
        } => {
            let image = LeafImage::open(&path)?;
            Ok(serde_json::to_value(coordinator.diagnose(&image))?)
        }
        Request::Diagnose {
            image: None,
            images: Some(paths),
        } => {
            let mut images = BTreeMap::new();
            for (target, path) in paths {
                images.insert(target, LeafImage::open(&path)?);
            }
            let inputs: BTreeMap<Target, &LeafImage> = images.iter().map(|(t, i)| (*t, i)).collect();
            Ok(serde_json::to_value(coordinator.diagnose_targets(&inputs))?)
        }
        Request::Diagnose { .. } => Err(LeafcareError::InvalidRequest(
            "diagnose needs exactly one of `image` or `images`".to_string(),
        )),
        Request::Feedback { image, feedback } => {
            let image = LeafImage::open(&image)?;
            Ok(serde_json::to_value(coordinator.provide_feedback(&image, &feedback)?)?)
        }
        Request::Stats => Ok(serde_json::to_value(coordinator.get_learning_stats())?),
    }
}

/// Run the session command - JSON lines on stdin, one JSON response per line on stdout
pub fn run_session() -> Result<()> {
    let config = LeafcareConfig::load()?;
    let coordinator = InteractionCoordinator::from_config(&config)?;
    info!("Session started");

    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = handle_line(&coordinator, &line);
        writeln!(stdout, "{}", response)?;
        stdout.flush()?;
    }

    info!("Session ended");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::LeafClassifier;
    use crate::config::LearningConfig;
    use crate::testing::StubClassifier;
    use std::sync::Arc;

    /// Coordinator whose stubs answer for a real file in `dir`
    fn setup(dir: &std::path::Path) -> (InteractionCoordinator, PathBuf) {
        let path = dir.join("leaf.jpg");
        std::fs::write(&path, b"\xff\xd8\xff leaf").unwrap();
        let key = path.to_str().unwrap();

        let mut classifiers: BTreeMap<Target, Arc<dyn LeafClassifier>> = BTreeMap::new();
        classifiers.insert(
            Target::Disease,
            Arc::new(StubClassifier::new().with_image(key, "Healthy", 0.92, vec![1.0, 0.0])),
        );
        classifiers.insert(
            Target::Deficiency,
            Arc::new(StubClassifier::new().with_image(key, "iron_deficiency", 0.75, vec![0.0, 1.0])),
        );
        (InteractionCoordinator::new(classifiers, &LearningConfig::default()), path)
    }

    #[test]
    fn test_ping() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _) = setup(dir.path());
        let response = handle_line(&coord, r#"{"cmd": "ping"}"#);
        assert_eq!(response["ok"], true);
        assert_eq!(response["result"]["status"], "healthy");
    }

    #[test]
    fn test_diagnose_feedback_stats_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, path) = setup(dir.path());
        let image = path.to_str().unwrap();

        let diagnosis = handle_line(&coord, &json!({"cmd": "diagnose", "image": image}).to_string());
        assert_eq!(diagnosis["ok"], true);
        let result = &diagnosis["result"];
        assert_eq!(result["status"], "success");
        assert_eq!(result["predictions"]["disease"]["prediction"]["class"], "Healthy");
        assert_eq!(result["predictions"]["disease"]["certainty_level"], "Very High");
        assert_eq!(result["predictions"]["deficiency"]["certainty_level"], "Moderate");
        assert!(result["predictions"]["disease"]["prediction"].get("embedding").is_none());

        let feedback = handle_line(
            &coord,
            &json!({"cmd": "feedback", "image": image, "feedback": {"disease": "Healthy"}}).to_string(),
        );
        assert_eq!(feedback["ok"], true);
        assert_eq!(feedback["result"]["memory_sizes"]["disease"], 1);
        assert_eq!(feedback["result"]["feedback_applied"]["disease"], true);
        assert_eq!(feedback["result"]["feedback_applied"]["deficiency"], false);

        let stats = handle_line(&coord, r#"{"cmd": "stats"}"#);
        assert_eq!(stats["result"]["disease"]["memory_size"], 1);
        assert_eq!(stats["result"]["disease"]["feature_classes"], 1);
        assert_eq!(stats["result"]["deficiency"]["memory_size"], 0);
    }

    #[test]
    fn test_per_target_images() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, path) = setup(dir.path());
        let image = path.to_str().unwrap();

        let response = handle_line(
            &coord,
            &json!({"cmd": "diagnose", "images": {"disease": image}}).to_string(),
        );
        assert_eq!(response["ok"], true);
        assert!(response["result"]["predictions"].get("deficiency").is_none());
    }

    #[test]
    fn test_errors_are_reported_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let (coord, _) = setup(dir.path());

        let bad_json = handle_line(&coord, "not json");
        assert_eq!(bad_json["ok"], false);

        let unknown = handle_line(&coord, r#"{"cmd": "train"}"#);
        assert_eq!(unknown["ok"], false);

        let both = handle_line(&coord, r#"{"cmd": "diagnose"}"#);
        assert_eq!(both["ok"], false);

        let missing = handle_line(
            &coord,
            &json!({"cmd": "diagnose", "image": dir.path().join("nope.png")}).to_string(),
        );
        assert_eq!(missing["ok"], false);
        assert!(missing["error"].as_str().unwrap().contains("nope.png"));
    }
}
