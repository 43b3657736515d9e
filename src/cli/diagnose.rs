use crate::classifier::LeafImage;
use crate::config::LeafcareConfig;
use crate::coordinator::InteractionCoordinator;
use crate::error::{LeafcareError, Result};
use crate::types::{DiagnosisResult, LearningStats, Target};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::WalkDir;

/// Run the diagnose command.
///
/// `path` is one image or a directory walked recursively. When labels are
/// given every image is confirmed with them after it is diagnosed, so later
/// images in the same run benefit from earlier feedback.
pub fn run_diagnose(
    path: &Path,
    disease: Option<&str>,
    deficiency: Option<&str>,
    json_output: bool,
) -> Result<()> {
    let images = collect_images(path)?;
    if images.is_empty() {
        return Err(LeafcareError::InvalidRequest(format!(
            "No supported images found in {}",
            path.display()
        )));
    }

    let mut labels = BTreeMap::new();
    if let Some(label) = disease {
        labels.insert(Target::Disease, label.to_string());
    }
    if let Some(label) = deficiency {
        labels.insert(Target::Deficiency, label.to_string());
    }

    let config = LeafcareConfig::load()?;
    let coordinator = InteractionCoordinator::from_config(&config)?;

    let tally = diagnose_images(&coordinator, &images, &labels, json_output);

    let stats = coordinator.get_learning_stats();
    if json_output {
        println!("{}", json!({ "learning_stats": stats }));
    } else {
        print_summary(&tally, &labels, &stats);
    }

    Ok(())
}

/// Diagnose each image in turn, confirming it with `labels` when given.
///
/// Labels are only sent to pipelines that produced a real prediction; an
/// image whose feedback still fails is logged and counted, never fatal.
fn diagnose_images(
    coordinator: &InteractionCoordinator,
    images: &[PathBuf],
    labels: &BTreeMap<Target, String>,
    json_output: bool,
) -> Tally {
    let mut tally = Tally::default();
    for image_path in images {
        let image = match LeafImage::open(image_path) {
            Ok(image) => image,
            Err(e) => {
                warn!("Skipping {}: {}", image_path.display(), e);
                tally.skipped += 1;
                continue;
            }
        };

        let result = coordinator.diagnose(&image);
        tally.record(&result, labels);

        let confirmed: BTreeMap<Target, String> = labels
            .iter()
            .filter(|(target, _)| {
                result
                    .predictions
                    .get(*target)
                    .is_some_and(|p| !p.is_degraded())
            })
            .map(|(target, label)| (*target, label.clone()))
            .collect();

        let feedback = if confirmed.is_empty() {
            None
        } else {
            match coordinator.provide_feedback(&image, &confirmed) {
                Ok(feedback) => Some(feedback),
                Err(e) => {
                    warn!("Feedback for {} not applied: {}", image_path.display(), e);
                    tally.feedback_failed += 1;
                    None
                }
            }
        };

        if json_output {
            println!(
                "{}",
                json!({ "image": image_path, "diagnosis": result, "feedback": feedback })
            );
        } else {
            print_diagnosis(image_path, &result);
        }
    }
    tally
}

/// Images under `path`, sorted; a single file is returned as-is
fn collect_images(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    if !path.exists() {
        return Err(LeafcareError::InvalidRequest(format!(
            "No such file or directory: {}",
            path.display()
        )));
    }

    let mut images: Vec<PathBuf> = WalkDir::new(path)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file() && LeafImage::is_supported(e.path()))
        .map(|e| e.into_path())
        .collect();
    images.sort();
    Ok(images)
}

#[derive(Debug, Default)]
struct Tally {
    diagnosed: usize,
    skipped: usize,
    degraded: usize,
    feedback_failed: usize,
    /// (matches, compared) per labelled target
    matches: BTreeMap<Target, (usize, usize)>,
}

impl Tally {
    fn record(&mut self, result: &DiagnosisResult, labels: &BTreeMap<Target, String>) {
        self.diagnosed += 1;
        if result.predictions.values().any(|p| p.is_degraded()) {
            self.degraded += 1;
        }
        for (target, label) in labels {
            if let Some(diagnosis) = result.predictions.get(target) {
                let (matched, compared) = self.matches.entry(*target).or_default();
                *compared += 1;
                if diagnosis.prediction.class == label.trim() {
                    *matched += 1;
                }
            }
        }
    }
}

fn print_diagnosis(path: &Path, result: &DiagnosisResult) {
    println!("{}", path.display());
    for (target, diagnosis) in &result.predictions {
        let prediction = &diagnosis.prediction;
        if let Some(error) = &diagnosis.error {
            println!("  {:11} unavailable ({})", target.as_str(), error);
            continue;
        }
        println!(
            "  {:11} {:28} {:.2} ({})",
            target.as_str(),
            prediction.class,
            prediction.confidence,
            diagnosis.certainty_level
        );
        if prediction.memory_boost > 0.0 {
            println!(
                "  {:11} base {:.2}, +{:.2} from {} similar case(s)",
                "",
                prediction.base_confidence,
                prediction.memory_boost,
                prediction.similar_cases
            );
        }
        if !prediction.recommendation.is_empty() {
            println!("  {:11} -> {}", "", prediction.recommendation);
        }
    }
    println!();
}

fn print_summary(tally: &Tally, labels: &BTreeMap<Target, String>, stats: &LearningStats) {
    println!("{}", "-".repeat(60));
    println!("Diagnosed: {} image(s)", tally.diagnosed);
    if tally.skipped > 0 {
        println!("Skipped:   {}", tally.skipped);
    }
    if tally.degraded > 0 {
        println!("Fallback:  {} image(s) with an unavailable pipeline", tally.degraded);
    }
    if tally.feedback_failed > 0 {
        println!("Feedback failed: {} image(s)", tally.feedback_failed);
    }

    for (target, (matched, compared)) in &tally.matches {
        let label = labels.get(target).map(String::as_str).unwrap_or_default();
        println!(
            "Matched {} label '{}': {}/{}",
            target.as_str(),
            label,
            matched,
            compared
        );
    }

    println!("\nLearning state:");
    println!(
        "  {:11} {:>7} {:>12} {:>9} {:>8} {:>9}",
        "target", "memory", "calibrated", "classes", "history", "avg ms"
    );
    for (target, s) in stats {
        println!(
            "  {:11} {:>7} {:>12} {:>9} {:>8} {:>9.2}",
            target.as_str(),
            s.memory_size,
            s.calibration_classes,
            s.feature_classes,
            s.history_size,
            s.average_inference_ms
        );
    }
}
