use crate::classifier::{get_classifier, ServerClassifier};
use crate::config::{config_file, LeafcareConfig, BACKENDS};
use crate::error::{LeafcareError, Result};
use crate::types::Target;

/// Run the config command
pub fn run_config(key: Option<&str>, value: Option<&str>, list_backends: bool) -> Result<()> {
    let path = config_file();
    let mut config = LeafcareConfig::load_from(&path)?;

    if list_backends {
        print_backends(&config);
        return Ok(());
    }

    match (key, value) {
        (None, None) => {
            println!("Current configuration ({}):\n", path.display());
            let yaml = serde_yaml::to_string(&config)?;
            for line in yaml.lines() {
                println!("  {}", line);
            }
        }
        (Some(k), None) => match config.get(k)? {
            Some(v) => println!("{}: {}", k, v),
            None => println!("{}: (not set)", k),
        },
        (Some(k), Some(v)) => {
            config.set(k, v)?;
            config.save_to(&path)?;
            println!("Set {} = {}", k, v);

            if k == "classifier.backend" && v == "server" {
                println!("\nThe model server is expected at {}", config.classifier.socket_path.display());
            }
        }
        (None, Some(_)) => {
            return Err(LeafcareError::Config("Key required when setting a value".to_string()));
        }
    }

    Ok(())
}

fn print_backends(config: &LeafcareConfig) {
    println!("Available classifier backends:\n");
    println!("{:2} {:8} {}", "", "Name", "Description");
    println!("{}", "-".repeat(60));

    for backend in BACKENDS {
        let marker = if backend.name == config.classifier.backend {
            " *"
        } else {
            "  "
        };
        println!("{} {:8} {}", marker, backend.name, backend.description);
    }

    let socket = &config.classifier.socket_path;
    let server = if ServerClassifier::is_running(socket) {
        "running"
    } else {
        "not running"
    };
    println!("\n* = currently configured");
    println!("Model server at {}: {}", socket.display(), server);
    println!("\nSet backend with: leafcare config classifier.backend <name>");
}

/// Run the classes command
pub fn run_classes(target: Option<Target>) -> Result<()> {
    let config = LeafcareConfig::load()?;
    let targets: Vec<Target> = match target {
        Some(t) => vec![t],
        None => Target::ALL.to_vec(),
    };

    for (i, target) in targets.iter().enumerate() {
        if i > 0 {
            println!();
        }
        let classifier = get_classifier(&config, *target)?;
        let mapping = classifier.classes();
        let source = config
            .classifier
            .class_mapping_path(*target)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "built-in".to_string());

        println!(
            "{} classes ({}, {}, {}):",
            target,
            mapping.len(),
            source,
            classifier.model_name()
        );
        for (index, info) in mapping.iter() {
            if info.description.is_empty() {
                println!("  {:>3}  {}", index, info.name);
            } else {
                println!("  {:>3}  {:44} {}", index, info.name, info.description);
            }
        }
    }

    Ok(())
}
