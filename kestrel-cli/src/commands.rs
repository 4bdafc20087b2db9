//! CLI subcommand handlers.

use crate::Commands;
use crate::ConfigAction;
use kestrel_core::metrics::format_metrics;
use kestrel_core::persistence::{load_json, load_yaml};
use kestrel_core::pruning::{SENSITIVITY_FILE, SensitivityTable};
use kestrel_core::training::checkpoint::{EVAL_DETAILS, PRUNE_META};
use kestrel_core::training::{ModelInfo, PruningState, validate_checkpoint};
use std::fmt::Write as _;
use std::path::Path;

/// Handle a CLI subcommand.
pub fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Architectures => {
            print!("{}", architecture_table());
            Ok(())
        }
        Commands::Validate { dir } => {
            let info = validate_checkpoint(&dir)
                .map_err(|e| anyhow::anyhow!("Invalid artifact: {}", e))?;
            println!(
                "{}: {} model, status {}, {} completed epochs",
                dir.display(),
                info.model,
                info.status,
                info.completed_epochs
            );
            Ok(())
        }
        Commands::Inspect { dir } => {
            print!("{}", describe_artifact(&dir)?);
            Ok(())
        }
        Commands::Config { action } => handle_config(action, workspace),
    }
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".kestrel");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let default_config = kestrel_core::KestrelConfig::default();
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = kestrel_core::config::load_config(Some(workspace), None)
                .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

/// One line per registered architecture.
pub(crate) fn architecture_table() -> String {
    let mut out = format!(
        "{:<22} {:<20} {:<32} {:<8} {}\n",
        "ARCHITECTURE", "BACKBONE", "SCALES", "EXPORT", "PRUNABLE"
    );
    for arch in kestrel_core::registry::architectures() {
        let scales = arch
            .supported_scales
            .map(|s| {
                s.iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .unwrap_or_else(|| "-".to_string());
        let export = arch
            .fixed_export_shape
            .map(|[h, w]| format!("{h}x{w}"))
            .unwrap_or_else(|| "dynamic".to_string());
        let _ = writeln!(
            out,
            "{:<22} {:<20} {:<32} {:<8} {}",
            arch.name,
            arch.backbone,
            scales,
            export,
            if arch.supports_pruning { "yes" } else { "no" }
        );
    }
    out
}

/// Human-readable summary of an artifact directory.
pub(crate) fn describe_artifact(dir: &Path) -> anyhow::Result<String> {
    let info = validate_checkpoint(dir).map_err(|e| anyhow::anyhow!("Invalid artifact: {}", e))?;
    let mut out = String::new();
    describe_info(&mut out, &info);

    if let Some(pruning) = load_yaml::<PruningState>(&dir.join(PRUNE_META))? {
        let _ = writeln!(out, "Pruner:           {}", pruning.pruner);
        for (param, ratio) in &pruning.pruning_ratios {
            let _ = writeln!(out, "  {param:<30} {ratio:.3}");
        }
    }

    if let Some(details) = load_json::<Vec<Vec<Vec<f32>>>>(&dir.join(EVAL_DETAILS))? {
        let rows: usize = details.iter().map(Vec::len).sum();
        let _ = writeln!(
            out,
            "Eval details:     {} batches, {} predictions",
            details.len(),
            rows
        );
    }

    if let Some(table) = load_json::<SensitivityTable>(&dir.join(SENSITIVITY_FILE))? {
        let _ = writeln!(
            out,
            "Sensitivities:    {} layers, {} criterion, metric {} (baseline {:.4})",
            table.layers.len(),
            table.criterion,
            table.metric,
            table.baseline
        );
    }
    Ok(out)
}

fn describe_info(out: &mut String, info: &ModelInfo) {
    let attrs = &info.attributes;
    let _ = writeln!(
        out,
        "Model:            {} ({})",
        info.model,
        attrs.model_type.as_str()
    );
    let _ = writeln!(out, "Status:           {}", info.status);
    let _ = writeln!(out, "Version:          {}", info.version);
    let _ = writeln!(out, "Completed epochs: {}", info.completed_epochs);
    match &attrs.labels {
        Some(labels) => {
            let _ = writeln!(
                out,
                "Classes:          {} ({})",
                attrs.num_classes,
                labels.join(", ")
            );
        }
        None => {
            let _ = writeln!(out, "Classes:          {}", attrs.num_classes);
        }
    }
    if !attrs.eval_metrics.is_empty() {
        let _ = writeln!(out, "Eval metrics:     {}", format_metrics(&attrs.eval_metrics));
    }
    if !info.transforms.is_empty() {
        let _ = writeln!(out, "Transforms:       {} steps", info.transforms.len());
    }
    if let Some(state) = &info.training_state {
        let _ = writeln!(out, "Global step:      {}", state.global_step);
        if let Some(best) = &state.best {
            let _ = writeln!(
                out,
                "Best:             {}={} at epoch {}",
                best.key, best.value, best.epoch
            );
        }
        if let Some(early_stop) = &state.early_stop {
            let _ = writeln!(
                out,
                "Early stop:       {}/{}",
                early_stop.counter(),
                early_stop.patience()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kestrel_core::persistence::{SUCCESS_MARKER, atomic_write, atomic_write_yaml, write_success_marker};
    use kestrel_core::registry::{ClassifierParams, ModelConfig};
    use kestrel_core::training::checkpoint::{ArtifactMeta, MODEL_META, MODEL_PARAMS};
    use kestrel_core::training::{BestMetric, ModelStatus, TrainingState};
    use kestrel_core::MetricMap;
    use tempfile::TempDir;

    fn write_checkpoint(dir: &Path, status: ModelStatus) {
        let mut config = ModelConfig::new("MobileNetV2", 2, ClassifierParams::default()).unwrap();
        config.bind_labels(vec!["ok".into(), "defect".into()]);
        let state = TrainingState {
            completed_epochs: 3,
            global_step: 120,
            best: Some(BestMetric {
                key: "acc1".into(),
                value: 0.75,
                epoch: 2,
            }),
            early_stop: None,
        };
        let mut metrics = MetricMap::new();
        metrics.insert("acc1".into(), 0.5);
        metrics.insert("acc2".into(), 1.0);
        let meta = ArtifactMeta {
            config: &config,
            status,
            state: &state,
            eval_metrics: Some(&metrics),
            eval_details: None,
            pruning: None,
            transforms: &[],
        };
        std::fs::create_dir_all(dir).unwrap();
        atomic_write(&dir.join(MODEL_PARAMS), b"weights").unwrap();
        atomic_write_yaml(&dir.join(MODEL_META), &meta.model_info(status)).unwrap();
        write_success_marker(dir).unwrap();
    }

    #[test]
    fn test_architecture_table_lists_registry() {
        let table = architecture_table();
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), kestrel_core::registry::architectures().len() + 1);
        let alexnet = lines.iter().find(|l| l.starts_with("AlexNet ")).unwrap();
        assert!(alexnet.contains("224x224"));
    }

    #[test]
    fn test_describe_checkpoint() {
        let dir = TempDir::new().unwrap();
        write_checkpoint(dir.path(), ModelStatus::Normal);
        atomic_write(
            &dir.path().join(EVAL_DETAILS),
            b"[[[0.2, 0.8], [0.9, 0.1]], [[0.5, 0.5]]]",
        )
        .unwrap();

        let text = describe_artifact(dir.path()).unwrap();
        assert!(text.contains("Model:            MobileNetV2 (classifier)"));
        assert!(text.contains("Status:           Normal"));
        assert!(text.contains("Classes:          2 (ok, defect)"));
        assert!(text.contains("Eval metrics:     acc1=0.500000"));
        assert!(!text.contains("acc2"));
        assert!(text.contains("Best:             acc1=0.75 at epoch 2"));
        assert!(text.contains("Eval details:     2 batches, 3 predictions"));
    }

    #[test]
    fn test_describe_rejects_incomplete_checkpoint() {
        let dir = TempDir::new().unwrap();
        write_checkpoint(dir.path(), ModelStatus::Normal);
        std::fs::remove_file(dir.path().join(SUCCESS_MARKER)).unwrap();
        assert!(describe_artifact(dir.path()).is_err());
    }
}
