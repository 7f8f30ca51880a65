use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use parsetab_core::RunController;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use walkdir::{DirEntry, WalkDir};

const DEFAULT_CONFIG: &str = "config.yaml";
const DEFAULT_CONFIG_DIR: &str = "configs";
const LOG_FILE: &str = "parsetab.log";

/// Parsetab - template-driven extraction of log files and spreadsheets into
/// per-run SQLite databases and Excel reports
#[derive(Debug, Parser)]
#[command(
    name = "parsetab",
    version,
    about = "Template-driven extraction into per-run SQLite databases and Excel reports"
)]
struct Cli {
    /// Configuration file, or a directory of configuration files. Defaults
    /// to `config.yaml`, falling back to the `configs/` directory.
    config: Option<PathBuf>,

    /// Directory receiving run databases, reports, and the log file
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Exit without waiting for Enter
    #[arg(long)]
    no_pause: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.data_dir)?;

    let configs = resolve_configs(cli.config.as_deref())?;
    let controller = RunController::new(&cli.data_dir);

    let mut all_ok = true;
    for config in &configs {
        info!(config = %config.display(), "processing configuration file");
        match controller.run_config_file(config) {
            Ok(summary) => {
                let failed = summary.failed_parts();
                if failed == 0 {
                    info!(
                        config = %config.display(),
                        parts = summary.parts.len(),
                        "configuration file completed"
                    );
                } else {
                    warn!(
                        config = %config.display(),
                        parts = summary.parts.len(),
                        failed,
                        "configuration file completed with failed parts"
                    );
                    all_ok = false;
                }
            }
            Err(fatal) => {
                error!(config = %config.display(), error = %format!("{fatal:#}"), "configuration file aborted");
                all_ok = false;
            }
        }
    }

    if !cli.no_pause {
        wait_for_acknowledgment();
    }
    std::process::exit(if all_ok { 0 } else { 1 });
}

fn init_logging(data_dir: &Path) -> Result<()> {
    let log_path = data_dir.join(LOG_FILE);
    let log_file = File::options()
        .create(true)
        .append(true)
        .open(&log_path)
        .with_context(|| format!("opening log file {}", log_path.display()))?;

    // Env-driven filtering so verbosity is tunable without rebuilding.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(Arc::new(log_file)),
        )
        .init();
    Ok(())
}

/// Resolve the positional argument, or the defaults, into an ordered list of
/// configuration files.
fn resolve_configs(config: Option<&Path>) -> Result<Vec<PathBuf>> {
    match config {
        Some(path) if path.is_dir() => collect_configs(path),
        Some(path) if path.is_file() => Ok(vec![path.to_path_buf()]),
        Some(path) => bail!("configuration path {} does not exist", path.display()),
        None => {
            let default_file = Path::new(DEFAULT_CONFIG);
            if default_file.is_file() {
                return Ok(vec![default_file.to_path_buf()]);
            }
            let default_dir = Path::new(DEFAULT_CONFIG_DIR);
            if default_dir.is_dir() {
                return collect_configs(default_dir);
            }
            bail!("neither {DEFAULT_CONFIG} nor a {DEFAULT_CONFIG_DIR}/ directory was found");
        }
    }
}

/// Collect every `*.yaml`/`*.yml` under `dir` in sorted order, skipping
/// hidden and underscore-prefixed entries.
fn collect_configs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut configs = Vec::new();
    for entry in WalkDir::new(dir)
        .into_iter()
        .filter_entry(|entry| !is_skipped(entry))
    {
        let entry = entry.with_context(|| format!("walking {}", dir.display()))?;
        if entry.file_type().is_file() && is_yaml(entry.path()) {
            configs.push(entry.into_path());
        }
    }
    configs.sort();
    if configs.is_empty() {
        bail!(
            "no configuration files (*.yaml, *.yml) found under {}",
            dir.display()
        );
    }
    Ok(configs)
}

fn is_skipped(entry: &DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.') || name.starts_with('_'))
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| extension.eq_ignore_ascii_case("yaml") || extension.eq_ignore_ascii_case("yml"))
}

fn wait_for_acknowledgment() {
    println!("Press Enter to close.");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn collects_yaml_files_in_sorted_order() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("b.yaml"), "[]").unwrap();
        fs::write(dir.path().join("a.yml"), "[]").unwrap();
        fs::write(dir.path().join("notes.txt"), "not a config").unwrap();

        let configs = collect_configs(dir.path()).unwrap();
        let names: Vec<_> = configs
            .iter()
            .map(|path| path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.yml", "b.yaml"]);
    }

    #[test]
    fn hidden_and_underscore_entries_are_skipped() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("run.yaml"), "[]").unwrap();
        fs::write(dir.path().join(".hidden.yaml"), "[]").unwrap();
        fs::write(dir.path().join("_draft.yaml"), "[]").unwrap();
        fs::create_dir(dir.path().join("_skipped")).unwrap();
        fs::write(dir.path().join("_skipped").join("inner.yaml"), "[]").unwrap();

        let configs = collect_configs(dir.path()).unwrap();
        assert_eq!(configs.len(), 1);
        assert!(configs[0].ends_with("run.yaml"));
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(collect_configs(dir.path()).is_err());
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("absent.yaml");
        assert!(resolve_configs(Some(&missing)).is_err());
    }

    #[test]
    fn explicit_file_is_used_as_is() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("pipeline.yaml");
        fs::write(&path, "[]").unwrap();
        assert_eq!(resolve_configs(Some(&path)).unwrap(), vec![path]);
    }
}
