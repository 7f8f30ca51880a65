//! Run orchestration.
//!
//! One configuration file is one run: every part processed from it shares a
//! single generated timestamp suffix, so repeated executions of the same
//! configuration never collide. Parts are dispatched by declared type in
//! stage order (imports, then extractions, then joins); within a stage they
//! run in declared order. Each part's outcome is an explicit value returned
//! to the dispatcher — a failure is logged with the part's identifying keys
//! and never aborts its siblings. Structural configuration problems,
//! including malformed function definitions, abort the whole file before any
//! table is created.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Local;
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{self, ExtractionPart, ImportPart, JoinPart, Part};
use crate::extract::{ExtractError, RowTemplate};
use crate::functions::{FunctionError, FunctionRegistry};
use crate::join::{self, JoinOutcome, JoinSpec};
use crate::sheet::{import_workbook, ImportError, ReportError, ReportWriter};
use crate::store::{RunStore, StoreError};

/// A recoverable, part-scoped failure. Sibling parts continue unaffected.
#[derive(Debug, Error)]
pub enum PartError {
    #[error("row template for table '{table}' is invalid: {source}")]
    Template {
        table: String,
        #[source]
        source: ExtractError,
    },

    #[error("failed to read input {path}: {source}")]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("template matched nothing in any input for table '{0}'")]
    NoRows(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Join(#[from] join::JoinError),

    #[error("failed to bind custom functions into '{db}': {source}")]
    Bind {
        db: String,
        #[source]
        source: FunctionError,
    },

    #[error("failed to export table '{table}': {source}")]
    Export {
        table: String,
        #[source]
        source: ReportError,
    },
}

#[derive(Debug)]
pub enum PartOutcome {
    Completed {
        tables: Vec<String>,
        exported: bool,
    },
    Failed {
        error: PartError,
    },
}

#[derive(Debug)]
pub struct PartReport {
    pub label: String,
    pub outcome: PartOutcome,
}

#[derive(Debug)]
pub struct RunSummary {
    pub config_path: PathBuf,
    pub timestamp: String,
    pub parts: Vec<PartReport>,
}

impl RunSummary {
    pub fn failed_parts(&self) -> usize {
        self.parts
            .iter()
            .filter(|part| matches!(part.outcome, PartOutcome::Failed { .. }))
            .count()
    }

    pub fn is_success(&self) -> bool {
        self.failed_parts() == 0
    }
}

/// Sequences one configuration file into a run.
pub struct RunController {
    data_dir: PathBuf,
}

impl RunController {
    /// `data_dir` receives the run database and report files.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    /// Process one configuration file under a fresh run timestamp.
    pub fn run_config_file(&self, path: &Path) -> Result<RunSummary> {
        let parts = config::load_parts(path)?;
        let timestamp = Local::now().format("_%Y%m%d-%H%M%S").to_string();
        self.run_parts(path, &parts, &timestamp)
    }

    /// Process an already-loaded part list under an explicit timestamp.
    pub fn run_parts(
        &self,
        config_path: &Path,
        parts: &[Part],
        timestamp: &str,
    ) -> Result<RunSummary> {
        // Compile every function source — global definitions first, then
        // inline join functions, both in declared order so a later definition
        // replaces an earlier one — before any table is created. A malformed
        // definition means the configuration itself is unreliable.
        let mut registry = FunctionRegistry::new();
        for part in parts {
            if let Part::FunctionDefinition(definition) = part {
                registry
                    .compile_sources(&definition.functions)
                    .with_context(|| {
                        format!("compiling functions declared in {}", config_path.display())
                    })?;
            }
        }
        for part in parts {
            if let Part::Join(join_part) = part {
                registry
                    .compile_sources(&join_part.functions)
                    .with_context(|| {
                        format!(
                            "compiling inline join functions declared in {}",
                            config_path.display()
                        )
                    })?;
            }
        }

        // Resolve every join up front: an underspecified join part is a
        // structural problem, not a data problem.
        let mut resolved_joins = Vec::new();
        for part in parts {
            if let Part::Join(join_part) = part {
                let spec = JoinSpec::from_part(join_part).with_context(|| {
                    format!("resolving join parts declared in {}", config_path.display())
                })?;
                resolved_joins.push((join_part, spec));
            }
        }

        let mut reports: HashMap<String, ReportWriter> = HashMap::new();
        let mut part_reports = Vec::new();

        for part in parts {
            if let Part::SpreadsheetImport(import) = part {
                let label = format!("import:{}", import.excel_file.display());
                let outcome = self.run_import(import, timestamp);
                part_reports.push(record(label, outcome));
            }
        }
        for part in parts {
            if let Part::Extraction(extraction) = part {
                let label = format!("extraction:{}", extraction.table_name);
                let outcome = self.run_extraction(extraction, timestamp, &mut reports);
                part_reports.push(record(label, outcome));
            }
        }
        for (join_part, spec) in &resolved_joins {
            let label = match spec {
                JoinSpec::Diagnostic { .. } => "join:diagnostic".to_string(),
                JoinSpec::Select { target, .. } | JoinSpec::AutoJoin { target, .. } => {
                    format!("join:{target}")
                }
            };
            let outcome = self.run_join(join_part, spec, &registry, timestamp, &mut reports);
            part_reports.push(record(label, outcome));
        }

        Ok(RunSummary {
            config_path: config_path.to_path_buf(),
            timestamp: timestamp.to_string(),
            parts: part_reports,
        })
    }

    fn run_import(
        &self,
        part: &ImportPart,
        timestamp: &str,
    ) -> Result<PartOutcome, PartError> {
        let run_db = format!("{}{}", part.db_name, timestamp);
        let mut store = RunStore::open(&self.data_dir, &run_db)?;
        let tables = import_workbook(&mut store, &part.excel_file, part.excel_sheets.as_deref())?;
        info!(
            file = %part.excel_file.display(),
            db = %run_db,
            tables = ?tables,
            "spreadsheet import completed"
        );
        Ok(PartOutcome::Completed {
            tables,
            exported: false,
        })
    }

    fn run_extraction(
        &self,
        part: &ExtractionPart,
        timestamp: &str,
        reports: &mut HashMap<String, ReportWriter>,
    ) -> Result<PartOutcome, PartError> {
        let table = config::sanitize_table_name(&part.table_name);
        let template = RowTemplate::compile(&part.template).map_err(|source| {
            PartError::Template {
                table: table.clone(),
                source,
            }
        })?;

        let run_db = format!("{}{}", part.db_name, timestamp);
        let mut store = RunStore::open(&self.data_dir, &run_db)?;
        let header = template.header();

        let mut total_rows = 0;
        for input in input_files(part)? {
            let text = std::fs::read_to_string(&input).map_err(|source| PartError::Input {
                path: input.clone(),
                source,
            })?;
            let filename = input
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| input.display().to_string());

            let rows = template.extract(&filename, &text);
            if rows.is_empty() {
                warn!(input = %input.display(), table = %table, "template produced no rows");
                continue;
            }
            total_rows += store.append_rows(&table, &header, &rows)?;
        }
        if total_rows == 0 {
            return Err(PartError::NoRows(table));
        }
        info!(table = %table, db = %run_db, rows = total_rows, "extraction completed");

        let exported = if part.excel_export {
            self.export_table(&store, &table, &run_db, reports)?;
            true
        } else {
            false
        };
        Ok(PartOutcome::Completed {
            tables: vec![table],
            exported,
        })
    }

    fn run_join(
        &self,
        part: &JoinPart,
        spec: &JoinSpec,
        registry: &FunctionRegistry,
        timestamp: &str,
        reports: &mut HashMap<String, ReportWriter>,
    ) -> Result<PartOutcome, PartError> {
        let run_db = format!("{}{}", part.db_name, timestamp);
        let store = RunStore::open(&self.data_dir, &run_db)?;
        registry
            .bind_all(store.connection())
            .map_err(|source| PartError::Bind {
                db: run_db.clone(),
                source,
            })?;

        match join::materialize(store.connection(), spec)? {
            JoinOutcome::Diagnostic { rows } => {
                info!(
                    command = %spec.select_sql(),
                    result = ?rows,
                    "diagnostic command executed"
                );
                Ok(PartOutcome::Completed {
                    tables: Vec::new(),
                    exported: false,
                })
            }
            JoinOutcome::Materialized { table, row_count } => {
                info!(table = %table, db = %run_db, rows = row_count, "join completed");
                let exported = if part.excel_export {
                    self.export_table(&store, &table, &run_db, reports)?;
                    true
                } else {
                    false
                };
                Ok(PartOutcome::Completed {
                    tables: vec![table],
                    exported,
                })
            }
        }
    }

    fn export_table(
        &self,
        store: &RunStore,
        table: &str,
        run_db: &str,
        reports: &mut HashMap<String, ReportWriter>,
    ) -> Result<(), PartError> {
        let data = store.fetch_table(table)?;
        let writer = reports.entry(run_db.to_string()).or_insert_with(|| {
            ReportWriter::create(self.data_dir.join(format!("{run_db}.xlsx")))
        });
        let export_error = |source| PartError::Export {
            table: table.to_string(),
            source,
        };
        writer.add_sheet(&data).map_err(export_error)?;
        writer.save().map_err(export_error)?;
        info!(table = %table, report = %writer.path().display(), "report sheet written");
        Ok(())
    }
}

fn record(label: String, result: Result<PartOutcome, PartError>) -> PartReport {
    let outcome = match result {
        Ok(outcome) => outcome,
        Err(part_error) => {
            error!(
                part = %label,
                error = %part_error,
                "part failed; continuing with remaining parts"
            );
            PartOutcome::Failed { error: part_error }
        }
    };
    PartReport { label, outcome }
}

fn input_files(part: &ExtractionPart) -> Result<Vec<PathBuf>, PartError> {
    let mut files = part.files.clone();
    for folder in &part.folders {
        let entries = std::fs::read_dir(folder).map_err(|source| PartError::Input {
            path: folder.clone(),
            source,
        })?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .collect();
        paths.sort();
        files.extend(paths);
    }
    Ok(files)
}
