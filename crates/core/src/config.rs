//! Configuration file model and loader.
//!
//! A configuration file is one YAML document holding an ordered list of
//! parts. Each part carries a `type` discriminator plus type-specific keys.
//! Structural problems (unreadable file, bad YAML, missing keys) are fatal
//! for the whole file; the configuration is not trusted once its shape is
//! wrong.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration in {path} at '{location}': {detail}")]
    Parse {
        path: PathBuf,
        location: String,
        detail: String,
    },

    #[error("extraction part for table '{0}' lists no input files or folders")]
    NoInputs(String),

    #[error(
        "join part in database '{0}' needs sqlcommand, sqlcommand_run, \
         or first_table/second_table/match"
    )]
    UnderspecifiedJoin(String),

    #[error("join part in database '{0}' is missing new_table")]
    MissingTargetTable(String),
}

fn default_export() -> bool {
    true
}

/// One pipeline stage instance, discriminated by its `type` key.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    Extraction(ExtractionPart),
    SpreadsheetImport(ImportPart),
    FunctionDefinition(FunctionDefinitionPart),
    Join(JoinPart),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExtractionPart {
    /// Row template: a regex with named capture groups, one row per match.
    pub template: String,
    #[serde(default)]
    pub files: Vec<PathBuf>,
    #[serde(default)]
    pub folders: Vec<PathBuf>,
    pub db_name: String,
    pub table_name: String,
    #[serde(default = "default_export")]
    pub excel_export: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportPart {
    pub excel_file: PathBuf,
    /// Restrict the import to these sheet names; absent means every sheet.
    #[serde(default)]
    pub excel_sheets: Option<Vec<String>>,
    pub db_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FunctionDefinitionPart {
    /// Raw function source blocks, each starting with the definition token.
    pub functions: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinPart {
    pub db_name: String,
    #[serde(default)]
    pub new_table: Option<String>,
    /// Literal select statement materialized as `new_table`.
    #[serde(default)]
    pub sqlcommand: Option<String>,
    /// Diagnostic command executed verbatim; nothing is persisted.
    #[serde(default)]
    pub sqlcommand_run: Option<String>,
    #[serde(default)]
    pub first_table: Option<String>,
    #[serde(default)]
    pub second_table: Option<String>,
    /// Either an explicit predicate (contains '=') or a comma-separated
    /// column list assumed equal across both tables.
    #[serde(default, rename = "match")]
    pub match_spec: Option<String>,
    /// Extra function sources registered before this join executes.
    #[serde(default)]
    pub functions: Vec<String>,
    #[serde(default = "default_export")]
    pub excel_export: bool,
}

/// Load the ordered part list from one configuration file.
pub fn load_parts(path: &Path) -> Result<Vec<Part>, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let deserializer = serde_yaml::Deserializer::from_str(&text);
    let parts: Vec<Part> =
        serde_path_to_error::deserialize(deserializer).map_err(|error| ConfigError::Parse {
            path: path.to_path_buf(),
            location: error.path().to_string(),
            detail: error.inner().to_string(),
        })?;

    validate_parts(&parts)?;
    Ok(parts)
}

/// Structural checks beyond what serde can express.
pub fn validate_parts(parts: &[Part]) -> Result<(), ConfigError> {
    for part in parts {
        match part {
            Part::Extraction(extraction) => {
                if extraction.files.is_empty() && extraction.folders.is_empty() {
                    return Err(ConfigError::NoInputs(extraction.table_name.clone()));
                }
            }
            Part::Join(join) => {
                let auto = join.first_table.is_some()
                    && join.second_table.is_some()
                    && join.match_spec.is_some();
                if join.sqlcommand.is_none() && join.sqlcommand_run.is_none() && !auto {
                    return Err(ConfigError::UnderspecifiedJoin(join.db_name.clone()));
                }
                if join.sqlcommand_run.is_none() && join.new_table.is_none() {
                    return Err(ConfigError::MissingTargetTable(join.db_name.clone()));
                }
            }
            Part::SpreadsheetImport(_) | Part::FunctionDefinition(_) => {}
        }
    }
    Ok(())
}

/// Table names come from operator input; keep them identifier-shaped.
pub fn sanitize_table_name(name: &str) -> String {
    name.replace(['.', '-', ' '], "_")
}
