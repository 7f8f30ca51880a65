//! Template-based text extraction.
//!
//! A row template is a regular expression with named capture groups. The
//! group names become the table header, each match over an input file becomes
//! one row, and every row is prefixed with the originating file name under
//! the `Filename` provenance column.

use regex::Regex;
use thiserror::Error;

use crate::join::PROVENANCE_COLUMN;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid row template: {0}")]
    InvalidTemplate(#[from] regex::Error),

    #[error("row template has no named capture groups")]
    NoFields,
}

#[derive(Debug)]
pub struct RowTemplate {
    regex: Regex,
    fields: Vec<String>,
}

impl RowTemplate {
    pub fn compile(source: &str) -> Result<Self, ExtractError> {
        let regex = Regex::new(source)?;
        let fields: Vec<String> = regex
            .capture_names()
            .flatten()
            .map(|name| name.to_string())
            .collect();
        if fields.is_empty() {
            return Err(ExtractError::NoFields);
        }
        Ok(Self { regex, fields })
    }

    /// Table header: provenance column first, template fields after.
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.fields.len() + 1);
        header.push(PROVENANCE_COLUMN.to_string());
        header.extend(self.fields.iter().cloned());
        header
    }

    /// Extract one row per template match. Unmatched optional groups become
    /// empty text rather than NULL so cells stay comparable across files.
    pub fn extract(&self, filename: &str, text: &str) -> Vec<Vec<Option<String>>> {
        self.regex
            .captures_iter(text)
            .map(|captures| {
                let mut row = Vec::with_capacity(self.fields.len() + 1);
                row.push(Some(filename.to_string()));
                for field in &self.fields {
                    let value = captures
                        .name(field)
                        .map(|m| m.as_str().to_string())
                        .unwrap_or_default();
                    row.push(Some(value));
                }
                row
            })
            .collect()
    }
}
