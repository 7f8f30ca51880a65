//! Spreadsheet report export.
//!
//! One workbook per run database, one sheet per exported table. The header
//! row is frozen and highlighted, an auto-filter spans the data range, and
//! column widths are uniform.

use std::path::PathBuf;

use rust_xlsxwriter::{Color, Format, Workbook, XlsxError};
use thiserror::Error;

use crate::store::TableData;

const COLUMN_WIDTH: f64 = 25.0;
const MAX_SHEET_NAME: usize = 31;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to write report sheet '{sheet}': {source}")]
    Sheet {
        sheet: String,
        #[source]
        source: XlsxError,
    },

    #[error("failed to save report {path}: {source}")]
    Save {
        path: PathBuf,
        #[source]
        source: XlsxError,
    },
}

/// Accumulates report sheets for one run database and rewrites the workbook
/// file after every added sheet, so a partial run still leaves a readable
/// report behind.
pub struct ReportWriter {
    workbook: Workbook,
    path: PathBuf,
}

impl ReportWriter {
    pub fn create(path: PathBuf) -> Self {
        Self {
            workbook: Workbook::new(),
            path,
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn add_sheet(&mut self, table: &TableData) -> Result<(), ReportError> {
        let sheet_error = |source| ReportError::Sheet {
            sheet: table.name.clone(),
            source,
        };

        let header_format = Format::new().set_background_color(Color::Yellow);
        let worksheet = self.workbook.add_worksheet();
        worksheet
            .set_name(sanitize_sheet_name(&table.name))
            .map_err(sheet_error)?;

        for (column, name) in table.columns.iter().enumerate() {
            worksheet
                .write_string_with_format(0, column as u16, name, &header_format)
                .map_err(sheet_error)?;
        }
        for (row_index, row) in table.rows.iter().enumerate() {
            for (column, cell) in row.iter().enumerate() {
                if let Some(text) = cell {
                    worksheet
                        .write_string(row_index as u32 + 1, column as u16, text)
                        .map_err(sheet_error)?;
                }
            }
        }

        if !table.columns.is_empty() {
            let last_row = table.rows.len() as u32;
            let last_column = (table.columns.len() - 1) as u16;
            worksheet.set_freeze_panes(1, 0).map_err(sheet_error)?;
            worksheet
                .autofilter(0, 0, last_row, last_column)
                .map_err(sheet_error)?;
            for column in 0..table.columns.len() {
                worksheet
                    .set_column_width(column as u16, COLUMN_WIDTH)
                    .map_err(sheet_error)?;
            }
        }

        Ok(())
    }

    pub fn save(&mut self) -> Result<(), ReportError> {
        self.workbook
            .save(&self.path)
            .map_err(|source| ReportError::Save {
                path: self.path.clone(),
                source,
            })
    }
}

/// Excel sheet names are capped at 31 characters and reject a handful of
/// punctuation characters.
fn sanitize_sheet_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .take(MAX_SHEET_NAME)
        .map(|ch| match ch {
            '[' | ']' | ':' | '*' | '?' | '/' | '\\' => '_',
            other => other,
        })
        .collect();
    if cleaned.is_empty() {
        "sheet".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use calamine::{open_workbook_auto, Reader};
    use tempfile::TempDir;

    fn sample_table() -> TableData {
        TableData {
            name: "ports".to_string(),
            columns: vec!["Filename".to_string(), "Port".to_string()],
            rows: vec![
                vec![Some("r1.txt".to_string()), Some("eth0".to_string())],
                vec![Some("r2.txt".to_string()), None],
            ],
        }
    }

    #[test]
    fn exported_sheet_round_trips_through_a_reader() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.xlsx");

        let mut writer = ReportWriter::create(path.clone());
        writer.add_sheet(&sample_table()).unwrap();
        writer.save().unwrap();

        let mut workbook = open_workbook_auto(&path).unwrap();
        let range = workbook.worksheet_range("ports").unwrap();
        let rows: Vec<Vec<String>> = range
            .rows()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect())
            .collect();
        assert_eq!(rows[0], vec!["Filename", "Port"]);
        assert_eq!(rows[1], vec!["r1.txt", "eth0"]);
    }

    #[test]
    fn saving_again_after_adding_a_sheet_rewrites_the_workbook() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("report.xlsx");

        let mut writer = ReportWriter::create(path.clone());
        writer.add_sheet(&sample_table()).unwrap();
        writer.save().unwrap();

        let mut second = sample_table();
        second.name = "ports_inventory".to_string();
        writer.add_sheet(&second).unwrap();
        writer.save().unwrap();

        let workbook = open_workbook_auto(&path).unwrap();
        assert_eq!(
            workbook.sheet_names(),
            vec!["ports".to_string(), "ports_inventory".to_string()]
        );
    }

    #[test]
    fn duplicate_sheet_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut writer = ReportWriter::create(dir.path().join("report.xlsx"));
        writer.add_sheet(&sample_table()).unwrap();
        let error = writer.add_sheet(&sample_table()).unwrap_err();
        assert!(matches!(error, ReportError::Sheet { .. }));
    }

    #[test]
    fn long_sheet_names_are_truncated() {
        assert_eq!(sanitize_sheet_name(&"x".repeat(40)).len(), 31);
        assert_eq!(sanitize_sheet_name("a/b:c"), "a_b_c");
    }
}
