//! Spreadsheet import: one table per sheet.
//!
//! The first row of each sheet is the header (empty header cells are
//! dropped); every data cell is stringified and trimmed so imported values
//! stay text-affine alongside extracted ones.

use std::path::{Path, PathBuf};

use calamine::{open_workbook_auto, Data, Reader};
use thiserror::Error;
use tracing::warn;

use crate::config::sanitize_table_name;
use crate::store::{RunStore, StoreError};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("failed to open spreadsheet {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: calamine::Error,
    },

    #[error("failed to read sheet '{sheet}': {source}")]
    Sheet {
        sheet: String,
        #[source]
        source: calamine::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Import every sheet of `path` (or only those named in `sheet_filter`) into
/// the run database. Returns the created table names.
pub fn import_workbook(
    store: &mut RunStore,
    path: &Path,
    sheet_filter: Option<&[String]>,
) -> Result<Vec<String>, ImportError> {
    let mut workbook = open_workbook_auto(path).map_err(|source| ImportError::Open {
        path: path.to_path_buf(),
        source,
    })?;

    let mut imported = Vec::new();
    for sheet_name in workbook.sheet_names() {
        if let Some(filter) = sheet_filter {
            if !filter.contains(&sheet_name) {
                continue;
            }
        }

        let range = workbook
            .worksheet_range(&sheet_name)
            .map_err(|source| ImportError::Sheet {
                sheet: sheet_name.clone(),
                source,
            })?;

        let mut rows = range.rows();
        let Some(header_row) = rows.next() else {
            warn!(sheet = %sheet_name, "skipping empty sheet");
            continue;
        };
        let columns: Vec<String> = header_row
            .iter()
            .map(cell_text)
            .filter(|cell| !cell.is_empty())
            .collect();
        if columns.is_empty() {
            warn!(sheet = %sheet_name, "skipping sheet without header row");
            continue;
        }

        let data: Vec<Vec<Option<String>>> = rows
            .map(|row| {
                (0..columns.len())
                    .map(|index| Some(row.get(index).map(cell_text).unwrap_or_default()))
                    .collect()
            })
            .collect();

        let table = sanitize_table_name(&sheet_name);
        store.append_rows(&table, &columns, &data)?;
        imported.push(table);
    }

    Ok(imported)
}

/// Stringify a cell; empty cells become empty text, never NULL.
fn cell_text(cell: &Data) -> String {
    match cell {
        Data::Empty => String::new(),
        other => other.to_string().trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_xlsxwriter::Workbook;
    use tempfile::TempDir;

    fn write_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("inventory.xlsx");
        let mut workbook = Workbook::new();

        let sheet = workbook.add_worksheet();
        sheet.set_name("devices").unwrap();
        sheet.write_string(0, 0, "Hostname").unwrap();
        sheet.write_string(0, 1, "Site").unwrap();
        sheet.write_string(1, 0, "r1").unwrap();
        sheet.write_string(1, 1, "ams").unwrap();
        sheet.write_number(2, 0, 42.0).unwrap();
        sheet.write_string(2, 1, "  fra ").unwrap();

        let other = workbook.add_worksheet();
        other.set_name("notes").unwrap();
        other.write_string(0, 0, "Text").unwrap();

        workbook.save(&path).unwrap();
        path
    }

    #[test]
    fn imports_each_sheet_as_a_table() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(dir.path());
        let mut store = RunStore::open(dir.path(), "importdb").unwrap();

        let tables = import_workbook(&mut store, &path, None).unwrap();
        assert_eq!(tables, vec!["devices".to_string(), "notes".to_string()]);

        let devices = store.fetch_table("devices").unwrap();
        assert_eq!(devices.columns, vec!["Hostname", "Site"]);
        assert_eq!(devices.rows.len(), 2);
        // Numbers are stringified, surrounding whitespace is trimmed.
        assert_eq!(devices.rows[1][0].as_deref(), Some("42"));
        assert_eq!(devices.rows[1][1].as_deref(), Some("fra"));
    }

    #[test]
    fn sheet_filter_restricts_the_import() {
        let dir = TempDir::new().unwrap();
        let path = write_fixture(dir.path());
        let mut store = RunStore::open(dir.path(), "importdb").unwrap();

        let tables =
            import_workbook(&mut store, &path, Some(&["notes".to_string()])).unwrap();
        assert_eq!(tables, vec!["notes".to_string()]);
        assert!(!store.table_exists("devices").unwrap());
    }

    #[test]
    fn missing_file_reports_open_error() {
        let dir = TempDir::new().unwrap();
        let mut store = RunStore::open(dir.path(), "importdb").unwrap();
        let error =
            import_workbook(&mut store, &dir.path().join("absent.xlsx"), None).unwrap_err();
        assert!(matches!(error, ImportError::Open { .. }));
    }
}
