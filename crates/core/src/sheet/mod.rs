//! Spreadsheet import and report export.

pub mod import;
pub mod report;

pub use import::{import_workbook, ImportError};
pub use report::{ReportError, ReportWriter};
