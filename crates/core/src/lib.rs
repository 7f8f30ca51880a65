pub mod config;
pub mod extract;
pub mod functions;
pub mod join;
pub mod run;
pub mod sheet;
pub mod store;

pub use config::{load_parts, ConfigError, Part};
pub use extract::{ExtractError, RowTemplate};
pub use functions::{FunctionError, FunctionRegistry, DEFINITION_TOKEN};
pub use join::{JoinError, JoinOutcome, JoinSpec, PROVENANCE_COLUMN};
pub use run::{PartError, PartOutcome, PartReport, RunController, RunSummary};
pub use sheet::{ImportError, ReportError, ReportWriter};
pub use store::{RunStore, StoreError, TableData};
