//! Join command synthesis and execution.
//!
//! A join part resolves to one of three shapes: a raw diagnostic command
//! (nothing persisted), a literal select statement, or an auto-join whose
//! condition is synthesized from a match specification. Materialization is
//! always drop-and-recreate, so re-running a part against the same run
//! database is safe.

use rusqlite::Connection;
use thiserror::Error;

use crate::config::{sanitize_table_name, JoinPart};
use crate::store::{quote_ident, value_to_text};

/// Column marking each row's originating input file. Auto-joins without an
/// explicit predicate always add equality on it, preventing accidental
/// cross-products across rows sourced from different input files.
pub const PROVENANCE_COLUMN: &str = "Filename";

#[derive(Debug, Error)]
pub enum JoinError {
    #[error("join part in database '{0}' has no command and no table pair")]
    Underspecified(String),

    #[error("auto join into '{0}' has an empty match specification")]
    EmptyMatch(String),

    #[error("sql failed for {context}: {source}")]
    Sql {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
}

/// How the first and second table are matched in an auto-join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchSpec {
    /// Explicit predicate text, used verbatim as the join condition.
    Predicate(String),
    /// Column names assumed present and equal in both tables.
    Columns(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinSpec {
    /// Execute the command as-is and log its result; no table is persisted.
    Diagnostic { command: String },
    /// Materialize a literal select statement as `target`.
    Select { target: String, select: String },
    /// Materialize a synthesized LEFT OUTER JOIN as `target`.
    AutoJoin {
        target: String,
        first: String,
        second: String,
        match_spec: MatchSpec,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Materialized { table: String, row_count: usize },
    Diagnostic { rows: Vec<Vec<Option<String>>> },
}

impl JoinSpec {
    /// Resolve the declarative part keys into one of the three join shapes.
    pub fn from_part(part: &JoinPart) -> Result<Self, JoinError> {
        if let Some(command) = &part.sqlcommand_run {
            return Ok(Self::Diagnostic {
                command: command.clone(),
            });
        }

        let target = part
            .new_table
            .as_deref()
            .map(sanitize_table_name)
            .ok_or_else(|| JoinError::Underspecified(part.db_name.clone()))?;

        if let Some(select) = &part.sqlcommand {
            return Ok(Self::Select {
                target,
                select: select.clone(),
            });
        }

        match (&part.first_table, &part.second_table, &part.match_spec) {
            (Some(first), Some(second), Some(raw_match)) => {
                let match_spec = if raw_match.contains('=') {
                    MatchSpec::Predicate(raw_match.clone())
                } else {
                    let columns: Vec<String> = raw_match
                        .split(',')
                        .map(str::trim)
                        .filter(|column| !column.is_empty())
                        .map(str::to_string)
                        .collect();
                    if columns.is_empty() {
                        return Err(JoinError::EmptyMatch(target));
                    }
                    MatchSpec::Columns(columns)
                };
                Ok(Self::AutoJoin {
                    target,
                    first: sanitize_table_name(first),
                    second: sanitize_table_name(second),
                    match_spec,
                })
            }
            _ => Err(JoinError::Underspecified(part.db_name.clone())),
        }
    }

    /// The select statement this spec executes, before any wrapping.
    pub fn select_sql(&self) -> String {
        match self {
            Self::Diagnostic { command } => command.clone(),
            Self::Select { select, .. } => select.clone(),
            Self::AutoJoin {
                first,
                second,
                match_spec,
                ..
            } => synthesize_auto_join(first, second, match_spec),
        }
    }
}

/// Build `SELECT * FROM first LEFT OUTER JOIN second ON <condition>`.
///
/// Selecting `*` from two joined tables with overlapping non-match column
/// names yields engine-default column precedence; no aliasing is performed.
fn synthesize_auto_join(first: &str, second: &str, match_spec: &MatchSpec) -> String {
    let condition = match match_spec {
        MatchSpec::Predicate(predicate) => predicate.clone(),
        MatchSpec::Columns(columns) => {
            let mut columns = columns.clone();
            if !columns
                .iter()
                .any(|column| column.eq_ignore_ascii_case(PROVENANCE_COLUMN))
            {
                columns.push(PROVENANCE_COLUMN.to_string());
            }
            columns
                .iter()
                .map(|column| format!("{first}.{column} = {second}.{column}"))
                .collect::<Vec<_>>()
                .join(" AND ")
        }
    };
    format!("SELECT * FROM {first} LEFT OUTER JOIN {second} ON {condition}")
}

/// Execute a join spec against the run database.
///
/// Materializing shapes drop any existing target table first. A failed
/// statement leaves the target absent rather than partially created.
pub fn materialize(conn: &Connection, spec: &JoinSpec) -> Result<JoinOutcome, JoinError> {
    match spec {
        JoinSpec::Diagnostic { command } => {
            let rows = query_all(conn, command)?;
            Ok(JoinOutcome::Diagnostic { rows })
        }
        JoinSpec::Select { target, .. } | JoinSpec::AutoJoin { target, .. } => {
            let select = spec.select_sql();
            let sql_error = |source| JoinError::Sql {
                context: format!("table '{target}'"),
                source,
            };

            conn.execute(
                &format!("DROP TABLE IF EXISTS {}", quote_ident(target)),
                [],
            )
            .map_err(sql_error)?;
            conn.execute(
                &format!("CREATE TABLE {} AS {select}", quote_ident(target)),
                [],
            )
            .map_err(sql_error)?;

            let row_count: i64 = conn
                .query_row(
                    &format!("SELECT count(*) FROM {}", quote_ident(target)),
                    [],
                    |row| row.get(0),
                )
                .map_err(sql_error)?;
            Ok(JoinOutcome::Materialized {
                table: target.clone(),
                row_count: row_count as usize,
            })
        }
    }
}

fn query_all(conn: &Connection, command: &str) -> Result<Vec<Vec<Option<String>>>, JoinError> {
    let sql_error = |source| JoinError::Sql {
        context: format!("command '{command}'"),
        source,
    };
    let mut stmt = conn.prepare(command).map_err(sql_error)?;
    let column_count = stmt.column_count();

    let mut rows = Vec::new();
    let mut raw = stmt.query([]).map_err(sql_error)?;
    while let Some(row) = raw.next().map_err(sql_error)? {
        let mut cells = Vec::with_capacity(column_count);
        for index in 0..column_count {
            cells.push(value_to_text(row.get_ref(index).map_err(sql_error)?));
        }
        rows.push(cells);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn join_part() -> JoinPart {
        JoinPart {
            db_name: "netdb".to_string(),
            new_table: Some("combined".to_string()),
            sqlcommand: None,
            sqlcommand_run: None,
            first_table: Some("ports".to_string()),
            second_table: Some("inventory".to_string()),
            match_spec: Some("Port".to_string()),
            functions: Vec::new(),
            excel_export: true,
        }
    }

    fn populated_connection() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE ports (Filename TEXT, Port TEXT, Status TEXT);
             INSERT INTO ports VALUES
               ('r1.txt', 'eth0', 'up'),
               ('r1.txt', 'eth1', 'down'),
               ('r2.txt', 'eth0', 'up');
             CREATE TABLE inventory (Filename TEXT, Port TEXT, Owner TEXT);
             INSERT INTO inventory VALUES
               ('r1.txt', 'eth0', 'core'),
               ('r2.txt', 'eth9', 'lab');",
        )
        .unwrap();
        conn
    }

    #[test]
    fn column_match_adds_provenance_equality() {
        let spec = JoinSpec::from_part(&join_part()).unwrap();
        assert_eq!(
            spec.select_sql(),
            "SELECT * FROM ports LEFT OUTER JOIN inventory \
             ON ports.Port = inventory.Port AND ports.Filename = inventory.Filename"
        );
    }

    #[test]
    fn provenance_column_is_not_duplicated_when_listed() {
        let mut part = join_part();
        part.match_spec = Some("Port, Filename".to_string());
        let spec = JoinSpec::from_part(&part).unwrap();
        assert_eq!(
            spec.select_sql(),
            "SELECT * FROM ports LEFT OUTER JOIN inventory \
             ON ports.Port = inventory.Port AND ports.Filename = inventory.Filename"
        );
    }

    #[test]
    fn explicit_predicate_is_used_verbatim() {
        let mut part = join_part();
        part.match_spec = Some("ports.Port = inventory.Port".to_string());
        let spec = JoinSpec::from_part(&part).unwrap();
        assert_eq!(
            spec.select_sql(),
            "SELECT * FROM ports LEFT OUTER JOIN inventory ON ports.Port = inventory.Port"
        );
    }

    #[test]
    fn left_outer_join_keeps_every_first_table_row() {
        let conn = populated_connection();
        let spec = JoinSpec::from_part(&join_part()).unwrap();

        let outcome = materialize(&conn, &spec).unwrap();
        // Three left rows, only ('r1.txt', 'eth0') matched on Port+Filename.
        assert_eq!(
            outcome,
            JoinOutcome::Materialized {
                table: "combined".to_string(),
                row_count: 3
            }
        );

        let owner: Option<String> = conn
            .query_row(
                "SELECT Owner FROM combined WHERE Port = 'eth0' AND Filename = 'r1.txt'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(owner.as_deref(), Some("core"));

        let unmatched: Option<String> = conn
            .query_row(
                "SELECT Owner FROM combined WHERE Port = 'eth1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(unmatched, None);
    }

    #[test]
    fn rerunning_the_same_join_is_idempotent() {
        let conn = populated_connection();
        let spec = JoinSpec::from_part(&join_part()).unwrap();

        let first = materialize(&conn, &spec).unwrap();
        let second = materialize(&conn, &spec).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn literal_select_is_wrapped_as_create_table() {
        let conn = populated_connection();
        let spec = JoinSpec::Select {
            target: "up_ports".to_string(),
            select: "SELECT Port FROM ports WHERE Status = 'up'".to_string(),
        };

        let outcome = materialize(&conn, &spec).unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Materialized {
                table: "up_ports".to_string(),
                row_count: 2
            }
        );
    }

    #[test]
    fn diagnostic_command_persists_nothing() {
        let conn = populated_connection();
        let spec = JoinSpec::Diagnostic {
            command: "SELECT count(*) FROM ports".to_string(),
        };

        let outcome = materialize(&conn, &spec).unwrap();
        assert_eq!(
            outcome,
            JoinOutcome::Diagnostic {
                rows: vec![vec![Some("3".to_string())]]
            }
        );
    }

    #[test]
    fn missing_source_table_fails_without_creating_target() {
        let conn = populated_connection();
        let mut part = join_part();
        part.second_table = Some("absent".to_string());
        let spec = JoinSpec::from_part(&part).unwrap();

        let error = materialize(&conn, &spec).unwrap_err();
        assert!(matches!(error, JoinError::Sql { .. }));

        let leftover: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE name = 'combined'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn part_without_command_or_pair_is_rejected() {
        let mut part = join_part();
        part.first_table = None;
        let error = JoinSpec::from_part(&part).unwrap_err();
        assert!(matches!(error, JoinError::Underspecified(_)));
    }
}
