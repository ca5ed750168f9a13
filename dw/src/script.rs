//! All-or-nothing execution of a SQL script
//!
//! The script is split into statements, executed one at a time inside a
//! single transaction, and committed only if every statement succeeds. Any
//! error rolls the whole batch back.
//!
//! # Partial-atomicity caveat
//!
//! Row-level changes and DDL are rolled back, but some statements take effect
//! outside the transaction: `PRAGMA` settings, and on other engines `TRUNCATE`.
//! `VACUUM`, `ATTACH` and `DETACH` are refused by SQLite inside a transaction
//! and therefore fail the batch. When a batch fails after such a statement was
//! applied, the failure names those statements and the operator must inspect
//! the warehouse before re-running.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::ScriptError;

/// Leading keywords of statements whose effect a rollback does not undo
const NON_TRANSACTIONAL: &[&str] = &["PRAGMA", "TRUNCATE", "VACUUM", "ATTACH", "DETACH"];

/// One statement of a script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    /// 1-based position in the script
    pub index: usize,
    /// Line the statement starts on
    pub line: usize,
    pub text: String,
}

impl SqlStatement {
    /// Uppercased first keyword
    pub fn keyword(&self) -> String {
        first_words(&self.text, 1).into_iter().next().unwrap_or_default()
    }

    /// Whether a rollback would not undo this statement
    pub fn is_non_transactional(&self) -> bool {
        NON_TRANSACTIONAL.contains(&self.keyword().as_str())
    }

    /// Whether this statement would open or close the enclosing transaction
    pub fn is_transaction_control(&self) -> bool {
        let words = first_words(&self.text, 2);
        match words.first().map(String::as_str) {
            Some("BEGIN" | "COMMIT" | "END") => true,
            Some("ROLLBACK") => words.get(1).map(String::as_str) != Some("TO"),
            _ => false,
        }
    }

    /// Single-line prefix for logs and diagnostics
    pub fn preview(&self) -> String {
        let flat = self.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() > 80 {
            format!("{}...", flat.chars().take(80).collect::<String>())
        } else {
            flat
        }
    }
}

/// Uppercased leading words of a statement, skipping comments
fn first_words(text: &str, count: usize) -> Vec<String> {
    let mut words = Vec::new();
    let mut rest = text;
    while words.len() < count {
        rest = rest.trim_start();
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, r)| r).unwrap_or("");
            continue;
        }
        if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, r)| r).unwrap_or("");
            continue;
        }
        let end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .unwrap_or(rest.len());
        if end == 0 {
            break;
        }
        words.push(rest[..end].to_ascii_uppercase());
        rest = &rest[end..];
    }
    words
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    Single,
    Double,
    Backtick,
    Bracket,
    LineComment,
    BlockComment,
}

/// Split a script into statements on top-level semicolons
///
/// Quoted strings, quoted identifiers and comments are respected, and the
/// `BEGIN ... END` body of a `CREATE TRIGGER` stays in one statement.
/// Empty statements are dropped.
pub fn split_statements(sql: &str) -> Result<Vec<SqlStatement>, ScriptError> {
    debug!(len = sql.len(), "split_statements: called");
    let chars: Vec<char> = sql.chars().collect();
    let mut statements = Vec::new();

    let mut lex = Lex::Code;
    let mut lex_line = 1;
    let mut line = 1;
    let mut current = String::new();
    let mut start_line = 0;
    let mut has_code = false;

    let mut word = String::new();
    let mut words_seen = 0;
    let mut first_word = String::new();
    let mut is_trigger = false;
    let mut depth = 0usize;

    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        if lex == Lex::Code && (c.is_ascii_alphanumeric() || c == '_') {
            word.push(c);
        } else if !word.is_empty() {
            let upper = word.to_ascii_uppercase();
            words_seen += 1;
            if words_seen == 1 {
                first_word = upper.clone();
            }
            if first_word == "CREATE" && words_seen <= 4 && upper == "TRIGGER" {
                is_trigger = true;
            }
            if is_trigger {
                match upper.as_str() {
                    "BEGIN" | "CASE" => depth += 1,
                    "END" => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
            word.clear();
        }

        match lex {
            Lex::Code => match c {
                ';' if depth == 0 => {
                    if has_code {
                        statements.push(SqlStatement {
                            index: statements.len() + 1,
                            line: start_line,
                            text: current.trim().to_string(),
                        });
                    }
                    current.clear();
                    has_code = false;
                    words_seen = 0;
                    first_word.clear();
                    is_trigger = false;
                    i += 1;
                    continue;
                }
                '-' if next == Some('-') => {
                    lex = Lex::LineComment;
                }
                '/' if next == Some('*') => {
                    lex = Lex::BlockComment;
                    lex_line = line;
                    current.push_str("/*");
                    i += 2;
                    continue;
                }
                '\'' | '"' | '`' | '[' => {
                    lex = match c {
                        '\'' => Lex::Single,
                        '"' => Lex::Double,
                        '`' => Lex::Backtick,
                        _ => Lex::Bracket,
                    };
                    lex_line = line;
                }
                _ => {}
            },
            Lex::Single | Lex::Double | Lex::Backtick => {
                let quote = match lex {
                    Lex::Single => '\'',
                    Lex::Double => '"',
                    _ => '`',
                };
                if c == quote {
                    if next == Some(quote) {
                        current.push(c);
                        current.push(quote);
                        i += 2;
                        continue;
                    }
                    lex = Lex::Code;
                }
            }
            Lex::Bracket => {
                if c == ']' {
                    lex = Lex::Code;
                }
            }
            Lex::LineComment => {
                if c == '\n' {
                    lex = Lex::Code;
                }
            }
            Lex::BlockComment => {
                if c == '*' && next == Some('/') {
                    lex = Lex::Code;
                    current.push_str("*/");
                    i += 2;
                    continue;
                }
            }
        }

        let in_comment = matches!(lex, Lex::LineComment | Lex::BlockComment);
        if !in_comment && !c.is_whitespace() && !has_code {
            has_code = true;
            start_line = line;
        }
        if c == '\n' {
            line += 1;
        }
        current.push(c);
        i += 1;
    }

    match lex {
        Lex::Single | Lex::Double | Lex::Backtick | Lex::Bracket => {
            return Err(ScriptError::Unterminated {
                what: "quoted text",
                line: lex_line,
            });
        }
        Lex::BlockComment => {
            return Err(ScriptError::Unterminated {
                what: "block comment",
                line: lex_line,
            });
        }
        Lex::Code | Lex::LineComment => {}
    }

    if has_code {
        statements.push(SqlStatement {
            index: statements.len() + 1,
            line: start_line,
            text: current.trim().to_string(),
        });
    }

    debug!(count = statements.len(), "split_statements: done");
    Ok(statements)
}

/// What a statement produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StatementResult {
    /// Statement returned rows
    Rows(usize),
    /// Statement changed rows
    Changed(usize),
}

#[derive(Debug, Clone, Serialize)]
pub struct StatementReport {
    pub index: usize,
    pub line: usize,
    pub preview: String,
    pub result: StatementResult,
}

/// Result of a committed batch
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScriptReport {
    pub statements: Vec<StatementReport>,
    pub duration: Duration,
}

impl ScriptReport {
    /// Rows changed across the batch
    pub fn rows_affected(&self) -> usize {
        self.statements
            .iter()
            .map(|s| match s.result {
                StatementResult::Changed(n) => n,
                StatementResult::Rows(_) => 0,
            })
            .sum()
    }
}

/// Executes SQL scripts as one transaction
pub struct TransactionalScriptExecutor<'c> {
    conn: &'c mut Connection,
}

impl<'c> TransactionalScriptExecutor<'c> {
    pub fn new(conn: &'c mut Connection) -> Self {
        Self { conn }
    }

    /// Read a script file and execute it
    pub fn execute_file(&mut self, path: &Path) -> Result<ScriptReport, ScriptError> {
        debug!(?path, "TransactionalScriptExecutor::execute_file: called");
        info!(path = %path.display(), "Reading SQL script");
        let sql = fs::read_to_string(path).map_err(|source| ScriptError::NotFound {
            path: path.to_path_buf(),
            source,
        })?;
        self.execute_script(&sql)
    }

    /// Execute every statement, committing only if all succeed
    pub fn execute_script(&mut self, sql: &str) -> Result<ScriptReport, ScriptError> {
        debug!("TransactionalScriptExecutor::execute_script: called");
        let start = Instant::now();
        let statements = split_statements(sql)?;

        if let Some(control) = statements.iter().find(|s| s.is_transaction_control()) {
            return Err(ScriptError::TransactionControl {
                index: control.index,
                preview: control.preview(),
            });
        }

        let tx = self.conn.transaction()?;
        info!(statements = statements.len(), "Transaction started");

        let mut reports = Vec::with_capacity(statements.len());
        let mut applied_non_transactional = Vec::new();

        for statement in &statements {
            debug!(index = statement.index, preview = %statement.preview(), "executing statement");
            let result = match run_statement(&tx, statement) {
                Ok(result) => result,
                Err(source) => {
                    error!(
                        index = statement.index,
                        line = statement.line,
                        error = %source,
                        "Statement failed, rolling back"
                    );
                    match tx.rollback() {
                        Ok(()) => warn!("Transaction rolled back"),
                        Err(e) => error!(error = %e, "Rollback failed"),
                    }
                    if !applied_non_transactional.is_empty() {
                        warn!(
                            statements = ?applied_non_transactional,
                            "Statements outside transactional control were already applied; inspect the warehouse"
                        );
                    }
                    return Err(ScriptError::Statement {
                        index: statement.index,
                        preview: statement.preview(),
                        applied_non_transactional,
                        source,
                    });
                }
            };

            match result {
                StatementResult::Rows(n) => info!(index = statement.index, "Query executed (rows returned: {})", n),
                StatementResult::Changed(n) => {
                    info!(index = statement.index, "Statement executed (rows affected: {})", n)
                }
            }
            if statement.is_non_transactional() {
                warn!(
                    index = statement.index,
                    keyword = %statement.keyword(),
                    "Statement is not undone by rollback"
                );
                applied_non_transactional.push(statement.index);
            }

            reports.push(StatementReport {
                index: statement.index,
                line: statement.line,
                preview: statement.preview(),
                result,
            });
        }

        tx.commit()?;
        let report = ScriptReport {
            statements: reports,
            duration: start.elapsed(),
        };
        info!(
            statements = report.statements.len(),
            rows_affected = report.rows_affected(),
            "Transaction committed in {:.2} seconds",
            report.duration.as_secs_f64()
        );
        Ok(report)
    }
}

fn run_statement(conn: &Connection, statement: &SqlStatement) -> rusqlite::Result<StatementResult> {
    let mut stmt = conn.prepare(&statement.text)?;
    if stmt.column_count() > 0 {
        let mut rows = stmt.query([])?;
        let mut count = 0;
        while rows.next()?.is_some() {
            count += 1;
        }
        Ok(StatementResult::Rows(count))
    } else {
        Ok(StatementResult::Changed(stmt.execute([])?))
    }
}
