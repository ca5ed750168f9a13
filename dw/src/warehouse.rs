//! Warehouse connection handling and object naming
//!
//! The warehouse is a SQLite database. Layered schemas (bronze, silver, gold)
//! are separate files attached under their schema name, so SQL units can keep
//! using `schema.table` references.

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::Connection;
use tracing::{debug, info};

use crate::config::WarehouseConfig;
use crate::error::Result;

/// Prefix that derives a staging table name from its target
pub const STAGING_PREFIX: &str = "stg_";

/// Open the warehouse and attach every configured schema
pub fn open(config: &WarehouseConfig) -> Result<Connection> {
    debug!(path = ?config.path, attach = ?config.attach, "warehouse::open: called");
    ensure_parent_dir(&config.path)?;
    let conn = Connection::open(&config.path)?;
    conn.busy_timeout(Duration::from_millis(config.busy_timeout_ms))?;

    for (schema, path) in &config.attach {
        ensure_parent_dir(path)?;
        debug!(%schema, ?path, "warehouse::open: attaching schema");
        conn.execute(
            &format!("ATTACH DATABASE ?1 AS {}", quote_ident(schema)),
            [path.to_string_lossy().as_ref()],
        )?;
    }

    info!(path = %config.path.display(), schemas = config.attach.len(), "Warehouse connection opened");
    Ok(conn)
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Staging table for a target: the last path segment gets the staging prefix
///
/// `crm_cust_info` -> `stg_crm_cust_info`, `bronze.crm_cust_info` -> `bronze.stg_crm_cust_info`
pub fn staging_table_name(target: &str) -> String {
    match target.rsplit_once('.') {
        Some((schema, table)) => format!("{}.{}{}", schema, STAGING_PREFIX, table),
        None => format!("{}{}", STAGING_PREFIX, target),
    }
}

/// Whether `name` is a plain identifier (`[A-Za-z_][A-Za-z0-9_]*`)
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => chars.all(|c| c.is_ascii_alphanumeric() || c == '_'),
        _ => false,
    }
}

/// Whether `name` is an identifier optionally qualified by one schema
pub fn is_valid_table_name(name: &str) -> bool {
    match name.split_once('.') {
        Some((schema, table)) => is_valid_identifier(schema) && is_valid_identifier(table),
        None => is_valid_identifier(name),
    }
}

/// Quote a possibly schema-qualified identifier for interpolation into SQL
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// Check whether a (possibly schema-qualified) table exists
pub fn table_exists(conn: &Connection, name: &str) -> rusqlite::Result<bool> {
    debug!(%name, "warehouse::table_exists: called");
    let (schema, table) = match name.rsplit_once('.') {
        Some((schema, table)) => (schema, table),
        None => ("main", name),
    };
    let sql = format!(
        "SELECT COUNT(*) FROM {}.sqlite_master WHERE type = 'table' AND name = ?1",
        quote_ident(schema)
    );
    let count: i64 = conn.query_row(&sql, [table], |row| row.get(0))?;
    Ok(count > 0)
}

/// Count the rows of a table
pub fn row_count(conn: &Connection, name: &str) -> rusqlite::Result<i64> {
    conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(name)), [], |row| row.get(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    #[test]
    fn test_staging_table_name_plain() {
        assert_eq!(staging_table_name("crm_cust_info"), "stg_crm_cust_info");
    }

    #[test]
    fn test_staging_table_name_keeps_schema() {
        assert_eq!(staging_table_name("bronze.crm_cust_info"), "bronze.stg_crm_cust_info");
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("cst_id"));
        assert!(is_valid_identifier("_hidden"));
        assert!(!is_valid_identifier("1abc"));
        assert!(!is_valid_identifier("drop table;"));
        assert!(!is_valid_identifier(""));

        assert!(is_valid_table_name("bronze.crm_cust_info"));
        assert!(!is_valid_table_name("a.b.c"));
        assert!(!is_valid_table_name("bronze."));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("crm_cust_info"), "\"crm_cust_info\"");
        assert_eq!(quote_ident("bronze.crm_cust_info"), "\"bronze\".\"crm_cust_info\"");
    }

    #[test]
    fn test_open_attaches_schemas() {
        let temp = tempdir().unwrap();
        let mut attach = BTreeMap::new();
        attach.insert("bronze".to_string(), temp.path().join("layers").join("bronze.db"));

        let config = WarehouseConfig {
            path: temp.path().join("warehouse.db"),
            attach,
            busy_timeout_ms: 1000,
        };

        let conn = open(&config).unwrap();
        conn.execute_batch("CREATE TABLE bronze.items (id INTEGER PRIMARY KEY, name TEXT);")
            .unwrap();

        assert!(table_exists(&conn, "bronze.items").unwrap());
        assert!(!table_exists(&conn, "items").unwrap());
        assert_eq!(row_count(&conn, "bronze.items").unwrap(), 0);
        assert!(temp.path().join("layers").join("bronze.db").exists());
    }
}
