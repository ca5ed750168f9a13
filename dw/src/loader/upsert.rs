//! SQL statement builders for the staging-then-merge protocol
//!
//! Pure functions of a [`TableLoadSpec`]; nothing here touches a connection.

use super::TableLoadSpec;
use crate::warehouse::quote_ident;

fn column_list(columns: &[String]) -> String {
    columns.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", ")
}

/// Merge the staging table into the target, staged values winning on key collision
///
/// Key columns are the conflict target; every other declared column is
/// overwritten. `WHERE true` keeps SQLite from reading `ON CONFLICT` as a join
/// constraint, and `ORDER BY rowid` makes the last staged row win when the
/// file repeats a key.
pub fn build_upsert_clause(spec: &TableLoadSpec) -> String {
    let columns = column_list(&spec.columns);
    let updates: Vec<String> = spec
        .columns
        .iter()
        .filter(|c| !spec.key.contains(c))
        .map(|c| format!("{col} = excluded.{col}", col = quote_ident(c)))
        .collect();

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    format!(
        "INSERT INTO {target} ({columns}) SELECT {columns} FROM {staging} WHERE true ORDER BY rowid \
         ON CONFLICT ({key}) {action}",
        target = quote_ident(&spec.target),
        staging = quote_ident(&spec.staging_table()),
        key = column_list(&spec.key),
    )
}

/// Insert one staged row (positional parameters in declared column order)
pub fn build_staging_insert(spec: &TableLoadSpec) -> String {
    let placeholders: Vec<String> = (1..=spec.columns.len()).map(|i| format!("?{}", i)).collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({})",
        quote_ident(&spec.staging_table()),
        column_list(&spec.columns),
        placeholders.join(", ")
    )
}

/// Drop a staging table left behind by an earlier load
pub fn build_drop_staging(spec: &TableLoadSpec) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(&spec.staging_table()))
}

/// Create the staging table as a constraint-free copy of the declared target columns
pub fn build_create_staging(spec: &TableLoadSpec) -> String {
    format!(
        "CREATE TABLE {} AS SELECT {} FROM {} WHERE 0",
        quote_ident(&spec.staging_table()),
        column_list(&spec.columns),
        quote_ident(&spec.target)
    )
}

/// Empty the staging table
pub fn build_clear_staging(spec: &TableLoadSpec) -> String {
    format!("DELETE FROM {}", quote_ident(&spec.staging_table()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cust_info() -> TableLoadSpec {
        TableLoadSpec::new(
            "bronze.crm_cust_info",
            "data_files/cust_info.csv",
            &["cst_id", "cst_key", "cst_firstname", "cst_marital_status"],
            &["cst_id"],
        )
    }

    #[test]
    fn test_upsert_clause_for_fixture() {
        let sql = build_upsert_clause(&cust_info());

        assert_eq!(
            sql,
            "INSERT INTO \"bronze\".\"crm_cust_info\" (\"cst_id\", \"cst_key\", \"cst_firstname\", \"cst_marital_status\") \
             SELECT \"cst_id\", \"cst_key\", \"cst_firstname\", \"cst_marital_status\" \
             FROM \"bronze\".\"stg_crm_cust_info\" WHERE true ORDER BY rowid \
             ON CONFLICT (\"cst_id\") DO UPDATE SET \"cst_key\" = excluded.\"cst_key\", \
             \"cst_firstname\" = excluded.\"cst_firstname\", \
             \"cst_marital_status\" = excluded.\"cst_marital_status\""
        );
    }

    #[test]
    fn test_upsert_clause_composite_key() {
        let spec = TableLoadSpec::new(
            "crm_sales_details",
            "sales.csv",
            &["sls_ord_num", "sls_prd_key", "sls_quantity"],
            &["sls_ord_num", "sls_prd_key"],
        );
        let sql = build_upsert_clause(&spec);

        assert!(sql.contains("ON CONFLICT (\"sls_ord_num\", \"sls_prd_key\")"));
        assert!(sql.ends_with("DO UPDATE SET \"sls_quantity\" = excluded.\"sls_quantity\""));
        assert!(!sql.contains("\"sls_ord_num\" = excluded"));
    }

    #[test]
    fn test_upsert_clause_all_key_columns_does_nothing_on_conflict() {
        let spec = TableLoadSpec::new("erp_px_cat", "cat.csv", &["id"], &["id"]);
        assert!(build_upsert_clause(&spec).ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn test_staging_insert_placeholders_follow_column_order() {
        let sql = build_staging_insert(&cust_info());
        assert_eq!(
            sql,
            "INSERT INTO \"bronze\".\"stg_crm_cust_info\" (\"cst_id\", \"cst_key\", \"cst_firstname\", \"cst_marital_status\") \
             VALUES (?1, ?2, ?3, ?4)"
        );
    }

    #[test]
    fn test_create_and_clear_staging() {
        let spec = cust_info();
        assert_eq!(build_drop_staging(&spec), "DROP TABLE IF EXISTS \"bronze\".\"stg_crm_cust_info\"");
        assert!(build_create_staging(&spec).starts_with("CREATE TABLE \"bronze\".\"stg_crm_cust_info\" AS SELECT"));
        assert!(build_create_staging(&spec).ends_with("FROM \"bronze\".\"crm_cust_info\" WHERE 0"));
        assert_eq!(build_clear_staging(&spec), "DELETE FROM \"bronze\".\"stg_crm_cust_info\"");
    }
}
