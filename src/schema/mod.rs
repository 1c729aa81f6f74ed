//! Tracks per-table column state and `*_ref` join targets, derived by
//! querying the live database rather than a private cache — so a second
//! `Session` opened against the same store sees identical state.

pub mod types;

use std::collections::HashMap;

use crate::adapter::SqlAdapter;
use crate::error::Result;
use types::ColumnType;

/// Bookkeeping table name mapping `(owning table, ref column)` to the SCO
/// type it points at. Populated by the shredder, consulted by the pattern
/// compiler's join planner.
pub const REFS_TABLE: &str = "__refs";

/// The physical SQL table name for a bare SCO type within a session
/// namespace - `physical_table("s1_", "url") == "s1_url"`. Two sessions
/// pointed at the same database never share a type table: everywhere this
/// crate talks to the database about an SCO type, it goes through this
/// mapping first. `__refs` is deliberately NOT namespaced this way - its
/// rows are already keyed by physical (namespaced) table names, so
/// cross-session isolation falls out of that for free.
pub fn physical_table(ns: &str, sco_type: &str) -> String {
    format!("{ns}{sco_type}")
}

pub struct SchemaRegistry;

impl SchemaRegistry {
    /// Ensure the `__refs` bookkeeping table exists.
    pub fn ensure_refs_table(adapter: &mut dyn SqlAdapter) -> Result<()> {
        if adapter.table_exists(REFS_TABLE)? {
            return Ok(());
        }
        let sql = format!(
            "CREATE TABLE {} (table_name TEXT NOT NULL, ref_column TEXT NOT NULL, \
             ref_type TEXT NOT NULL, PRIMARY KEY (table_name, ref_column))",
            adapter.quote_identifier(REFS_TABLE)
        );
        adapter.execute(&sql, &[])?;
        Ok(())
    }

    /// Ensure a type table exists with at least `id`, `type`, and
    /// `number_observed` columns.
    pub fn ensure_table(adapter: &mut dyn SqlAdapter, table: &str) -> Result<()> {
        if adapter.table_exists(table)? {
            return Ok(());
        }
        let sql = format!(
            "CREATE TABLE {} (id TEXT PRIMARY KEY, type TEXT NOT NULL, \
             number_observed BIGINT NOT NULL DEFAULT 1)",
            adapter.quote_identifier(table)
        );
        adapter.execute(&sql, &[])?;
        Ok(())
    }

    /// Ensure `table` has a column named `column` able to hold `observed`;
    /// widen its declared type if a narrower column already exists.
    pub fn ensure_column(
        adapter: &mut dyn SqlAdapter,
        table: &str,
        column: &str,
        observed: ColumnType,
    ) -> Result<()> {
        let existing = adapter.table_columns(table)?;
        match existing.iter().find(|(name, _)| name == column) {
            None => {
                let sql = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    adapter.quote_identifier(table),
                    adapter.quote_identifier(column),
                    observed.sql_type(adapter.dialect().is_postgres)
                );
                adapter.execute(&sql, &[])?;
            }
            Some((_, current)) => {
                let widened = current.widen(observed);
                if widened != *current {
                    if adapter.dialect().is_postgres {
                        let sql = format!(
                            "ALTER TABLE {} ALTER COLUMN {} TYPE {} USING {}::{}",
                            adapter.quote_identifier(table),
                            adapter.quote_identifier(column),
                            widened.sql_type(true),
                            adapter.quote_identifier(column),
                            widened.sql_type(true),
                        );
                        adapter.execute(&sql, &[])?;
                    }
                    // SQLite has no in-place column type change, but its
                    // columns are dynamically typed: a wider value stores
                    // fine under the narrower declared affinity, so no
                    // DDL is needed there.
                }
            }
        }
        Ok(())
    }

    /// Record that `table.ref_column` points at `ref_type`, widening
    /// nothing (ref targets are fixed once observed, per the STIX type
    /// system) but tolerating repeated identical observations.
    pub fn ensure_ref(
        adapter: &mut dyn SqlAdapter,
        table: &str,
        ref_column: &str,
        ref_type: &str,
    ) -> Result<()> {
        Self::ensure_refs_table(adapter)?;
        let sql = format!(
            "INSERT INTO {} (table_name, ref_column, ref_type) VALUES ({}, {}, {}) \
             ON CONFLICT (table_name, ref_column) DO UPDATE SET ref_type = excluded.ref_type",
            adapter.quote_identifier(REFS_TABLE),
            adapter.placeholder(1),
            adapter.placeholder(2),
            adapter.placeholder(3),
        );
        adapter.execute(
            &sql,
            &[table.into(), ref_column.into(), ref_type.into()],
        )?;
        Ok(())
    }

    /// Look up the SCO type `table.ref_column` points at, if known.
    pub fn ref_target(
        adapter: &mut dyn SqlAdapter,
        table: &str,
        ref_column: &str,
    ) -> Result<Option<String>> {
        if !adapter.table_exists(REFS_TABLE)? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT ref_type FROM {} WHERE table_name = {} AND ref_column = {}",
            adapter.quote_identifier(REFS_TABLE),
            adapter.placeholder(1),
            adapter.placeholder(2),
        );
        let res = adapter.execute(&sql, &[table.into(), ref_column.into()])?;
        Ok(res.rows.first().and_then(|row| row[0].as_text().map(String::from)))
    }

    /// Every `*_ref` column on `table` known to point at `ref_type`, in
    /// column-name order. Used by `filter` when its output type differs
    /// from its pattern's root type: each matching column is a candidate
    /// path from the matched rows to the rows `filter` actually returns.
    pub fn ref_columns_to(
        adapter: &mut dyn SqlAdapter,
        table: &str,
        ref_type: &str,
    ) -> Result<Vec<String>> {
        if !adapter.table_exists(REFS_TABLE)? {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT ref_column FROM {} WHERE table_name = {} AND ref_type = {} ORDER BY ref_column",
            adapter.quote_identifier(REFS_TABLE),
            adapter.placeholder(1),
            adapter.placeholder(2),
        );
        let res = adapter.execute(&sql, &[table.into(), ref_type.into()])?;
        Ok(res
            .rows
            .iter()
            .filter_map(|r| r[0].as_text().map(String::from))
            .collect())
    }

    /// `(column, type)` pairs for `table`, excluding bookkeeping columns.
    pub fn schema(adapter: &mut dyn SqlAdapter, table: &str) -> Result<Vec<(String, ColumnType)>> {
        adapter.table_columns(table)
    }

    pub fn column_map(
        adapter: &mut dyn SqlAdapter,
        table: &str,
    ) -> Result<HashMap<String, ColumnType>> {
        Ok(Self::schema(adapter, table)?.into_iter().collect())
    }
}
