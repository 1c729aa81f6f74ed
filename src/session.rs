//! `Session` is the crate's one public entry point: a storage target plus a
//! session id, wrapping every operation in `view`/`view::ops`/`shred` behind
//! a single transaction so a caller never observes a half-applied mutation.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::adapter::postgres::PostgresAdapter;
use crate::adapter::sqlite::SqliteAdapter;
use crate::adapter::{self, QueryResult, SqlAdapter, Value};
use crate::catalog::{Catalog, ViewInfo};
use crate::error::Result;
use crate::schema::types::ColumnType;
use crate::schema::{physical_table, SchemaRegistry};
use crate::view::{self, ops};

/// Open the right adapter for `target`: a `postgres://`/`postgresql://` URL
/// dials the server dialect, anything else (a path, or `:memory:`) opens
/// the embedded SQLite file.
fn open_adapter(target: &str) -> Result<Box<dyn SqlAdapter>> {
    if target.starts_with("postgres://") || target.starts_with("postgresql://") {
        Ok(Box::new(PostgresAdapter::connect(target)?))
    } else if target == ":memory:" {
        Ok(Box::new(SqliteAdapter::open_in_memory()?))
    } else {
        Ok(Box::new(SqliteAdapter::open(target)?))
    }
}

/// A connection to a store plus an isolated namespace (`session_id`) within
/// it. Every method brackets its work in `adapter::transaction`, so a
/// caller never needs to manage commit/rollback itself.
pub struct Session {
    adapter: Box<dyn SqlAdapter>,
    ns: String,
}

impl Session {
    pub fn open(target: &str, session_id: &str) -> Result<Self> {
        let adapter = open_adapter(target)?;
        Ok(Session {
            adapter,
            ns: format!("{session_id}_"),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.ns
    }

    pub fn cache(&mut self, query_id: &str, bundle: &Json) -> Result<Vec<String>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| ops::cache(a, &ns, query_id, bundle))
    }

    pub fn load(
        &mut self,
        name: &str,
        records: &[BTreeMap<String, Json>],
        sco_type: Option<&str>,
        query_id: Option<&str>,
    ) -> Result<String> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            ops::load(a, &ns, name, records, sco_type, query_id)
        })
    }

    pub fn extract(&mut self, name: &str, sco_type: &str, query_id: &str, pattern: &str) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            ops::extract(a, &ns, name, sco_type, query_id, pattern)
        })
    }

    pub fn filter(&mut self, name: &str, sco_type: &str, source: &str, pattern: &str) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            ops::filter(a, &ns, name, sco_type, source, pattern)
        })
    }

    pub fn assign(
        &mut self,
        name: &str,
        source: &str,
        op: &str,
        by: &str,
        asc: bool,
        limit: Option<i64>,
    ) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            ops::assign(a, &ns, name, source, op, by, asc, limit)
        })
    }

    pub fn join(&mut self, name: &str, left: &str, left_on: &str, right: &str, right_on: &str) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            ops::join(a, &ns, name, left, left_on, right, right_on)
        })
    }

    pub fn merge(&mut self, name: &str, views: &[String]) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| ops::merge(a, &ns, name, views))
    }

    pub fn reassign(&mut self, name: &str, records: &[BTreeMap<String, Json>]) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| ops::reassign(a, &ns, name, records))
    }

    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| ops::rename(a, &ns, old, new))
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| ops::remove(a, &ns, name))
    }

    pub fn lookup(
        &mut self,
        name: &str,
        limit: Option<i64>,
        offset: Option<i64>,
        cols: Option<&[String]>,
    ) -> Result<QueryResult> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| view::lookup(a, &ns, name, limit, offset, cols))
    }

    pub fn values(&mut self, name: &str, path: &str) -> Result<Vec<Value>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| view::values(a, &ns, name, path))
    }

    pub fn columns(&mut self, name: &str) -> Result<Vec<String>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| view::columns(a, &ns, name))
    }

    pub fn schema(&mut self, name: &str) -> Result<Vec<(String, ColumnType)>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| view::schema(a, &ns, name))
    }

    pub fn count(&mut self, name: &str) -> Result<i64> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| view::count(a, &ns, name))
    }

    /// Every catalog-registered view name.
    pub fn views(&mut self) -> Result<Vec<String>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| Catalog::view_names(a, &ns))
    }

    pub fn view_data(&mut self, names: &[String]) -> Result<Vec<ViewInfo>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| Catalog::view_data(a, &ns, names))
    }

    /// The SCO type a view or bare type table resolves to.
    pub fn table_type(&mut self, name: &str) -> Result<String> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| Ok(view::resolve(a, &ns, name)?.sco_type))
    }

    /// Every physical type table this session has ever written a row to,
    /// as bare SCO type names (the `ns` prefix stripped back off).
    pub fn tables(&mut self) -> Result<Vec<String>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            let bookkeeping = [
                format!("{ns}__symtable"),
                format!("{ns}__membership"),
                format!("{ns}__queries"),
            ];
            Ok(a.tables_with_prefix(&ns)?
                .into_iter()
                .filter(|t| !bookkeeping.contains(t))
                .map(|t| t[ns.len()..].to_string())
                .collect())
        })
    }

    pub fn set_appdata(&mut self, name: &str, blob: &[u8]) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| Catalog::set_appdata(a, &ns, name, blob))
    }

    pub fn get_appdata(&mut self, name: &str) -> Result<Option<Vec<u8>>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| Catalog::get_appdata(a, &ns, name))
    }

    /// Tear down this session's entire namespace: every physical type
    /// table it ever wrote, plus the catalog/membership/query bookkeeping
    /// tables - a full wipe, not a per-view operation. Other sessions
    /// against the same database are untouched, since every dropped table
    /// name carries this session's `ns` prefix.
    pub fn delete(&mut self) -> Result<()> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            for table in a.tables_with_prefix(&ns)? {
                let sql = format!("DROP TABLE IF EXISTS {}", a.quote_identifier(&table));
                a.execute(&sql, &[])?;
            }
            Ok(())
        })
    }

    /// Raw SQL escape hatch. No namespace rewriting is applied - the
    /// caller is trusted to reference physical table names directly.
    pub fn sql(&mut self, statement: &str, params: &[Value]) -> Result<QueryResult> {
        adapter::transaction(self.adapter.as_mut(), |a| a.execute(statement, params))
    }

    /// Live `(column, type)` pairs for a physical type table, bypassing
    /// view resolution - used by `columns`/`schema` callers that already
    /// have a bare type name in hand.
    pub fn table_columns(&mut self, sco_type: &str) -> Result<Vec<(String, ColumnType)>> {
        let ns = self.ns.clone();
        adapter::transaction(self.adapter.as_mut(), |a| {
            SchemaRegistry::schema(a, &physical_table(&ns, sco_type))
        })
    }
}
