//! Catalog and membership bookkeeping: the `__symtable` (view name → SCO
//! type, definition, app-data) and `__membership` (view name → member id)
//! tables, plus `__queries` (query_id → ingested ids, written directly by
//! the shredder in `shred::cache_bundle`).
//!
//! Both bookkeeping tables are named with a per-session prefix (`ns`, see
//! `Session`), so two sessions pointed at the same physical database never
//! see each other's views or membership. Like the schema registry, the
//! catalog keeps no private in-memory cache: every lookup reads straight
//! from these tables, so a second `Session` opened against the same store
//! and session id sees identical state immediately.

use serde::{Deserialize, Serialize};

use crate::adapter::{SqlAdapter, Value};
use crate::error::{Result, StoreError};

fn symtable(ns: &str) -> String {
    format!("{ns}__symtable")
}

fn membership(ns: &str) -> String {
    format!("{ns}__membership")
}

/// How a view's contents are produced. `Membership` is the only kind with
/// durable, snapshotted rows; every other kind is a *definition* resolved
/// against its sources' current state each time it's read, which is what
/// gives `sort`/`group`/`join` their rebinding-aliasing behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViewDef {
    /// Rows are exactly the ids recorded for this view name in
    /// `__membership`. Written by `cache`, `extract`, `filter`, `merge`,
    /// and `reassign`.
    Membership,
    /// Same SCO type and rows as `source`, ordered by `by` (a dotted
    /// object path), optionally truncated to `limit`.
    Sort {
        source: String,
        by: String,
        asc: bool,
        limit: Option<i64>,
    },
    /// Rows of `source` collapsed by `by`, with non-key scalar columns
    /// turned into `unique_*` aggregates and `number_observed` summed.
    Group { source: String, by: String },
    /// Left-outer join of `left`/`right` on the named columns. Inherits
    /// `left`'s SCO type; `right`'s non-overlapping columns are added.
    Join {
        left: String,
        left_on: String,
        right: String,
        right_on: String,
    },
}

impl ViewDef {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ViewDef::Membership => "membership",
            ViewDef::Sort { .. } => "sort",
            ViewDef::Group { .. } => "group",
            ViewDef::Join { .. } => "join",
        }
    }
}

/// A catalog entry: `{name, sco_type, appdata}`, as returned by
/// `get_view_data`.
#[derive(Debug, Clone)]
pub struct ViewInfo {
    pub name: String,
    pub sco_type: String,
    pub appdata: Option<Vec<u8>>,
}

pub struct Catalog;

impl Catalog {
    pub fn ensure_tables(adapter: &mut dyn SqlAdapter, ns: &str) -> Result<()> {
        let sym = symtable(ns);
        if !adapter.table_exists(&sym)? {
            let sql = format!(
                "CREATE TABLE {} (view_name TEXT PRIMARY KEY, type TEXT NOT NULL, \
                 kind TEXT NOT NULL, definition TEXT, appdata TEXT)",
                adapter.quote_identifier(&sym)
            );
            adapter.execute(&sql, &[])?;
        }
        let mem = membership(ns);
        if !adapter.table_exists(&mem)? {
            let sql = format!(
                "CREATE TABLE {} (view_name TEXT NOT NULL, id TEXT NOT NULL, \
                 PRIMARY KEY (view_name, id))",
                adapter.quote_identifier(&mem)
            );
            adapter.execute(&sql, &[])?;
        }
        Ok(())
    }

    /// Create or replace the catalog entry for `name`. Replacing a view
    /// under a different SCO type always raises `IncompatibleType` (see
    /// DESIGN.md for why).
    pub fn put_view(
        adapter: &mut dyn SqlAdapter,
        ns: &str,
        name: &str,
        sco_type: &str,
        def: &ViewDef,
    ) -> Result<()> {
        Self::ensure_tables(adapter, ns)?;
        if let Some(existing) = Self::type_of(adapter, ns, name)? {
            if existing != sco_type {
                return Err(StoreError::IncompatibleType {
                    name: name.to_string(),
                    existing,
                    new: sco_type.to_string(),
                });
            }
        }
        let definition = serde_json::to_string(def)?;
        let sql = format!(
            "INSERT INTO {table} (view_name, type, kind, definition, appdata) \
             VALUES ({p1}, {p2}, {p3}, {p4}, NULL) \
             ON CONFLICT (view_name) DO UPDATE SET type = excluded.type, \
             kind = excluded.kind, definition = excluded.definition",
            table = adapter.quote_identifier(&symtable(ns)),
            p1 = adapter.placeholder(1),
            p2 = adapter.placeholder(2),
            p3 = adapter.placeholder(3),
            p4 = adapter.placeholder(4),
        );
        adapter.execute(
            &sql,
            &[
                name.into(),
                sco_type.into(),
                def.kind_name().into(),
                definition.into(),
            ],
        )?;
        Ok(())
    }

    /// Fetch a view's definition and SCO type, or `None` if `name` has no
    /// catalog entry (it may still be a bare type table; callers fall back
    /// to that separately).
    pub fn get_view(
        adapter: &mut dyn SqlAdapter,
        ns: &str,
        name: &str,
    ) -> Result<Option<(String, ViewDef)>> {
        Self::ensure_tables(adapter, ns)?;
        let sql = format!(
            "SELECT type, definition FROM {} WHERE view_name = {}",
            adapter.quote_identifier(&symtable(ns)),
            adapter.placeholder(1)
        );
        let res = adapter.execute(&sql, &[name.into()])?;
        match res.rows.first() {
            None => Ok(None),
            Some(row) => {
                let sco_type = row[0].as_text().unwrap_or_default().to_string();
                let def: ViewDef = match row[1].as_text() {
                    Some(s) => serde_json::from_str(s)?,
                    None => ViewDef::Membership,
                };
                Ok(Some((sco_type, def)))
            }
        }
    }

    pub fn type_of(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<Option<String>> {
        Ok(Self::get_view(adapter, ns, name)?.map(|(t, _)| t))
    }

    pub fn exists(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<bool> {
        Ok(Self::get_view(adapter, ns, name)?.is_some())
    }

    /// All catalog-registered view names (bare type tables are not
    /// included — see `Session::views` vs `Session::tables`).
    pub fn view_names(adapter: &mut dyn SqlAdapter, ns: &str) -> Result<Vec<String>> {
        Self::ensure_tables(adapter, ns)?;
        let sql = format!(
            "SELECT view_name FROM {} ORDER BY view_name",
            adapter.quote_identifier(&symtable(ns))
        );
        let res = adapter.execute(&sql, &[])?;
        Ok(res
            .rows
            .iter()
            .filter_map(|r| r[0].as_text().map(String::from))
            .collect())
    }

    pub fn remove_view(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<()> {
        Self::ensure_tables(adapter, ns)?;
        let sql = format!(
            "DELETE FROM {} WHERE view_name = {}",
            adapter.quote_identifier(&symtable(ns)),
            adapter.placeholder(1)
        );
        adapter.execute(&sql, &[name.into()])?;
        Self::clear_membership(adapter, ns, name)?;
        Ok(())
    }

    /// Atomic rename: the catalog row and its membership rows move to
    /// `new`. Other views' definitions that reference `old` by name are
    /// repointed too, so dependents keep resolving through `new`.
    pub fn rename_view(adapter: &mut dyn SqlAdapter, ns: &str, old: &str, new: &str) -> Result<()> {
        Self::ensure_tables(adapter, ns)?;
        if !Self::exists(adapter, ns, old)? {
            return Err(StoreError::UnknownViewname(old.to_string()));
        }
        let sql = format!(
            "UPDATE {} SET view_name = {} WHERE view_name = {}",
            adapter.quote_identifier(&symtable(ns)),
            adapter.placeholder(1),
            adapter.placeholder(2),
        );
        adapter.execute(&sql, &[new.into(), old.into()])?;

        let sql = format!(
            "UPDATE {} SET view_name = {} WHERE view_name = {}",
            adapter.quote_identifier(&membership(ns)),
            adapter.placeholder(1),
            adapter.placeholder(2),
        );
        adapter.execute(&sql, &[new.into(), old.into()])?;

        for name in Self::view_names(adapter, ns)? {
            if name == new {
                continue;
            }
            if let Some((_sco_type, def)) = Self::get_view(adapter, ns, &name)? {
                let rewritten = match def {
                    ViewDef::Sort { source, by, asc, limit } if source == old => Some(ViewDef::Sort {
                        source: new.to_string(),
                        by,
                        asc,
                        limit,
                    }),
                    ViewDef::Group { source, by } if source == old => {
                        Some(ViewDef::Group { source: new.to_string(), by })
                    }
                    ViewDef::Join { left, left_on, right, right_on } if left == old || right == old => {
                        Some(ViewDef::Join {
                            left: if left == old { new.to_string() } else { left },
                            left_on,
                            right: if right == old { new.to_string() } else { right },
                            right_on,
                        })
                    }
                    _ => None,
                };
                if let Some(def) = rewritten {
                    let definition = serde_json::to_string(&def)?;
                    let sql = format!(
                        "UPDATE {} SET definition = {} WHERE view_name = {}",
                        adapter.quote_identifier(&symtable(ns)),
                        adapter.placeholder(1),
                        adapter.placeholder(2),
                    );
                    adapter.execute(&sql, &[definition.into(), name.clone().into()])?;
                }
            }
        }
        Ok(())
    }

    pub fn clear_membership(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<()> {
        Self::ensure_tables(adapter, ns)?;
        let sql = format!(
            "DELETE FROM {} WHERE view_name = {}",
            adapter.quote_identifier(&membership(ns)),
            adapter.placeholder(1)
        );
        adapter.execute(&sql, &[name.into()])?;
        Ok(())
    }

    /// Replace `name`'s membership set wholesale.
    pub fn set_membership(
        adapter: &mut dyn SqlAdapter,
        ns: &str,
        name: &str,
        ids: &[String],
    ) -> Result<()> {
        Self::clear_membership(adapter, ns, name)?;
        Self::add_membership(adapter, ns, name, ids)
    }

    /// Add ids to `name`'s membership without clearing existing ones
    /// (used by `cache`/`extract`/`filter` appending to a synthetic
    /// `query_id` view across repeated calls).
    pub fn add_membership(
        adapter: &mut dyn SqlAdapter,
        ns: &str,
        name: &str,
        ids: &[String],
    ) -> Result<()> {
        Self::ensure_tables(adapter, ns)?;
        let mem = membership(ns);
        for id in ids {
            let sql = format!(
                "INSERT INTO {} (view_name, id) VALUES ({}, {}) \
                 ON CONFLICT (view_name, id) DO NOTHING",
                adapter.quote_identifier(&mem),
                adapter.placeholder(1),
                adapter.placeholder(2),
            );
            adapter.execute(&sql, &[Value::Text(name.to_string()), Value::Text(id.clone())])?;
        }
        Ok(())
    }

    pub fn set_appdata(adapter: &mut dyn SqlAdapter, ns: &str, name: &str, blob: &[u8]) -> Result<()> {
        Self::ensure_tables(adapter, ns)?;
        if !Self::exists(adapter, ns, name)? {
            return Err(StoreError::UnknownViewname(name.to_string()));
        }
        let text = String::from_utf8_lossy(blob).to_string();
        let sql = format!(
            "UPDATE {} SET appdata = {} WHERE view_name = {}",
            adapter.quote_identifier(&symtable(ns)),
            adapter.placeholder(1),
            adapter.placeholder(2),
        );
        adapter.execute(&sql, &[text.into(), name.into()])?;
        Ok(())
    }

    pub fn get_appdata(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<Option<Vec<u8>>> {
        Self::ensure_tables(adapter, ns)?;
        let sql = format!(
            "SELECT appdata FROM {} WHERE view_name = {}",
            adapter.quote_identifier(&symtable(ns)),
            adapter.placeholder(1)
        );
        let res = adapter.execute(&sql, &[name.into()])?;
        match res.rows.first() {
            None => Err(StoreError::UnknownViewname(name.to_string())),
            Some(row) => Ok(row[0].as_text().map(|s| s.as_bytes().to_vec())),
        }
    }

    pub fn view_data(adapter: &mut dyn SqlAdapter, ns: &str, names: &[String]) -> Result<Vec<ViewInfo>> {
        Self::ensure_tables(adapter, ns)?;
        let mut out = Vec::with_capacity(names.len());
        for name in names {
            let sql = format!(
                "SELECT type, appdata FROM {} WHERE view_name = {}",
                adapter.quote_identifier(&symtable(ns)),
                adapter.placeholder(1)
            );
            let res = adapter.execute(&sql, &[name.clone().into()])?;
            let Some(row) = res.rows.first() else {
                return Err(StoreError::UnknownViewname(name.clone()));
            };
            out.push(ViewInfo {
                name: name.clone(),
                sco_type: row[0].as_text().unwrap_or_default().to_string(),
                appdata: row[1].as_text().map(|s| s.as_bytes().to_vec()),
            });
        }
        Ok(out)
    }
}
