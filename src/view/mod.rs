//! The view engine: resolves a catalog view name to a parameterized SQL
//! `SELECT`, recursively following `sort`/`group`/`join` definitions
//! against their sources' *current* state. `Membership`-kind views (and the
//! implicit whole-type-table fallback) are the only leaves.
//!
//! Mutating operations (`cache`, `extract`, `filter`, `assign`, `join`,
//! `merge`, `rename`, `remove`, `reassign`) live in `view::ops`; this module
//! is read-only.

pub mod ops;

use crate::adapter::{SqlAdapter, Value};
use crate::catalog::{Catalog, ViewDef};
use crate::error::{Result, StoreError};
use crate::pattern::compiler;
use crate::schema::types::ColumnType;
use crate::schema::SchemaRegistry;

/// A view resolved to a `SELECT` yielding every column of `sco_type`,
/// ready to be wrapped as a subquery (`SELECT ... FROM ({sql}) AS alias`).
#[derive(Debug, Clone)]
pub struct Resolved {
    pub sco_type: String,
    pub sql: String,
    pub params: Vec<Value>,
}

/// Split a STIX object path (`"network-traffic:src_ref.value"` or bare
/// `"value"`) into its dotted property segments, dropping any `type:`
/// prefix.
pub fn split_path(path: &str) -> Vec<String> {
    let rest = path.split_once(':').map(|(_, r)| r).unwrap_or(path);
    rest.split('.').map(str::to_string).collect()
}

/// A SQL string literal, quoted and escaped. `resolve` composes resolved
/// views arbitrarily deep (sort-of-group-of-join-of-sort...), and each
/// nested `SqlFragment`'s bound parameters are numbered independently
/// (`?1`, `?2`, ...; both dialects treat these as direct indices into the
/// bound array, not sequential text position). Concatenating two
/// independently-numbered parameter lists would collide, so `resolve`
/// never binds a parameter of its own — the one value every leaf needs
/// (a view name) is embedded as an escaped literal instead. Pattern
/// predicate values stay genuinely parameterized: `compiler::compile`
/// produces one self-contained fragment consumed by a single top-level
/// statement in `view::ops`, never recomposed into a deeper resolve.
fn sql_literal(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

pub fn resolve(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<Resolved> {
    resolve_inner(adapter, ns, name, 0)
}

fn resolve_inner(adapter: &mut dyn SqlAdapter, ns: &str, name: &str, depth: usize) -> Result<Resolved> {
    if depth > 32 {
        return Err(StoreError::InvalidAttr(format!(
            "view definition cycle detected at '{name}'"
        )));
    }
    match Catalog::get_view(adapter, ns, name)? {
        Some((sco_type, ViewDef::Membership)) => {
            let mem = format!("{ns}__membership");
            let physical = crate::schema::physical_table(ns, &sco_type);
            let sql = format!(
                "SELECT s.* FROM {tbl} AS s JOIN {mem} AS m ON m.id = s.id AND m.view_name = {lit}",
                tbl = adapter.quote_identifier(&physical),
                mem = adapter.quote_identifier(&mem),
                lit = sql_literal(name),
            );
            Ok(Resolved {
                sco_type,
                sql,
                params: Vec::new(),
            })
        }
        Some((_, ViewDef::Sort { source, by, asc, limit })) => {
            let inner = resolve_inner(adapter, ns, &source, depth + 1)?;
            let segments = split_path(&by);
            let (expr, from_suffix, _) = project(adapter, ns, &inner, "base", &segments)?;
            let mut sql = format!(
                "SELECT base.* FROM ({}) AS base{} ORDER BY {} {}",
                inner.sql,
                from_suffix,
                expr,
                if asc { "ASC" } else { "DESC" }
            );
            if let Some(n) = limit {
                sql.push_str(&format!(" LIMIT {n}"));
            }
            Ok(Resolved {
                sco_type: inner.sco_type,
                sql,
                params: inner.params,
            })
        }
        Some((_, ViewDef::Group { source, by })) => {
            let inner = resolve_inner(adapter, ns, &source, depth + 1)?;
            let segments = split_path(&by);
            let (by_expr, by_from, _) = project(adapter, ns, &inner, "base", &segments)?;
            let by_name = segments.join(".");
            let by_col = adapter.quote_identifier(&by_name);
            let plain_by_col = if segments.len() == 1 {
                Some(segments[0].clone())
            } else {
                None
            };

            let cols = probe_columns(adapter, &inner)?;
            let id_col = adapter.quote_identifier("id");
            let type_col = adapter.quote_identifier("type");
            let num_col = adapter.quote_identifier("number_observed");
            let is_pg = adapter.dialect().is_postgres;

            let mut select_list = vec![
                format!("{by_expr} AS {by_col}"),
                format!("MIN(base.{id_col}) AS {id_col}"),
                format!("MAX(base.{type_col}) AS {type_col}"),
                format!("SUM(base.{num_col}) AS {num_col}"),
            ];
            for col in &cols {
                if col == "id" || col == "type" || col == "number_observed" {
                    continue;
                }
                if plain_by_col.as_deref() == Some(col.as_str()) {
                    continue;
                }
                let q = adapter.quote_identifier(col);
                let agg = if is_pg {
                    format!("string_agg(DISTINCT CAST(base.{q} AS TEXT), ',')")
                } else {
                    format!("group_concat(DISTINCT base.{q})")
                };
                let unique_col = adapter.quote_identifier(&format!("unique_{col}"));
                select_list.push(format!("{agg} AS {unique_col}"));
            }

            let sql = format!(
                "SELECT {sel} FROM ({inner_sql}) AS base{from} GROUP BY {by}",
                sel = select_list.join(", "),
                inner_sql = inner.sql,
                from = by_from,
                by = by_expr,
            );
            Ok(Resolved {
                sco_type: inner.sco_type,
                sql,
                params: inner.params,
            })
        }
        Some((_, ViewDef::Join { left, left_on, right, right_on })) => {
            let linner = resolve_inner(adapter, ns, &left, depth + 1)?;
            let rinner = resolve_inner(adapter, ns, &right, depth + 1)?;
            let lseg = split_path(&left_on);
            let rseg = split_path(&right_on);
            let (lexpr, lfrom, _) = project(adapter, ns, &linner, "lbase", &lseg)?;
            let (rexpr, rfrom, _) = project(adapter, ns, &rinner, "rbase", &rseg)?;

            let lcols = probe_columns(adapter, &linner)?;
            let rcols = probe_columns(adapter, &rinner)?;

            let mut select_list = Vec::with_capacity(lcols.len() + rcols.len());
            for col in &lcols {
                let q = adapter.quote_identifier(col);
                if rcols.contains(col) {
                    select_list.push(format!("COALESCE(rbase.{q}, lbase.{q}) AS {q}"));
                } else {
                    select_list.push(format!("lbase.{q} AS {q}"));
                }
            }
            for col in &rcols {
                if !lcols.contains(col) {
                    let q = adapter.quote_identifier(col);
                    select_list.push(format!("rbase.{q} AS {q}"));
                }
            }

            let mut params = linner.params.clone();
            params.extend(rinner.params.clone());
            let sql = format!(
                "SELECT {sel} FROM ({lsql}) AS lbase{lfrom} LEFT JOIN ({rsql}) AS rbase{rfrom} ON {lexpr} = {rexpr}",
                sel = select_list.join(", "),
                lsql = linner.sql,
                rsql = rinner.sql,
            );
            Ok(Resolved {
                sco_type: linner.sco_type,
                sql,
                params,
            })
        }
        None => {
            let physical = crate::schema::physical_table(ns, name);
            if adapter.table_exists(&physical)? {
                Ok(Resolved {
                    sco_type: name.to_string(),
                    sql: format!("SELECT * FROM {}", adapter.quote_identifier(&physical)),
                    params: Vec::new(),
                })
            } else {
                Err(StoreError::UnknownViewname(name.to_string()))
            }
        }
    }
}

/// Build `(value_expr, from_suffix, params)` for projecting a dotted path
/// against an already-resolved subquery aliased `base_alias`. A one-segment
/// path is a plain column reference; a longer path walks `__refs` joins
/// rendered onto `from_suffix`.
fn project(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    inner: &Resolved,
    base_alias: &str,
    segments: &[String],
) -> Result<(String, String, Vec<Value>)> {
    if segments.len() == 1 {
        let col = adapter.quote_identifier(&segments[0]);
        return Ok((format!("{base_alias}.{col}"), String::new(), Vec::new()));
    }
    let physical = crate::schema::physical_table(ns, &inner.sco_type);
    let (joins, alias, column) = compiler::resolve_path(adapter, &physical, base_alias, segments)?;
    let from_suffix = compiler::render_joins(adapter, &joins);
    let col = adapter.quote_identifier(&column);
    Ok((format!("{alias}.{col}"), from_suffix, Vec::new()))
}

/// Column names of a resolved view, via a zero-row probe (`LIMIT 0`); both
/// adapters return column metadata even when no rows match.
pub fn probe_columns(adapter: &mut dyn SqlAdapter, resolved: &Resolved) -> Result<Vec<String>> {
    let sql = format!("SELECT * FROM ({}) AS probe WHERE 1 = 0", resolved.sql);
    let res = adapter.execute(&sql, &resolved.params)?;
    Ok(res.columns)
}

/// The ids of every row in a resolved view, in whatever order the
/// underlying query produces them.
pub fn collect_ids(adapter: &mut dyn SqlAdapter, resolved: &Resolved) -> Result<Vec<String>> {
    let id_col = adapter.quote_identifier("id");
    let sql = format!("SELECT base.{id_col} FROM ({}) AS base", resolved.sql);
    let res = adapter.execute(&sql, &resolved.params)?;
    Ok(res
        .rows
        .into_iter()
        .filter_map(|r| r.into_iter().next())
        .filter_map(|v| v.as_text().map(String::from))
        .collect())
}

pub fn count(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<i64> {
    let resolved = resolve(adapter, ns, name)?;
    let sql = format!("SELECT COUNT(*) FROM ({}) AS base", resolved.sql);
    let res = adapter.execute(&sql, &resolved.params)?;
    Ok(res
        .rows
        .first()
        .and_then(|r| r.first())
        .and_then(|v| v.as_integer())
        .unwrap_or(0))
}

pub fn columns(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<Vec<String>> {
    let resolved = resolve(adapter, ns, name)?;
    probe_columns(adapter, &resolved)
}

pub fn schema(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<Vec<(String, ColumnType)>> {
    let resolved = resolve(adapter, ns, name)?;
    let physical = crate::schema::physical_table(ns, &resolved.sco_type);
    let known = SchemaRegistry::column_map(adapter, &physical)?;
    let cols = probe_columns(adapter, &resolved)?;
    Ok(cols
        .into_iter()
        .map(|c| {
            let ty = known.get(&c).copied().unwrap_or(ColumnType::String);
            (c, ty)
        })
        .collect())
}

pub fn lookup(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    name: &str,
    limit: Option<i64>,
    offset: Option<i64>,
    cols: Option<&[String]>,
) -> Result<crate::adapter::QueryResult> {
    let resolved = resolve(adapter, ns, name)?;
    let select = match cols {
        Some(c) if !c.is_empty() => c
            .iter()
            .map(|c| adapter.quote_identifier(c))
            .collect::<Vec<_>>()
            .join(", "),
        _ => "*".to_string(),
    };
    let mut sql = format!("SELECT {select} FROM ({}) AS base", resolved.sql);
    match (limit, offset) {
        (Some(n), Some(o)) => sql.push_str(&format!(" LIMIT {n} OFFSET {o}")),
        (Some(n), None) => sql.push_str(&format!(" LIMIT {n}")),
        (None, Some(o)) if o > 0 => {
            if adapter.dialect().is_postgres {
                sql.push_str(&format!(" OFFSET {o}"));
            } else {
                sql.push_str(&format!(" LIMIT -1 OFFSET {o}"));
            }
        }
        _ => {}
    }
    adapter.execute(&sql, &resolved.params)
}

/// The distinct, non-null values of `path` across every row of `name`.
pub fn values(adapter: &mut dyn SqlAdapter, ns: &str, name: &str, path: &str) -> Result<Vec<Value>> {
    let resolved = resolve(adapter, ns, name)?;
    let segments = split_path(path);
    let dotted = segments.join(".");
    let probed = probe_columns(adapter, &resolved)?;

    let (expr, from_suffix) = if segments.len() == 1 {
        (format!("base.{}", adapter.quote_identifier(&segments[0])), String::new())
    } else if probed.contains(&dotted) {
        (format!("base.{}", adapter.quote_identifier(&dotted)), String::new())
    } else {
        let physical = crate::schema::physical_table(ns, &resolved.sco_type);
        let (joins, alias, column) = compiler::resolve_path(adapter, &physical, "base", &segments)?;
        let from_suffix = compiler::render_joins(adapter, &joins);
        (format!("{alias}.{}", adapter.quote_identifier(&column)), from_suffix)
    };

    let sql = format!(
        "SELECT DISTINCT {expr} FROM ({}) AS base{from_suffix}",
        resolved.sql
    );
    let res = adapter.execute(&sql, &resolved.params)?;
    Ok(res
        .rows
        .into_iter()
        .filter_map(|r| r.into_iter().next())
        .filter(|v| !v.is_null())
        .collect())
}
