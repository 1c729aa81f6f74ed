//! The mutating half of the view algebra: every operation that writes a
//! catalog entry or a `__membership` row. `cache`/`load` delegate straight
//! to the shredder; `extract`/`filter`/`merge`/`reassign` compute an id set
//! and snapshot it into `__membership` under a fresh name; `assign`/`join`
//! write a catalog-only *definition* that `view::resolve` re-evaluates
//! against its source's current state on every read.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value as Json;

use crate::adapter::{SqlAdapter, Value};
use crate::catalog::{Catalog, ViewDef};
use crate::error::{Result, StoreError};
use crate::pattern::ast::Pattern;
use crate::pattern::{compiler, parser};
use crate::schema::{physical_table, SchemaRegistry};
use crate::shred::{self, upsert};

use super::{self, Resolved};

/// Ingest a STIX bundle, tagging every top-level id under `query_id`. No
/// catalog view is created for `query_id` itself — it is pure `__queries`
/// bookkeeping, consulted by `extract`, never listed by `views()`.
pub fn cache(adapter: &mut dyn SqlAdapter, ns: &str, query_id: &str, bundle: &Json) -> Result<Vec<String>> {
    shred::cache_bundle(adapter, ns, query_id, bundle)
}

/// Ingest a flat list of already-shredded records, as `load()`. Returns the
/// SCO type ingested and registers `name` as a fresh membership view over
/// the ids written.
pub fn load(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    name: &str,
    records: &[BTreeMap<String, Json>],
    sco_type: Option<&str>,
    query_id: Option<&str>,
) -> Result<String> {
    let (ty, ids) = shred::load_records(adapter, ns, records, sco_type, query_id)?;
    Catalog::put_view(adapter, ns, name, &ty, &ViewDef::Membership)?;
    Catalog::set_membership(adapter, ns, name, &ids)?;
    Ok(ty)
}

/// Create/replace `name` with membership = the ids cached under `query_id`
/// that also satisfy `pattern`, restricted to rows of `sco_type`. The
/// pattern must be rooted at `sco_type` — unlike `filter`, `extract` has no
/// other view to pivot through.
pub fn extract(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    name: &str,
    sco_type: &str,
    query_id: &str,
    pattern_text: &str,
) -> Result<()> {
    let pattern = parser::parse(pattern_text)?;
    let root_type = pattern
        .root_type()
        .ok_or_else(|| StoreError::InvalidPattern("pattern has no comparisons".to_string()))?;
    if root_type != sco_type {
        return Err(StoreError::InvalidAttr(format!(
            "extract's pattern is rooted at '{root_type}', not the requested type '{sco_type}'"
        )));
    }

    let table = physical_table(ns, sco_type);
    let ids = if adapter.table_exists(&table)? {
        let candidates = shred::query_ids(adapter, ns, query_id)?;
        matched_ids(adapter, &table, &pattern, Some(&candidates))?
    } else {
        Vec::new()
    };

    Catalog::put_view(adapter, ns, name, sco_type, &ViewDef::Membership)?;
    Catalog::set_membership(adapter, ns, name, &ids)?;
    Ok(())
}

/// Create/replace `name` with membership computed from `source`'s current
/// ids filtered by `pattern`. The pattern's root type need not match
/// `sco_type`: if it doesn't, the matched rows of the pattern's own type
/// are walked through their `*_ref` columns into `sco_type`, deduplicated
/// (the canonical fix for the double-counting a naive ref fan-out join
/// produces — see DESIGN.md).
pub fn filter(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    name: &str,
    sco_type: &str,
    source: &str,
    pattern_text: &str,
) -> Result<()> {
    let source_resolved = super::resolve(adapter, ns, source)?;
    let source_ids = super::collect_ids(adapter, &source_resolved)?;

    let pattern = parser::parse(pattern_text)?;
    let root_type = pattern
        .root_type()
        .ok_or_else(|| StoreError::InvalidPattern("pattern has no comparisons".to_string()))?
        .to_string();
    let pattern_table = physical_table(ns, &root_type);

    let matched = if adapter.table_exists(&pattern_table)? {
        let candidates = if root_type == source_resolved.sco_type {
            Some(source_ids.as_slice())
        } else {
            None
        };
        matched_ids(adapter, &pattern_table, &pattern, candidates)?
    } else {
        Vec::new()
    };

    let ids = if root_type == sco_type {
        matched
    } else {
        project_via_refs(adapter, ns, &root_type, &matched, sco_type)?
    };

    Catalog::put_view(adapter, ns, name, sco_type, &ViewDef::Membership)?;
    Catalog::set_membership(adapter, ns, name, &ids)?;
    Ok(())
}

/// `sort` or `group` over `source`. Both are catalog-only definitions, not
/// snapshots: `view::resolve` re-evaluates `source` each time `name` is
/// read, which is what lets `assign`'s result track later edits to
/// `source` (`test_sort_same_name`'s "also changes...weird" sibling
/// behavior). Rebinding `name` onto its own `source` (`assign('urls',
/// 'urls', ...)`) would otherwise make the definition self-referential, so
/// that case snapshots the pre-rebind contents into a hidden membership
/// view first and points the new definition at that instead.
pub fn assign(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    name: &str,
    source: &str,
    op: &str,
    by: &str,
    asc: bool,
    limit: Option<i64>,
) -> Result<()> {
    let resolved = super::resolve(adapter, ns, source)?;
    let actual_source = if source == name {
        let hidden = format!("__assign_src_{name}");
        let ids = super::collect_ids(adapter, &resolved)?;
        Catalog::put_view(adapter, ns, &hidden, &resolved.sco_type, &ViewDef::Membership)?;
        Catalog::set_membership(adapter, ns, &hidden, &ids)?;
        hidden
    } else {
        source.to_string()
    };

    let def = match op {
        "sort" => ViewDef::Sort {
            source: actual_source,
            by: by.to_string(),
            asc,
            limit,
        },
        "group" => ViewDef::Group {
            source: actual_source,
            by: by.to_string(),
        },
        other => return Err(StoreError::InvalidAttr(format!("unknown assign op '{other}'"))),
    };
    Catalog::put_view(adapter, ns, name, &resolved.sco_type, &def)?;
    Ok(())
}

/// Left-outer join of `left`/`right` on their named columns, inheriting
/// `left`'s SCO type. Also a catalog-only definition: both sides are
/// re-resolved on every read of `name`.
pub fn join(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    name: &str,
    left: &str,
    left_on: &str,
    right: &str,
    right_on: &str,
) -> Result<()> {
    let left_resolved = super::resolve(adapter, ns, left)?;
    let def = ViewDef::Join {
        left: left.to_string(),
        left_on: left_on.to_string(),
        right: right.to_string(),
        right_on: right_on.to_string(),
    };
    Catalog::put_view(adapter, ns, name, &left_resolved.sco_type, &def)?;
    Ok(())
}

/// Union the current memberships of `views` (which must share an SCO
/// type) into a new membership view `name`. Always snapshots: later edits
/// to `views` are invisible to `name`, the one deliberate exception to
/// `assign`/`join`'s aliasing behavior.
pub fn merge(adapter: &mut dyn SqlAdapter, ns: &str, name: &str, views: &[String]) -> Result<()> {
    let mut sco_type: Option<String> = None;
    let mut ids = BTreeSet::new();
    for v in views {
        let resolved = super::resolve(adapter, ns, v)?;
        match &sco_type {
            None => sco_type = Some(resolved.sco_type.clone()),
            Some(t) if *t != resolved.sco_type => {
                return Err(StoreError::IncompatibleType {
                    name: name.to_string(),
                    existing: t.clone(),
                    new: resolved.sco_type.clone(),
                });
            }
            _ => {}
        }
        ids.extend(super::collect_ids(adapter, &resolved)?);
    }
    let sco_type = sco_type
        .ok_or_else(|| StoreError::InvalidAttr("merge requires at least one source view".to_string()))?;
    Catalog::put_view(adapter, ns, name, &sco_type, &ViewDef::Membership)?;
    Catalog::set_membership(adapter, ns, name, &ids.into_iter().collect::<Vec<_>>())?;
    Ok(())
}

pub fn rename(adapter: &mut dyn SqlAdapter, ns: &str, old: &str, new: &str) -> Result<()> {
    Catalog::rename_view(adapter, ns, old, new)
}

pub fn remove(adapter: &mut dyn SqlAdapter, ns: &str, name: &str) -> Result<()> {
    Catalog::remove_view(adapter, ns, name)
}

/// Enrich already-ingested rows: each record must carry its original
/// `type` and `id`; every other field is upserted onto the existing row
/// without touching `number_observed`. The source view keeps its own
/// membership untouched; `name` becomes a fresh membership view over the
/// enriched ids (the row data itself is shared, so both views see the
/// enrichment).
pub fn reassign(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    name: &str,
    records: &[BTreeMap<String, Json>],
) -> Result<()> {
    let mut ids = Vec::with_capacity(records.len());
    let mut sco_type: Option<String> = None;
    for record in records {
        let mut rec = record.clone();
        let ty = rec
            .remove("type")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| StoreError::InvalidAttr("reassign record missing 'type'".to_string()))?;
        let id = rec
            .remove("id")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| StoreError::InvalidAttr("reassign record missing 'id'".to_string()))?;
        sco_type.get_or_insert_with(|| ty.clone());

        let table = physical_table(ns, &ty);
        for (col, val) in &rec {
            SchemaRegistry::ensure_column(adapter, &table, col, shred::infer_column_type(val))?;
        }
        upsert::upsert_enrichment(adapter, &table, &ty, &id, &rec)?;
        ids.push(id);
    }
    let sco_type =
        sco_type.ok_or_else(|| StoreError::InvalidAttr("reassign given no records".to_string()))?;
    Catalog::put_view(adapter, ns, name, &sco_type, &ViewDef::Membership)?;
    Catalog::set_membership(adapter, ns, name, &ids)?;
    Ok(())
}

/// Compile `pattern` against `root_table`, optionally restricted to
/// `candidate_ids`, and return the distinct matching ids. `DISTINCT` is
/// load-bearing: a dotted ref path joins in a second table, and a row with
/// more than one matching child would otherwise appear twice.
fn matched_ids(
    adapter: &mut dyn SqlAdapter,
    root_table: &str,
    pattern: &Pattern,
    candidate_ids: Option<&[String]>,
) -> Result<Vec<String>> {
    if let Some(ids) = candidate_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
    }
    let fragment = compiler::compile(adapter, root_table, pattern)?;
    let joins_sql = compiler::render_joins(adapter, &fragment.joins);
    let id_col = adapter.quote_identifier("id");
    let root_alias = compiler::ROOT_ALIAS;

    let mut params = fragment.params.clone();
    let mut where_sql = fragment.where_sql.clone();
    if let Some(ids) = candidate_ids {
        let placeholders: Vec<String> = ids
            .iter()
            .enumerate()
            .map(|(i, _)| adapter.placeholder(params.len() + i + 1))
            .collect();
        where_sql = format!(
            "{where_sql} AND {root_alias}.{id_col} IN ({})",
            placeholders.join(", ")
        );
        params.extend(ids.iter().cloned().map(Value::Text));
    }

    let sql = format!(
        "SELECT DISTINCT {root_alias}.{id_col} FROM {table} AS {root_alias}{joins} WHERE {where_sql}",
        table = adapter.quote_identifier(root_table),
        joins = joins_sql,
    );
    let res = adapter.execute(&sql, &params)?;
    Ok(res
        .rows
        .into_iter()
        .filter_map(|r| r.into_iter().next())
        .filter_map(|v| v.as_text().map(String::from))
        .collect())
}

/// For every `*_ref` column on `from_type` known to target `to_type`,
/// collect the referenced ids out of the rows named by `from_ids`, as a
/// deduplicated set — `filter`'s canonical answer to the root/output type
/// mismatch case (see DESIGN.md).
fn project_via_refs(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    from_type: &str,
    from_ids: &[String],
    to_type: &str,
) -> Result<Vec<String>> {
    if from_ids.is_empty() {
        return Ok(Vec::new());
    }
    let from_table = physical_table(ns, from_type);
    let to_table = physical_table(ns, to_type);
    let ref_cols = SchemaRegistry::ref_columns_to(adapter, &from_table, &to_table)?;
    if ref_cols.is_empty() {
        return Ok(Vec::new());
    }

    let id_col = adapter.quote_identifier("id");
    let id_placeholders: Vec<String> = (1..=from_ids.len()).map(|i| adapter.placeholder(i)).collect();
    let params: Vec<Value> = from_ids.iter().cloned().map(Value::Text).collect();

    let mut seen = BTreeSet::new();
    for col in &ref_cols {
        let quoted_col = adapter.quote_identifier(col);
        let sql = format!(
            "SELECT DISTINCT {quoted_col} FROM {table} WHERE {id_col} IN ({phs}) AND {quoted_col} IS NOT NULL",
            table = adapter.quote_identifier(&from_table),
            phs = id_placeholders.join(", "),
        );
        let res = adapter.execute(&sql, &params)?;
        for row in res.rows {
            if let Some(v) = row.into_iter().next() {
                if let Some(s) = v.as_text() {
                    seen.insert(s.to_string());
                }
            }
        }
    }
    Ok(seen.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::sqlite::SqliteAdapter;
    use serde_json::json;

    const NS: &str = "t_";

    fn bundle_with_urls() -> Json {
        json!({
            "type": "bundle",
            "objects": [
                {"type": "url", "id": "url--1", "value": "http://example.com/page/1"},
                {"type": "url", "id": "url--2", "value": "http://example.com/page/2"},
                {"type": "url", "id": "url--3", "value": "http://other.example.com/index"},
            ],
        })
    }

    #[test]
    fn extract_intersects_query_and_pattern() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        cache(&mut db, NS, "q1", &bundle_with_urls()).unwrap();
        extract(&mut db, NS, "urls", "url", "q1", "[url:value LIKE '%page%']").unwrap();
        let resolved = super::super::resolve(&mut db, NS, "urls").unwrap();
        let ids = super::super::collect_ids(&mut db, &resolved).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn extract_rejects_mismatched_root_type() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        cache(&mut db, NS, "q1", &bundle_with_urls()).unwrap();
        let err = extract(&mut db, NS, "urls", "url", "q1", "[ipv4-addr:value = '1.2.3.4']").unwrap_err();
        assert!(matches!(err, StoreError::InvalidAttr(_)));
    }

    #[test]
    fn filter_narrows_an_existing_view() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        cache(&mut db, NS, "q1", &bundle_with_urls()).unwrap();
        extract(&mut db, NS, "urls", "url", "q1", "[url:value LIKE '%page%']").unwrap();
        filter(
            &mut db,
            NS,
            "urls",
            "url",
            "urls",
            "[url:value = 'http://example.com/page/1']",
        )
        .unwrap();
        let resolved = super::super::resolve(&mut db, NS, "urls").unwrap();
        let ids = super::super::collect_ids(&mut db, &resolved).unwrap();
        assert_eq!(ids, vec!["url--1".to_string()]);
    }

    #[test]
    fn filter_crosses_ref_into_a_different_type() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        let bundle = json!({
            "type": "bundle",
            "objects": [
                {
                    "type": "network-traffic",
                    "id": "network-traffic--1",
                    "dst_port": 22,
                    "src_ref": {"type": "ipv4-addr", "id": "ipv4-addr--1", "value": "10.0.0.1"},
                },
                {
                    "type": "network-traffic",
                    "id": "network-traffic--2",
                    "dst_port": 80,
                    "src_ref": {"type": "ipv4-addr", "id": "ipv4-addr--2", "value": "10.0.0.2"},
                },
            ],
        });
        cache(&mut db, NS, "q1", &bundle).unwrap();
        extract(
            &mut db,
            NS,
            "ssh_conns",
            "network-traffic",
            "q1",
            "[network-traffic:dst_port = 22]",
        )
        .unwrap();
        filter(
            &mut db,
            NS,
            "ssh_ips",
            "ipv4-addr",
            "ssh_conns",
            "[network-traffic:dst_port = 22]",
        )
        .unwrap();
        let resolved = super::super::resolve(&mut db, NS, "ssh_ips").unwrap();
        let ids = super::super::collect_ids(&mut db, &resolved).unwrap();
        assert_eq!(ids, vec!["ipv4-addr--1".to_string()]);
    }

    #[test]
    fn assign_sort_rebinding_same_name_preserves_membership() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        cache(&mut db, NS, "q1", &bundle_with_urls()).unwrap();
        extract(&mut db, NS, "urls", "url", "q1", "[url:value LIKE '%page%']").unwrap();
        assign(&mut db, NS, "urls", "urls", "sort", "value", true, None).unwrap();
        let resolved = super::super::resolve(&mut db, NS, "urls").unwrap();
        let ids = super::super::collect_ids(&mut db, &resolved).unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn merge_unions_and_snapshots() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        cache(&mut db, NS, "q1", &bundle_with_urls()).unwrap();
        extract(&mut db, NS, "urls1", "url", "q1", "[url:value LIKE '%page%']").unwrap();
        extract(&mut db, NS, "urls2", "url", "q1", "[url:value NOT LIKE '%page%']").unwrap();
        merge(&mut db, NS, "merged", &["urls1".to_string(), "urls2".to_string()]).unwrap();
        remove(&mut db, NS, "urls1").unwrap();
        let resolved = super::super::resolve(&mut db, NS, "merged").unwrap();
        let ids = super::super::collect_ids(&mut db, &resolved).unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[test]
    fn reassign_enriches_without_disturbing_original_membership() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        cache(&mut db, NS, "q1", &bundle_with_urls()).unwrap();
        extract(&mut db, NS, "urls", "url", "q1", "[url:value LIKE '%page%']").unwrap();
        let resolved = super::super::resolve(&mut db, NS, "urls").unwrap();
        let ids = super::super::collect_ids(&mut db, &resolved).unwrap();
        let mut records = Vec::new();
        for id in &ids {
            let mut rec = BTreeMap::new();
            rec.insert("type".to_string(), Json::String("url".to_string()));
            rec.insert("id".to_string(), Json::String(id.clone()));
            rec.insert("x_enrich".to_string(), Json::Number(1.into()));
            records.push(rec);
        }
        reassign(&mut db, NS, "enriched_urls", &records).unwrap();

        let urls_resolved = super::super::resolve(&mut db, NS, "urls").unwrap();
        let urls_ids = super::super::collect_ids(&mut db, &urls_resolved).unwrap();
        assert_eq!(urls_ids.len(), 2);

        let enriched_resolved = super::super::resolve(&mut db, NS, "enriched_urls").unwrap();
        let enriched_ids = super::super::collect_ids(&mut db, &enriched_resolved).unwrap();
        assert_eq!(enriched_ids.len(), 2);
    }
}
