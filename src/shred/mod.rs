//! Flattens STIX Cyber Observable JSON into wide, per-type SQL tables.
//!
//! A scalar top-level property becomes a column of the inferred type. A
//! nested object carrying its own `type` field is shredded recursively and
//! replaced in its parent by an `{prop}_ref` id column, with the join
//! target recorded in the schema registry's `__refs` table. A nested object
//! with no `type` field (a free-form extension) is dropped - STIX
//! extensions have no fixed shape to assign a column type to, and this
//! store has no path for arbitrary nested storage.
//!
//! Every function here takes a session namespace `ns` and internally maps
//! a bare SCO type (`"url"`) to its physical table (`"{ns}url"`) before
//! touching the schema registry or issuing SQL - see `schema::physical_table`.
//! This is what keeps two sessions against the same database looking at
//! disjoint type tables.

pub mod upsert;

use std::collections::BTreeMap;

use serde_json::Value as Json;
use uuid::Uuid;

use crate::adapter::{SqlAdapter, Value};
use crate::error::{Result, StoreError};
use crate::schema::types::ColumnType;
use crate::schema::{physical_table, SchemaRegistry};

fn queries_table(ns: &str) -> String {
    format!("{ns}__queries")
}

/// Shred every object in a STIX bundle (`{"type":"bundle","objects":[...]}`
/// or a bare array of objects), tagging ingested ids under `query_id` when
/// given. Returns the ids actually written at the top level (nested
/// ref-targets are shredded too but not included in the returned list).
pub fn cache_bundle(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    query_id: &str,
    bundle: &Json,
) -> Result<Vec<String>> {
    let objects = top_level_objects(bundle)?;
    let mut ids = Vec::with_capacity(objects.len());
    for obj in objects {
        let id = shred_object(adapter, ns, obj)?;
        ids.push(id);
    }
    record_query(adapter, ns, query_id, &ids)?;
    Ok(ids)
}

/// Ingest a flat list of already-shredded-shape records (no nested ref
/// objects), as used by `load()`. `sco_type` overrides any `type` key
/// present in the records. Returns the SCO type ingested (for `load`'s
/// `res == 'process'`-style return value) alongside the ids written.
pub fn load_records(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    records: &[BTreeMap<String, Json>],
    sco_type: Option<&str>,
    query_id: Option<&str>,
) -> Result<(String, Vec<String>)> {
    let mut ids = Vec::with_capacity(records.len());
    let mut resolved_type: Option<String> = sco_type.map(str::to_string);
    for (i, record) in records.iter().enumerate() {
        let ty = sco_type
            .map(str::to_string)
            .or_else(|| record.get("type").and_then(|v| v.as_str()).map(str::to_string))
            .ok_or_else(|| StoreError::InvalidAttr("no sco_type given or present".to_string()))?;
        resolved_type.get_or_insert_with(|| ty.clone());
        let mut flat = record.clone();
        flat.remove("type");
        let id = flat
            .remove("id")
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{ty}--{}_{i}", Uuid::new_v4()));
        write_row(adapter, ns, &ty, &id, &flat)?;
        ids.push(id);
    }
    if let Some(qid) = query_id {
        record_query(adapter, ns, qid, &ids)?;
    }
    let ty = resolved_type
        .ok_or_else(|| StoreError::InvalidAttr("load() given no records and no sco_type".to_string()))?;
    Ok((ty, ids))
}

fn top_level_objects(bundle: &Json) -> Result<Vec<&Json>> {
    match bundle {
        Json::Object(map) => match map.get("objects") {
            Some(Json::Array(objs)) => Ok(objs.iter().collect()),
            _ => Err(StoreError::InvalidAttr(
                "bundle has no 'objects' array".to_string(),
            )),
        },
        Json::Array(objs) => Ok(objs.iter().collect()),
        _ => Err(StoreError::InvalidAttr(
            "expected a STIX bundle object or array of observables".to_string(),
        )),
    }
}

/// Shred one SCO, recursively shredding any nested typed objects first so
/// `*_ref` columns can be written alongside the parent's own columns.
/// Returns the (possibly synthesized) id of the object written.
fn shred_object(adapter: &mut dyn SqlAdapter, ns: &str, obj: &Json) -> Result<String> {
    let map = obj.as_object().ok_or_else(|| {
        StoreError::InvalidAttr("observable is not a JSON object".to_string())
    })?;

    let sco_type = map
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| StoreError::InvalidAttr("observable missing 'type'".to_string()))?
        .to_string();

    let id = map
        .get("id")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{sco_type}--{}", Uuid::new_v4()));

    let mut flat: BTreeMap<String, Json> = BTreeMap::new();
    for (key, value) in map {
        if key == "type" || key == "id" {
            continue;
        }
        match value {
            Json::Object(child) if child.contains_key("type") => {
                let child_id = shred_object(adapter, ns, value)?;
                let child_type = child["type"].as_str().unwrap_or_default();
                let ref_col = ref_column_name(key);
                SchemaRegistry::ensure_ref(
                    adapter,
                    &physical_table(ns, &sco_type),
                    &ref_col,
                    &physical_table(ns, child_type),
                )?;
                flat.insert(ref_col, Json::String(child_id));
            }
            Json::Object(_) => {
                // Untyped nested extension data: no stable shape, dropped.
            }
            Json::Array(items) => {
                // Arrays of scalars are stored as a delimited string; arrays
                // of typed objects are shredded and linked the same way a
                // singular ref would be, keyed off the first element only
                // is not attempted here - multi-valued refs are out of
                // scope for this column-per-property model.
                if items.iter().all(|v| v.is_string() || v.is_number() || v.is_boolean()) {
                    let joined = items
                        .iter()
                        .map(json_scalar_to_string)
                        .collect::<Vec<_>>()
                        .join(",");
                    flat.insert(key.clone(), Json::String(joined));
                }
            }
            _ => {
                flat.insert(key.clone(), value.clone());
            }
        }
    }

    write_row(adapter, ns, &sco_type, &id, &flat)?;
    Ok(id)
}

fn ref_column_name(key: &str) -> String {
    if key.ends_with("_ref") {
        key.to_string()
    } else {
        format!("{key}_ref")
    }
}

fn json_scalar_to_string(v: &Json) -> String {
    match v {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub(crate) fn infer_column_type(v: &Json) -> ColumnType {
    match v {
        Json::Bool(_) => ColumnType::Boolean,
        Json::Number(n) if n.is_i64() || n.is_u64() => ColumnType::Integer,
        Json::Number(_) => ColumnType::Real,
        _ => ColumnType::String,
    }
}

/// Ensure `sco_type`'s physical table (and each of `columns`' columns)
/// exists, widened as needed, then upsert `id`'s row. Exposed for
/// `reassign` and `join`'s `load`-style enrichment ingestion, which write
/// rows the same way ordinary ingestion does.
pub fn write_row(
    adapter: &mut dyn SqlAdapter,
    ns: &str,
    sco_type: &str,
    id: &str,
    columns: &BTreeMap<String, Json>,
) -> Result<()> {
    let table = physical_table(ns, sco_type);
    SchemaRegistry::ensure_table(adapter, &table)?;
    for (col, val) in columns {
        SchemaRegistry::ensure_column(adapter, &table, col, infer_column_type(val))?;
    }
    upsert::upsert_row(adapter, &table, sco_type, id, columns)
}

fn record_query(adapter: &mut dyn SqlAdapter, ns: &str, query_id: &str, ids: &[String]) -> Result<()> {
    let table = queries_table(ns);
    if !adapter.table_exists(&table)? {
        let sql = format!(
            "CREATE TABLE {} (query_id TEXT NOT NULL, id TEXT NOT NULL, \
             PRIMARY KEY (query_id, id))",
            adapter.quote_identifier(&table)
        );
        adapter.execute(&sql, &[])?;
    }
    for id in ids {
        let sql = format!(
            "INSERT INTO {} (query_id, id) VALUES ({}, {}) ON CONFLICT (query_id, id) DO NOTHING",
            adapter.quote_identifier(&table),
            adapter.placeholder(1),
            adapter.placeholder(2),
        );
        adapter.execute(&sql, &[Value::Text(query_id.to_string()), Value::Text(id.clone())])?;
    }
    Ok(())
}

/// The ids recorded under `query_id` by a prior `cache` call, regardless
/// of SCO type. `extract` further restricts this set to the rows that
/// actually exist in its target type's physical table.
pub fn query_ids(adapter: &mut dyn SqlAdapter, ns: &str, query_id: &str) -> Result<Vec<String>> {
    let table = queries_table(ns);
    if !adapter.table_exists(&table)? {
        return Ok(Vec::new());
    }
    let sql = format!(
        "SELECT id FROM {} WHERE query_id = {}",
        adapter.quote_identifier(&table),
        adapter.placeholder(1)
    );
    let res = adapter.execute(&sql, &[Value::Text(query_id.to_string())])?;
    Ok(res
        .rows
        .into_iter()
        .filter_map(|r| r.into_iter().next())
        .filter_map(|v| v.as_text().map(String::from))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::sqlite::SqliteAdapter;
    use serde_json::json;

    #[test]
    fn shreds_nested_ref_into_two_tables() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        let bundle = json!({
            "type": "bundle",
            "objects": [{
                "type": "network-traffic",
                "id": "network-traffic--1",
                "dst_port": 22,
                "src_ref": {"type": "ipv4-addr", "id": "ipv4-addr--1", "value": "10.0.0.1"},
            }],
        });
        let ids = cache_bundle(&mut db, "s1_", "q1", &bundle).unwrap();
        assert_eq!(ids, vec!["network-traffic--1".to_string()]);
        assert!(db.table_exists("s1_network-traffic").unwrap());
        assert!(db.table_exists("s1_ipv4-addr").unwrap());
        let res = db
            .execute("SELECT \"src_ref\" FROM \"s1_network-traffic\"", &[])
            .unwrap();
        assert_eq!(res.rows[0][0], Value::Text("ipv4-addr--1".to_string()));
    }

    #[test]
    fn duplicate_id_sums_number_observed() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        let bundle = json!({
            "type": "bundle",
            "objects": [{"type": "url", "id": "url--1", "value": "http://example.com"}],
        });
        cache_bundle(&mut db, "s1_", "q1", &bundle).unwrap();
        cache_bundle(&mut db, "s1_", "q2", &bundle).unwrap();
        let res = db
            .execute("SELECT number_observed FROM \"s1_url\" WHERE id = 'url--1'", &[])
            .unwrap();
        assert_eq!(res.rows[0][0], Value::Integer(2));
    }

    #[test]
    fn sessions_keep_query_ids_disjoint() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        let bundle = json!({
            "type": "bundle",
            "objects": [{"type": "url", "id": "url--1", "value": "http://example.com"}],
        });
        cache_bundle(&mut db, "s1_", "q1", &bundle).unwrap();
        let s1_ids = query_ids(&mut db, "s1_", "q1").unwrap();
        let s2_ids = query_ids(&mut db, "s2_", "q1").unwrap();
        assert_eq!(s1_ids, vec!["url--1".to_string()]);
        assert!(s2_ids.is_empty());
    }
}
