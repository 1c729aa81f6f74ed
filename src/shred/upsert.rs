//! Identity/merge layer: the single upsert statement that keeps repeated
//! observations of the same id coherent - `number_observed` accumulates and
//! non-null incoming values win over existing nulls, but an incoming null
//! never clobbers an existing value.

use std::collections::BTreeMap;

use serde_json::Value as Json;

use crate::adapter::{SqlAdapter, Value};
use crate::error::Result;

/// `table` is the physical (already session-namespaced) table name;
/// `sco_type` is the bare STIX type written into the `type` column.
pub fn upsert_row(
    adapter: &mut dyn SqlAdapter,
    table: &str,
    sco_type: &str,
    id: &str,
    columns: &BTreeMap<String, Json>,
) -> Result<()> {
    let quoted_table = adapter.quote_identifier(table);
    let mut names = vec!["id".to_string(), "type".to_string(), "number_observed".to_string()];
    let mut placeholders = vec![
        adapter.placeholder(1),
        adapter.placeholder(2),
        adapter.placeholder(3),
    ];
    let observed = columns
        .get("number_observed")
        .and_then(|v| v.as_i64())
        .unwrap_or(1);
    let mut params: Vec<Value> = vec![
        Value::Text(id.to_string()),
        Value::Text(sco_type.to_string()),
        Value::Integer(observed),
    ];

    let mut idx = 4;
    for (col, val) in columns {
        if col == "number_observed" {
            continue;
        }
        names.push(col.clone());
        placeholders.push(adapter.placeholder(idx));
        params.push(Value::from(val.clone()));
        idx += 1;
    }

    let quoted_names: Vec<String> = names.iter().map(|n| adapter.quote_identifier(n)).collect();
    let update_clauses: Vec<String> = names
        .iter()
        .filter(|n| n.as_str() != "id" && n.as_str() != "type")
        .map(|n| {
            let q = adapter.quote_identifier(n);
            if n == "number_observed" {
                format!("{q} = {q} + excluded.{q}")
            } else {
                format!("{q} = COALESCE(excluded.{q}, {q})")
            }
        })
        .collect();

    let sql = format!(
        "INSERT INTO {table} ({names}) VALUES ({values}) \
         ON CONFLICT (id) DO UPDATE SET {updates}",
        table = quoted_table,
        names = quoted_names.join(", "),
        values = placeholders.join(", "),
        updates = update_clauses.join(", "),
    );

    adapter.execute(&sql, &params)?;
    Ok(())
}

/// Enrich an existing row with extra columns without touching
/// `number_observed` - used by `reassign`, which adds analyst-supplied
/// columns to rows that were already ingested rather than re-observing
/// them. Non-null incoming values win over existing nulls, same as
/// `upsert_row`; an absent row is still inserted (with `number_observed`
/// defaulting to 1) so enrichment never silently no-ops.
pub fn upsert_enrichment(
    adapter: &mut dyn SqlAdapter,
    table: &str,
    sco_type: &str,
    id: &str,
    columns: &BTreeMap<String, Json>,
) -> Result<()> {
    let quoted_table = adapter.quote_identifier(table);
    let mut names = vec!["id".to_string(), "type".to_string()];
    let mut placeholders = vec![adapter.placeholder(1), adapter.placeholder(2)];
    let mut params: Vec<Value> = vec![Value::Text(id.to_string()), Value::Text(sco_type.to_string())];

    let mut idx = 3;
    for (col, val) in columns {
        names.push(col.clone());
        placeholders.push(adapter.placeholder(idx));
        params.push(Value::from(val.clone()));
        idx += 1;
    }

    let quoted_names: Vec<String> = names.iter().map(|n| adapter.quote_identifier(n)).collect();
    let update_clauses: Vec<String> = names
        .iter()
        .filter(|n| n.as_str() != "id" && n.as_str() != "type")
        .map(|n| {
            let q = adapter.quote_identifier(n);
            format!("{q} = COALESCE(excluded.{q}, {q})")
        })
        .collect();
    if update_clauses.is_empty() {
        return Ok(());
    }

    let sql = format!(
        "INSERT INTO {table} ({names}) VALUES ({values}) \
         ON CONFLICT (id) DO UPDATE SET {updates}",
        table = quoted_table,
        names = quoted_names.join(", "),
        values = placeholders.join(", "),
        updates = update_clauses.join(", "),
    );

    adapter.execute(&sql, &params)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::sqlite::SqliteAdapter;
    use crate::schema::types::ColumnType;
    use crate::schema::SchemaRegistry;

    fn setup() -> SqliteAdapter {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        SchemaRegistry::ensure_table(&mut db, "url").unwrap();
        SchemaRegistry::ensure_column(&mut db, "url", "value", ColumnType::String).unwrap();
        SchemaRegistry::ensure_column(&mut db, "url", "x_enrich", ColumnType::Integer).unwrap();
        db
    }

    #[test]
    fn enrichment_does_not_touch_number_observed() {
        let mut db = setup();
        let mut cols = BTreeMap::new();
        cols.insert("value".to_string(), Json::String("http://example.com".to_string()));
        upsert_row(&mut db, "url", "url", "url--1", &cols).unwrap();

        let mut enrich = BTreeMap::new();
        enrich.insert("x_enrich".to_string(), Json::Number(1.into()));
        upsert_enrichment(&mut db, "url", "url", "url--1", &enrich).unwrap();

        let res = db
            .execute(
                "SELECT number_observed, x_enrich FROM \"url\" WHERE id = 'url--1'",
                &[],
            )
            .unwrap();
        assert_eq!(res.rows[0][0], Value::Integer(1));
        assert_eq!(res.rows[0][1], Value::Integer(1));
    }
}
