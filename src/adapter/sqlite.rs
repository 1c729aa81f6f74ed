//! Embedded dialect: a single SQLite file via `rusqlite`'s bundled build,
//! so tests and callers need no system libsqlite3.

use rusqlite::types::ValueRef;
use rusqlite::{Connection, params_from_iter};

use super::{DialectFlags, QueryResult, SqlAdapter, Value};
use crate::error::Result;
use crate::schema::types::ColumnType;

pub struct SqliteAdapter {
    conn: Connection,
    dialect: DialectFlags,
    in_transaction: bool,
}

impl SqliteAdapter {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA synchronous=NORMAL;",
        )?;
        register_pattern_functions(&conn)?;
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        register_pattern_functions(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            dialect: DialectFlags {
                cidr_subset_op: None,
                cidr_superset_op: None,
                regex_op: None,
                is_postgres: false,
            },
            in_transaction: false,
        }
    }
}

/// Register the scalar functions the pattern compiler falls back to when
/// SQLite has no native operator: `firepit_regexp(pattern, text)` for
/// `MATCHES`, `firepit_ip2int(dotted_quad)` for `ISSUBSET`/`ISSUPERSET`.
fn register_pattern_functions(conn: &Connection) -> Result<()> {
    conn.create_scalar_function(
        "firepit_regexp",
        2,
        rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let pattern: String = ctx.get(0)?;
            let text: String = ctx.get(1)?;
            let re = regex::Regex::new(&pattern).map_err(|e| {
                rusqlite::Error::UserFunctionError(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    e.to_string(),
                )))
            })?;
            Ok(re.is_match(&text))
        },
    )?;

    conn.create_scalar_function(
        "firepit_ip2int",
        1,
        rusqlite::functions::FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let text: String = ctx.get(0)?;
            let addr: std::net::Ipv4Addr = text.parse().map_err(|_| {
                rusqlite::Error::UserFunctionError(Box::new(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("'{text}' is not an IPv4 address"),
                )))
            })?;
            Ok(u32::from(addr) as i64)
        },
    )?;
    Ok(())
}

fn to_sql_value(v: &Value) -> rusqlite::types::Value {
    match v {
        Value::Null => rusqlite::types::Value::Null,
        Value::Integer(i) => rusqlite::types::Value::Integer(*i),
        Value::Real(r) => rusqlite::types::Value::Real(*r),
        Value::Boolean(b) => rusqlite::types::Value::Integer(if *b { 1 } else { 0 }),
        Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
    }
}

fn from_value_ref(v: ValueRef<'_>) -> Value {
    match v {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Integer(i),
        ValueRef::Real(r) => Value::Real(r),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::Text(String::from_utf8_lossy(b).to_string()),
    }
}

impl SqlAdapter for SqliteAdapter {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn dialect(&self) -> &DialectFlags {
        &self.dialect
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let bound: Vec<rusqlite::types::Value> = params.iter().map(to_sql_value).collect();
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .iter()
            .map(|s| s.to_string())
            .collect();

        if columns.is_empty() {
            stmt.execute(params_from_iter(bound.iter()))?;
            return Ok(QueryResult::default());
        }

        let mut rows_out = Vec::new();
        let mut rows = stmt.query(params_from_iter(bound.iter()))?;
        while let Some(row) = rows.next()? {
            let mut out_row = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                out_row.push(from_value_ref(row.get_ref(i)?));
            }
            rows_out.push(out_row);
        }
        Ok(QueryResult {
            columns,
            rows: rows_out,
        })
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<(String, ColumnType)>> {
        if !self.table_exists(table)? {
            return Ok(Vec::new());
        }
        let sql = format!("PRAGMA table_info({})", self.quote_identifier(table));
        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(1)?;
            let decl_type: String = row.get(2)?;
            out.push((name, ColumnType::from_sql_type_name(&decl_type)));
        }
        Ok(out)
    }

    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM sqlite_master WHERE type='table' AND name=?1")?;
        let exists = stmt.exists([table])?;
        Ok(exists)
    }

    fn tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM sqlite_master WHERE type='table'")?;
        let mut rows = stmt.query([])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let name: String = row.get(0)?;
            if name.starts_with(prefix) {
                out.push(name);
            }
        }
        Ok(out)
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("BEGIN IMMEDIATE;")?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("COMMIT;")?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.conn.execute_batch("ROLLBACK;")?;
        self.in_transaction = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_columns_on_missing_table_is_empty() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        assert!(db.table_columns("nope").unwrap().is_empty());
    }

    #[test]
    fn create_and_introspect_table() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        db.execute(
            "CREATE TABLE \"url\" (id TEXT PRIMARY KEY, value TEXT, number_observed BIGINT)",
            &[],
        )
        .unwrap();
        let cols = db.table_columns("url").unwrap();
        assert_eq!(cols.len(), 3);
        assert_eq!(cols[1].0, "value");
    }

    #[test]
    fn transaction_commits_and_rolls_back() {
        let mut db = SqliteAdapter::open_in_memory().unwrap();
        db.execute("CREATE TABLE t (id INTEGER)", &[]).unwrap();
        db.begin().unwrap();
        db.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
        db.rollback().unwrap();
        let res = db.execute("SELECT count(*) as c FROM t", &[]).unwrap();
        assert_eq!(res.rows[0][0], Value::Integer(0));
    }
}
