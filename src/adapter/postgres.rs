//! Server dialect: a synchronous connection via the `postgres` crate. No
//! async runtime is needed — every public operation is a single blocking
//! transaction, matching the crate's single-writer concurrency model.

use postgres::types::{ToSql, Type};
use postgres::{Client, NoTls, Row};

use super::{DialectFlags, QueryResult, SqlAdapter, Value};
use crate::error::Result;
use crate::schema::types::ColumnType;

pub struct PostgresAdapter {
    client: Client,
    dialect: DialectFlags,
    in_transaction: bool,
}

impl PostgresAdapter {
    pub fn connect(conninfo: &str) -> Result<Self> {
        let client = Client::connect(conninfo, NoTls)?;
        Ok(Self {
            client,
            dialect: DialectFlags {
                cidr_subset_op: Some("<<="),
                cidr_superset_op: Some(">>="),
                regex_op: Some("~"),
                is_postgres: true,
            },
            in_transaction: false,
        })
    }
}

struct BoxedSql(Value);

impl ToSql for BoxedSql {
    fn to_sql(
        &self,
        ty: &Type,
        out: &mut bytes::BytesMut,
    ) -> std::result::Result<postgres::types::IsNull, Box<dyn std::error::Error + Sync + Send>>
    {
        match &self.0 {
            Value::Null => Ok(postgres::types::IsNull::Yes),
            Value::Integer(i) => i.to_sql(ty, out),
            Value::Real(r) => r.to_sql(ty, out),
            Value::Boolean(b) => b.to_sql(ty, out),
            Value::Text(s) => s.to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    postgres::types::to_sql_checked!();
}

fn row_to_value(row: &Row, idx: usize) -> Value {
    let col = &row.columns()[idx];
    match *col.type_() {
        Type::INT2 | Type::INT4 | Type::INT8 => row
            .try_get::<_, Option<i64>>(idx)
            .ok()
            .flatten()
            .map(Value::Integer)
            .unwrap_or(Value::Null),
        Type::FLOAT4 | Type::FLOAT8 | Type::NUMERIC => row
            .try_get::<_, Option<f64>>(idx)
            .ok()
            .flatten()
            .map(Value::Real)
            .unwrap_or(Value::Null),
        Type::BOOL => row
            .try_get::<_, Option<bool>>(idx)
            .ok()
            .flatten()
            .map(Value::Boolean)
            .unwrap_or(Value::Null),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::Text)
            .unwrap_or(Value::Null),
    }
}

impl SqlAdapter for PostgresAdapter {
    fn quote_identifier(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    fn dialect(&self) -> &DialectFlags {
        &self.dialect
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult> {
        let boxed: Vec<BoxedSql> = params.iter().cloned().map(BoxedSql).collect();
        let refs: Vec<&(dyn ToSql + Sync)> = boxed
            .iter()
            .map(|b| b as &(dyn ToSql + Sync))
            .collect();

        // Column metadata comes from the prepared statement, not the first
        // returned row, so a zero-row result (e.g. `probe_columns`'s `WHERE
        // 1 = 0`) still reports its columns.
        let stmt = self.client.prepare(sql)?;
        let columns: Vec<String> = stmt.columns().iter().map(|c| c.name().to_string()).collect();

        let rows = self.client.query(&stmt, &refs)?;
        let out_rows = rows
            .iter()
            .map(|row| (0..columns.len()).map(|i| row_to_value(row, i)).collect())
            .collect();
        Ok(QueryResult {
            columns,
            rows: out_rows,
        })
    }

    fn table_columns(&mut self, table: &str) -> Result<Vec<(String, ColumnType)>> {
        let rows = self.client.query(
            "SELECT column_name, data_type FROM information_schema.columns \
             WHERE table_name = $1 ORDER BY ordinal_position",
            &[&table],
        )?;
        Ok(rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let data_type: String = row.get(1);
                (name, ColumnType::from_sql_type_name(&data_type))
            })
            .collect())
    }

    fn table_exists(&mut self, table: &str) -> Result<bool> {
        let row = self.client.query_one(
            "SELECT EXISTS (SELECT 1 FROM information_schema.tables WHERE table_name = $1)",
            &[&table],
        )?;
        Ok(row.get(0))
    }

    fn tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>> {
        let rows = self.client.query(
            "SELECT table_name FROM information_schema.tables WHERE table_schema = 'public'",
            &[],
        )?;
        Ok(rows
            .iter()
            .map(|row| row.get::<_, String>(0))
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    fn begin(&mut self) -> Result<()> {
        if self.in_transaction {
            return Ok(());
        }
        self.client.execute("BEGIN", &[])?;
        self.in_transaction = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.client.execute("COMMIT", &[])?;
        self.in_transaction = false;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.in_transaction {
            return Ok(());
        }
        self.client.execute("ROLLBACK", &[])?;
        self.in_transaction = false;
        Ok(())
    }
}
