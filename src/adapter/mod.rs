//! Dialect abstraction. Every caller above this module speaks `Value` and
//! `QueryResult`; dialect-specific quoting, placeholder style, and
//! operator translation live entirely inside the two implementations.

pub mod postgres;
pub mod sqlite;
pub mod value;

pub use value::{QueryResult, Value};

use crate::error::Result;
use crate::schema::types::ColumnType;

/// Per-dialect behavior the rest of the crate needs to branch on, without
/// knowing which concrete adapter it's talking to.
#[derive(Debug, Clone)]
pub struct DialectFlags {
    /// Native CIDR containment operators, if the dialect has an `inet`
    /// type (`<<=`/`>>=` on Postgres). `None` means the pattern compiler
    /// must expand `ISSUBSET`/`ISSUPERSET` into numeric range predicates.
    pub cidr_subset_op: Option<&'static str>,
    pub cidr_superset_op: Option<&'static str>,
    /// Native regex match operator (`~` on Postgres). `None` means the
    /// pattern compiler must call a registered scalar function instead.
    pub regex_op: Option<&'static str>,
    pub is_postgres: bool,
}

/// Unifies the embedded (SQLite) and server (Postgres) backends behind one
/// contract: parameterized execution, live schema introspection, and
/// transaction bracketing. Every public store operation runs inside one
/// `begin`/`commit` (or `rollback` on error) pair.
pub trait SqlAdapter {
    fn quote_identifier(&self, ident: &str) -> String;
    fn dialect(&self) -> &DialectFlags;

    /// Render the `n`th (1-indexed) bind parameter placeholder in this
    /// dialect's syntax (`?n` for SQLite, `$n` for Postgres).
    fn placeholder(&self, n: usize) -> String {
        if self.dialect().is_postgres {
            format!("${n}")
        } else {
            format!("?{n}")
        }
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<QueryResult>;

    /// Live column introspection, `(name, type)` in declaration order.
    /// Returns an empty vec if the table does not exist.
    fn table_columns(&mut self, table: &str) -> Result<Vec<(String, ColumnType)>>;

    fn table_exists(&mut self, table: &str) -> Result<bool>;

    /// Every table whose name starts with `prefix` - used by `Session::delete`
    /// to find every physical table a session namespace ever wrote to,
    /// since nothing else tracks that set directly.
    fn tables_with_prefix(&mut self, prefix: &str) -> Result<Vec<String>>;

    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
}

/// Run `f` inside a transaction: commits on `Ok`, rolls back on `Err`.
pub fn transaction<A, F, T>(adapter: &mut A, f: F) -> Result<T>
where
    A: SqlAdapter + ?Sized,
    F: FnOnce(&mut A) -> Result<T>,
{
    adapter.begin()?;
    match f(adapter) {
        Ok(value) => {
            adapter.commit()?;
            Ok(value)
        }
        Err(e) => {
            let _ = adapter.rollback();
            Err(e)
        }
    }
}
