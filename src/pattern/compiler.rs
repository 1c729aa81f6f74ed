//! Compiles a parsed pattern into a parameterized SQL predicate, resolving
//! dotted ref paths into table joins via the schema registry's `__refs`
//! table and translating operators that have no direct SQL equivalent
//! (`MATCHES`, `ISSUBSET`/`ISSUPERSET`) per dialect.

use ipnetwork::IpNetwork;

use super::ast::{Comparison, Expr, Operator, Pattern, PatternValue};
use crate::adapter::{SqlAdapter, Value};
use crate::error::{Result, StoreError};
use crate::schema::SchemaRegistry;

/// A table this predicate must be joined against to resolve a dotted ref
/// path, e.g. `network-traffic:src_ref.value` joining `ipv4-addr`.
#[derive(Debug, Clone)]
pub struct JoinClause {
    pub table: String,
    pub alias: String,
    pub parent_alias: String,
    pub parent_ref_column: String,
}

/// The compiled, parameterized form of a pattern: a `WHERE`-clause body,
/// its bound parameters in order, and the joins it requires against the
/// root alias `t0`.
#[derive(Debug, Clone)]
pub struct SqlFragment {
    pub where_sql: String,
    pub params: Vec<Value>,
    pub joins: Vec<JoinClause>,
}

pub const ROOT_ALIAS: &str = "t0";

/// Resolve a dotted object path (`["src_ref", "value"]`) against `root_table`,
/// starting the join chain from `root_alias`, joining through `__refs`
/// targets for every segment but the last. Shared by predicate compilation
/// (`Compiler::resolve_column`) and the view engine's read-time dotted-path
/// projections (`values()`, grouped `by`, join `on` columns).
pub fn resolve_path(
    adapter: &mut dyn SqlAdapter,
    root_table: &str,
    root_alias: &str,
    segments: &[String],
) -> Result<(Vec<JoinClause>, String, String)> {
    let mut joins = Vec::new();
    let mut alias = root_alias.to_string();
    let mut table = root_table.to_string();
    let mut counter = 0usize;

    if segments.is_empty() {
        return Err(StoreError::InvalidAttr(
            "object path has no property segment".to_string(),
        ));
    }

    for seg in &segments[..segments.len() - 1] {
        let target = SchemaRegistry::ref_target(adapter, &table, seg)?.ok_or_else(|| {
            StoreError::InvalidAttr(format!("'{table}.{seg}' is not a known reference property"))
        })?;
        counter += 1;
        let new_alias = format!("{root_alias}_j{counter}");
        joins.push(JoinClause {
            table: target.clone(),
            alias: new_alias.clone(),
            parent_alias: alias.clone(),
            parent_ref_column: seg.clone(),
        });
        alias = new_alias;
        table = target;
    }

    let column = segments.last().cloned().unwrap();
    Ok((joins, alias, column))
}

pub fn compile(
    adapter: &mut dyn SqlAdapter,
    root_table: &str,
    pattern: &Pattern,
) -> Result<SqlFragment> {
    let mut compiler = Compiler {
        adapter,
        root_table: root_table.to_string(),
        joins: Vec::new(),
        params: Vec::new(),
    };
    let mut clauses = Vec::with_capacity(pattern.groups.len());
    for group in &pattern.groups {
        clauses.push(compiler.compile_expr(group)?);
    }
    Ok(SqlFragment {
        where_sql: clauses.join(" AND "),
        params: compiler.params,
        joins: compiler.joins,
    })
}

struct Compiler<'a> {
    adapter: &'a mut dyn SqlAdapter,
    root_table: String,
    joins: Vec<JoinClause>,
    params: Vec<Value>,
}

impl<'a> Compiler<'a> {
    fn compile_expr(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Compare(cmp) => self.compile_comparison(cmp),
            Expr::And(lhs, rhs) => {
                let l = self.compile_expr(lhs)?;
                let r = self.compile_expr(rhs)?;
                Ok(format!("({l} AND {r})"))
            }
            Expr::Or(lhs, rhs) => {
                let l = self.compile_expr(lhs)?;
                let r = self.compile_expr(rhs)?;
                Ok(format!("({l} OR {r})"))
            }
        }
    }

    /// Resolve `cmp.path.path` into a `(alias, column)` pair, joining
    /// through `__refs` targets for every segment but the last.
    fn resolve_column(&mut self, cmp: &Comparison) -> Result<(String, String)> {
        let root_table = self.root_table.clone();
        let (joins, alias, column) =
            resolve_path(self.adapter, &root_table, ROOT_ALIAS, &cmp.path.path)?;
        let final_alias = if joins.is_empty() {
            alias
        } else {
            // Renumber: give each join a globally-unique t{n} alias and
            // rewrite the chain's parent pointers to match.
            let mut prev = ROOT_ALIAS.to_string();
            let mut renamed = Vec::with_capacity(joins.len());
            for j in joins.into_iter() {
                let n = {
                    self.joins.len() + renamed.len() + 1
                };
                let new_alias = format!("t{n}");
                renamed.push(JoinClause {
                    table: j.table,
                    alias: new_alias.clone(),
                    parent_alias: prev.clone(),
                    parent_ref_column: j.parent_ref_column,
                });
                prev = new_alias;
            }
            let last_alias = prev;
            self.joins.extend(renamed);
            last_alias
        };
        Ok((final_alias, column))
    }

    fn compile_comparison(&mut self, cmp: &Comparison) -> Result<String> {
        let (alias, column) = self.resolve_column(cmp)?;
        let quoted_col = format!("{alias}.{}", self.adapter.quote_identifier(&column));

        let body = match cmp.op {
            Operator::Eq => self.binary_op(&quoted_col, "=", &cmp.value)?,
            Operator::NotEq => self.binary_op(&quoted_col, "!=", &cmp.value)?,
            Operator::Lt => self.binary_op(&quoted_col, "<", &cmp.value)?,
            Operator::Lte => self.binary_op(&quoted_col, "<=", &cmp.value)?,
            Operator::Gt => self.binary_op(&quoted_col, ">", &cmp.value)?,
            Operator::Gte => self.binary_op(&quoted_col, ">=", &cmp.value)?,
            Operator::Like => self.binary_op(&quoted_col, "LIKE", &cmp.value)?,
            Operator::Matches => self.compile_matches(&quoted_col, &cmp.value)?,
            Operator::In => self.compile_in(&quoted_col, &cmp.value)?,
            Operator::IsSubset => self.compile_cidr(&quoted_col, &cmp.value, true)?,
            Operator::IsSuperset => self.compile_cidr(&quoted_col, &cmp.value, false)?,
        };

        Ok(if cmp.negated {
            format!("NOT ({body})")
        } else {
            body
        })
    }

    fn bind(&mut self, value: &PatternValue) -> Result<Value> {
        Ok(match value {
            PatternValue::Str(s) => Value::Text(s.clone()),
            PatternValue::Num(n) => Value::Real(*n),
            PatternValue::Bool(b) => Value::Boolean(*b),
            PatternValue::List(_) => {
                return Err(StoreError::InvalidPattern(
                    "list value is not valid here".to_string(),
                ));
            }
        })
    }

    fn push_param(&mut self, value: Value) -> String {
        self.params.push(value);
        self.adapter.placeholder(self.params.len())
    }

    fn binary_op(&mut self, col: &str, op: &str, value: &PatternValue) -> Result<String> {
        let bound = self.bind(value)?;
        let ph = self.push_param(bound);
        Ok(format!("{col} {op} {ph}"))
    }

    fn compile_in(&mut self, col: &str, value: &PatternValue) -> Result<String> {
        let items = match value {
            PatternValue::List(items) => items,
            other => std::slice::from_ref(other),
        };
        let mut placeholders = Vec::with_capacity(items.len());
        for item in items {
            let bound = self.bind(item)?;
            placeholders.push(self.push_param(bound));
        }
        Ok(format!("{col} IN ({})", placeholders.join(", ")))
    }

    fn compile_matches(&mut self, col: &str, value: &PatternValue) -> Result<String> {
        let pattern = match value {
            PatternValue::Str(s) => s.clone(),
            _ => {
                return Err(StoreError::InvalidPattern(
                    "MATCHES requires a string pattern".to_string(),
                ));
            }
        };
        // Validate eagerly so InvalidPattern is raised at compile time, not
        // as a storage error when the engine finally evaluates a row.
        regex::Regex::new(&pattern)
            .map_err(|e| StoreError::InvalidPattern(format!("invalid MATCHES regex: {e}")))?;

        let ph = self.push_param(Value::Text(pattern));
        if let Some(op) = self.adapter.dialect().regex_op {
            Ok(format!("{col} {op} {ph}"))
        } else {
            Ok(format!("firepit_regexp({ph}, {col})"))
        }
    }

    fn compile_cidr(&mut self, col: &str, value: &PatternValue, subset: bool) -> Result<String> {
        let cidr_text = match value {
            PatternValue::Str(s) => s.clone(),
            _ => {
                return Err(StoreError::InvalidPattern(
                    "ISSUBSET/ISSUPERSET requires a string CIDR literal".to_string(),
                ));
            }
        };
        let network: IpNetwork = cidr_text
            .parse()
            .map_err(|e| StoreError::InvalidPattern(format!("invalid CIDR '{cidr_text}': {e}")))?;

        let native_op = if subset {
            self.adapter.dialect().cidr_subset_op
        } else {
            self.adapter.dialect().cidr_superset_op
        };
        if let Some(op) = native_op {
            let ph = self.push_param(Value::Text(cidr_text));
            return Ok(format!("{col}::inet {op} {ph}::cidr"));
        }

        let lo_ph = self.push_param(Value::Text(network.network().to_string()));
        let hi_ph = self.push_param(Value::Text(broadcast_of(&network)));
        if subset {
            // col's address falls within the literal CIDR's [network, broadcast] range.
            Ok(format!(
                "firepit_ip2int({col}) BETWEEN firepit_ip2int({lo_ph}) AND firepit_ip2int({hi_ph})"
            ))
        } else {
            // Inverse: col (a single address, i.e. an implicit /32) contains
            // the literal CIDR's range only if that range collapses to
            // exactly col's address.
            Ok(format!(
                "firepit_ip2int({col}) <= firepit_ip2int({lo_ph}) AND firepit_ip2int({col}) >= firepit_ip2int({hi_ph})"
            ))
        }
    }
}

/// Render a join chain (from `compile` or `resolve_path`) into literal SQL
/// `LEFT JOIN` clauses, one per hop, in order.
pub fn render_joins(adapter: &dyn SqlAdapter, joins: &[JoinClause]) -> String {
    let mut sql = String::new();
    for j in joins {
        sql.push_str(&format!(
            " LEFT JOIN {table} AS {alias} ON {alias}.id = {parent}.{col}",
            table = adapter.quote_identifier(&j.table),
            alias = j.alias,
            parent = j.parent_alias,
            col = adapter.quote_identifier(&j.parent_ref_column),
        ));
    }
    sql
}

fn broadcast_of(network: &IpNetwork) -> String {
    match network {
        IpNetwork::V4(n) => n.broadcast().to_string(),
        IpNetwork::V6(n) => n.broadcast().to_string(),
    }
}
