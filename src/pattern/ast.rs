#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    Matches,
    In,
    IsSubset,
    IsSuperset,
}

impl Operator {
    pub fn from_token(s: &str) -> Option<Operator> {
        match s {
            "=" => Some(Operator::Eq),
            "!=" => Some(Operator::NotEq),
            "<" => Some(Operator::Lt),
            "<=" => Some(Operator::Lte),
            ">" => Some(Operator::Gt),
            ">=" => Some(Operator::Gte),
            "LIKE" => Some(Operator::Like),
            "MATCHES" => Some(Operator::Matches),
            "IN" => Some(Operator::In),
            "ISSUBSET" => Some(Operator::IsSubset),
            "ISSUPERSET" => Some(Operator::IsSuperset),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PatternValue {
    Str(String),
    Num(f64),
    Bool(bool),
    List(Vec<PatternValue>),
}

/// `type:prop.sub.sub` — `root_type` is the SCO type this comparison is
/// rooted at; `path` is the dotted property chain after the colon. A path
/// of length > 1 crosses a `*_ref` join, resolved via the schema
/// registry's ref-target table at compile time.
#[derive(Debug, Clone)]
pub struct ObjectPath {
    pub root_type: String,
    pub path: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub path: ObjectPath,
    pub op: Operator,
    pub value: PatternValue,
    pub negated: bool,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Compare(Comparison),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

/// A parsed pattern: one expression per bracketed group, joined by
/// `FOLLOWEDBY`. This store has no event-ordering concept, so groups are
/// compiled independently and conjoined with AND (see DESIGN.md).
#[derive(Debug, Clone)]
pub struct Pattern {
    pub groups: Vec<Expr>,
}

impl Pattern {
    /// The root SCO type of the pattern: the object type named by the
    /// leftmost comparison in the first bracketed group.
    pub fn root_type(&self) -> Option<&str> {
        fn leftmost(expr: &Expr) -> &str {
            match expr {
                Expr::Compare(cmp) => &cmp.path.root_type,
                Expr::And(lhs, _) | Expr::Or(lhs, _) => leftmost(lhs),
            }
        }
        self.groups.first().map(|g| leftmost(g))
    }
}
