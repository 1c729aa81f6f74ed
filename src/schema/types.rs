use std::fmt;

/// The inferred column type lattice. Columns only ever widen, never narrow:
/// `Integer ⊆ Real ⊆ String`, `Boolean ⊆ String`, nothing else unifies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnType {
    Integer,
    Real,
    Boolean,
    String,
}

impl ColumnType {
    pub fn sql_type(&self, dialect_is_postgres: bool) -> &'static str {
        match (self, dialect_is_postgres) {
            (ColumnType::Integer, _) => "BIGINT",
            (ColumnType::Real, _) => "DOUBLE PRECISION",
            (ColumnType::Boolean, true) => "BOOLEAN",
            (ColumnType::Boolean, false) => "BOOLEAN", // sqlite stores 0/1 ints
            (ColumnType::String, true) => "TEXT",
            (ColumnType::String, false) => "TEXT",
        }
    }

    pub fn from_sql_type_name(name: &str) -> ColumnType {
        let upper = name.to_ascii_uppercase();
        if upper.contains("BOOL") {
            ColumnType::Boolean
        } else if upper.contains("INT") {
            ColumnType::Integer
        } else if upper.contains("REAL") || upper.contains("DOUBLE") || upper.contains("FLOAT") || upper.contains("NUMERIC")
        {
            ColumnType::Real
        } else {
            ColumnType::String
        }
    }

    /// Widen `self` to accommodate a value observed to be `other`.
    /// Returns `None` when the two types have no common representation
    /// (this only happens for currently-unreachable combinations; the
    /// lattice below is total over `ColumnType`).
    pub fn widen(self, other: ColumnType) -> ColumnType {
        use ColumnType::*;
        match (self, other) {
            (a, b) if a == b => a,
            (Boolean, String) | (String, Boolean) => String,
            (Integer, Real) | (Real, Integer) => Real,
            (Integer, String) | (String, Integer) => String,
            (Real, String) | (String, Real) => String,
            (Boolean, Integer) | (Integer, Boolean) => Integer,
            (Boolean, Real) | (Real, Boolean) => Real,
            _ => String,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ColumnType::Integer => "integer",
            ColumnType::Real => "real",
            ColumnType::Boolean => "boolean",
            ColumnType::String => "string",
        };
        write!(f, "{s}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn widen_is_commutative_and_never_narrows() {
        let pairs = [
            (ColumnType::Integer, ColumnType::Real, ColumnType::Real),
            (ColumnType::Integer, ColumnType::String, ColumnType::String),
            (ColumnType::Boolean, ColumnType::String, ColumnType::String),
            (ColumnType::Boolean, ColumnType::Integer, ColumnType::Integer),
            (ColumnType::Real, ColumnType::String, ColumnType::String),
        ];
        for (a, b, expected) in pairs {
            assert_eq!(a.widen(b), expected);
            assert_eq!(b.widen(a), expected);
        }
    }

    #[test]
    fn widen_same_type_is_identity() {
        for t in [
            ColumnType::Integer,
            ColumnType::Real,
            ColumnType::Boolean,
            ColumnType::String,
        ] {
            assert_eq!(t.widen(t), t);
        }
    }
}
