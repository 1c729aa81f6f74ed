use super::ast::{Comparison, Expr, ObjectPath, Operator, Pattern, PatternValue};
use super::lexer::{Token, lex};
use crate::error::{Result, StoreError};

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

pub fn parse(input: &str) -> Result<Pattern> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    parser.parse_pattern()
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, expected: &Token) -> Result<()> {
        match self.advance() {
            Some(ref t) if t == expected => Ok(()),
            other => Err(StoreError::InvalidPattern(format!(
                "expected {expected:?}, found {other:?}"
            ))),
        }
    }

    fn parse_pattern(&mut self) -> Result<Pattern> {
        let mut groups = vec![self.parse_group()?];
        while matches!(self.peek(), Some(Token::FollowedBy)) {
            self.advance();
            groups.push(self.parse_group()?);
        }
        if self.pos != self.tokens.len() {
            return Err(StoreError::InvalidPattern(
                "trailing tokens after pattern".to_string(),
            ));
        }
        Ok(Pattern { groups })
    }

    fn parse_group(&mut self) -> Result<Expr> {
        self.expect(&Token::LBracket)?;
        let expr = self.parse_expr()?;
        self.expect(&Token::RBracket)?;
        Ok(expr)
    }

    fn parse_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_comparison()?;
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.advance();
                    let rhs = self.parse_comparison()?;
                    lhs = Expr::And(Box::new(lhs), Box::new(rhs));
                }
                Some(Token::Or) => {
                    self.advance();
                    let rhs = self.parse_comparison()?;
                    lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
                }
                _ => break,
            }
        }
        Ok(lhs)
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let path = self.parse_object_path()?;
        let negated = matches!(self.peek(), Some(Token::Not));
        if negated {
            self.advance();
        }
        let op = self.parse_operator()?;
        let value = self.parse_rhs()?;
        Ok(Expr::Compare(Comparison {
            path,
            op,
            value,
            negated,
        }))
    }

    fn parse_object_path(&mut self) -> Result<ObjectPath> {
        let root_type = match self.advance() {
            Some(Token::Ident(s)) => s,
            other => {
                return Err(StoreError::InvalidPattern(format!(
                    "expected object type, found {other:?}"
                )));
            }
        };
        self.expect(&Token::Colon)?;
        let mut path = vec![self.expect_ident()?];
        while matches!(self.peek(), Some(Token::Dot)) {
            self.advance();
            path.push(self.expect_ident()?);
        }
        Ok(ObjectPath { root_type, path })
    }

    fn expect_ident(&mut self) -> Result<String> {
        match self.advance() {
            Some(Token::Ident(s)) => Ok(s),
            other => Err(StoreError::InvalidPattern(format!(
                "expected identifier, found {other:?}"
            ))),
        }
    }

    fn parse_operator(&mut self) -> Result<Operator> {
        match self.advance() {
            Some(Token::Op(s)) => Operator::from_token(&s)
                .ok_or_else(|| StoreError::InvalidPattern(format!("unknown operator '{s}'"))),
            other => Err(StoreError::InvalidPattern(format!(
                "expected operator, found {other:?}"
            ))),
        }
    }

    fn parse_rhs(&mut self) -> Result<PatternValue> {
        match self.peek() {
            Some(Token::LParen) => {
                self.advance();
                let mut values = vec![self.parse_scalar()?];
                while matches!(self.peek(), Some(Token::Comma)) {
                    self.advance();
                    values.push(self.parse_scalar()?);
                }
                self.expect(&Token::RParen)?;
                Ok(PatternValue::List(values))
            }
            _ => self.parse_scalar(),
        }
    }

    fn parse_scalar(&mut self) -> Result<PatternValue> {
        match self.advance() {
            Some(Token::String(s)) => Ok(PatternValue::Str(s)),
            Some(Token::Number(n)) => Ok(PatternValue::Num(n)),
            Some(Token::Bool(b)) => Ok(PatternValue::Bool(b)),
            other => Err(StoreError::InvalidPattern(format!(
                "expected a literal value, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_comparison() {
        let pattern = parse("[url:value = 'http://example.com']").unwrap();
        assert_eq!(pattern.groups.len(), 1);
        match &pattern.groups[0] {
            Expr::Compare(c) => {
                assert_eq!(c.path.root_type, "url");
                assert_eq!(c.path.path, vec!["value".to_string()]);
                assert_eq!(c.op, Operator::Eq);
            }
            _ => panic!("expected a comparison"),
        }
    }

    #[test]
    fn parses_and_or_and_dotted_ref_path() {
        let pattern =
            parse("[network-traffic:src_ref.value = '1.2.3.4' AND network-traffic:dst_port > 1024]")
                .unwrap();
        match &pattern.groups[0] {
            Expr::And(lhs, rhs) => {
                if let Expr::Compare(c) = lhs.as_ref() {
                    assert_eq!(c.path.path, vec!["src_ref".to_string(), "value".to_string()]);
                } else {
                    panic!("expected compare on lhs");
                }
                if let Expr::Compare(c) = rhs.as_ref() {
                    assert_eq!(c.op, Operator::Gt);
                } else {
                    panic!("expected compare on rhs");
                }
            }
            _ => panic!("expected AND"),
        }
    }

    #[test]
    fn parses_negated_in_list() {
        let pattern = parse("[url:value NOT IN ('a', 'b')]").unwrap();
        match &pattern.groups[0] {
            Expr::Compare(c) => {
                assert!(c.negated);
                assert_eq!(c.op, Operator::In);
                assert_eq!(
                    c.value,
                    PatternValue::List(vec![
                        PatternValue::Str("a".to_string()),
                        PatternValue::Str("b".to_string())
                    ])
                );
            }
            _ => panic!("expected compare"),
        }
    }

    #[test]
    fn parses_followedby_as_two_groups() {
        let pattern = parse("[url:value = 'a'] FOLLOWEDBY [ipv4-addr:value = '1.2.3.4']").unwrap();
        assert_eq!(pattern.groups.len(), 2);
    }

    #[test]
    fn rejects_unterminated_pattern() {
        assert!(parse("[url:value = 'a'").is_err());
    }
}
