//! Recursive-descent parser for the routing expression language.
//!
//! Grammar (lowest to highest precedence):
//!
//! ```text
//! expr       := or_expr
//! or_expr    := and_expr ( '||' and_expr )*
//! and_expr   := unary ( '&&' unary )*
//! unary      := '!' unary | comparison
//! comparison := atom ( compop atom )?
//! atom       := literal | ident | '(' expr ')'
//! literal    := string | number | bool | '[' literal (',' literal)* ']'
//! ```

use super::lexer::{self, Token};
use super::CompareOp;
use crate::error::{CoreError, Result};
use serde_json::Value;

/// Parsed expression AST. Every variant is a total, side-effect-free
/// operation over a [`super::RoutingContext`].
#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    Ident(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CompareOp, Box<Expr>, Box<Expr>),
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

pub(super) fn parse(source: &str) -> Result<Expr> {
    let tokens = lexer::lex(source)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        source,
    };
    let expr = parser.parse_or()?;
    parser.expect_eof()?;
    Ok(expr)
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn advance(&mut self) -> Token {
        let t = self.tokens[self.pos].clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, reason: impl Into<String>) -> CoreError {
        CoreError::ExpressionParseError {
            expr: self.source.to_string(),
            reason: reason.into(),
        }
    }

    fn expect_eof(&self) -> Result<()> {
        if matches!(self.peek(), Token::Eof) {
            Ok(())
        } else {
            Err(self.err(format!("unexpected trailing token {:?}", self.peek())))
        }
    }

    fn parse_or(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Token::Or) {
            self.advance();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while matches!(self.peek(), Token::And) {
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if matches!(self.peek(), Token::Not) {
            self.advance();
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr> {
        let lhs = self.parse_atom()?;
        let op = match self.peek() {
            Token::Eq => CompareOp::Eq,
            Token::Ne => CompareOp::Ne,
            Token::Lt => CompareOp::Lt,
            Token::Le => CompareOp::Le,
            Token::Gt => CompareOp::Gt,
            Token::Ge => CompareOp::Ge,
            Token::In => CompareOp::In,
            Token::Contains => CompareOp::Contains,
            Token::Matches => CompareOp::Matches,
            _ => return Ok(lhs),
        };
        self.advance();
        let rhs = self.parse_atom()?;
        Ok(Expr::Compare(op, Box::new(lhs), Box::new(rhs)))
    }

    fn parse_atom(&mut self) -> Result<Expr> {
        match self.advance() {
            Token::LParen => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Token::RParen => Ok(inner),
                    other => Err(self.err(format!("expected ')', found {other:?}"))),
                }
            }
            Token::Str(s) => Ok(Expr::Literal(Value::String(s))),
            Token::Num(n) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .ok_or_else(|| self.err("invalid numeric literal"))?,
            )),
            Token::Bool(b) => Ok(Expr::Literal(Value::Bool(b))),
            Token::Ident(name) => Ok(Expr::Ident(name)),
            Token::LBracket => self.parse_array_literal(),
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_array_literal(&mut self) -> Result<Expr> {
        let mut items = Vec::new();
        if matches!(self.peek(), Token::RBracket) {
            self.advance();
            return Ok(Expr::Literal(Value::Array(items)));
        }
        loop {
            let item = match self.parse_atom()? {
                Expr::Literal(v) => v,
                _ => return Err(self.err("array literals may only contain literal values")),
            };
            items.push(item);
            match self.advance() {
                Token::Comma => continue,
                Token::RBracket => break,
                other => return Err(self.err(format!("expected ',' or ']', found {other:?}"))),
            }
        }
        Ok(Expr::Literal(Value::Array(items)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_equality() {
        let expr = parse(r#"status == "VERIFIED""#).unwrap();
        assert!(matches!(expr, Expr::Compare(CompareOp::Eq, _, _)));
    }

    #[test]
    fn parses_nested_parens() {
        parse(r#"(status == "A") && (confidence > 0.5)"#).unwrap();
    }

    #[test]
    fn rejects_unterminated_string() {
        assert!(parse(r#"status == "A"#).is_err());
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert!(parse("status == \"A\" extra").is_err());
    }

    #[test]
    fn parses_array_literal() {
        parse(r#"status in ["A", "B"]"#).unwrap();
    }
}
