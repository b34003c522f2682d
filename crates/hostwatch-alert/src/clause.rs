//! Row filters for rules, e.g. `mount_point = '/' AND total_space > 0`.
//!
//! Grammar, case-insensitive keywords, AND binding tighter than OR:
//!
//! ```text
//! expr  := term ( OR term )*
//! term  := cmp ( AND cmp )*
//! cmp   := field op literal | '(' expr ')'
//! op    := = | == | != | <> | < | <= | > | >=
//! literal := number | 'text' | "text"
//! ```

use hostwatch_common::types::{FieldValue, MetricSample, SampleKind};

use crate::error::ValidationError;
use crate::threshold::CompareOp;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WhereClause {
    Compare {
        field: String,
        op: CompareOp,
        literal: Literal,
    },
    And(Box<WhereClause>, Box<WhereClause>),
    Or(Box<WhereClause>, Box<WhereClause>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Op(CompareOp),
    Number(f64),
    Text(String),
    And,
    Or,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&q| q == c)
                    .ok_or_else(|| "unterminated string literal".to_string())?;
                tokens.push(Token::Text(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '<' | '>' | '=' | '!' => {
                let len = chars[i..]
                    .iter()
                    .take_while(|c| matches!(**c, '<' | '>' | '=' | '!'))
                    .count();
                let op: String = chars[i..i + len].iter().collect();
                tokens.push(Token::Op(op.parse()?));
                i += len;
            }
            c if c.is_ascii_digit() || c == '-' || c == '.' => {
                let len = chars[i..]
                    .iter()
                    .enumerate()
                    .take_while(|(n, c)| {
                        c.is_ascii_digit() || **c == '.' || (*n == 0 && **c == '-')
                    })
                    .count();
                let text: String = chars[i..i + len].iter().collect();
                let value = text
                    .parse()
                    .map_err(|_| format!("'{text}' is not a number"))?;
                tokens.push(Token::Number(value));
                i += len;
            }
            c if c.is_alphabetic() || c == '_' => {
                let len = chars[i..]
                    .iter()
                    .take_while(|c| c.is_alphanumeric() || **c == '_')
                    .count();
                let word: String = chars[i..i + len].iter().collect();
                tokens.push(match word.to_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Ident(word),
                });
                i += len;
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> Result<WhereClause, String> {
        let mut left = self.term()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = WhereClause::Or(Box::new(left), Box::new(self.term()?));
        }
        Ok(left)
    }

    fn term(&mut self) -> Result<WhereClause, String> {
        let mut left = self.cmp()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = WhereClause::And(Box::new(left), Box::new(self.cmp()?));
        }
        Ok(left)
    }

    fn cmp(&mut self) -> Result<WhereClause, String> {
        match self.advance() {
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err("missing ')'".into()),
                }
            }
            Some(Token::Ident(field)) => {
                let op = match self.advance() {
                    Some(Token::Op(op)) => op,
                    _ => return Err(format!("expected an operator after '{field}'")),
                };
                let literal = match self.advance() {
                    Some(Token::Number(n)) => Literal::Number(n),
                    Some(Token::Text(s)) => Literal::Text(s),
                    _ => return Err(format!("expected a value after '{field} {op}'")),
                };
                Ok(WhereClause::Compare { field, op, literal })
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of clause".into()),
        }
    }
}

impl WhereClause {
    /// Parses `input` and type-checks it against the fields of `kind`.
    pub fn parse(input: &str, kind: SampleKind) -> Result<Self, ValidationError> {
        let invalid = |reason: String| ValidationError::WhereClause {
            clause: input.to_string(),
            reason,
        };
        let tokens = tokenize(input).map_err(invalid)?;
        let mut parser = Parser { tokens, pos: 0 };
        let clause = parser.expr().map_err(invalid)?;
        if let Some(extra) = parser.peek() {
            return Err(invalid(format!("trailing input at {extra:?}")));
        }
        clause.check(kind).map_err(invalid)?;
        Ok(clause)
    }

    fn check(&self, kind: SampleKind) -> Result<(), String> {
        match self {
            WhereClause::Compare { field, op, literal } => {
                let numeric = kind.numeric_fields().contains(&field.as_str());
                let text = kind.text_fields().contains(&field.as_str());
                match literal {
                    _ if !numeric && !text => {
                        Err(format!("table '{}' has no field '{field}'", kind.table()))
                    }
                    Literal::Number(_) if numeric => Ok(()),
                    Literal::Text(_) if text && op.direction().is_none() => Ok(()),
                    Literal::Text(_) if text => {
                        Err(format!("operator '{op}' is not supported on text field '{field}'"))
                    }
                    _ => Err(format!("type mismatch on field '{field}'")),
                }
            }
            WhereClause::And(a, b) | WhereClause::Or(a, b) => {
                a.check(kind)?;
                b.check(kind)
            }
        }
    }

    /// Whether `sample` satisfies the clause. `None` when a referenced field
    /// is absent from the sample or has an unexpected type.
    pub fn matches(&self, sample: &MetricSample) -> Option<bool> {
        match self {
            WhereClause::Compare { field, op, literal } => match (sample.field(field)?, literal) {
                (FieldValue::Number(v), Literal::Number(n)) => Some(op.check(v, *n)),
                (FieldValue::Text(v), Literal::Text(s)) => op.check_text(v, s),
                _ => None,
            },
            WhereClause::And(a, b) => Some(a.matches(sample)? && b.matches(sample)?),
            WhereClause::Or(a, b) => Some(a.matches(sample)? || b.matches(sample)?),
        }
    }
}
