//! Subscription filter expressions.
//!
//! ```text
//! filter  := "" | clause ("&&" clause)*
//! clause  := path ("==" | "!=") literal
//! path    := ident ("." ident)*
//! literal := JSON string | number | true | false | null
//! ```

use serde_json::Value;

use crate::error::FilterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Comparison {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq)]
struct Clause {
    path: Vec<String>,
    comparison: Comparison,
    literal: Value,
}

impl Clause {
    fn matches(&self, data: &Value) -> bool {
        let found = self
            .path
            .iter()
            .try_fold(data, |value, segment| value.get(segment.as_str()));
        match self.comparison {
            Comparison::Equal => found == Some(&self.literal),
            Comparison::NotEqual => found != Some(&self.literal),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    source: String,
    clauses: Vec<Clause>,
}

impl EventFilter {
    pub fn parse(expr: &str) -> Result<Self, FilterError> {
        let mut parser = Parser { input: expr, pos: 0 };
        let mut clauses = Vec::new();
        parser.skip_ws();
        if !parser.at_end() {
            loop {
                clauses.push(parser.clause()?);
                parser.skip_ws();
                if parser.at_end() {
                    break;
                }
                parser.expect("&&")?;
            }
        }
        Ok(Self {
            source: expr.to_string(),
            clauses,
        })
    }

    pub fn matches_all(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, data: &Value) -> bool {
        self.clauses.iter().all(|clause| clause.matches(data))
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.input[self.pos..]
    }

    fn at_end(&self) -> bool {
        self.rest().is_empty()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.input.len() - trimmed.len();
    }

    fn error(&self, message: impl Into<String>) -> FilterError {
        FilterError::Syntax {
            offset: self.pos,
            message: message.into(),
        }
    }

    fn expect(&mut self, token: &str) -> Result<(), FilterError> {
        self.skip_ws();
        if self.rest().starts_with(token) {
            self.pos += token.len();
            Ok(())
        } else {
            Err(self.error(format!("expected `{token}`")))
        }
    }

    fn clause(&mut self) -> Result<Clause, FilterError> {
        let path = self.path()?;
        self.skip_ws();
        let comparison = if self.rest().starts_with("==") {
            Comparison::Equal
        } else if self.rest().starts_with("!=") {
            Comparison::NotEqual
        } else {
            return Err(self.error("expected `==` or `!=`"));
        };
        self.pos += 2;
        self.skip_ws();
        let literal = self.literal()?;
        Ok(Clause {
            path,
            comparison,
            literal,
        })
    }

    fn path(&mut self) -> Result<Vec<String>, FilterError> {
        self.skip_ws();
        let len = self
            .rest()
            .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '.' || c == '-'))
            .unwrap_or(self.rest().len());
        let raw = &self.rest()[..len];
        if raw.is_empty() {
            return Err(self.error("expected a field path"));
        }
        let segments: Vec<String> = raw.split('.').map(str::to_string).collect();
        if segments.iter().any(String::is_empty) {
            return Err(self.error(format!("invalid field path `{raw}`")));
        }
        self.pos += len;
        Ok(segments)
    }

    fn literal(&mut self) -> Result<Value, FilterError> {
        let mut stream = serde_json::Deserializer::from_str(self.rest()).into_iter::<Value>();
        match stream.next() {
            Some(Ok(value)) if !value.is_array() && !value.is_object() => {
                self.pos += stream.byte_offset();
                Ok(value)
            }
            Some(Ok(_)) => Err(self.error("literal must be a string, number, bool or null")),
            _ => Err(self.error("expected a JSON literal")),
        }
    }
}
