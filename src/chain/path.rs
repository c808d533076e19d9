//! Path expressions over JSON values.
//!
//! Grammar:
//!
//! ```text
//! $                     the whole value
//! $.a.b                 object fields
//! $.items[0].name       array index
//! $['weird key']        quoted field (single or double quotes, `\` escapes)
//! a.b.0                 bare dotted form; a numeric segment indexes arrays
//! ```
//!
//! Parsing and extraction are pure functions, independent of chain control
//! flow.

use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// One path step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Dotted name. Indexes arrays when it is a number.
    Field(String),
    /// Bracketed quoted key; objects only.
    Key(String),
    /// Bracketed index; arrays only.
    Index(usize),
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Field(name) => write!(f, ".{}", name),
            Segment::Key(key) => write!(f, "['{}']", key.replace('\'', "\\'")),
            Segment::Index(i) => write!(f, "[{}]", i),
        }
    }
}

/// Parsed path expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathExpr {
    raw: String,
    segments: Vec<Segment>,
}

impl PathExpr {
    pub fn parse(expr: &str) -> Result<Self> {
        let raw = expr.trim();
        if raw.is_empty() {
            return Err(syntax(expr, "empty expression"));
        }
        let segments = Parser::new(raw).parse()?;
        Ok(Self {
            raw: raw.to_string(),
            segments,
        })
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Whether the expression selects the whole value.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Borrow the selected value. A missing field, an out-of-range index or
    /// a step into a scalar fails with `ChainMapping`.
    pub fn extract<'v>(&self, value: &'v Value) -> Result<&'v Value> {
        let mut current = value;
        for (depth, segment) in self.segments.iter().enumerate() {
            current = step(current, segment).ok_or_else(|| {
                let at: String = self.segments[..=depth].iter().map(ToString::to_string).collect();
                Error::chain_mapping(format!(
                    "path '{}' does not resolve: nothing at '${}'",
                    self.raw, at
                ))
            })?;
        }
        Ok(current)
    }
}

impl FromStr for PathExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        PathExpr::parse(s)
    }
}

impl fmt::Display for PathExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Parse `expr` and clone the value it selects.
pub fn extract(value: &Value, expr: &str) -> Result<Value> {
    PathExpr::parse(expr)?.extract(value).cloned()
}

/// Write `value` at a dotted target (`a.b.c`) inside `input`, creating
/// intermediate objects. Fails when an intermediate exists and is not an
/// object.
pub fn insert_dotted(input: &mut Map<String, Value>, target: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = target.split('.').collect();
    if parts.iter().any(|p| p.is_empty()) {
        return Err(Error::chain_mapping(format!(
            "invalid mapping target '{}'",
            target
        )));
    }
    let Some((last, parents)) = parts.split_last() else {
        return Err(Error::chain_mapping("empty mapping target"));
    };

    let mut current = input;
    for (depth, part) in parents.iter().enumerate() {
        let slot = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match slot {
            Value::Object(map) => map,
            _ => {
                return Err(Error::chain_mapping(format!(
                    "mapping target '{}': '{}' is not an object",
                    target,
                    parents[..=depth].join(".")
                )))
            }
        };
    }
    current.insert(last.to_string(), value);
    Ok(())
}

fn step<'v>(value: &'v Value, segment: &Segment) -> Option<&'v Value> {
    match (segment, value) {
        (Segment::Field(name), Value::Object(map)) | (Segment::Key(name), Value::Object(map)) => {
            map.get(name)
        }
        (Segment::Field(name), Value::Array(items)) => {
            name.parse::<usize>().ok().and_then(|i| items.get(i))
        }
        (Segment::Index(i), Value::Array(items)) => items.get(*i),
        _ => None,
    }
}

fn syntax(expr: &str, reason: impl fmt::Display) -> Error {
    Error::chain_mapping(format!("invalid path '{}': {}", expr, reason))
}

// =============================================================================
// Parser
// =============================================================================

struct Parser<'a> {
    src: &'a str,
    chars: Vec<char>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            chars: src.chars().collect(),
            pos: 0,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn parse(mut self) -> Result<Vec<Segment>> {
        let mut segments = Vec::new();
        if self.peek() == Some('$') {
            self.bump();
        } else {
            segments.push(Segment::Field(self.field()?));
        }

        while let Some(c) = self.bump() {
            match c {
                '.' => segments.push(Segment::Field(self.field()?)),
                '[' => segments.push(self.bracket()?),
                other => {
                    return Err(syntax(
                        self.src,
                        format!("unexpected '{}' at offset {}", other, self.pos - 1),
                    ))
                }
            }
        }
        Ok(segments)
    }

    fn field(&mut self) -> Result<String> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '.' || c == '[' {
                break;
            }
            if c == ']' || c == '\'' || c == '"' || c == '$' || c.is_whitespace() {
                return Err(syntax(
                    self.src,
                    format!("unexpected '{}' at offset {}", c, self.pos),
                ));
            }
            self.pos += 1;
        }
        if self.pos == start {
            return Err(syntax(self.src, format!("empty field at offset {}", start)));
        }
        Ok(self.chars[start..self.pos].iter().collect())
    }

    fn bracket(&mut self) -> Result<Segment> {
        let segment = match self.peek() {
            Some(quote @ ('\'' | '"')) => {
                self.bump();
                Segment::Key(self.quoted(quote)?)
            }
            Some(c) if c.is_ascii_digit() => {
                let start = self.pos;
                while self.peek().is_some_and(|c| c.is_ascii_digit()) {
                    self.pos += 1;
                }
                let digits: String = self.chars[start..self.pos].iter().collect();
                let index = digits
                    .parse::<usize>()
                    .map_err(|e| syntax(self.src, format!("bad index '{}': {}", digits, e)))?;
                Segment::Index(index)
            }
            _ => {
                return Err(syntax(
                    self.src,
                    format!("expected an index or a quoted key at offset {}", self.pos),
                ))
            }
        };
        match self.bump() {
            Some(']') => Ok(segment),
            _ => Err(syntax(self.src, "unterminated '['")),
        }
    }

    fn quoted(&mut self, quote: char) -> Result<String> {
        let mut key = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some(escaped) => key.push(escaped),
                    None => break,
                },
                Some(c) if c == quote => return Ok(key),
                Some(c) => key.push(c),
                None => break,
            }
        }
        Err(syntax(self.src, "unterminated quoted key"))
    }
}
