//! Literal term format used by every file the platform reads at boot.
//!
//! Boot sequence descriptions, compiled instruction files, and the
//! runtime configuration artifact are all written in this form. The
//! format carries literals only:
//!
//! - integers, floats, booleans
//! - bare symbols (`lowercase_start`, alphanumeric + underscore)
//! - quoted text with `\\`, `\"`, `\n`, `\t`, `\r` escapes
//! - lists `[a, b]` and tuples `(a, b)`
//!
//! `#` starts a comment running to end of line. The writer is
//! canonical: parsing what [`fmt::Display`] produced yields an equal
//! term, which is what the configuration merger relies on for
//! round-trip validation.

use std::fmt;
use thiserror::Error;

/// A literal value in the platform text format.
#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Int(i64),
    Float(f64),
    Bool(bool),
    /// Bare symbolic name. Must be lowercase-start, alphanumeric plus
    /// underscore; anything else fails the round-trip check.
    Sym(String),
    /// Quoted text.
    Text(String),
    List(Vec<Term>),
    Tuple(Vec<Term>),
}

/// Parse failure, with the byte offset of the offending input.
#[derive(Debug, Error, PartialEq)]
pub enum TermError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected character '{ch}' at byte {at}")]
    Unexpected { ch: char, at: usize },
    #[error("invalid number '{text}' at byte {at}")]
    BadNumber { text: String, at: usize },
    #[error("invalid escape '\\{ch}' at byte {at}")]
    BadEscape { ch: char, at: usize },
    #[error("unterminated text literal starting at byte {at}")]
    UnterminatedText { at: usize },
    #[error("trailing input at byte {at}")]
    Trailing { at: usize },
}

impl Term {
    pub fn sym(name: impl Into<String>) -> Term {
        Term::Sym(name.into())
    }

    pub fn text(value: impl Into<String>) -> Term {
        Term::Text(value.into())
    }

    /// True when `name` is a valid bare symbol.
    pub fn is_valid_symbol(name: &str) -> bool {
        let mut chars = name.chars();
        match chars.next() {
            Some(first) if first.is_ascii_lowercase() => {}
            _ => return false,
        }
        chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Int(value) => write!(f, "{value}"),
            Term::Float(value) => {
                let text = format!("{value}");
                if text.contains('.') || text.contains('e') || text.contains('E') {
                    write!(f, "{text}")
                } else {
                    write!(f, "{text}.0")
                }
            }
            Term::Bool(value) => write!(f, "{value}"),
            Term::Sym(name) => write!(f, "{name}"),
            Term::Text(value) => {
                f.write_str("\"")?;
                for c in value.chars() {
                    match c {
                        '\\' => f.write_str("\\\\")?,
                        '"' => f.write_str("\\\"")?,
                        '\n' => f.write_str("\\n")?,
                        '\t' => f.write_str("\\t")?,
                        '\r' => f.write_str("\\r")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
            Term::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Term::Tuple(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Parse a single term. Trailing whitespace and comments are allowed;
/// any other trailing input is rejected.
pub fn parse(input: &str) -> Result<Term, TermError> {
    let mut parser = Parser { input, pos: 0 };
    parser.skip_trivia();
    let term = parser.parse_term()?;
    parser.skip_trivia();
    if parser.pos < parser.input.len() {
        return Err(TermError::Trailing { at: parser.pos });
    }
    Ok(term)
}

struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_trivia(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.bump();
            } else if c == '#' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn parse_term(&mut self) -> Result<Term, TermError> {
        match self.peek() {
            None => Err(TermError::UnexpectedEof),
            Some('[') => self.parse_sequence('[', ']').map(Term::List),
            Some('(') => self.parse_sequence('(', ')').map(Term::Tuple),
            Some('"') => self.parse_text(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_number(),
            Some(c) if c.is_ascii_lowercase() => Ok(self.parse_symbol()),
            Some(c) => Err(TermError::Unexpected { ch: c, at: self.pos }),
        }
    }

    fn parse_sequence(&mut self, open: char, close: char) -> Result<Vec<Term>, TermError> {
        debug_assert_eq!(self.peek(), Some(open));
        self.bump();
        let mut items = Vec::new();
        self.skip_trivia();
        if self.peek() == Some(close) {
            self.bump();
            return Ok(items);
        }
        loop {
            self.skip_trivia();
            items.push(self.parse_term()?);
            self.skip_trivia();
            match self.peek() {
                Some(',') => {
                    self.bump();
                }
                Some(c) if c == close => {
                    self.bump();
                    return Ok(items);
                }
                Some(c) => return Err(TermError::Unexpected { ch: c, at: self.pos }),
                None => return Err(TermError::UnexpectedEof),
            }
        }
    }

    fn parse_text(&mut self) -> Result<Term, TermError> {
        let start = self.pos;
        self.bump();
        let mut value = String::new();
        loop {
            match self.bump() {
                None => return Err(TermError::UnterminatedText { at: start }),
                Some('"') => return Ok(Term::Text(value)),
                Some('\\') => {
                    let at = self.pos;
                    match self.bump() {
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('r') => value.push('\r'),
                        Some(c) => return Err(TermError::BadEscape { ch: c, at }),
                        None => return Err(TermError::UnterminatedText { at: start }),
                    }
                }
                Some(c) => value.push(c),
            }
        }
    }

    fn parse_number(&mut self) -> Result<Term, TermError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        let mut is_float = false;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else if c == '.' || c == 'e' || c == 'E' {
                is_float = true;
                self.bump();
            } else if is_float && (c == '-' || c == '+') {
                // exponent sign, only legal right after e/E; full
                // validation is delegated to the float parser below
                self.bump();
            } else {
                break;
            }
        }
        let text = &self.input[start..self.pos];
        if is_float {
            text.parse::<f64>()
                .map(Term::Float)
                .map_err(|_| TermError::BadNumber {
                    text: text.to_string(),
                    at: start,
                })
        } else {
            text.parse::<i64>()
                .map(Term::Int)
                .map_err(|_| TermError::BadNumber {
                    text: text.to_string(),
                    at: start,
                })
        }
    }

    fn parse_symbol(&mut self) -> Term {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        match &self.input[start..self.pos] {
            "true" => Term::Bool(true),
            "false" => Term::Bool(false),
            name => Term::Sym(name.to_string()),
        }
    }
}
