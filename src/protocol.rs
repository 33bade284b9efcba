//! Protocol parser and command definitions for minikv
//!
//! One command per line. Lines are split into tokens with nom: bare tokens
//! are runs of non-whitespace characters, `"quoted tokens"` may contain
//! whitespace. Command names are case-insensitive.
//!
//! Replies are one line each, except `SHOW` whose header carries the line
//! count. Text placed in a reply is escaped with [`escape_text`] so a stored
//! newline can never split it.

use crate::error::{MiniKvError, Result};
use crate::value::Value;
use std::borrow::Cow;
use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{eof, map},
    multi::many0,
    sequence::{delimited, pair, preceded, terminated},
    IResult,
};

/// Commands supported by the minikv protocol
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Set {
        key: String,
        value: Value,
        ttl: Option<i64>,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
    Exists {
        key: String,
    },
    Expire {
        key: String,
        ttl: i64,
    },
    Size,
    Show,
    Save {
        file: String,
    },
    Load {
        file: String,
    },
    Quit,
}

/// Response types from the server
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Ok,
    Value(Value),
    Nil,
    Integer(i64),
    Entries(Vec<(String, Value)>),
    Error(String),
    Goodbye,
}

impl Response {
    /// Serialize response to bytes for network transmission
    ///
    /// `Entries` spans several lines: a `(entries) <n>` header followed by one
    /// line per entry.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Response::Ok => b"OK\r\n".to_vec(),
            Response::Value(v) => format!("VALUE {}\r\n", escape_text(&v.to_string())).into_bytes(),
            Response::Nil => b"(nil)\r\n".to_vec(),
            Response::Integer(n) => format!("(integer) {}\r\n", n).into_bytes(),
            Response::Entries(entries) if entries.is_empty() => b"(empty) store\r\n".to_vec(),
            Response::Entries(entries) => {
                let rows: Vec<(Cow<str>, String)> = entries
                    .iter()
                    .map(|(k, v)| (escape_text(k), escape_text(&v.to_string()).into_owned()))
                    .collect();
                let width = rows.iter().map(|(k, _)| k.chars().count()).max().unwrap_or(0) + 2;
                let mut out = format!("(entries) {}\r\n", rows.len());
                for (key, value) in &rows {
                    out.push_str(&format!("{:<width$}{}\r\n", key, value, width = width));
                }
                out.into_bytes()
            }
            Response::Error(e) => format!("(error) {}\r\n", escape_text(e)).into_bytes(),
            Response::Goodbye => b"Goodbye!\r\n".to_vec(),
        }
    }

    /// Build a response from a boolean engine result
    pub fn flag(set: bool) -> Self {
        Response::Integer(i64::from(set))
    }
}

/// Escape backslashes and line breaks so `text` fits on one reply line
pub fn escape_text(text: &str) -> Cow<'_, str> {
    if !text.contains(|c: char| c == '\\' || c == '\n' || c == '\r') {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len() + 8);
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    Cow::Owned(out)
}

/// Reverse [`escape_text`]. Unknown escapes are kept as written.
pub fn unescape_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token<'a> {
    Bare(&'a str),
    Quoted(&'a str),
}

impl<'a> Token<'a> {
    fn text(&self) -> &'a str {
        match self {
            Token::Bare(s) | Token::Quoted(s) => *s,
        }
    }
}

/// Parse one command line
pub fn parse_command(line: &str) -> Result<Command> {
    let line = line.trim_end_matches(|c: char| c == '\r' || c == '\n');
    if line.matches('"').count() % 2 == 1 {
        return Err(MiniKvError::Protocol("unterminated quote".to_string()));
    }

    let (_, tokens) = tokenize(line)?;
    let (name, args) = match tokens.split_first() {
        Some((Token::Bare(name), args)) => (name.to_ascii_uppercase(), args),
        Some((Token::Quoted(_), _)) => {
            return Err(MiniKvError::Protocol(
                "command name must not be quoted".to_string(),
            ))
        }
        None => return Err(MiniKvError::Protocol("empty command".to_string())),
    };

    let command = match (name.as_str(), args) {
        ("SET", [key, value]) => Command::Set {
            key: key.text().to_string(),
            value: token_value(value),
            ttl: None,
        },
        ("SET", [key, value, ttl]) => Command::Set {
            key: key.text().to_string(),
            value: token_value(value),
            ttl: Some(parse_ttl(ttl)?),
        },
        ("GET", [key]) => Command::Get {
            key: key.text().to_string(),
        },
        ("DEL", [key]) => Command::Delete {
            key: key.text().to_string(),
        },
        ("EXISTS", [key]) => Command::Exists {
            key: key.text().to_string(),
        },
        ("EXPIRE", [key, ttl]) => Command::Expire {
            key: key.text().to_string(),
            ttl: parse_ttl(ttl)?,
        },
        ("SIZE", []) => Command::Size,
        ("SHOW" | "DISPLAY", []) => Command::Show,
        ("SAVE", [file]) => Command::Save {
            file: file.text().to_string(),
        },
        ("LOAD", [file]) => Command::Load {
            file: file.text().to_string(),
        },
        ("QUIT" | "EXIT", []) => Command::Quit,
        ("SET" | "GET" | "DEL" | "EXISTS" | "EXPIRE" | "SIZE" | "SHOW" | "DISPLAY" | "SAVE"
        | "LOAD" | "QUIT" | "EXIT", _) => {
            return Err(MiniKvError::Protocol(format!(
                "wrong number of arguments for '{}'",
                name
            )))
        }
        (other, _) => {
            return Err(MiniKvError::Protocol(format!("unknown command '{}'", other)))
        }
    };

    Ok(command)
}

/// Coerce an unquoted literal: integer, then finite float, then boolean,
/// falling back to text
pub fn coerce_literal(text: &str) -> Value {
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(x) = text.parse::<f64>() {
        if x.is_finite() {
            return Value::Float(x);
        }
    }
    match text {
        "true" | "TRUE" => Value::Bool(true),
        "false" | "FALSE" => Value::Bool(false),
        _ => Value::Text(text.to_string()),
    }
}

fn token_value(token: &Token) -> Value {
    match token {
        Token::Quoted(s) => Value::Text(s.to_string()),
        Token::Bare(s) => coerce_literal(s),
    }
}

fn parse_ttl(token: &Token) -> Result<i64> {
    token
        .text()
        .parse()
        .map_err(|_| MiniKvError::InvalidArgument(format!("invalid TTL value '{}'", token.text())))
}

fn tokenize(input: &str) -> IResult<&str, Vec<Token>> {
    terminated(
        many0(preceded(multispace0, alt((quoted_token, bare_token)))),
        pair(multispace0, eof),
    )(input)
}

fn quoted_token(input: &str) -> IResult<&str, Token> {
    map(
        delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
        Token::Quoted,
    )(input)
}

fn bare_token(input: &str) -> IResult<&str, Token> {
    map(
        take_while1(|c: char| !c.is_whitespace() && c != '"'),
        Token::Bare,
    )(input)
}

impl Command {
    /// Render the command as a protocol line, quoting where needed
    ///
    /// Text values are always quoted so the server stores them as text.
    pub fn to_line(&self) -> Result<String> {
        let line = match self {
            Command::Set { key, value, ttl } => {
                let mut line = format!("SET {} {}", encode_token(key)?, encode_value(value)?);
                if let Some(ttl) = ttl {
                    line.push_str(&format!(" {}", ttl));
                }
                line
            }
            Command::Get { key } => format!("GET {}", encode_token(key)?),
            Command::Delete { key } => format!("DEL {}", encode_token(key)?),
            Command::Exists { key } => format!("EXISTS {}", encode_token(key)?),
            Command::Expire { key, ttl } => format!("EXPIRE {} {}", encode_token(key)?, ttl),
            Command::Size => "SIZE".to_string(),
            Command::Show => "SHOW".to_string(),
            Command::Save { file } => format!("SAVE {}", encode_token(file)?),
            Command::Load { file } => format!("LOAD {}", encode_token(file)?),
            Command::Quit => "QUIT".to_string(),
        };
        Ok(line + "\r\n")
    }
}

fn encode_token(text: &str) -> Result<String> {
    if text.contains(|c: char| c == '"' || c == '\r' || c == '\n') {
        return Err(MiniKvError::InvalidArgument(format!(
            "'{}' cannot be sent over the text protocol",
            text
        )));
    }
    if text.is_empty() || text.contains(char::is_whitespace) {
        Ok(format!("\"{}\"", text))
    } else {
        Ok(text.to_string())
    }
}

fn encode_value(value: &Value) -> Result<String> {
    match value {
        Value::Text(s) => encode_token(s).map(|_| format!("\"{}\"", s)),
        Value::Float(x) if !x.is_finite() => Err(MiniKvError::InvalidArgument(format!(
            "{} cannot be sent over the text protocol",
            x
        ))),
        other => Ok(other.to_string()),
    }
}
