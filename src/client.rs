//! Client library for connecting to a minikv server
//!
//! Provides a simple interface for interacting with the key-value store

use crate::error::{MiniKvError, Result};
use crate::protocol::{unescape_text, Command};
use crate::value::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;

/// A server reply as seen by the client
///
/// Values come back as display text; the protocol does not tag their type.
/// `Lines` holds SHOW rows exactly as the server escaped them.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    Ok,
    Value(String),
    Nil,
    Integer(i64),
    Lines(Vec<String>),
    Error(String),
    Goodbye,
}

/// Client for connecting to a minikv server
pub struct Client {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: BufWriter<tokio::net::tcp::OwnedWriteHalf>,
}

impl Client {
    /// Connect to a minikv server
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (read_half, write_half) = stream.into_split();
        let reader = BufReader::new(read_half);
        let writer = BufWriter::new(write_half);

        Ok(Self { reader, writer })
    }

    /// Send a command and receive a reply
    pub async fn send_command(&mut self, command: &Command) -> Result<Reply> {
        let line = command.to_line()?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let first = self.read_line().await?;
        match parse_reply(&first)? {
            Header::Complete(reply) => Ok(reply),
            Header::Entries(count) => {
                let mut lines = Vec::with_capacity(count);
                for _ in 0..count {
                    lines.push(self.read_line().await?);
                }
                Ok(Reply::Lines(lines))
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(MiniKvError::Client("connection closed by server".to_string()));
        }
        Ok(line.trim_end_matches(|c: char| c == '\r' || c == '\n').to_string())
    }

    /// Set a key-value pair
    pub async fn set(&mut self, key: &str, value: impl Into<Value>) -> Result<()> {
        let command = Command::Set {
            key: key.to_string(),
            value: value.into(),
            ttl: None,
        };
        self.expect_ok(&command, "SET").await
    }

    /// Set a key-value pair that expires after `ttl_secs` seconds
    pub async fn set_with_ttl(&mut self, key: &str, value: impl Into<Value>, ttl_secs: i64) -> Result<()> {
        let command = Command::Set {
            key: key.to_string(),
            value: value.into(),
            ttl: Some(ttl_secs),
        };
        self.expect_ok(&command, "SET").await
    }

    /// Get a value by key, as displayed by the server
    pub async fn get(&mut self, key: &str) -> Result<Option<String>> {
        let command = Command::Get {
            key: key.to_string(),
        };

        match self.send_command(&command).await? {
            Reply::Value(value) => Ok(Some(value)),
            Reply::Nil => Ok(None),
            other => Err(unexpected(other, "GET")),
        }
    }

    /// Delete a key
    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        let command = Command::Delete {
            key: key.to_string(),
        };
        self.expect_flag(&command, "DEL").await
    }

    /// Check if a key exists
    pub async fn exists(&mut self, key: &str) -> Result<bool> {
        let command = Command::Exists {
            key: key.to_string(),
        };
        self.expect_flag(&command, "EXISTS").await
    }

    /// Set a TTL on an existing key
    pub async fn expire(&mut self, key: &str, ttl_secs: i64) -> Result<bool> {
        let command = Command::Expire {
            key: key.to_string(),
            ttl: ttl_secs,
        };
        self.expect_flag(&command, "EXPIRE").await
    }

    /// Number of live keys
    pub async fn size(&mut self) -> Result<usize> {
        let n = self.expect_integer(&Command::Size, "SIZE").await?;
        usize::try_from(n).map_err(|_| MiniKvError::Protocol(format!("invalid size {}", n)))
    }

    /// Formatted listing of all live entries
    pub async fn show(&mut self) -> Result<Vec<String>> {
        match self.send_command(&Command::Show).await? {
            Reply::Lines(lines) => Ok(lines),
            other => Err(unexpected(other, "SHOW")),
        }
    }

    /// Save the store to a file in the session directory
    pub async fn save(&mut self, file: &str) -> Result<()> {
        let command = Command::Save {
            file: file.to_string(),
        };
        self.expect_ok(&command, "SAVE").await
    }

    /// Replace the store with a file from the session directory
    pub async fn load(&mut self, file: &str) -> Result<usize> {
        let command = Command::Load {
            file: file.to_string(),
        };
        let n = self.expect_integer(&command, "LOAD").await?;
        usize::try_from(n).map_err(|_| MiniKvError::Protocol(format!("invalid count {}", n)))
    }

    /// Close the connection
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }

    async fn expect_ok(&mut self, command: &Command, name: &str) -> Result<()> {
        match self.send_command(command).await? {
            Reply::Ok => Ok(()),
            other => Err(unexpected(other, name)),
        }
    }

    async fn expect_integer(&mut self, command: &Command, name: &str) -> Result<i64> {
        match self.send_command(command).await? {
            Reply::Integer(n) => Ok(n),
            other => Err(unexpected(other, name)),
        }
    }

    async fn expect_flag(&mut self, command: &Command, name: &str) -> Result<bool> {
        match self.expect_integer(command, name).await? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(MiniKvError::Protocol(format!(
                "Unexpected integer {} for {}",
                n, name
            ))),
        }
    }
}

fn unexpected(reply: Reply, name: &str) -> MiniKvError {
    match reply {
        Reply::Error(e) => MiniKvError::Server(e),
        _ => MiniKvError::Protocol(format!("Unexpected response for {}", name)),
    }
}

/// First line of a server reply
#[derive(Debug, PartialEq)]
enum Header {
    Complete(Reply),
    /// `(entries) <n>`: n more lines follow
    Entries(usize),
}

/// Parse the first line of a server reply
fn parse_reply(line: &str) -> Result<Header> {
    let unknown = || MiniKvError::Protocol(format!("Unknown response format: {}", line));

    let reply = if line == "OK" {
        Reply::Ok
    } else if line == "(nil)" {
        Reply::Nil
    } else if line == "(empty) store" {
        Reply::Lines(Vec::new())
    } else if line == "Goodbye!" {
        Reply::Goodbye
    } else if let Some(value) = line.strip_prefix("VALUE ") {
        Reply::Value(unescape_text(value))
    } else if let Some(error) = line.strip_prefix("(error) ") {
        Reply::Error(unescape_text(error))
    } else if let Some(n) = line.strip_prefix("(integer) ") {
        Reply::Integer(n.parse().map_err(|_| unknown())?)
    } else if let Some(n) = line.strip_prefix("(entries) ") {
        return Ok(Header::Entries(n.parse().map_err(|_| unknown())?));
    } else {
        return Err(unknown());
    };

    Ok(Header::Complete(reply))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_reply() {
        let complete = |reply| Header::Complete(reply);

        assert_eq!(parse_reply("OK").unwrap(), complete(Reply::Ok));
        assert_eq!(parse_reply("(nil)").unwrap(), complete(Reply::Nil));
        assert_eq!(parse_reply("(integer) 5").unwrap(), complete(Reply::Integer(5)));
        assert_eq!(
            parse_reply("VALUE hello world").unwrap(),
            complete(Reply::Value("hello world".to_string()))
        );
        assert_eq!(parse_reply("VALUE ").unwrap(), complete(Reply::Value(String::new())));
        assert_eq!(
            parse_reply("(error) test error").unwrap(),
            complete(Reply::Error("test error".to_string()))
        );
        assert_eq!(parse_reply("(empty) store").unwrap(), complete(Reply::Lines(vec![])));
        assert_eq!(parse_reply("(entries) 3").unwrap(), Header::Entries(3));
        assert_eq!(parse_reply("Goodbye!").unwrap(), complete(Reply::Goodbye));
        assert!(parse_reply("(integer) lots").is_err());
        assert!(parse_reply("hello world").is_err());
    }

    #[test]
    fn test_tagged_values_are_never_status_lines() {
        for text in ["OK", "(nil)", "(integer) 5", "(error) x", "Goodbye!", "(entries) 2", "(empty) store"] {
            let line = format!("VALUE {}", text);
            assert_eq!(
                parse_reply(&line).unwrap(),
                complete_value(text),
                "misread {:?}",
                text
            );
        }
        assert_eq!(
            parse_reply("VALUE line1\\nline2").unwrap(),
            complete_value("line1\nline2")
        );
        assert_eq!(
            parse_reply("(error) bad\\nthing").unwrap(),
            Header::Complete(Reply::Error("bad\nthing".to_string()))
        );
    }

    fn complete_value(text: &str) -> Header {
        Header::Complete(Reply::Value(text.to_string()))
    }
}
