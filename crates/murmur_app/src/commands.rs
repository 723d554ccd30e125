//! Parsing of lines typed into `murmur peer`.

use std::path::PathBuf;

use anyhow::{Result, bail};

/// One line of user input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `/list`: print known peers.
    List,
    /// `/switch @name`: connect to a peer.
    Switch(String),
    /// `/file <path>`: send a file to the current peer.
    File(PathBuf),
    /// Anything else is chat text.
    Text(String),
}

impl Command {
    /// Parse a line. Blank lines yield `None`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        let (head, rest) = match trimmed.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (trimmed, ""),
        };

        let command = match head {
            "/list" => Self::List,
            "/switch" => {
                let name = rest.trim_start_matches('@');
                if name.is_empty() {
                    bail!("usage: /switch @name");
                }
                Self::Switch(name.to_string())
            }
            "/file" => {
                if rest.is_empty() {
                    bail!("usage: /file <path>");
                }
                Self::File(PathBuf::from(rest))
            }
            _ => Self::Text(line.trim_end_matches(['\r', '\n']).to_string()),
        };
        Ok(Some(command))
    }
}
