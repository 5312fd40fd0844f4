//! Inline command parser for the Redis protocol.
//!
//! Supports telnet-style space-separated commands like "PING" or "SET key value",
//! which is how most hand-driven probes arrive.

use super::RedisDatum;
use crate::error::PipelineError;

/// Parser for inline (telnet-style) Redis commands.
///
/// Converts space-separated text commands into a RESP array of bulk strings.
pub struct InlineParser;

impl InlineParser {
    /// Length of the first line including its `\n` terminator, or None if the
    /// line is not complete yet. A preceding `\r` is part of the line.
    pub fn line_len(buffer: &[u8]) -> Option<usize> {
        buffer.iter().position(|&b| b == b'\n').map(|pos| pos + 1)
    }

    /// Parse one complete inline line. Returns None for a blank line.
    pub fn parse(line: &[u8]) -> Result<Option<RedisDatum>, PipelineError> {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        let line = line.strip_suffix(b"\r").unwrap_or(line);

        let line = std::str::from_utf8(line)
            .map_err(|_| PipelineError::violation("invalid UTF-8 in inline command"))?;

        let parts = Self::parse_command_line(line)?;
        if parts.is_empty() {
            return Ok(None);
        }

        Ok(Some(RedisDatum::Array(
            parts.into_iter().map(RedisDatum::bulk).collect(),
        )))
    }

    /// Split a command line on whitespace, honouring double quotes.
    fn parse_command_line(line: &str) -> Result<Vec<String>, PipelineError> {
        let mut parts = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut quoted = false;
        let mut chars = line.chars();

        while let Some(ch) = chars.next() {
            match ch {
                '"' => {
                    in_quotes = !in_quotes;
                    quoted = true;
                }
                ' ' | '\t' if !in_quotes => {
                    if !current.is_empty() || quoted {
                        parts.push(std::mem::take(&mut current));
                    }
                    quoted = false;
                }
                '\\' if in_quotes => match chars.next() {
                    Some('n') => current.push('\n'),
                    Some('r') => current.push('\r'),
                    Some('t') => current.push('\t'),
                    Some('"') => current.push('"'),
                    Some('\\') => current.push('\\'),
                    Some(other) => {
                        current.push('\\');
                        current.push(other);
                    }
                    None => current.push('\\'),
                },
                _ => current.push(ch),
            }
        }

        if in_quotes {
            return Err(PipelineError::violation("unbalanced quotes in inline command"));
        }
        if !current.is_empty() || quoted {
            parts.push(current);
        }

        Ok(parts)
    }
}
