//! IRC message parsing and formatting.
//!
//! Supports IRCv3 message tags: `@key=value;key2 :prefix COMMAND params :trailing`
//!
//! Parsing is total: malformed lines never fail, they degrade to a
//! [`Message`] with an empty `command` and whatever structure was present.
//! Permissive parsing matters for a test harness — a misbehaving server is
//! exactly what we are here to observe, not something to crash on.

use std::collections::HashMap;
use std::fmt;

/// Value of a single IRCv3 message tag.
///
/// `@key` with no `=` is a boolean presence flag; `@key=value` carries a
/// string, unescaped once at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagValue {
    Flag,
    Value(String),
}

impl TagValue {
    /// The string value, or `None` for a bare flag.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            TagValue::Flag => None,
            TagValue::Value(v) => Some(v),
        }
    }
}

/// A parsed IRC message.
#[derive(Debug, Clone)]
pub struct Message {
    /// The original wire line, terminator stripped, kept verbatim for
    /// diagnostics.
    pub raw: String,
    /// IRCv3 message tags.
    pub tags: HashMap<String, TagValue>,
    /// Sender prefix (`server` or `nick!user@host`), without the leading `:`.
    pub prefix: Option<String>,
    /// Upper-cased command token; empty string when the line had none.
    pub command: String,
    /// Parameters in order. A trailing parameter (introduced by ` :`) may
    /// contain spaces and is never split further.
    pub params: Vec<String>,
}

impl Message {
    /// Parse a raw IRC line. Never fails.
    pub fn parse(line: &str) -> Self {
        let line = line.trim_end_matches(['\r', '\n']);
        let raw = line.to_string();

        let mut rest = line;

        // Tags: @key=value;key2=value2
        let tags = if let Some(tag_block) = rest.strip_prefix('@') {
            match tag_block.split_once(' ') {
                Some((block, remainder)) => {
                    rest = remainder;
                    parse_tags(block)
                }
                None => {
                    // Tag-only line: consume everything, no command follows.
                    rest = "";
                    parse_tags(tag_block)
                }
            }
        } else {
            HashMap::new()
        };

        // Prefix: :server or :nick!user@host
        let prefix = if let Some(pfx_block) = rest.strip_prefix(':') {
            match pfx_block.split_once(' ') {
                Some((pfx, remainder)) => {
                    rest = remainder;
                    Some(pfx.to_string())
                }
                None => {
                    rest = "";
                    Some(pfx_block.to_string())
                }
            }
        } else {
            None
        };

        // Command and params. The ` :` search must happen only now, after
        // tags and prefix are consumed.
        let mut params = Vec::new();
        let command;
        if let Some((front, trailing)) = rest.split_once(" :") {
            let mut parts = front.split_whitespace();
            command = parts.next().unwrap_or("").to_ascii_uppercase();
            params.extend(parts.map(str::to_string));
            params.push(trailing.to_string());
        } else {
            let mut parts = rest.split_whitespace();
            command = parts.next().unwrap_or("").to_ascii_uppercase();
            params.extend(parts.map(str::to_string));
        }

        Message {
            raw,
            tags,
            prefix,
            command,
            params,
        }
    }

    /// Nick portion of the prefix: everything before the first `!`, or the
    /// whole prefix if it has none.
    pub fn nick(&self) -> Option<&str> {
        let prefix = self.prefix.as_deref()?;
        Some(prefix.split('!').next().unwrap_or(prefix))
    }

    /// String value of a tag, `None` if absent or a bare flag.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).and_then(TagValue::as_str)
    }

    /// Build an outbound message with no tags or prefix.
    pub fn new(command: &str, params: Vec<&str>) -> Self {
        Self::with_tags(HashMap::new(), command, params)
    }

    /// Build an outbound message with tags.
    pub fn with_tags(tags: HashMap<String, TagValue>, command: &str, params: Vec<&str>) -> Self {
        let msg = Message {
            raw: String::new(),
            tags,
            prefix: None,
            command: command.to_string(),
            params: params.into_iter().map(str::to_string).collect(),
        };
        let raw = msg.to_string();
        Message { raw, ..msg }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            write!(f, "@")?;
            let mut first = true;
            for (key, value) in &self.tags {
                if !first {
                    write!(f, ";")?;
                }
                first = false;
                match value {
                    TagValue::Flag => write!(f, "{key}")?,
                    TagValue::Value(v) => write!(f, "{key}={}", escape_tag_value(v))?,
                }
            }
            write!(f, " ")?;
        }

        if let Some(ref prefix) = self.prefix {
            write!(f, ":{prefix} ")?;
        }
        write!(f, "{}", self.command)?;
        for (i, param) in self.params.iter().enumerate() {
            if i == self.params.len() - 1
                && (param.contains(' ') || param.starts_with(':') || param.is_empty())
            {
                write!(f, " :{param}")?;
            } else {
                write!(f, " {param}")?;
            }
        }
        Ok(())
    }
}

/// Parse a tag block: `key=value;key2`
fn parse_tags(block: &str) -> HashMap<String, TagValue> {
    let mut tags = HashMap::new();
    for entry in block.split(';') {
        if entry.is_empty() {
            continue;
        }
        if let Some((key, value)) = entry.split_once('=') {
            tags.insert(key.to_string(), TagValue::Value(unescape_tag_value(value)));
        } else {
            tags.insert(entry.to_string(), TagValue::Flag);
        }
    }
    tags
}

/// Unescape a tag value: `\:` → `;`, `\s` → space, `\\` → `\`.
/// Unrecognized escape sequences pass through literally.
fn unescape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(':') => result.push(';'),
                Some('s') => result.push(' '),
                Some('\\') => result.push('\\'),
                Some(other) => {
                    result.push('\\');
                    result.push(other);
                }
                None => result.push('\\'),
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// Escape a tag value for the wire: `;` → `\:`, space → `\s`, `\` → `\\`.
fn escape_tag_value(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            ';' => result.push_str("\\:"),
            ' ' => result.push_str("\\s"),
            '\\' => result.push_str("\\\\"),
            _ => result.push(c),
        }
    }
    result
}
