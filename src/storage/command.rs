// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Pipelineable store commands and their replies.
//!
//! A [`Command`] is one request in a pipelined round trip; the store answers
//! every command with exactly one [`Reply`], in the same position.

use std::fmt;

/// The command families the batch scheduler can pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    Get,
    Set,
    SetEx,
    Del,
    Exists,
    Expire,
    Incr,
    Decr,
    SAdd,
    SRem,
}

impl CommandKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "get",
            Self::Set => "set",
            Self::SetEx => "setex",
            Self::Del => "del",
            Self::Exists => "exists",
            Self::Expire => "expire",
            Self::Incr => "incr",
            Self::Decr => "decr",
            Self::SAdd => "sadd",
            Self::SRem => "srem",
        }
    }

    /// Read-only commands are safe to answer from a fallback.
    #[must_use]
    pub fn is_read(&self) -> bool {
        matches!(self, Self::Get | Self::Exists)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single store command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get { key: String },
    Set { key: String, value: String },
    SetEx { key: String, ttl_secs: u64, value: String },
    Del { key: String },
    Exists { key: String },
    Expire { key: String, ttl_secs: u64 },
    Incr { key: String },
    Decr { key: String },
    SAdd { key: String, member: String },
    SRem { key: String, member: String },
}

impl Command {
    pub fn get(key: impl Into<String>) -> Self {
        Self::Get { key: key.into() }
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Set { key: key.into(), value: value.into() }
    }

    pub fn set_ex(key: impl Into<String>, value: impl Into<String>, ttl_secs: u64) -> Self {
        Self::SetEx { key: key.into(), ttl_secs, value: value.into() }
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::Del { key: key.into() }
    }

    pub fn exists(key: impl Into<String>) -> Self {
        Self::Exists { key: key.into() }
    }

    pub fn expire(key: impl Into<String>, ttl_secs: u64) -> Self {
        Self::Expire { key: key.into(), ttl_secs }
    }

    pub fn incr(key: impl Into<String>) -> Self {
        Self::Incr { key: key.into() }
    }

    pub fn decr(key: impl Into<String>) -> Self {
        Self::Decr { key: key.into() }
    }

    pub fn sadd(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SAdd { key: key.into(), member: member.into() }
    }

    pub fn srem(key: impl Into<String>, member: impl Into<String>) -> Self {
        Self::SRem { key: key.into(), member: member.into() }
    }

    #[must_use]
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Get { .. } => CommandKind::Get,
            Self::Set { .. } => CommandKind::Set,
            Self::SetEx { .. } => CommandKind::SetEx,
            Self::Del { .. } => CommandKind::Del,
            Self::Exists { .. } => CommandKind::Exists,
            Self::Expire { .. } => CommandKind::Expire,
            Self::Incr { .. } => CommandKind::Incr,
            Self::Decr { .. } => CommandKind::Decr,
            Self::SAdd { .. } => CommandKind::SAdd,
            Self::SRem { .. } => CommandKind::SRem,
        }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        match self {
            Self::Get { key }
            | Self::Set { key, .. }
            | Self::SetEx { key, .. }
            | Self::Del { key }
            | Self::Exists { key }
            | Self::Expire { key, .. }
            | Self::Incr { key }
            | Self::Decr { key }
            | Self::SAdd { key, .. }
            | Self::SRem { key, .. } => key,
        }
    }
}

/// One reply per pipelined command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Missing key (GET on an absent key).
    Nil,
    /// String payload.
    Data(String),
    /// Integer reply (DEL/EXISTS/EXPIRE/INCR/DECR/SADD/SREM counts).
    Int(i64),
    /// Status reply (SET/SETEX).
    Ok,
    /// The store refused this one command (WRONGTYPE, non-integer INCR).
    /// Siblings in the same pipeline are unaffected.
    Error(String),
}

impl Reply {
    /// Interpret as an optional string value.
    #[must_use]
    pub fn into_value(self) -> Option<String> {
        match self {
            Self::Data(s) => Some(s),
            Self::Int(n) => Some(n.to_string()),
            Self::Nil | Self::Ok | Self::Error(_) => None,
        }
    }

    /// Interpret as an integer, treating nil as zero.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::Nil => Some(0),
            Self::Data(s) => s.parse().ok(),
            Self::Ok | Self::Error(_) => None,
        }
    }

    /// The command-level error message, if the store refused the command.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Error(msg) => Some(msg),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_bool(&self) -> bool {
        self.as_int().is_some_and(|n| n > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_kind_and_key() {
        let cmd = Command::set_ex("session:abc", "{}", 60);
        assert_eq!(cmd.kind(), CommandKind::SetEx);
        assert_eq!(cmd.key(), "session:abc");
        assert_eq!(Command::srem("tag:x", "k").kind().as_str(), "srem");
    }

    #[test]
    fn test_reply_conversions() {
        assert_eq!(Reply::Data("v".into()).into_value(), Some("v".into()));
        assert_eq!(Reply::Nil.into_value(), None);
        assert_eq!(Reply::Int(3).as_int(), Some(3));
        assert!(Reply::Int(1).as_bool());
        assert!(!Reply::Int(0).as_bool());
        assert!(!Reply::Ok.as_bool());
        let refused = Reply::Error("ERR value is not an integer".into());
        assert_eq!(refused.error(), Some("ERR value is not an integer"));
        assert_eq!(refused.as_int(), None);
        assert_eq!(refused.into_value(), None);
        assert_eq!(Reply::Nil.error(), None);
    }

    #[test]
    fn test_read_kinds() {
        assert!(CommandKind::Get.is_read());
        assert!(CommandKind::Exists.is_read());
        assert!(!CommandKind::Incr.is_read());
    }
}
