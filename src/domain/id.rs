//! Domain identifier types with proper encapsulation.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ControlError;

const MAX_BOT_NAME_LEN: usize = 64;

/// Unique name of a bot instance.
///
/// Validated on construction: 1 to 64 characters from `[A-Za-z0-9_-]`, so the
/// name is safe to embed in broker topics and filesystem paths.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BotName(String);

impl BotName {
    /// Create a new `BotName`, validating its characters.
    ///
    /// # Errors
    ///
    /// Returns [`ControlError::InvalidRequest`] for empty, overlong or
    /// non-alphanumeric names.
    pub fn new(name: impl Into<String>) -> Result<Self, ControlError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_BOT_NAME_LEN {
            return Err(ControlError::InvalidRequest(format!(
                "bot name must be 1..={MAX_BOT_NAME_LEN} characters, got {}",
                name.len()
            )));
        }
        if let Some(bad) = name
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '-' || *c == '_'))
        {
            return Err(ControlError::InvalidRequest(format!(
                "bot name {name:?} contains invalid character {bad:?}"
            )));
        }
        Ok(Self(name))
    }

    /// Get the bot name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for BotName {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BotName {
    type Error = ControlError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BotName> for String {
    fn from(name: BotName) -> Self {
        name.0
    }
}

/// Sandbox identifier assigned by the sandbox runtime.
///
/// Owned exclusively by the Runtime Controller; everyone else treats it as
/// opaque.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxId(String);

impl SandboxId {
    /// Create a new `SandboxId` from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the sandbox ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlation identifier pairing an outbound command with its response.
///
/// Generated as UUID v4 for new requests, or constructed from an existing
/// string when decoding inbound envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Create a new `CorrelationId` with a generated UUID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Wrap an existing identifier.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the correlation ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle identifying one consumer of a market data feed.
///
/// Callers hold handles, never the subscription itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerHandle(String);

impl CallerHandle {
    /// Create a handle from an existing caller identity.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh, unique handle.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("caller-{}", uuid::Uuid::new_v4().simple()))
    }

    /// Get the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallerHandle {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_name_accepts_simple_names() {
        assert_eq!(BotName::new("bot-1_a").unwrap().as_str(), "bot-1_a");
    }

    #[test]
    fn bot_name_rejects_topic_separators() {
        assert!(BotName::new("a/b").is_err());
        assert!(BotName::new("a+b").is_err());
        assert!(BotName::new("a#").is_err());
        assert!(BotName::new("a.b").is_err());
    }

    #[test]
    fn bot_name_rejects_empty_and_overlong() {
        assert!(BotName::new("").is_err());
        assert!(BotName::new("x".repeat(65)).is_err());
        assert!(BotName::new("x".repeat(64)).is_ok());
    }

    #[test]
    fn bot_name_deserialization_validates() {
        let ok: BotName = serde_json::from_str("\"bot1\"").unwrap();
        assert_eq!(ok.as_str(), "bot1");
        assert!(serde_json::from_str::<BotName>("\"bad name\"").is_err());
    }

    #[test]
    fn correlation_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn caller_handles_are_unique() {
        let a = CallerHandle::generate();
        let b = CallerHandle::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("caller-"));
    }
}
