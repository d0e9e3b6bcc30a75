//! Disconnect classification
//!
//! Substring matching against kick reasons and error text. Connection layers
//! that know the cause should attach an [`ErrorClass`] to the signal instead;
//! this is the fallback.

use serde::{Deserialize, Serialize};
use std::fmt;

const NETWORK_PHRASES: &[&str] = &["econnrefused", "enotfound", "etimedout"];
const AUTH_PHRASES: &[&str] = &["invalid credentials", "authentication", "session"];
const TIMEOUT_PHRASES: &[&str] = &["timeout", "timed out"];
const PERMANENT_BAN_PHRASES: &[&str] = &["banned", "permanent"];

/// Why a connection went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Auth,
    KickedPermanent,
    KickedTemporary,
    Timeout,
    Unknown,
}

impl ErrorClass {
    /// Terminal classes never schedule a reconnect
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Auth | Self::KickedPermanent)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Auth => "auth",
            Self::KickedPermanent => "kicked_permanent",
            Self::KickedTemporary => "kicked_temporary",
            Self::Timeout => "timeout",
            Self::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

fn contains_any(text: &str, phrases: &[&str]) -> bool {
    phrases.iter().any(|p| text.contains(p))
}

/// Classify a kick reason. Ban phrases are only honored here.
pub fn classify_kick(reason: &str) -> ErrorClass {
    if contains_any(&reason.to_lowercase(), PERMANENT_BAN_PHRASES) {
        ErrorClass::KickedPermanent
    } else {
        ErrorClass::KickedTemporary
    }
}

/// Classify error or disconnect text: network, then auth, then timeout
pub fn classify_error(message: &str) -> ErrorClass {
    let text = message.to_lowercase();
    if contains_any(&text, NETWORK_PHRASES) {
        ErrorClass::Network
    } else if contains_any(&text, AUTH_PHRASES) {
        ErrorClass::Auth
    } else if contains_any(&text, TIMEOUT_PHRASES) {
        ErrorClass::Timeout
    } else {
        ErrorClass::Unknown
    }
}
