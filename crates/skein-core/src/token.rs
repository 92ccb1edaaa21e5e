use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Opaque identifier correlating a suspended call with its resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallToken(String);

impl CallToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CallToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CallToken {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Mints `{runner_id}/{site}/{seq}` tokens.
///
/// Sequence numbers are per runner and start at 1, so replaying a session
/// with the same runner id re-derives the same token for the same call.
#[derive(Debug)]
pub struct TokenMinter {
    runner_id: String,
    next: AtomicU64,
}

impl TokenMinter {
    pub fn new(runner_id: impl Into<String>) -> Self {
        Self {
            runner_id: runner_id.into(),
            next: AtomicU64::new(1),
        }
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn mint(&self, site: &str) -> CallToken {
        let seq = self.next.fetch_add(1, Ordering::Relaxed);
        CallToken(format!("{}/{}/{}", self.runner_id, site, seq))
    }
}
