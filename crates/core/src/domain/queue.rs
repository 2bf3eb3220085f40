// Queue Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};

pub use crate::domain::job::QueueId;

pub const MAX_QUEUE_NAME_LEN: usize = 64;
pub const MAX_DEDUP_KEY_LEN: usize = 255;

/// Prefix of database notification channels used for wakeups
pub const WAKEUP_CHANNEL_PREFIX: &str = "cairn_wakeup_";

/// Postgres identifier limit (NAMEDATALEN - 1)
const MAX_CHANNEL_NAME_LEN: usize = 63;

/// Queue names: 1-64 chars of `[A-Za-z0-9_-]`
pub fn validate_queue_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(DomainError::ValidationError(
            "queue name is empty".to_string(),
        ));
    }
    if name.len() > MAX_QUEUE_NAME_LEN {
        return Err(DomainError::ValidationError(format!(
            "queue name too long ({} > {})",
            name.len(),
            MAX_QUEUE_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(DomainError::ValidationError(format!(
            "queue name '{}' must be alphanumeric, '_' or '-'",
            name
        )));
    }
    Ok(())
}

pub fn validate_dedup_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(DomainError::ValidationError(
            "dedup key is empty".to_string(),
        ));
    }
    if key.contains('\0') {
        return Err(DomainError::ValidationError(
            "dedup key contains a null byte".to_string(),
        ));
    }
    if key.len() > MAX_DEDUP_KEY_LEN {
        return Err(DomainError::ValidationError(format!(
            "dedup key exceeds {} bytes",
            MAX_DEDUP_KEY_LEN
        )));
    }
    Ok(())
}

/// Conventional per-asset dedup key ("<asset type>:<asset id>")
pub fn asset_dedup_key(asset_type: &str, asset_id: &str) -> String {
    format!("{}:{}", asset_type, asset_id)
}

/// Notification channel for a partition (queue name).
///
/// Lowercased, non-`[a-z0-9_]` characters replaced by `_`, truncated to the
/// database identifier limit.
pub fn wakeup_channel_name(partition: &str) -> String {
    let mut name = String::with_capacity(WAKEUP_CHANNEL_PREFIX.len() + partition.len());
    name.push_str(WAKEUP_CHANNEL_PREFIX);
    for c in partition.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            name.push(c);
        } else {
            name.push('_');
        }
    }
    // All pushed chars are ASCII, so byte truncation is char-safe
    name.truncate(MAX_CHANNEL_NAME_LEN);
    name
}

/// Cross-process wakeup request. `count: None` wakes every waiter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WakeupMessage {
    pub partition: String,
    #[serde(default)]
    pub count: Option<usize>,
}

impl WakeupMessage {
    pub fn one(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            count: Some(1),
        }
    }

    pub fn all(partition: impl Into<String>) -> Self {
        Self {
            partition: partition.into(),
            count: None,
        }
    }
}
