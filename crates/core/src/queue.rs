//! Queue types: which handler and configuration apply to a job.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

const WATCHDOG_PREFIX: &str = "watchdog-";

/// Queue type of a job.
///
/// Serialized as its kebab-case name (`"bulk-delete"`, `"watchdog-stale-leases"`),
/// so it can be used directly as a JSON map key in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum QueueType {
    Export,
    Reindex,
    Import,
    BulkDelete,
    BulkUpdate,
    SubscriptionProcessing,
    SubscriptionOrchestrator,
    /// Singleton maintenance queue, e.g. `watchdog-stale-leases`.
    Watchdog(String),
}

impl QueueType {
    /// Build a watchdog queue type from its task name (without the prefix).
    pub fn watchdog(name: impl Into<String>) -> Result<Self, DomainError> {
        let name = name.into();
        validate_watchdog_name(&name)?;
        Ok(Self::Watchdog(name))
    }

    pub fn is_watchdog(&self) -> bool {
        matches!(self, QueueType::Watchdog(_))
    }

    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        use std::borrow::Cow;
        match self {
            QueueType::Export => Cow::Borrowed("export"),
            QueueType::Reindex => Cow::Borrowed("reindex"),
            QueueType::Import => Cow::Borrowed("import"),
            QueueType::BulkDelete => Cow::Borrowed("bulk-delete"),
            QueueType::BulkUpdate => Cow::Borrowed("bulk-update"),
            QueueType::SubscriptionProcessing => Cow::Borrowed("subscription-processing"),
            QueueType::SubscriptionOrchestrator => Cow::Borrowed("subscription-orchestrator"),
            QueueType::Watchdog(name) => Cow::Owned(format!("{WATCHDOG_PREFIX}{name}")),
        }
    }
}

fn validate_watchdog_name(name: &str) -> Result<(), DomainError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(DomainError::UnknownQueueType(format!(
            "{WATCHDOG_PREFIX}{name}"
        )))
    }
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

impl FromStr for QueueType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "export" => Ok(QueueType::Export),
            "reindex" => Ok(QueueType::Reindex),
            "import" => Ok(QueueType::Import),
            "bulk-delete" => Ok(QueueType::BulkDelete),
            "bulk-update" => Ok(QueueType::BulkUpdate),
            "subscription-processing" => Ok(QueueType::SubscriptionProcessing),
            "subscription-orchestrator" => Ok(QueueType::SubscriptionOrchestrator),
            other => match other.strip_prefix(WATCHDOG_PREFIX) {
                Some(name) => QueueType::watchdog(name),
                None => Err(DomainError::UnknownQueueType(other.to_string())),
            },
        }
    }
}

impl TryFrom<String> for QueueType {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<QueueType> for String {
    fn from(value: QueueType) -> Self {
        value.as_str().into_owned()
    }
}
