use common::ProviderKind;
use thiserror::Error;

/// Failure classes of the enforcement loop. Only `Repository` aborts a tick;
/// everything else is logged and isolated to the item that failed.
#[derive(Debug, Error)]
pub enum EnforceError {
    #[error("billing fetch failed for account {account}: {source}")]
    Collector {
        account: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("rule evaluation failed for policy {policy}: {reason}")]
    Evaluation { policy: String, reason: String },

    #[error("remediation failed for policy {policy}: {source}")]
    Remediation {
        policy: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("webhook delivery to {url} failed: {reason}")]
    Delivery { url: String, reason: String },

    #[error("repository error: {0}")]
    Repository(#[source] anyhow::Error),

    #[error("no provider registered for {0}")]
    UnknownProvider(ProviderKind),

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: &'static str, secs: u64 },
}
