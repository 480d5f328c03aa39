//! Activity log side channel
//!
//! The surrounding application keeps a categorized activity log; this core
//! only ever writes to it through [`LogSink::record`]. Ordering and display
//! are the sink's concern, not ours.

use std::fmt;

/// Category attached to every recorded entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogCategory {
    Auth,
    Transfer,
    Network,
}

impl fmt::Display for LogCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogCategory::Auth => write!(f, "Auth"),
            LogCategory::Transfer => write!(f, "Transfer"),
            LogCategory::Network => write!(f, "Network"),
        }
    }
}

/// Write target for the application activity log.
///
/// `source` identifies the provider/operation, `message` carries the minimal
/// context needed to reproduce. Credentials must never be passed in.
pub trait LogSink: Send + Sync {
    fn record(&self, category: LogCategory, source: &str, message: &str);
}

/// Default sink that forwards entries to the `tracing` subscriber
pub struct TracingSink;

impl LogSink for TracingSink {
    fn record(&self, category: LogCategory, source: &str, message: &str) {
        tracing::info!(target: "activity", "[{}] {}: {}", category, source, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_display() {
        assert_eq!(LogCategory::Auth.to_string(), "Auth");
        assert_eq!(LogCategory::Transfer.to_string(), "Transfer");
        assert_eq!(LogCategory::Network.to_string(), "Network");
    }
}
