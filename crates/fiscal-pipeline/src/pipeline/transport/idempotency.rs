use chrono::{DateTime, Utc};

use crate::pipeline::ledger::LedgerError;

use super::ExchangeReply;

/// Replies keyed by idempotency key, written the moment they arrive so a
/// crashed worker can recover the authority's answer without resending.
pub trait IdempotencyStore: Send + Sync {
    fn remember(
        &self,
        key: &str,
        reply: &ExchangeReply,
        received_at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    fn recall(&self, key: &str) -> Result<Option<ExchangeReply>, LedgerError>;
}
