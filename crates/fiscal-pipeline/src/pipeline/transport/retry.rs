use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::pipeline::clock::Clock;
use crate::pipeline::codec::EnvelopeError;
use crate::pipeline::interpreter::AuthorityReply;

use super::{AuthorityChannel, ChannelError, ExchangeReply, ExchangeRequest, IdempotencyStore};

/// Retries after transport failures, waiting `base_delay * n²` before retry `n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn delay(&self, retry: u32) -> Duration {
        self.base_delay * retry.saturating_mul(retry)
    }
}

/// Why a single call did not yield an authority reply.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportFault {
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("authority answered HTTP {status}")]
    ServerError { status: u16, body: String },
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("transport failed after {calls} call(s): {last}")]
pub struct TransportFailure {
    pub calls: u32,
    pub last: TransportFault,
    /// Body of the last reply, when one arrived.
    pub last_body: Option<Vec<u8>>,
}

/// Authority reply that parsed under the codec grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub reply: ExchangeReply,
    pub parsed: AuthorityReply,
    pub calls: u32,
}

/// Timeout, retry and classification around an [`AuthorityChannel`].
#[derive(Clone)]
pub struct TransportAdapter {
    channel: Arc<dyn AuthorityChannel>,
    replies: Arc<dyn IdempotencyStore>,
    clock: Arc<dyn Clock>,
}

impl TransportAdapter {
    pub fn new(
        channel: Arc<dyn AuthorityChannel>,
        replies: Arc<dyn IdempotencyStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            channel,
            replies,
            clock,
        }
    }

    pub fn replies(&self) -> &Arc<dyn IdempotencyStore> {
        &self.replies
    }

    /// Sends `request` until the authority gives a parseable answer or the
    /// retry budget is spent. Server errors, timeouts, network failures and
    /// unparseable envelopes are retried; authority replies never are.
    pub async fn exchange<F>(
        &self,
        request: &ExchangeRequest,
        call_timeout: Duration,
        policy: &RetryPolicy,
        parse: F,
    ) -> Result<Delivered, TransportFailure>
    where
        F: Fn(&ExchangeReply) -> Result<AuthorityReply, EnvelopeError>,
    {
        let mut calls = 0;
        loop {
            calls += 1;
            let (fault, last_body) = match timeout(call_timeout, self.channel.send(request)).await {
                Err(_) => (TransportFault::Channel(ChannelError::Timeout), None),
                Ok(Err(error)) => (TransportFault::Channel(error), None),
                Ok(Ok(reply)) if reply.is_server_error() => (
                    TransportFault::ServerError {
                        status: reply.status,
                        body: reply.body_text().into_owned(),
                    },
                    Some(reply.body),
                ),
                Ok(Ok(reply)) => match parse(&reply) {
                    Ok(parsed) => {
                        self.cache(request, &reply);
                        if calls > 1 {
                            debug!(url = %request.url, calls, "authority answered after retry");
                        }
                        return Ok(Delivered {
                            reply,
                            parsed,
                            calls,
                        });
                    }
                    Err(error) => (TransportFault::Envelope(error), Some(reply.body)),
                },
            };

            if calls > policy.max_retries {
                warn!(url = %request.url, calls, error = %fault, "transport retries exhausted");
                return Err(TransportFailure {
                    calls,
                    last: fault,
                    last_body,
                });
            }

            let backoff = policy.delay(calls);
            debug!(
                url = %request.url,
                call = calls,
                backoff_ms = backoff.as_millis() as u64,
                error = %fault,
                "transient transport failure, backing off"
            );
            sleep(backoff).await;
        }
    }

    fn cache(&self, request: &ExchangeRequest, reply: &ExchangeReply) {
        let Some(key) = request.idempotency_key.as_deref() else {
            return;
        };
        if let Err(error) = self.replies.remember(key, reply, self.clock.now()) {
            warn!(key, error = %error, "failed to cache authority reply");
        }
    }
}
