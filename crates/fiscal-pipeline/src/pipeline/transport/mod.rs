//! The only component doing network I/O.
//!
//! Codecs describe requests as [`ExchangeRequest`] values; an
//! [`AuthorityChannel`] moves bytes; the [`TransportAdapter`] adds timeouts,
//! retries, failure classification and the reply cache.

mod http;
mod idempotency;
mod retry;

use std::borrow::Cow;
use std::fmt;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::pipeline::codec::{AuthenticationMode, IdempotencyKeyFormat};
use crate::pipeline::credential::CredentialRecord;
use crate::pipeline::signer::SignedPayload;

pub use http::HttpChannel;
pub use idempotency::IdempotencyStore;
pub use retry::{Delivered, RetryPolicy, TransportAdapter, TransportFailure, TransportFault};

/// Outbound POST to an authority endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Key under which the reply is cached; set for submissions only.
    pub idempotency_key: Option<String>,
}

impl ExchangeRequest {
    pub fn post(url: impl Into<String>, content_type: &str, body: Vec<u8>) -> Self {
        Self {
            url: url.into(),
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body,
            idempotency_key: None,
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    pub fn header_value(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Tags the request with its idempotency key, adding the protocol header
    /// when the format declares one.
    pub fn idempotent(mut self, format: &IdempotencyKeyFormat, key: &str) -> Self {
        if let Some(header) = format.header {
            self = self.header(header, key);
        }
        self.idempotency_key = Some(key.to_string());
        self
    }

    /// Adds the HTTP-level proof of origin the codec declares.
    pub fn authenticated(
        self,
        mode: AuthenticationMode,
        signed: &SignedPayload,
        credential: Option<&CredentialRecord>,
    ) -> Self {
        match mode {
            AuthenticationMode::EmbeddedSignature => self,
            AuthenticationMode::ApiKey { header } => match credential {
                Some(credential) => {
                    self.header(header, String::from_utf8_lossy(&credential.secret).into_owned())
                }
                None => self,
            },
            AuthenticationMode::BodyHmac { header } => {
                match signed.metadata.get(crate::pipeline::signer::HMAC_METADATA) {
                    Some(mac) => self.header(header, mac.clone()),
                    None => self,
                }
            }
            AuthenticationMode::DetachedSignature { header } => match &signed.detached_signature {
                Some(signature) => self.header(header, STANDARD.encode(signature)),
                None => self,
            },
        }
    }

    /// Headers suitable for persisting: credential-bearing values are masked.
    pub fn redacted_headers(&self, secret_headers: &[&str]) -> Vec<(String, String)> {
        self.headers
            .iter()
            .map(|(name, value)| {
                if secret_headers
                    .iter()
                    .any(|secret| secret.eq_ignore_ascii_case(name))
                {
                    (name.clone(), "***".to_string())
                } else {
                    (name.clone(), value.clone())
                }
            })
            .collect()
    }
}

/// Raw authority response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ExchangeReply {
    pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    pub fn body_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn is_server_error(&self) -> bool {
        self.status >= 500
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("request timed out")]
    Timeout,
    #[error("network failure: {0}")]
    Network(String),
}

/// Byte mover to an authority endpoint.
#[async_trait]
pub trait AuthorityChannel: Send + Sync + fmt::Debug {
    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeReply, ChannelError>;
}
