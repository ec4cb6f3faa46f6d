//! Codec manifests and the per-jurisdiction recipes they describe.
//!
//! A codec bundles a payload builder, the signature and authentication modes,
//! the request envelopes for each exchange and the reply grammar. Everything a
//! codec declares about its protocol lives in its [`CodecDescriptor`], which is
//! built once at registry construction and never mutated afterwards.

pub mod dian;
pub mod etims;
pub mod fatturapa;
mod registry;
pub mod riba;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::document::{DocumentId, DocumentKind, DocumentSnapshot, TaxRate, TaxScheme};
use crate::pipeline::credential::{CredentialKind, CredentialRecord};
use crate::pipeline::interpreter::AuthorityReply;
use crate::pipeline::payload::{BuildError, Payload, RoundingStrategy};
use crate::pipeline::signer::{SignatureMode, SignedPayload};
use crate::pipeline::transport::{ExchangeReply, ExchangeRequest, RetryPolicy};

pub use registry::{CodecEndpoints, CodecRegistry, RegistryError, Resolution};

/// `(country, document kind, profile)` triple identifying one codec.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CodecId {
    pub country: String,
    pub kind: DocumentKind,
    pub profile: String,
}

impl CodecId {
    pub fn new(country: &str, kind: DocumentKind, profile: &str) -> Self {
        Self {
            country: country.trim().to_ascii_uppercase(),
            kind,
            profile: profile.trim().to_ascii_lowercase(),
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.country, self.kind, self.profile)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed codec id '{0}'")]
pub struct CodecIdError(pub String);

impl FromStr for CodecId {
    type Err = CodecIdError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split(':');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(country), Some(kind), Some(profile), None) if !profile.is_empty() => {
                let kind = DocumentKind::parse(kind).ok_or_else(|| CodecIdError(raw.to_string()))?;
                Ok(Self::new(country, kind, profile))
            }
            _ => Err(CodecIdError(raw.to_string())),
        }
    }
}

impl TryFrom<String> for CodecId {
    type Error = CodecIdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CodecId> for String {
    fn from(value: CodecId) -> Self {
        value.to_string()
    }
}

/// Remote operations a codec may expose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub submit: String,
    pub status: Option<String>,
    pub lookup: Option<String>,
}

/// How a request proves its origin at the HTTP level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationMode {
    /// The signature travels inside the payload itself.
    EmbeddedSignature,
    /// Credential secret sent verbatim in a header.
    ApiKey { header: &'static str },
    /// Hex HMAC of the body in a header.
    BodyHmac { header: &'static str },
    /// Base64 detached signature in a header.
    DetachedSignature { header: &'static str },
}

/// Sign applied to amounts of credit notes when formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignConvention {
    AsPosted,
    NegatedForCredits,
}

impl SignConvention {
    pub fn apply(self, kind: DocumentKind, amount_minor: i64) -> i64 {
        match (self, kind) {
            (Self::NegatedForCredits, DocumentKind::CreditNote) => -amount_minor,
            _ => amount_minor,
        }
    }
}

/// Deterministic idempotency token format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdempotencyKeyFormat {
    pub prefix: &'static str,
    /// Header carrying the key, when the protocol has one.
    pub header: Option<&'static str>,
}

impl IdempotencyKeyFormat {
    /// Token derived from `(document, codec, key sequence)`.
    pub fn derive(&self, document: &DocumentId, codec: &CodecId, key_seq: u32) -> String {
        let digest = Sha256::digest(format!("{document}|{codec}|{key_seq}").as_bytes());
        format!("{}{}", self.prefix, &hex::encode(digest)[..32])
    }
}

/// Counterparty fields a codec refuses to build without.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterpartyField {
    TaxId,
    Address,
    Email,
}

impl CounterpartyField {
    pub const fn path(self) -> &'static str {
        match self {
            Self::TaxId => "counterparty.tax_id",
            Self::Address => "counterparty.address",
            Self::Email => "counterparty.email",
        }
    }
}

/// Immutable manifest of one codec.
#[derive(Debug, Clone)]
pub struct CodecDescriptor {
    pub id: CodecId,
    /// Credential scope shared by all codecs of one authority, e.g. `co-dian`.
    pub family: &'static str,
    pub schema_version: &'static str,
    pub endpoints: Endpoints,
    pub authentication: AuthenticationMode,
    pub credential_kind: Option<CredentialKind>,
    pub signature: SignatureMode,
    pub rounding: RoundingStrategy,
    pub sign_convention: SignConvention,
    pub idempotency: IdempotencyKeyFormat,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// Present for asynchronous codecs.
    pub poll_interval: Option<Duration>,
    pub lookup_supported: bool,
    /// Whether `pending_authority` documents count as legally issued in
    /// tax closings. Each manifest must state it.
    pub pending_counts_as_issued: bool,
    pub allowed_rates: Vec<(TaxScheme, TaxRate)>,
    pub required_counterparty: Vec<CounterpartyField>,
    pub requires_classification: bool,
    pub requires_exemption_for_zero_rate: bool,
}

impl CodecDescriptor {
    pub fn is_async(&self) -> bool {
        self.poll_interval.is_some()
    }

    pub fn allows_rate(&self, scheme: TaxScheme, rate: TaxRate) -> bool {
        self.allowed_rates
            .iter()
            .any(|(allowed_scheme, allowed_rate)| *allowed_scheme == scheme && *allowed_rate == rate)
    }
}

/// Remote operation a reply belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exchange {
    Submit,
    Status,
    Lookup,
}

/// Inputs to a submission envelope.
#[derive(Debug, Clone, Copy)]
pub struct SubmitContext<'a> {
    pub snapshot: &'a DocumentSnapshot,
    pub payload: &'a Payload,
    pub signed: &'a SignedPayload,
    pub credential: Option<&'a CredentialRecord>,
    pub idempotency_key: &'a str,
}

/// Inputs to a status poll or a lookup by reference.
#[derive(Debug, Clone, Copy)]
pub struct QueryContext<'a> {
    pub snapshot: &'a DocumentSnapshot,
    pub payload: &'a Payload,
    pub credential: Option<&'a CredentialRecord>,
    pub tracking_ref: Option<&'a str>,
}

/// Reply body the codec could not parse; treated as a transport failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unparseable {exchange:?} envelope: {reason}")]
pub struct EnvelopeError {
    pub exchange: Exchange,
    pub reason: String,
}

impl EnvelopeError {
    pub fn new(exchange: Exchange, reason: impl fmt::Display) -> Self {
        Self {
            exchange,
            reason: reason.to_string(),
        }
    }
}

/// One jurisdiction recipe.
pub trait Codec: Send + Sync + fmt::Debug {
    fn descriptor(&self) -> &CodecDescriptor;

    /// Pure, deterministic payload construction.
    fn build(&self, snapshot: &DocumentSnapshot) -> Result<Payload, BuildError>;

    /// Wraps the signed payload in the protocol's submission envelope.
    fn submit_request(&self, context: &SubmitContext<'_>) -> Result<ExchangeRequest, BuildError>;

    /// Status poll for asynchronous codecs.
    fn status_request(&self, _context: &QueryContext<'_>) -> Option<ExchangeRequest> {
        None
    }

    /// Lookup by reference, for codecs whose authority supports it.
    fn lookup_request(&self, _context: &QueryContext<'_>) -> Option<ExchangeRequest> {
        None
    }

    fn parse_reply(
        &self,
        exchange: Exchange,
        reply: &ExchangeReply,
    ) -> Result<AuthorityReply, EnvelopeError>;
}

pub(crate) fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}
