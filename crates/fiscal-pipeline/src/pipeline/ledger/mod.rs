//! Submission ledger: append-only attempts, the status projection derived from
//! them, the transition log, and the tables the pipeline keeps alongside
//! (snapshots, blobs, packages, credentials, the reply cache, advisory locks).

mod sqlite;

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::document::{DocumentId, DocumentSnapshot};
use crate::pipeline::codec::CodecId;
use crate::pipeline::interpreter::ErrorDetail;

pub use sqlite::SqliteLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentState {
    NotSent,
    Queued,
    Submitting,
    Accepted,
    Rejected,
    PendingAuthority,
    Cancelled,
}

impl DocumentState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotSent => "not_sent",
            Self::Queued => "queued",
            Self::Submitting => "submitting",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::PendingAuthority => "pending_authority",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "not_sent" => Some(Self::NotSent),
            "queued" => Some(Self::Queued),
            "submitting" => Some(Self::Submitting),
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "pending_authority" => Some(Self::PendingAuthority),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Accepted,
    Rejected,
    PendingAuthority,
    TransportError,
}

impl Outcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::PendingAuthority => "pending_authority",
            Self::TransportError => "transport_error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "accepted" => Some(Self::Accepted),
            "rejected" => Some(Self::Rejected),
            "pending_authority" => Some(Self::PendingAuthority),
            "transport_error" => Some(Self::TransportError),
            _ => None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage that produced an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Build,
    Credential,
    Transport,
    Authority,
    /// Synthesised during crash recovery from a cached reply or a lookup.
    Recovered,
}

impl Origin {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Credential => "credential",
            Self::Transport => "transport",
            Self::Authority => "authority",
            Self::Recovered => "recovered",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "build" => Some(Self::Build),
            "credential" => Some(Self::Credential),
            "transport" => Some(Self::Transport),
            "authority" => Some(Self::Authority),
            "recovered" => Some(Self::Recovered),
            _ => None,
        }
    }
}

/// Projection of a document's lifecycle, rebuilt from attempts on every write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentStatus {
    pub document_id: DocumentId,
    pub state: DocumentState,
    pub codec: Option<CodecId>,
    pub snapshot_hash: Option<String>,
    pub authority_ref: Option<String>,
    /// Identifier the authority asked us to poll with.
    pub tracking_ref: Option<String>,
    pub errors: Vec<ErrorDetail>,
    pub accepted_attempt: Option<String>,
    pub last_seq: u32,
    /// Seq handed out by `begin` and not yet recorded.
    pub reserved_seq: Option<u32>,
    pub last_exchange_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

/// Immutable row of `submission_attempt`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionAttempt {
    /// `"{document}#{seq}"`.
    pub attempt_id: String,
    pub document_id: DocumentId,
    pub codec: CodecId,
    pub seq: u32,
    pub idempotency_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// SHA-256 of the signed request payload, a key into the blob table.
    pub request_hash: Option<String>,
    pub request_headers: Vec<(String, String)>,
    #[serde(skip)]
    pub response: Option<Vec<u8>>,
    /// Hash of the authority-issued artifact (DIAN ApplicationResponse).
    pub artifact_hash: Option<String>,
    pub outcome: Outcome,
    pub origin: Origin,
    pub authority_ref: Option<String>,
    pub tracking_ref: Option<String>,
    pub errors: Vec<ErrorDetail>,
    pub from_state: DocumentState,
    pub to_state: DocumentState,
}

impl SubmissionAttempt {
    pub fn attempt_id(document: &DocumentId, seq: u32) -> String {
        format!("{document}#{seq}")
    }
}

/// Attempt to append, together with the state it moves the document to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAttempt {
    pub document_id: DocumentId,
    pub codec: CodecId,
    pub seq: u32,
    pub owner: String,
    pub idempotency_key: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub request: Option<Vec<u8>>,
    pub request_headers: Vec<(String, String)>,
    pub response: Option<Vec<u8>>,
    pub artifact: Option<Vec<u8>>,
    pub outcome: Outcome,
    pub origin: Origin,
    pub authority_ref: Option<String>,
    pub tracking_ref: Option<String>,
    pub errors: Vec<ErrorDetail>,
    pub next_state: DocumentState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub document_id: DocumentId,
    pub from: DocumentState,
    pub to: DocumentState,
    pub at: DateTime<Utc>,
    pub reason: String,
    pub attempt_id: Option<String>,
}

/// Answer to posting a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueOutcome {
    Queued(DocumentStatus),
    /// Already moving through the pipeline; nothing changed.
    InFlight(DocumentStatus),
    /// Accepted with the same content; the authority reference is returned.
    AlreadyAccepted { authority_ref: Option<String> },
    /// Accepted documents are locked from payload edits.
    LockedAfterAcceptance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// `queued -> submitting`.
    Submit,
    /// Status poll of a `pending_authority` document.
    FollowUp,
    /// Resolution of a `submitting` document whose worker vanished.
    Recover,
}

#[derive(Debug, Clone)]
pub struct BeginRequest<'a> {
    pub document: &'a DocumentId,
    pub owner: &'a str,
    pub purpose: Purpose,
    pub at: DateTime<Utc>,
    pub lock_ttl: chrono::Duration,
}

/// Exclusive right to append the attempt numbered `seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub document_id: DocumentId,
    pub codec: CodecId,
    pub seq: u32,
    pub owner: String,
    /// State the document was in before `begin`.
    pub from_state: DocumentState,
    /// The seq was reserved earlier and never recorded; whatever happened to
    /// it must be resolved before anything is re-sent.
    pub resumed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPackage {
    pub document_id: DocumentId,
    pub attempt_id: String,
    pub name: String,
    pub bytes: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Attached-document archive bound to one accepted attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachedPackage {
    pub document_id: DocumentId,
    pub attempt_id: String,
    pub name: String,
    /// SHA-256 of the archive bytes, also its key in the blob table.
    pub content_hash: String,
    pub size: u64,
    pub created_at: DateTime<Utc>,
}

/// Document a closing may have to count.
#[derive(Debug, Clone, PartialEq)]
pub struct IssuedDocument {
    pub status: DocumentStatus,
    pub snapshot: DocumentSnapshot,
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("ledger encoding error: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("ledger connection poisoned")]
    Poisoned,
    #[error("document {0} is unknown to the ledger")]
    UnknownDocument(DocumentId),
    #[error("credential {0} does not exist")]
    UnknownCredential(i64),
    #[error("document {document} cannot move from {from} to {to}")]
    InvalidTransition {
        document: DocumentId,
        from: DocumentState,
        to: DocumentState,
    },
    #[error("document {document} already holds an accepted attempt for {codec}")]
    DuplicateAcceptance { document: DocumentId, codec: CodecId },
    #[error("attempt {found} for {document} does not follow reservation {expected:?}")]
    SequenceConflict {
        document: DocumentId,
        expected: Option<u32>,
        found: u32,
    },
    #[error("corrupt ledger value: {0}")]
    Corrupt(String),
}

/// Ledger operations used by the orchestrator, scheduler and operator surface.
pub trait LedgerStore: Send + Sync {
    /// Stores the snapshot and moves the document to `queued`, unless it is
    /// already in flight or accepted.
    fn queue_snapshot(
        &self,
        snapshot: &DocumentSnapshot,
        codec: &CodecId,
        at: DateTime<Utc>,
    ) -> Result<QueueOutcome, LedgerError>;

    /// Records that no codec applies to the document.
    fn mark_not_sent(
        &self,
        snapshot: &DocumentSnapshot,
        at: DateTime<Utc>,
    ) -> Result<DocumentStatus, LedgerError>;

    fn status(&self, document: &DocumentId) -> Result<Option<DocumentStatus>, LedgerError>;

    /// Snapshot the status currently points at.
    fn snapshot(&self, document: &DocumentId) -> Result<Option<DocumentSnapshot>, LedgerError>;

    /// Takes the advisory lock and reserves the next seq. `None` when another
    /// owner holds a live lock or the state does not fit the purpose.
    fn begin(&self, request: BeginRequest<'_>) -> Result<Option<Reservation>, LedgerError>;

    /// Appends the attempt, updates the projection, logs the transition and
    /// releases the lock, all in one transaction.
    fn record(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, LedgerError>;

    /// Gives up a reservation after a deadline expiry: `submitting` returns to
    /// `queued` with its seq still reserved.
    fn abandon(
        &self,
        reservation: &Reservation,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    fn cancel(
        &self,
        document: &DocumentId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<DocumentStatus, LedgerError>;

    /// Attempts in seq order.
    fn replay(&self, document: &DocumentId) -> Result<Vec<SubmissionAttempt>, LedgerError>;

    fn transitions(&self, document: &DocumentId) -> Result<Vec<StatusTransition>, LedgerError>;

    fn documents_in(
        &self,
        state: DocumentState,
        limit: usize,
    ) -> Result<Vec<DocumentStatus>, LedgerError>;

    /// `submitting` documents whose lock expired or disappeared.
    fn stale_submissions(&self, now: DateTime<Utc>) -> Result<Vec<DocumentStatus>, LedgerError>;

    fn store_package(&self, package: NewPackage) -> Result<AttachedPackage, LedgerError>;

    fn package(&self, document: &DocumentId) -> Result<Option<AttachedPackage>, LedgerError>;

    fn blob(&self, hash: &str) -> Result<Option<Vec<u8>>, LedgerError>;

    /// Accepted and pending documents issued within `[from, to]`.
    fn issued_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<IssuedDocument>, LedgerError>;
}
