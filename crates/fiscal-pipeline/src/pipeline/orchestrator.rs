//! Drives documents through `build -> credential -> sign -> transmit ->
//! interpret -> record -> package`, one reservation at a time.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, info_span, warn, Instrument};

use crate::document::{DocumentId, DocumentSnapshot};
use crate::pipeline::assembler::{assemble, AssemblyError, PackageParts, SourcePdfProvider};
use crate::pipeline::clock::Clock;
use crate::pipeline::codec::{
    AuthenticationMode, Codec, CodecDescriptor, CodecId, CodecRegistry, Exchange, QueryContext,
    Resolution, SubmitContext,
};
use crate::pipeline::credential::{CredentialRecord, CredentialStore};
use crate::pipeline::interpreter::{
    interpret, interpret_lookup, ErrorDetail, Interpretation, DUPLICATE_REFERENCE,
};
use crate::pipeline::ledger::{
    AttachedPackage, BeginRequest, DocumentState, DocumentStatus, LedgerError, LedgerStore,
    NewAttempt, NewPackage, Origin, Outcome, Purpose, QueueOutcome, Reservation,
    SubmissionAttempt,
};
use crate::pipeline::payload::{BuildError, Payload};
use crate::pipeline::signer::{sign, SignError};
use crate::pipeline::transport::{ExchangeReply, TransportAdapter};

/// Error code recorded when the transport gave up.
pub const TRANSPORT_ERROR: &str = "TRANSPORT_ERROR";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Owner name written into advisory locks.
    pub worker_id: String,
    /// Hard bound on one document's processing.
    pub deadline: Duration,
    pub lock_ttl: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            worker_id: "worker-1".to_string(),
            deadline: Duration::from_secs(120),
            lock_ttl: Duration::from_secs(300),
        }
    }
}

/// Answer to the posting hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOutcome {
    /// No codec applies to the document.
    NotSent(DocumentStatus),
    Queued(DocumentStatus),
    InFlight(DocumentStatus),
    AlreadyAccepted { authority_ref: Option<String> },
}

/// Result of one processing or follow-up step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Recorded(SubmissionAttempt),
    /// Another worker holds the document, or its state does not call for the step.
    Skipped,
    /// The deadline expired; the reservation was handed back untouched.
    DeadlineExceeded { seq: u32 },
    /// Whether the authority holds an earlier send could not be established.
    /// The reservation was handed back and nothing was re-sent.
    Unresolved { seq: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("document {0} was accepted and its payload is locked")]
    LockedAfterAcceptance(DocumentId),
    #[error("document {0} is unknown")]
    UnknownDocument(DocumentId),
    #[error("no snapshot stored for document {0}")]
    MissingSnapshot(DocumentId),
    #[error("codec {0} is not registered")]
    UnknownCodec(CodecId),
    #[error("stored snapshot no longer builds: {0}")]
    Rebuild(#[from] BuildError),
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
}

/// Everything an attempt row needs beyond the reservation.
struct Entry {
    outcome: Outcome,
    origin: Origin,
    next_state: DocumentState,
    request: Option<Vec<u8>>,
    request_headers: Vec<(String, String)>,
    response: Option<Vec<u8>>,
    artifact: Option<Vec<u8>>,
    authority_ref: Option<String>,
    tracking_ref: Option<String>,
    errors: Vec<ErrorDetail>,
}

impl Entry {
    fn failure(origin: Origin, errors: Vec<ErrorDetail>) -> Self {
        Self {
            outcome: Outcome::Rejected,
            origin,
            next_state: DocumentState::Rejected,
            request: None,
            request_headers: Vec::new(),
            response: None,
            artifact: None,
            authority_ref: None,
            tracking_ref: None,
            errors,
        }
    }

    fn transport(message: String, resume_in: DocumentState, response: Option<Vec<u8>>) -> Self {
        Self {
            outcome: Outcome::TransportError,
            origin: Origin::Transport,
            next_state: resume_in,
            request: None,
            request_headers: Vec::new(),
            response,
            artifact: None,
            authority_ref: None,
            tracking_ref: None,
            errors: vec![ErrorDetail::new(TRANSPORT_ERROR, message)],
        }
    }

    fn reply(interpretation: Interpretation, origin: Origin, response: Vec<u8>) -> Self {
        let next_state = match interpretation.outcome {
            Outcome::Accepted => DocumentState::Accepted,
            Outcome::Rejected => DocumentState::Rejected,
            Outcome::PendingAuthority | Outcome::TransportError => DocumentState::PendingAuthority,
        };
        Self {
            outcome: interpretation.outcome,
            origin,
            next_state,
            request: None,
            request_headers: Vec::new(),
            response: Some(response),
            artifact: interpretation.artifact,
            authority_ref: interpretation.authority_ref,
            tracking_ref: interpretation.tracking_ref,
            errors: interpretation.errors,
        }
    }

    fn with_request(mut self, body: Vec<u8>, headers: Vec<(String, String)>) -> Self {
        self.request = Some(body);
        self.request_headers = headers;
        self
    }
}

/// Authority answer found for a reservation that was never recorded.
struct Recovered {
    interpretation: Interpretation,
    reply: ExchangeReply,
}

impl Recovered {
    fn into_entry(self, payload: &Payload) -> Entry {
        with_payload_reference(
            Entry::reply(self.interpretation, Origin::Recovered, self.reply.body),
            payload,
        )
    }
}

/// What the authority is known to hold for a send whose answer never reached
/// the ledger.
enum Prior {
    Found(Recovered),
    /// Definitely not received; the request may go out again under its key.
    Absent,
    /// The lookup itself failed.
    Unknown,
}

pub struct FiscalOrchestrator<L, P> {
    registry: Arc<CodecRegistry>,
    ledger: Arc<L>,
    transport: TransportAdapter,
    pdfs: Arc<P>,
    clock: Arc<dyn Clock>,
    settings: OrchestratorSettings,
}

impl<L, P> FiscalOrchestrator<L, P>
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    pub fn new(
        registry: Arc<CodecRegistry>,
        ledger: Arc<L>,
        transport: TransportAdapter,
        pdfs: Arc<P>,
        clock: Arc<dyn Clock>,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            registry,
            ledger,
            transport,
            pdfs,
            clock,
            settings,
        }
    }

    pub fn registry(&self) -> &CodecRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Posting hook: resolves the codec and queues the snapshot.
    pub fn post(&self, snapshot: &DocumentSnapshot) -> Result<PostOutcome, OrchestratorError> {
        let now = self.clock.now();
        let codec = match self.registry.resolve_snapshot(snapshot) {
            Resolution::Codec(codec) => codec,
            Resolution::NotApplicable => {
                let status = self.ledger.mark_not_sent(snapshot, now)?;
                info!(document = %snapshot.id, "no codec applies, document not sent");
                return Ok(PostOutcome::NotSent(status));
            }
        };

        let id = &codec.descriptor().id;
        match self.ledger.queue_snapshot(snapshot, id, now)? {
            QueueOutcome::Queued(status) => {
                info!(document = %snapshot.id, codec = %id, "document queued");
                Ok(PostOutcome::Queued(status))
            }
            QueueOutcome::InFlight(status) => {
                debug!(document = %snapshot.id, state = %status.state, "document already in flight");
                Ok(PostOutcome::InFlight(status))
            }
            QueueOutcome::AlreadyAccepted { authority_ref } => {
                Ok(PostOutcome::AlreadyAccepted { authority_ref })
            }
            QueueOutcome::LockedAfterAcceptance => {
                warn!(document = %snapshot.id, "accepted document changed upstream");
                Err(OrchestratorError::LockedAfterAcceptance(snapshot.id.clone()))
            }
        }
    }

    /// Submits a `queued` document under its advisory lock.
    pub async fn process(&self, document: &DocumentId) -> Result<StepOutcome, OrchestratorError> {
        let Some(reservation) = self.reserve(document, Purpose::Submit)? else {
            debug!(document = %document, "document not available for submission");
            return Ok(StepOutcome::Skipped);
        };
        self.bounded(&reservation, self.submit_reserved(&reservation))
            .await
    }

    /// Polls the authority for a `pending_authority` document.
    pub async fn follow_up(&self, document: &DocumentId) -> Result<StepOutcome, OrchestratorError> {
        let Some(reservation) = self.reserve(document, Purpose::FollowUp)? else {
            return Ok(StepOutcome::Skipped);
        };
        self.bounded(&reservation, self.poll_reserved(&reservation))
            .await
    }

    /// Resolves `submitting` documents whose worker disappeared.
    pub async fn recover_stale(&self) -> Result<Vec<StepOutcome>, OrchestratorError> {
        let stale = self.ledger.stale_submissions(self.clock.now())?;
        let mut outcomes = Vec::with_capacity(stale.len());
        for status in stale {
            let Some(reservation) = self.reserve(&status.document_id, Purpose::Recover)? else {
                continue;
            };
            info!(document = %reservation.document_id, seq = reservation.seq, "recovering interrupted submission");
            match self
                .bounded(&reservation, self.submit_reserved(&reservation))
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(error) => {
                    warn!(document = %reservation.document_id, error = %error, "recovery failed");
                }
            }
        }
        Ok(outcomes)
    }

    pub fn cancel(
        &self,
        document: &DocumentId,
        reason: &str,
    ) -> Result<DocumentStatus, OrchestratorError> {
        let status = self.ledger.cancel(document, reason, self.clock.now())?;
        info!(document = %document, reason, "document cancelled");
        Ok(status)
    }

    pub fn status(&self, document: &DocumentId) -> Result<DocumentStatus, OrchestratorError> {
        self.ledger
            .status(document)?
            .ok_or_else(|| OrchestratorError::UnknownDocument(document.clone()))
    }

    pub fn attempts(
        &self,
        document: &DocumentId,
    ) -> Result<Vec<SubmissionAttempt>, OrchestratorError> {
        Ok(self.ledger.replay(document)?)
    }

    /// Package of the accepted attempt with its bytes.
    pub fn package(
        &self,
        document: &DocumentId,
    ) -> Result<Option<(AttachedPackage, Vec<u8>)>, OrchestratorError> {
        let Some(package) = self.attach_package(document)? else {
            return Ok(None);
        };
        let bytes = self
            .ledger
            .blob(&package.content_hash)?
            .ok_or_else(|| LedgerError::Corrupt(format!("missing blob {}", package.content_hash)))?;
        Ok(Some((package, bytes)))
    }

    /// Builds and stores the package of the accepted attempt unless it
    /// already exists. `None` while the document is not accepted.
    pub fn attach_package(
        &self,
        document: &DocumentId,
    ) -> Result<Option<AttachedPackage>, OrchestratorError> {
        let status = self.status(document)?;
        let Some(accepted_id) = status.accepted_attempt.clone() else {
            return Ok(None);
        };
        if let Some(existing) = self.ledger.package(document)? {
            if existing.attempt_id == accepted_id {
                return Ok(Some(existing));
            }
        }

        let attempts = self.ledger.replay(document)?;
        let accepted = attempts
            .iter()
            .find(|attempt| attempt.attempt_id == accepted_id)
            .ok_or_else(|| LedgerError::Corrupt(format!("accepted attempt {accepted_id} missing")))?;
        let signed_payload = match attempts
            .iter()
            .filter(|attempt| attempt.seq <= accepted.seq && attempt.idempotency_key.is_some())
            .rev()
            .find_map(|attempt| attempt.request_hash.as_deref())
        {
            Some(hash) => self.ledger.blob(hash)?.unwrap_or_default(),
            None => Vec::new(),
        };
        let reply = accepted.response.clone().unwrap_or_default();
        let artifact = match accepted.artifact_hash.as_deref() {
            Some(hash) => self.ledger.blob(hash)?,
            None => None,
        };

        let snapshot = self.stored_snapshot(document)?;
        let codec = self.codec(&accepted.codec)?;
        let payload = codec.build(&snapshot)?;
        let pdf = self
            .pdfs
            .source_pdf(&snapshot)
            .map_err(AssemblyError::from)?;
        let assembled = assemble(&PackageParts {
            issuer_tax_id: snapshot.issuer.tax_id().unwrap_or_default(),
            document_number: &snapshot.number,
            authority_ref: status.authority_ref.as_deref().unwrap_or_default(),
            pdf: &pdf,
            payload_name: &payload.filename,
            signed_payload: &signed_payload,
            reply: &reply,
            artifact: artifact.as_deref(),
        })?;

        let stored = self.ledger.store_package(NewPackage {
            document_id: document.clone(),
            attempt_id: accepted_id,
            name: assembled.name,
            bytes: assembled.bytes,
            created_at: self.clock.now(),
        })?;
        info!(document = %document, package = %stored.name, hash = %stored.content_hash, "attached package stored");
        Ok(Some(stored))
    }

    fn reserve(
        &self,
        document: &DocumentId,
        purpose: Purpose,
    ) -> Result<Option<Reservation>, OrchestratorError> {
        let lock_ttl = chrono::Duration::from_std(self.settings.lock_ttl)
            .unwrap_or_else(|_| chrono::Duration::minutes(5));
        Ok(self.ledger.begin(BeginRequest {
            document,
            owner: &self.settings.worker_id,
            purpose,
            at: self.clock.now(),
            lock_ttl,
        })?)
    }

    async fn bounded<F>(
        &self,
        reservation: &Reservation,
        step: F,
    ) -> Result<StepOutcome, OrchestratorError>
    where
        F: Future<Output = Result<StepOutcome, OrchestratorError>>,
    {
        let span = info_span!(
            "document",
            document = %reservation.document_id,
            codec = %reservation.codec,
            seq = reservation.seq,
        );
        match tokio::time::timeout(self.settings.deadline, step)
            .instrument(span)
            .await
        {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    document = %reservation.document_id,
                    seq = reservation.seq,
                    "processing deadline exceeded, reservation handed back"
                );
                self.ledger
                    .abandon(reservation, "processing deadline exceeded", self.clock.now())?;
                Ok(StepOutcome::DeadlineExceeded {
                    seq: reservation.seq,
                })
            }
        }
    }

    async fn submit_reserved(
        &self,
        reservation: &Reservation,
    ) -> Result<StepOutcome, OrchestratorError> {
        let snapshot = self.stored_snapshot(&reservation.document_id)?;
        let codec = self.codec(&reservation.codec)?;
        let descriptor = codec.descriptor();
        let started_at = self.clock.now();
        let history = self.ledger.replay(&reservation.document_id)?;
        let key = submission_key(descriptor, reservation, &history);

        let payload = match codec.build(&snapshot) {
            Ok(payload) => payload,
            Err(error) => {
                warn!(document = %snapshot.id, errors = error.0.len(), "payload preconditions failed");
                let entry = Entry::failure(Origin::Build, error.0);
                return self.finish(reservation, Some(key), started_at, entry);
            }
        };

        let record = match descriptor.credential_kind {
            Some(kind) => self.ledger.current(
                snapshot.issuer.tax_id().unwrap_or_default(),
                descriptor.family,
                kind,
            )?,
            None => None,
        };
        let credential = check_credential(descriptor, &snapshot, record, started_at)
            .and_then(|credential| {
                sign(&payload, descriptor.signature, credential.as_ref(), started_at)
                    .map(|signed| (credential, signed))
            });
        let (credential, signed) = match credential {
            Ok(pair) => pair,
            Err(error) => {
                warn!(document = %snapshot.id, code = error.code(), error = %error, "credential refused");
                let detail = ErrorDetail::new(error.code(), error.to_string());
                let entry = Entry::failure(Origin::Credential, vec![detail]);
                return self.finish(reservation, Some(key), started_at, entry);
            }
        };

        if reservation.resumed || follows_transport_error(&history) {
            match self
                .resolve_unrecorded(codec.as_ref(), &snapshot, &payload, credential.as_ref(), &key)
                .await
            {
                Prior::Found(recovered) => {
                    let entry = recovered
                        .into_entry(&payload)
                        .with_request(signed.bytes.clone(), Vec::new());
                    return self.finish(reservation, Some(key), started_at, entry);
                }
                Prior::Absent => {}
                Prior::Unknown => return self.hand_back(reservation),
            }
        }

        let request = match codec.submit_request(&SubmitContext {
            snapshot: &snapshot,
            payload: &payload,
            signed: &signed,
            credential: credential.as_ref(),
            idempotency_key: &key,
        }) {
            Ok(request) => request,
            Err(error) => {
                let entry = Entry::failure(Origin::Build, error.0);
                return self.finish(reservation, Some(key), started_at, entry);
            }
        };
        let headers = request.redacted_headers(&secret_headers(descriptor));

        let entry = match self
            .transport
            .exchange(&request, descriptor.timeout, &descriptor.retry, |reply| {
                codec.parse_reply(Exchange::Submit, reply)
            })
            .await
        {
            Err(failure) => {
                warn!(document = %snapshot.id, calls = failure.calls, error = %failure, "submission failed in transport");
                Entry::transport(failure.to_string(), DocumentState::Queued, failure.last_body)
            }
            Ok(delivered) => {
                let interpretation = interpret(&delivered.parsed);
                if interpretation.credential_rejected {
                    self.revoke(credential.as_ref());
                }
                let prior = if is_duplicate(&interpretation) {
                    info!(document = %snapshot.id, "authority reports a duplicate, looking it up");
                    self.look_up(codec.as_ref(), &snapshot, &payload, credential.as_ref())
                        .await
                } else {
                    Prior::Absent
                };
                match prior {
                    Prior::Found(recovered) => recovered.into_entry(&payload),
                    Prior::Absent => with_payload_reference(
                        Entry::reply(interpretation, Origin::Authority, delivered.reply.body),
                        &payload,
                    ),
                    Prior::Unknown => return self.hand_back(reservation),
                }
            }
        }
        .with_request(signed.bytes, headers);

        self.finish(reservation, Some(key), started_at, entry)
    }

    async fn poll_reserved(
        &self,
        reservation: &Reservation,
    ) -> Result<StepOutcome, OrchestratorError> {
        let snapshot = self.stored_snapshot(&reservation.document_id)?;
        let codec = self.codec(&reservation.codec)?;
        let descriptor = codec.descriptor();
        let started_at = self.clock.now();
        let status = self.status(&reservation.document_id)?;

        let payload = match codec.build(&snapshot) {
            Ok(payload) => payload,
            Err(error) => {
                self.ledger
                    .abandon(reservation, "stored snapshot no longer builds", started_at)?;
                return Err(error.into());
            }
        };
        let credential = match descriptor.credential_kind {
            Some(kind) => self
                .ledger
                .current(
                    snapshot.issuer.tax_id().unwrap_or_default(),
                    descriptor.family,
                    kind,
                )?
                .filter(|record| record.check(kind, started_at).is_ok()),
            None => None,
        };

        let context = QueryContext {
            snapshot: &snapshot,
            payload: &payload,
            credential: credential.as_ref(),
            tracking_ref: status.tracking_ref.as_deref(),
        };
        let (request, exchange) = match codec.status_request(&context) {
            Some(request) => (request, Exchange::Status),
            None => match codec.lookup_request(&context) {
                Some(request) => (request, Exchange::Lookup),
                None => {
                    self.ledger
                        .abandon(reservation, "codec offers no status query", started_at)?;
                    return Ok(StepOutcome::Skipped);
                }
            },
        };
        let headers = request.redacted_headers(&secret_headers(descriptor));

        let entry = match self
            .transport
            .exchange(&request, descriptor.timeout, &descriptor.retry, |reply| {
                codec.parse_reply(exchange, reply)
            })
            .await
        {
            Err(failure) => {
                warn!(document = %snapshot.id, error = %failure, "status poll failed in transport");
                Entry::transport(
                    failure.to_string(),
                    DocumentState::PendingAuthority,
                    failure.last_body,
                )
            }
            Ok(delivered) => {
                let interpretation = match exchange {
                    Exchange::Lookup => interpret_lookup(&delivered.parsed)
                        .unwrap_or_else(|| not_yet_known(status.tracking_ref.clone())),
                    Exchange::Submit | Exchange::Status => interpret(&delivered.parsed),
                };
                if interpretation.credential_rejected {
                    self.revoke(credential.as_ref());
                }
                with_payload_reference(
                    Entry::reply(interpretation, Origin::Authority, delivered.reply.body),
                    &payload,
                )
            }
        }
        .with_request(request.body, headers);

        self.finish(reservation, None, started_at, entry)
    }

    /// Consults the reply cache, then lookup-by-reference. A cached duplicate
    /// rejection says nothing about the original send, so it is looked up too.
    async fn resolve_unrecorded(
        &self,
        codec: &dyn Codec,
        snapshot: &DocumentSnapshot,
        payload: &Payload,
        credential: Option<&CredentialRecord>,
        key: &str,
    ) -> Prior {
        let lookup_supported = codec.descriptor().lookup_supported;
        match self.transport.replies().recall(key) {
            Ok(Some(reply)) => match codec.parse_reply(Exchange::Submit, &reply) {
                Ok(parsed) => {
                    let interpretation = interpret(&parsed);
                    if !is_duplicate(&interpretation) || !lookup_supported {
                        info!(document = %snapshot.id, key, "reply recovered from cache");
                        return Prior::Found(Recovered {
                            interpretation,
                            reply,
                        });
                    }
                }
                Err(error) => warn!(document = %snapshot.id, error = %error, "cached reply unreadable"),
            },
            Ok(None) => {}
            Err(error) => warn!(document = %snapshot.id, error = %error, "reply cache unavailable"),
        }
        self.look_up(codec, snapshot, payload, credential).await
    }

    /// Asks the authority whether it holds the document under its
    /// reference. Codecs without lookup report `Absent`.
    async fn look_up(
        &self,
        codec: &dyn Codec,
        snapshot: &DocumentSnapshot,
        payload: &Payload,
        credential: Option<&CredentialRecord>,
    ) -> Prior {
        let descriptor = codec.descriptor();
        if !descriptor.lookup_supported {
            return Prior::Absent;
        }
        let Some(request) = codec.lookup_request(&QueryContext {
            snapshot,
            payload,
            credential,
            tracking_ref: None,
        }) else {
            return Prior::Absent;
        };
        match self
            .transport
            .exchange(&request, descriptor.timeout, &descriptor.retry, |reply| {
                codec.parse_reply(Exchange::Lookup, reply)
            })
            .await
        {
            Ok(delivered) => match interpret_lookup(&delivered.parsed) {
                Some(interpretation) => {
                    info!(document = %snapshot.id, outcome = %interpretation.outcome, "authority already holds the document");
                    Prior::Found(Recovered {
                        interpretation,
                        reply: delivered.reply,
                    })
                }
                None => {
                    debug!(document = %snapshot.id, "authority holds no trace of the document");
                    Prior::Absent
                }
            },
            Err(failure) => {
                warn!(document = %snapshot.id, error = %failure, "lookup failed, authority state unknown");
                Prior::Unknown
            }
        }
    }

    /// Returns the reservation so the next pass repeats the lookup under the
    /// same sequence number.
    fn hand_back(&self, reservation: &Reservation) -> Result<StepOutcome, OrchestratorError> {
        self.ledger.abandon(
            reservation,
            "authority state unknown, lookup failed",
            self.clock.now(),
        )?;
        Ok(StepOutcome::Unresolved {
            seq: reservation.seq,
        })
    }

    fn finish(
        &self,
        reservation: &Reservation,
        idempotency_key: Option<String>,
        started_at: DateTime<Utc>,
        entry: Entry,
    ) -> Result<StepOutcome, OrchestratorError> {
        let stored = self.ledger.record(NewAttempt {
            document_id: reservation.document_id.clone(),
            codec: reservation.codec.clone(),
            seq: reservation.seq,
            owner: reservation.owner.clone(),
            idempotency_key,
            started_at,
            finished_at: self.clock.now(),
            request: entry.request,
            request_headers: entry.request_headers,
            response: entry.response,
            artifact: entry.artifact,
            outcome: entry.outcome,
            origin: entry.origin,
            authority_ref: entry.authority_ref,
            tracking_ref: entry.tracking_ref,
            errors: entry.errors,
            next_state: entry.next_state,
        })?;
        info!(
            document = %stored.document_id,
            codec = %stored.codec,
            seq = stored.seq,
            outcome = %stored.outcome,
            state = %stored.to_state,
            "attempt recorded"
        );

        if stored.outcome == Outcome::Accepted {
            if let Err(error) = self.attach_package(&stored.document_id) {
                warn!(document = %stored.document_id, error = %error, "attached package not built");
            }
        }
        Ok(StepOutcome::Recorded(stored))
    }

    fn revoke(&self, credential: Option<&CredentialRecord>) {
        let Some(credential) = credential else {
            return;
        };
        match self.ledger.revoke(credential.id, self.clock.now()) {
            Ok(()) => warn!(credential = credential.id, "authority rejected credential, revoked"),
            Err(error) => warn!(credential = credential.id, error = %error, "credential revocation failed"),
        }
    }

    fn stored_snapshot(&self, document: &DocumentId) -> Result<DocumentSnapshot, OrchestratorError> {
        self.ledger
            .snapshot(document)?
            .ok_or_else(|| OrchestratorError::MissingSnapshot(document.clone()))
    }

    fn codec(&self, id: &CodecId) -> Result<Arc<dyn Codec>, OrchestratorError> {
        self.registry
            .get(id)
            .ok_or_else(|| OrchestratorError::UnknownCodec(id.clone()))
    }
}

/// Last keyed attempt, when it ended in a transport error: the authority may
/// or may not have received it.
fn unconfirmed_send(history: &[SubmissionAttempt]) -> Option<&SubmissionAttempt> {
    history
        .iter()
        .rev()
        .find(|attempt| attempt.idempotency_key.is_some())
        .filter(|attempt| attempt.outcome == Outcome::TransportError)
}

fn follows_transport_error(history: &[SubmissionAttempt]) -> bool {
    unconfirmed_send(history).is_some()
}

fn is_duplicate(interpretation: &Interpretation) -> bool {
    interpretation.outcome == Outcome::Rejected
        && interpretation
            .errors
            .iter()
            .any(|error| error.code == DUPLICATE_REFERENCE)
}

/// Key for the reserved attempt. A retry after a transport error keeps the
/// previous key so the authority can collapse duplicates.
fn submission_key(
    descriptor: &CodecDescriptor,
    reservation: &Reservation,
    history: &[SubmissionAttempt],
) -> String {
    unconfirmed_send(history)
        .and_then(|attempt| attempt.idempotency_key.clone())
        .unwrap_or_else(|| {
            descriptor
                .idempotency
                .derive(&reservation.document_id, &reservation.codec, reservation.seq)
        })
}

/// The credential must be valid both when the document was issued and now.
fn check_credential(
    descriptor: &CodecDescriptor,
    snapshot: &DocumentSnapshot,
    record: Option<CredentialRecord>,
    now: DateTime<Utc>,
) -> Result<Option<CredentialRecord>, SignError> {
    let Some(kind) = descriptor.credential_kind else {
        return Ok(None);
    };
    let record = record.ok_or_else(|| SignError::CredentialMissing {
        issuer: snapshot.issuer.tax_id().unwrap_or_default().to_string(),
        scope: descriptor.family.to_string(),
        kind,
    })?;
    record.check(kind, snapshot.issued_at.with_timezone(&Utc))?;
    record.check(kind, now)?;
    Ok(Some(record))
}

fn secret_headers(descriptor: &CodecDescriptor) -> Vec<&'static str> {
    match descriptor.authentication {
        AuthenticationMode::ApiKey { header } => vec![header],
        _ => Vec::new(),
    }
}

/// Acceptances that do not echo a reference fall back to the one derived from
/// the payload.
fn with_payload_reference(mut entry: Entry, payload: &Payload) -> Entry {
    if entry.outcome == Outcome::Accepted && entry.authority_ref.is_none() {
        entry.authority_ref = payload.authority_ref.clone();
    }
    entry
}

fn not_yet_known(tracking_ref: Option<String>) -> Interpretation {
    Interpretation {
        outcome: Outcome::PendingAuthority,
        authority_ref: None,
        tracking_ref,
        errors: vec![ErrorDetail::new("NOT_FOUND", "authority holds no record yet")],
        artifact: None,
        credential_rejected: false,
    }
}
