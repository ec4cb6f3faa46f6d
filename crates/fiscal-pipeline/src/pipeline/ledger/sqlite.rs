use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use sha2::{Digest, Sha256};

use crate::document::{DocumentId, DocumentSnapshot};
use crate::pipeline::codec::CodecId;
use crate::pipeline::credential::{CredentialKind, CredentialRecord, CredentialStore, NewCredential};
use crate::pipeline::interpreter::ErrorDetail;
use crate::pipeline::transport::{ExchangeReply, IdempotencyStore};

use super::{
    AttachedPackage, BeginRequest, DocumentState, DocumentStatus, IssuedDocument, LedgerError,
    LedgerStore, NewAttempt, NewPackage, Origin, Outcome, Purpose, QueueOutcome, Reservation,
    StatusTransition, SubmissionAttempt,
};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const STATUS_COLUMNS: &str = "s.document_id, s.state, s.codec_id, s.snapshot_hash, \
     s.authority_ref, s.tracking_ref, s.errors, s.accepted_attempt, s.last_seq, \
     s.reserved_seq, s.last_exchange_at, s.updated_at";

const ATTEMPT_COLUMNS: &str = "attempt_id, document_id, codec_id, seq, idempotency_key, \
     started_at, finished_at, request_hash, request_headers, response, outcome, origin, \
     authority_ref, tracking_ref, errors, from_state, to_state, artifact_hash";

const CREDENTIAL_COLUMNS: &str =
    "id, issuer_tax_id, scope, kind, secret, certificate, not_before, not_after, revoked_at";

/// SQLite-backed ledger. One connection guarded by a mutex; every write runs in
/// its own transaction.
#[derive(Clone)]
pub struct SqliteLedger {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger").finish_non_exhaustive()
    }
}

impl SqliteLedger {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::Poisoned)
    }
}

impl LedgerStore for SqliteLedger {
    fn queue_snapshot(
        &self,
        snapshot: &DocumentSnapshot,
        codec: &CodecId,
        at: DateTime<Utc>,
    ) -> Result<QueueOutcome, LedgerError> {
        let hash = snapshot.content_hash();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = load_status(&tx, &snapshot.id)?;

        let outcome = match current {
            Some(status) if status.state == DocumentState::Accepted => {
                if status.snapshot_hash.as_deref() == Some(hash.as_str()) {
                    QueueOutcome::AlreadyAccepted {
                        authority_ref: status.authority_ref,
                    }
                } else {
                    QueueOutcome::LockedAfterAcceptance
                }
            }
            Some(status)
                if matches!(
                    status.state,
                    DocumentState::Submitting | DocumentState::PendingAuthority
                ) =>
            {
                QueueOutcome::InFlight(status)
            }
            Some(status)
                if status.state == DocumentState::Queued
                    && (status.reserved_seq.is_some()
                        || status.snapshot_hash.as_deref() == Some(hash.as_str())) =>
            {
                QueueOutcome::InFlight(status)
            }
            current => {
                store_snapshot(&tx, snapshot, &hash, at)?;
                let from = current.as_ref().map(|status| status.state);
                let mut status =
                    current.unwrap_or_else(|| fresh_status(snapshot.id.clone(), at));
                status.state = DocumentState::Queued;
                status.codec = Some(codec.clone());
                status.snapshot_hash = Some(hash);
                status.tracking_ref = None;
                status.errors.clear();
                status.updated_at = at;
                write_status(&tx, &status)?;
                let reason = match from {
                    Some(DocumentState::Queued) => None,
                    Some(_) => Some("snapshot re-posted"),
                    None => Some("snapshot posted"),
                };
                if let Some(reason) = reason {
                    log_transition(
                        &tx,
                        &StatusTransition {
                            document_id: status.document_id.clone(),
                            from: from.unwrap_or(DocumentState::NotSent),
                            to: DocumentState::Queued,
                            at,
                            reason: reason.to_string(),
                            attempt_id: None,
                        },
                    )?;
                }
                QueueOutcome::Queued(status)
            }
        };
        tx.commit()?;
        Ok(outcome)
    }

    fn mark_not_sent(
        &self,
        snapshot: &DocumentSnapshot,
        at: DateTime<Utc>,
    ) -> Result<DocumentStatus, LedgerError> {
        let hash = snapshot.content_hash();
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let current = load_status(&tx, &snapshot.id)?;
        if let Some(status) = &current {
            if !matches!(
                status.state,
                DocumentState::NotSent | DocumentState::Rejected | DocumentState::Cancelled
            ) {
                return Ok(status.clone());
            }
        }

        store_snapshot(&tx, snapshot, &hash, at)?;
        let from = current.as_ref().map(|status| status.state);
        let mut status = current.unwrap_or_else(|| fresh_status(snapshot.id.clone(), at));
        status.state = DocumentState::NotSent;
        status.codec = None;
        status.snapshot_hash = Some(hash);
        status.updated_at = at;
        write_status(&tx, &status)?;
        if let Some(from) = from.filter(|from| *from != DocumentState::NotSent) {
            log_transition(
                &tx,
                &StatusTransition {
                    document_id: status.document_id.clone(),
                    from,
                    to: DocumentState::NotSent,
                    at,
                    reason: "no codec applies".to_string(),
                    attempt_id: None,
                },
            )?;
        }
        tx.commit()?;
        Ok(status)
    }

    fn status(&self, document: &DocumentId) -> Result<Option<DocumentStatus>, LedgerError> {
        let conn = self.lock()?;
        load_status(&conn, document)
    }

    fn snapshot(&self, document: &DocumentId) -> Result<Option<DocumentSnapshot>, LedgerError> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT d.body FROM document_status s \
                 JOIN document_snapshot d \
                   ON d.document_id = s.document_id AND d.content_hash = s.snapshot_hash \
                 WHERE s.document_id = ?1",
                params![document.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        body.map(|body| serde_json::from_str(&body).map_err(LedgerError::from))
            .transpose()
    }

    fn begin(&self, request: BeginRequest<'_>) -> Result<Option<Reservation>, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let Some(mut status) = load_status(&tx, request.document)? else {
            return Ok(None);
        };
        let Some(codec) = status.codec.clone() else {
            return Ok(None);
        };
        let fits = match request.purpose {
            Purpose::Submit => status.state == DocumentState::Queued,
            Purpose::FollowUp => status.state == DocumentState::PendingAuthority,
            Purpose::Recover => status.state == DocumentState::Submitting,
        };
        if !fits || !acquire_lock(&tx, &request)? {
            return Ok(None);
        }

        let (seq, resumed) = match (request.purpose, status.reserved_seq) {
            (Purpose::FollowUp, _) => (status.last_seq + 1, false),
            (_, Some(seq)) => (seq, true),
            (_, None) => (status.last_seq + 1, false),
        };
        let from_state = status.state;
        status.reserved_seq = Some(seq);
        status.updated_at = request.at;
        if request.purpose == Purpose::Submit {
            status.state = DocumentState::Submitting;
            log_transition(
                &tx,
                &StatusTransition {
                    document_id: status.document_id.clone(),
                    from: from_state,
                    to: DocumentState::Submitting,
                    at: request.at,
                    reason: format!("attempt {seq} started by {}", request.owner),
                    attempt_id: None,
                },
            )?;
        }
        write_status(&tx, &status)?;
        tx.commit()?;

        Ok(Some(Reservation {
            document_id: status.document_id,
            codec,
            seq,
            owner: request.owner.to_string(),
            from_state,
            resumed,
        }))
    }

    fn record(&self, attempt: NewAttempt) -> Result<SubmissionAttempt, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut status = load_status(&tx, &attempt.document_id)?
            .ok_or_else(|| LedgerError::UnknownDocument(attempt.document_id.clone()))?;

        if status.state == DocumentState::Accepted {
            return Err(LedgerError::InvalidTransition {
                document: attempt.document_id,
                from: status.state,
                to: attempt.next_state,
            });
        }
        let follows = match status.reserved_seq {
            Some(reserved) => reserved == attempt.seq,
            None => attempt.seq == status.last_seq + 1,
        };
        if !follows {
            return Err(LedgerError::SequenceConflict {
                document: attempt.document_id,
                expected: status.reserved_seq,
                found: attempt.seq,
            });
        }
        if attempt.outcome == Outcome::Accepted && status.accepted_attempt.is_some() {
            return Err(LedgerError::DuplicateAcceptance {
                document: attempt.document_id,
                codec: attempt.codec,
            });
        }

        let request_hash = attempt
            .request
            .as_deref()
            .map(|bytes| store_blob(&tx, bytes, attempt.finished_at))
            .transpose()?;
        let artifact_hash = attempt
            .artifact
            .as_deref()
            .map(|bytes| store_blob(&tx, bytes, attempt.finished_at))
            .transpose()?;
        let started_at = attempt.started_at.min(attempt.finished_at);
        let attempt_id = SubmissionAttempt::attempt_id(&attempt.document_id, attempt.seq);
        let stored = SubmissionAttempt {
            attempt_id: attempt_id.clone(),
            document_id: attempt.document_id.clone(),
            codec: attempt.codec.clone(),
            seq: attempt.seq,
            idempotency_key: attempt.idempotency_key.clone(),
            started_at,
            finished_at: attempt.finished_at,
            request_hash,
            request_headers: attempt.request_headers.clone(),
            response: attempt.response.clone(),
            artifact_hash,
            outcome: attempt.outcome,
            origin: attempt.origin,
            authority_ref: attempt.authority_ref.clone(),
            tracking_ref: attempt.tracking_ref.clone(),
            errors: attempt.errors.clone(),
            from_state: status.state,
            to_state: attempt.next_state,
        };
        insert_attempt(&tx, &stored)?;

        let from = status.state;
        status.state = attempt.next_state;
        status.last_seq = attempt.seq;
        status.reserved_seq = None;
        if attempt.authority_ref.is_some() {
            status.authority_ref = attempt.authority_ref.clone();
        }
        if attempt.next_state == DocumentState::PendingAuthority {
            if attempt.tracking_ref.is_some() {
                status.tracking_ref = attempt.tracking_ref.clone();
            }
        } else {
            status.tracking_ref = None;
        }
        status.errors = if attempt.outcome == Outcome::Accepted {
            Vec::new()
        } else {
            attempt.errors.clone()
        };
        if attempt.outcome == Outcome::Accepted {
            status.accepted_attempt = Some(attempt_id.clone());
        }
        status.last_exchange_at = Some(attempt.finished_at);
        status.updated_at = attempt.finished_at;
        write_status(&tx, &status)?;

        if from != attempt.next_state {
            log_transition(
                &tx,
                &StatusTransition {
                    document_id: status.document_id.clone(),
                    from,
                    to: attempt.next_state,
                    at: attempt.finished_at,
                    reason: format!("attempt {}: {}", attempt.seq, attempt.outcome),
                    attempt_id: Some(attempt_id),
                },
            )?;
        }
        tx.execute(
            "DELETE FROM document_lock WHERE document_id = ?1 AND owner = ?2",
            params![attempt.document_id.as_str(), attempt.owner],
        )?;
        tx.commit()?;
        Ok(stored)
    }

    fn abandon(
        &self,
        reservation: &Reservation,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut status = load_status(&tx, &reservation.document_id)?
            .ok_or_else(|| LedgerError::UnknownDocument(reservation.document_id.clone()))?;

        match status.state {
            DocumentState::Submitting => {
                status.state = DocumentState::Queued;
                status.updated_at = at;
                write_status(&tx, &status)?;
                log_transition(
                    &tx,
                    &StatusTransition {
                        document_id: status.document_id.clone(),
                        from: DocumentState::Submitting,
                        to: DocumentState::Queued,
                        at,
                        reason: reason.to_string(),
                        attempt_id: None,
                    },
                )?;
            }
            DocumentState::PendingAuthority => {
                status.reserved_seq = None;
                status.updated_at = at;
                write_status(&tx, &status)?;
            }
            _ => {}
        }
        tx.execute(
            "DELETE FROM document_lock WHERE document_id = ?1 AND owner = ?2",
            params![reservation.document_id.as_str(), reservation.owner],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn cancel(
        &self,
        document: &DocumentId,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<DocumentStatus, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut status = load_status(&tx, document)?
            .ok_or_else(|| LedgerError::UnknownDocument(document.clone()))?;

        let live_lock: Option<String> = tx
            .query_row(
                "SELECT owner FROM document_lock WHERE document_id = ?1 AND expires_at > ?2",
                params![document.as_str(), millis(at)],
                |row| row.get(0),
            )
            .optional()?;
        let allowed = match status.state {
            DocumentState::Rejected => true,
            DocumentState::NotSent | DocumentState::Queued | DocumentState::PendingAuthority => {
                status.accepted_attempt.is_none()
                    && status.reserved_seq.is_none()
                    && live_lock.is_none()
            }
            DocumentState::Submitting | DocumentState::Accepted | DocumentState::Cancelled => {
                false
            }
        };
        if !allowed {
            return Err(LedgerError::InvalidTransition {
                document: document.clone(),
                from: status.state,
                to: DocumentState::Cancelled,
            });
        }

        let from = status.state;
        status.state = DocumentState::Cancelled;
        status.tracking_ref = None;
        status.updated_at = at;
        write_status(&tx, &status)?;
        log_transition(
            &tx,
            &StatusTransition {
                document_id: document.clone(),
                from,
                to: DocumentState::Cancelled,
                at,
                reason: reason.to_string(),
                attempt_id: None,
            },
        )?;
        tx.commit()?;
        Ok(status)
    }

    fn replay(&self, document: &DocumentId) -> Result<Vec<SubmissionAttempt>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ATTEMPT_COLUMNS} FROM submission_attempt \
             WHERE document_id = ?1 ORDER BY seq"
        ))?;
        let rows = stmt
            .query_map(params![document.as_str()], AttemptRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(AttemptRow::into_attempt).collect()
    }

    fn transitions(&self, document: &DocumentId) -> Result<Vec<StatusTransition>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT document_id, from_state, to_state, at, reason, attempt_id \
             FROM status_transition WHERE document_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![document.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(document_id, from, to, at, reason, attempt_id)| {
                Ok(StatusTransition {
                    document_id: DocumentId(document_id),
                    from: parse_state(&from)?,
                    to: parse_state(&to)?,
                    at: from_millis(at)?,
                    reason,
                    attempt_id,
                })
            })
            .collect()
    }

    fn documents_in(
        &self,
        state: DocumentState,
        limit: usize,
    ) -> Result<Vec<DocumentStatus>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATUS_COLUMNS} FROM document_status s \
             WHERE s.state = ?1 ORDER BY s.updated_at, s.document_id LIMIT ?2"
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt
            .query_map(params![state.as_str(), limit], StatusRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StatusRow::into_status).collect()
    }

    fn stale_submissions(&self, now: DateTime<Utc>) -> Result<Vec<DocumentStatus>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATUS_COLUMNS} FROM document_status s \
             LEFT JOIN document_lock l ON l.document_id = s.document_id \
             WHERE s.state = 'submitting' AND (l.expires_at IS NULL OR l.expires_at <= ?1) \
             ORDER BY s.updated_at, s.document_id"
        ))?;
        let rows = stmt
            .query_map(params![millis(now)], StatusRow::read)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(StatusRow::into_status).collect()
    }

    fn store_package(&self, package: NewPackage) -> Result<AttachedPackage, LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let content_hash = store_blob(&tx, &package.bytes, package.created_at)?;
        let size = package.bytes.len() as u64;
        tx.execute(
            "INSERT OR REPLACE INTO attached_document \
             (attempt_id, document_id, name, content_hash, size, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                package.attempt_id,
                package.document_id.as_str(),
                package.name,
                content_hash,
                i64::try_from(size).unwrap_or(i64::MAX),
                millis(package.created_at),
            ],
        )?;
        tx.commit()?;
        Ok(AttachedPackage {
            document_id: package.document_id,
            attempt_id: package.attempt_id,
            name: package.name,
            content_hash,
            size,
            created_at: package.created_at,
        })
    }

    fn package(&self, document: &DocumentId) -> Result<Option<AttachedPackage>, LedgerError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT document_id, attempt_id, name, content_hash, size, created_at \
                 FROM attached_document WHERE document_id = ?1 \
                 ORDER BY created_at DESC LIMIT 1",
                params![document.as_str()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(document_id, attempt_id, name, content_hash, size, created_at)| {
            Ok(AttachedPackage {
                document_id: DocumentId(document_id),
                attempt_id,
                name,
                content_hash,
                size: u64::try_from(size)
                    .map_err(|_| LedgerError::Corrupt(format!("package size {size}")))?,
                created_at: from_millis(created_at)?,
            })
        })
        .transpose()
    }

    fn blob(&self, hash: &str) -> Result<Option<Vec<u8>>, LedgerError> {
        let conn = self.lock()?;
        let bytes = conn
            .query_row(
                "SELECT bytes FROM payload_blob WHERE content_hash = ?1",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }

    fn issued_between(
        &self,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<IssuedDocument>, LedgerError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {STATUS_COLUMNS}, d.body FROM document_status s \
             JOIN document_snapshot d \
               ON d.document_id = s.document_id AND d.content_hash = s.snapshot_hash \
             WHERE s.state IN ('accepted', 'pending_authority') \
               AND d.issued_on BETWEEN ?1 AND ?2 \
             ORDER BY d.issued_on, s.document_id"
        ))?;
        let rows = stmt
            .query_map(params![from.to_string(), to.to_string()], |row| {
                Ok((StatusRow::read(row)?, row.get::<_, String>(12)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter()
            .map(|(status, body)| {
                Ok(IssuedDocument {
                    status: status.into_status()?,
                    snapshot: serde_json::from_str(&body)?,
                })
            })
            .collect()
    }
}

impl CredentialStore for SqliteLedger {
    fn register(
        &self,
        credential: NewCredential,
        at: DateTime<Utc>,
    ) -> Result<CredentialRecord, LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO credential \
             (issuer_tax_id, scope, kind, secret, certificate, not_before, not_after, registered_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                credential.issuer_tax_id,
                credential.scope,
                credential.kind.as_str(),
                credential.secret,
                credential.certificate,
                millis(credential.not_before),
                millis(credential.not_after),
                millis(at),
            ],
        )?;
        Ok(CredentialRecord {
            id: conn.last_insert_rowid(),
            issuer_tax_id: credential.issuer_tax_id,
            scope: credential.scope,
            kind: credential.kind,
            secret: credential.secret,
            certificate: credential.certificate,
            not_before: credential.not_before,
            not_after: credential.not_after,
            revoked_at: None,
        })
    }

    fn current(
        &self,
        issuer_tax_id: &str,
        scope: &str,
        kind: CredentialKind,
    ) -> Result<Option<CredentialRecord>, LedgerError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!(
                    "SELECT {CREDENTIAL_COLUMNS} FROM credential \
                     WHERE issuer_tax_id = ?1 AND scope = ?2 AND kind = ?3 \
                     ORDER BY revoked_at IS NOT NULL, id DESC LIMIT 1"
                ),
                params![issuer_tax_id, scope, kind.as_str()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Vec<u8>>(4)?,
                        row.get::<_, Vec<u8>>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, Option<i64>>(8)?,
                    ))
                },
            )
            .optional()?;
        row.map(
            |(id, issuer_tax_id, scope, kind, secret, certificate, not_before, not_after, revoked)| {
                Ok(CredentialRecord {
                    id,
                    issuer_tax_id,
                    scope,
                    kind: CredentialKind::parse(&kind)
                        .ok_or_else(|| LedgerError::Corrupt(format!("credential kind {kind}")))?,
                    secret,
                    certificate,
                    not_before: from_millis(not_before)?,
                    not_after: from_millis(not_after)?,
                    revoked_at: revoked.map(from_millis).transpose()?,
                })
            },
        )
        .transpose()
    }

    fn revoke(&self, id: i64, at: DateTime<Utc>) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE credential SET revoked_at = COALESCE(revoked_at, ?2) WHERE id = ?1",
            params![id, millis(at)],
        )?;
        if changed == 0 {
            return Err(LedgerError::UnknownCredential(id));
        }
        Ok(())
    }
}

impl IdempotencyStore for SqliteLedger {
    fn remember(
        &self,
        key: &str,
        reply: &ExchangeReply,
        received_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let headers = serde_json::to_string(&reply.headers)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO idempotency_reply \
             (idempotency_key, status, headers, body, received_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![key, reply.status, headers, reply.body, millis(received_at)],
        )?;
        Ok(())
    }

    fn recall(&self, key: &str) -> Result<Option<ExchangeReply>, LedgerError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT status, headers, body FROM idempotency_reply WHERE idempotency_key = ?1",
                params![key],
                |row| {
                    Ok((
                        row.get::<_, u16>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(status, headers, body)| {
            Ok(ExchangeReply {
                status,
                headers: serde_json::from_str(&headers)?,
                body,
            })
        })
        .transpose()
    }
}

struct StatusRow {
    document_id: String,
    state: String,
    codec_id: Option<String>,
    snapshot_hash: Option<String>,
    authority_ref: Option<String>,
    tracking_ref: Option<String>,
    errors: String,
    accepted_attempt: Option<String>,
    last_seq: u32,
    reserved_seq: Option<u32>,
    last_exchange_at: Option<i64>,
    updated_at: i64,
}

impl StatusRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            document_id: row.get(0)?,
            state: row.get(1)?,
            codec_id: row.get(2)?,
            snapshot_hash: row.get(3)?,
            authority_ref: row.get(4)?,
            tracking_ref: row.get(5)?,
            errors: row.get(6)?,
            accepted_attempt: row.get(7)?,
            last_seq: row.get(8)?,
            reserved_seq: row.get(9)?,
            last_exchange_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_status(self) -> Result<DocumentStatus, LedgerError> {
        Ok(DocumentStatus {
            document_id: DocumentId(self.document_id),
            state: parse_state(&self.state)?,
            codec: self.codec_id.as_deref().map(parse_codec).transpose()?,
            snapshot_hash: self.snapshot_hash,
            authority_ref: self.authority_ref,
            tracking_ref: self.tracking_ref,
            errors: serde_json::from_str(&self.errors)?,
            accepted_attempt: self.accepted_attempt,
            last_seq: self.last_seq,
            reserved_seq: self.reserved_seq,
            last_exchange_at: self.last_exchange_at.map(from_millis).transpose()?,
            updated_at: from_millis(self.updated_at)?,
        })
    }
}

struct AttemptRow {
    attempt_id: String,
    document_id: String,
    codec_id: String,
    seq: u32,
    idempotency_key: Option<String>,
    started_at: i64,
    finished_at: i64,
    request_hash: Option<String>,
    request_headers: String,
    response: Option<Vec<u8>>,
    outcome: String,
    origin: String,
    authority_ref: Option<String>,
    tracking_ref: Option<String>,
    errors: String,
    from_state: String,
    to_state: String,
    artifact_hash: Option<String>,
}

impl AttemptRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            attempt_id: row.get(0)?,
            document_id: row.get(1)?,
            codec_id: row.get(2)?,
            seq: row.get(3)?,
            idempotency_key: row.get(4)?,
            started_at: row.get(5)?,
            finished_at: row.get(6)?,
            request_hash: row.get(7)?,
            request_headers: row.get(8)?,
            response: row.get(9)?,
            outcome: row.get(10)?,
            origin: row.get(11)?,
            authority_ref: row.get(12)?,
            tracking_ref: row.get(13)?,
            errors: row.get(14)?,
            from_state: row.get(15)?,
            to_state: row.get(16)?,
            artifact_hash: row.get(17)?,
        })
    }

    fn into_attempt(self) -> Result<SubmissionAttempt, LedgerError> {
        Ok(SubmissionAttempt {
            attempt_id: self.attempt_id,
            document_id: DocumentId(self.document_id),
            codec: parse_codec(&self.codec_id)?,
            seq: self.seq,
            idempotency_key: self.idempotency_key,
            started_at: from_millis(self.started_at)?,
            finished_at: from_millis(self.finished_at)?,
            request_hash: self.request_hash,
            request_headers: serde_json::from_str(&self.request_headers)?,
            response: self.response,
            artifact_hash: self.artifact_hash,
            outcome: Outcome::parse(&self.outcome)
                .ok_or_else(|| LedgerError::Corrupt(format!("outcome {}", self.outcome)))?,
            origin: Origin::parse(&self.origin)
                .ok_or_else(|| LedgerError::Corrupt(format!("origin {}", self.origin)))?,
            authority_ref: self.authority_ref,
            tracking_ref: self.tracking_ref,
            errors: serde_json::from_str::<Vec<ErrorDetail>>(&self.errors)?,
            from_state: parse_state(&self.from_state)?,
            to_state: parse_state(&self.to_state)?,
        })
    }
}

fn fresh_status(document_id: DocumentId, at: DateTime<Utc>) -> DocumentStatus {
    DocumentStatus {
        document_id,
        state: DocumentState::NotSent,
        codec: None,
        snapshot_hash: None,
        authority_ref: None,
        tracking_ref: None,
        errors: Vec::new(),
        accepted_attempt: None,
        last_seq: 0,
        reserved_seq: None,
        last_exchange_at: None,
        updated_at: at,
    }
}

fn load_status(
    conn: &Connection,
    document: &DocumentId,
) -> Result<Option<DocumentStatus>, LedgerError> {
    let row = conn
        .query_row(
            &format!("SELECT {STATUS_COLUMNS} FROM document_status s WHERE s.document_id = ?1"),
            params![document.as_str()],
            StatusRow::read,
        )
        .optional()?;
    row.map(StatusRow::into_status).transpose()
}

fn write_status(tx: &Transaction<'_>, status: &DocumentStatus) -> Result<(), LedgerError> {
    let errors = serde_json::to_string(&status.errors)?;
    tx.execute(
        "INSERT INTO document_status \
         (document_id, state, codec_id, snapshot_hash, authority_ref, tracking_ref, errors, \
          accepted_attempt, last_seq, reserved_seq, last_exchange_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
         ON CONFLICT(document_id) DO UPDATE SET \
           state = excluded.state, codec_id = excluded.codec_id, \
           snapshot_hash = excluded.snapshot_hash, authority_ref = excluded.authority_ref, \
           tracking_ref = excluded.tracking_ref, errors = excluded.errors, \
           accepted_attempt = excluded.accepted_attempt, last_seq = excluded.last_seq, \
           reserved_seq = excluded.reserved_seq, last_exchange_at = excluded.last_exchange_at, \
           updated_at = excluded.updated_at",
        params![
            status.document_id.as_str(),
            status.state.as_str(),
            status.codec.as_ref().map(ToString::to_string),
            status.snapshot_hash,
            status.authority_ref,
            status.tracking_ref,
            errors,
            status.accepted_attempt,
            status.last_seq,
            status.reserved_seq,
            status.last_exchange_at.map(millis),
            millis(status.updated_at),
        ],
    )?;
    Ok(())
}

fn log_transition(tx: &Transaction<'_>, transition: &StatusTransition) -> Result<(), LedgerError> {
    tx.execute(
        "INSERT INTO status_transition (document_id, from_state, to_state, at, reason, attempt_id) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            transition.document_id.as_str(),
            transition.from.as_str(),
            transition.to.as_str(),
            millis(transition.at),
            transition.reason,
            transition.attempt_id,
        ],
    )?;
    Ok(())
}

fn insert_attempt(tx: &Transaction<'_>, attempt: &SubmissionAttempt) -> Result<(), LedgerError> {
    let headers = serde_json::to_string(&attempt.request_headers)?;
    let errors = serde_json::to_string(&attempt.errors)?;
    tx.execute(
        &format!(
            "INSERT INTO submission_attempt ({ATTEMPT_COLUMNS}) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)"
        ),
        params![
            attempt.attempt_id,
            attempt.document_id.as_str(),
            attempt.codec.to_string(),
            attempt.seq,
            attempt.idempotency_key,
            millis(attempt.started_at),
            millis(attempt.finished_at),
            attempt.request_hash,
            headers,
            attempt.response,
            attempt.outcome.as_str(),
            attempt.origin.as_str(),
            attempt.authority_ref,
            attempt.tracking_ref,
            errors,
            attempt.from_state.as_str(),
            attempt.to_state.as_str(),
            attempt.artifact_hash,
        ],
    )?;
    Ok(())
}

fn store_snapshot(
    tx: &Transaction<'_>,
    snapshot: &DocumentSnapshot,
    hash: &str,
    at: DateTime<Utc>,
) -> Result<(), LedgerError> {
    let body = serde_json::to_string(snapshot)?;
    tx.execute(
        "INSERT OR IGNORE INTO document_snapshot (document_id, content_hash, issued_on, body, stored_at) \
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            snapshot.id.as_str(),
            hash,
            snapshot.issue_date().to_string(),
            body,
            millis(at),
        ],
    )?;
    Ok(())
}

/// Content-addressed insert; returns the SHA-256 key.
fn store_blob(tx: &Transaction<'_>, bytes: &[u8], at: DateTime<Utc>) -> Result<String, LedgerError> {
    let hash = hex::encode(Sha256::digest(bytes));
    tx.execute(
        "INSERT OR IGNORE INTO payload_blob (content_hash, bytes, stored_at) VALUES (?1, ?2, ?3)",
        params![hash, bytes, millis(at)],
    )?;
    Ok(hash)
}

/// Takes or refreshes the advisory lock; fails only against a live lock held
/// by someone else.
fn acquire_lock(tx: &Transaction<'_>, request: &BeginRequest<'_>) -> Result<bool, LedgerError> {
    let holder: Option<(String, i64)> = tx
        .query_row(
            "SELECT owner, expires_at FROM document_lock WHERE document_id = ?1",
            params![request.document.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let now = millis(request.at);
    if let Some((owner, expires_at)) = holder {
        if owner != request.owner && expires_at > now {
            return Ok(false);
        }
    }
    tx.execute(
        "INSERT INTO document_lock (document_id, owner, acquired_at, expires_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(document_id) DO UPDATE SET \
           owner = excluded.owner, acquired_at = excluded.acquired_at, \
           expires_at = excluded.expires_at",
        params![
            request.document.as_str(),
            request.owner,
            now,
            now.saturating_add(request.lock_ttl.num_milliseconds()),
        ],
    )?;
    Ok(true)
}

fn parse_state(raw: &str) -> Result<DocumentState, LedgerError> {
    DocumentState::parse(raw).ok_or_else(|| LedgerError::Corrupt(format!("state {raw}")))
}

fn parse_codec(raw: &str) -> Result<CodecId, LedgerError> {
    raw.parse()
        .map_err(|err: crate::pipeline::codec::CodecIdError| LedgerError::Corrupt(err.to_string()))
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(raw: i64) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::<Utc>::from_timestamp_millis(raw)
        .ok_or_else(|| LedgerError::Corrupt(format!("timestamp {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::DocumentKind;
    use crate::pipeline::tests::common::sample_snapshot;
    use chrono::{Duration, TimeZone};

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, 15, minute, 0).unwrap()
    }

    fn codec() -> CodecId {
        CodecId::new("CO", DocumentKind::Invoice, "production")
    }

    fn begin(
        ledger: &SqliteLedger,
        document: &DocumentId,
        owner: &str,
        purpose: Purpose,
        when: DateTime<Utc>,
    ) -> Option<Reservation> {
        ledger
            .begin(BeginRequest {
                document,
                owner,
                purpose,
                at: when,
                lock_ttl: Duration::minutes(5),
            })
            .unwrap()
    }

    fn attempt(reservation: &Reservation, outcome: Outcome, next: DocumentState) -> NewAttempt {
        NewAttempt {
            document_id: reservation.document_id.clone(),
            codec: reservation.codec.clone(),
            seq: reservation.seq,
            owner: reservation.owner.clone(),
            idempotency_key: Some(format!("key-{}", reservation.seq)),
            started_at: at(1),
            finished_at: at(2),
            request: Some(b"<Invoice/>".to_vec()),
            request_headers: vec![("Content-Type".to_string(), "application/xml".to_string())],
            response: Some(b"ok".to_vec()),
            artifact: None,
            outcome,
            origin: Origin::Authority,
            authority_ref: (outcome == Outcome::Accepted).then(|| "CUFE-1".to_string()),
            tracking_ref: None,
            errors: Vec::new(),
            next_state: next,
        }
    }

    #[test]
    fn accepted_attempt_updates_projection_and_transition_log() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        let queued = ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        assert!(matches!(queued, QueueOutcome::Queued(_)));

        let reservation = begin(&ledger, &snapshot.id, "worker-a", Purpose::Submit, at(1)).unwrap();
        assert_eq!(reservation.seq, 1);
        assert!(!reservation.resumed);

        let stored = ledger
            .record(attempt(&reservation, Outcome::Accepted, DocumentState::Accepted))
            .unwrap();
        assert_eq!(stored.attempt_id, format!("{}#1", snapshot.id));
        assert_eq!(stored.from_state, DocumentState::Submitting);

        let status = ledger.status(&snapshot.id).unwrap().unwrap();
        assert_eq!(status.state, DocumentState::Accepted);
        assert_eq!(status.authority_ref.as_deref(), Some("CUFE-1"));
        assert_eq!(status.accepted_attempt, Some(stored.attempt_id.clone()));
        assert_eq!(status.reserved_seq, None);

        let states: Vec<_> = ledger
            .transitions(&snapshot.id)
            .unwrap()
            .into_iter()
            .map(|transition| (transition.from, transition.to))
            .collect();
        assert_eq!(
            states,
            vec![
                (DocumentState::NotSent, DocumentState::Queued),
                (DocumentState::Queued, DocumentState::Submitting),
                (DocumentState::Submitting, DocumentState::Accepted),
            ]
        );

        let request_hash = stored.request_hash.unwrap();
        assert_eq!(ledger.blob(&request_hash).unwrap().unwrap(), b"<Invoice/>");
        assert_eq!(stored.artifact_hash, None);
        assert_eq!(ledger.snapshot(&snapshot.id).unwrap(), Some(snapshot));
    }

    #[test]
    fn authority_artifacts_are_stored_as_blobs() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        let mut accepted = attempt(&reservation, Outcome::Accepted, DocumentState::Accepted);
        accepted.artifact = Some(b"<ApplicationResponse/>".to_vec());

        let stored = ledger.record(accepted).unwrap();
        let artifact_hash = stored.artifact_hash.clone().expect("artifact hash");
        assert_eq!(
            ledger.blob(&artifact_hash).unwrap().unwrap(),
            b"<ApplicationResponse/>"
        );
        let replayed = ledger.replay(&snapshot.id).unwrap();
        assert_eq!(replayed[0].artifact_hash, Some(artifact_hash));
    }

    #[test]
    fn reposting_after_acceptance_never_requeues() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        ledger
            .record(attempt(&reservation, Outcome::Accepted, DocumentState::Accepted))
            .unwrap();

        assert_eq!(
            ledger.queue_snapshot(&snapshot, &codec(), at(3)).unwrap(),
            QueueOutcome::AlreadyAccepted {
                authority_ref: Some("CUFE-1".to_string())
            }
        );
        let mut edited = snapshot.clone();
        edited.number.push('X');
        assert_eq!(
            ledger.queue_snapshot(&edited, &codec(), at(3)).unwrap(),
            QueueOutcome::LockedAfterAcceptance
        );
        assert_eq!(ledger.replay(&snapshot.id).unwrap().len(), 1);
    }

    #[test]
    fn second_acceptance_for_same_document_is_refused() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        ledger
            .record(attempt(&reservation, Outcome::PendingAuthority, DocumentState::PendingAuthority))
            .unwrap();
        let poll = begin(&ledger, &snapshot.id, "w", Purpose::FollowUp, at(2)).unwrap();
        assert_eq!(poll.seq, 2);
        let mut accepted = attempt(&poll, Outcome::Accepted, DocumentState::Accepted);
        accepted.started_at = at(3);
        accepted.finished_at = at(3);
        ledger.record(accepted).unwrap();

        let mut again = attempt(&poll, Outcome::Accepted, DocumentState::Accepted);
        again.seq = 3;
        assert!(matches!(
            ledger.record(again),
            Err(LedgerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn attempts_out_of_sequence_are_refused() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        let mut skipped = attempt(&reservation, Outcome::Rejected, DocumentState::Rejected);
        skipped.seq = 5;
        assert!(matches!(
            ledger.record(skipped),
            Err(LedgerError::SequenceConflict {
                expected: Some(1),
                found: 5,
                ..
            })
        ));
    }

    #[test]
    fn live_lock_blocks_other_owners_until_it_expires() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let first = begin(&ledger, &snapshot.id, "worker-a", Purpose::Submit, at(1)).unwrap();

        assert!(begin(&ledger, &snapshot.id, "worker-b", Purpose::Recover, at(2)).is_none());
        assert!(ledger.stale_submissions(at(2)).unwrap().is_empty());

        let stale = ledger.stale_submissions(at(10)).unwrap();
        assert_eq!(stale.len(), 1);
        let stolen = begin(&ledger, &snapshot.id, "worker-b", Purpose::Recover, at(10)).unwrap();
        assert_eq!(stolen.seq, first.seq);
        assert!(stolen.resumed);
    }

    #[test]
    fn abandoned_reservation_is_resumed_with_same_seq() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        ledger
            .abandon(&reservation, "deadline expired", at(2))
            .unwrap();

        let status = ledger.status(&snapshot.id).unwrap().unwrap();
        assert_eq!(status.state, DocumentState::Queued);
        assert_eq!(status.reserved_seq, Some(1));
        assert!(matches!(
            ledger.cancel(&snapshot.id, "operator", at(3)),
            Err(LedgerError::InvalidTransition { .. })
        ));

        let resumed = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(3)).unwrap();
        assert_eq!(resumed.seq, 1);
        assert!(resumed.resumed);
    }

    #[test]
    fn rejected_documents_can_be_cancelled_or_requeued() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        let mut rejected = attempt(&reservation, Outcome::Rejected, DocumentState::Rejected);
        rejected.errors = vec![ErrorDetail::new("FAD06", "bad cufe")];
        ledger.record(rejected).unwrap();

        let mut fixed = snapshot.clone();
        fixed.number = "SETP990000002".to_string();
        let requeued = ledger.queue_snapshot(&fixed, &codec(), at(4)).unwrap();
        let QueueOutcome::Queued(status) = requeued else {
            panic!("expected requeue, got {requeued:?}");
        };
        assert!(status.errors.is_empty());
        assert_eq!(status.last_seq, 1);

        let cancelled = ledger.cancel(&snapshot.id, "voided upstream", at(5)).unwrap();
        assert_eq!(cancelled.state, DocumentState::Cancelled);
    }

    #[test]
    fn append_only_tables_refuse_updates_and_deletes() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        ledger
            .record(attempt(&reservation, Outcome::Rejected, DocumentState::Rejected))
            .unwrap();

        let conn = ledger.lock().unwrap();
        assert!(conn
            .execute("UPDATE submission_attempt SET outcome = 'accepted'", [])
            .is_err());
        assert!(conn.execute("DELETE FROM submission_attempt", []).is_err());
        assert!(conn.execute("DELETE FROM status_transition", []).is_err());
    }

    #[test]
    fn credentials_prefer_unrevoked_records() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let template = NewCredential {
            issuer_tax_id: "900123456".to_string(),
            scope: "co-dian".to_string(),
            kind: CredentialKind::SigningKey,
            secret: vec![7; 32],
            certificate: Vec::new(),
            not_before: at(0),
            not_after: at(0) + Duration::days(365),
        };
        let old = ledger.register(template.clone(), at(0)).unwrap();
        let new = ledger.register(template, at(1)).unwrap();
        ledger.revoke(new.id, at(2)).unwrap();

        let current = ledger
            .current("900123456", "co-dian", CredentialKind::SigningKey)
            .unwrap()
            .unwrap();
        assert_eq!(current.id, old.id);
        assert!(matches!(
            ledger.revoke(999, at(3)),
            Err(LedgerError::UnknownCredential(999))
        ));
    }

    #[test]
    fn cached_replies_survive_for_recovery() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let mut reply = ExchangeReply::new(200, b"<ok/>".to_vec());
        reply.headers.push(("X-Trace".to_string(), "abc".to_string()));
        ledger.remember("key-1", &reply, at(0)).unwrap();
        assert_eq!(ledger.recall("key-1").unwrap(), Some(reply));
        assert_eq!(ledger.recall("key-2").unwrap(), None);
    }

    #[test]
    fn issued_between_counts_pending_and_accepted_only() {
        let ledger = SqliteLedger::in_memory().unwrap();
        let snapshot = sample_snapshot();
        ledger.queue_snapshot(&snapshot, &codec(), at(0)).unwrap();
        let day = snapshot.issue_date();
        assert!(ledger.issued_between(day, day).unwrap().is_empty());

        let reservation = begin(&ledger, &snapshot.id, "w", Purpose::Submit, at(1)).unwrap();
        ledger
            .record(attempt(&reservation, Outcome::PendingAuthority, DocumentState::PendingAuthority))
            .unwrap();
        let issued = ledger.issued_between(day, day).unwrap();
        assert_eq!(issued.len(), 1);
        assert_eq!(issued[0].snapshot, snapshot);
    }
}
