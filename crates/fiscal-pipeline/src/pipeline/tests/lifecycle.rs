use super::common::*;
use std::time::Duration;

use crate::document::{DocumentId, DocumentKind, DocumentSnapshot, SourceReference};
use crate::pipeline::codec::Resolution;
use crate::pipeline::interpreter::DUPLICATE_REFERENCE;
use crate::pipeline::ledger::{DocumentState, LedgerStore, Origin, Outcome};
use crate::pipeline::orchestrator::{
    OrchestratorError, OrchestratorSettings, PostOutcome, StepOutcome, TRANSPORT_ERROR,
};
use crate::pipeline::transport::{ChannelError, ExchangeReply, ExchangeRequest};

fn cufe(harness: &Harness, snapshot: &DocumentSnapshot) -> String {
    let Resolution::Codec(codec) = harness.orchestrator.registry().resolve_snapshot(snapshot) else {
        panic!("DIAN codec resolves");
    };
    codec
        .build(snapshot)
        .expect("builds")
        .authority_ref
        .expect("CUFE derived")
}

fn accepted(harness: &Harness, snapshot: &DocumentSnapshot) -> ExchangeReply {
    ExchangeReply::new(200, dian_accepted_reply(&cufe(harness, snapshot)))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

fn is_lookup(request: &ExchangeRequest) -> bool {
    String::from_utf8_lossy(&request.body).contains("GetStatus")
}

fn recorded(outcome: StepOutcome) -> crate::pipeline::ledger::SubmissionAttempt {
    match outcome {
        StepOutcome::Recorded(attempt) => attempt,
        other => panic!("expected a recorded attempt, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn synchronous_acceptance_is_recorded_and_packaged() {
    let harness = Harness::new(Vec::new());
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    let cufe = cufe(&harness, &snapshot);
    harness.channel.push(Ok(accepted(&harness, &snapshot)));

    let posted = harness.orchestrator.post(&snapshot).expect("post");
    assert!(matches!(posted, PostOutcome::Queued(_)));

    let attempt = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(attempt.seq, 1);
    assert_eq!(attempt.outcome, Outcome::Accepted);
    assert_eq!(attempt.origin, Origin::Authority);
    assert_eq!(attempt.authority_ref.as_deref(), Some(cufe.as_str()));
    assert!(attempt
        .idempotency_key
        .as_deref()
        .is_some_and(|key| key.starts_with("co-")));
    assert!(attempt.request_hash.is_some());
    let artifact_hash = attempt.artifact_hash.clone().expect("ApplicationResponse kept");
    let artifact = harness
        .ledger
        .blob(&artifact_hash)
        .expect("blob lookup")
        .expect("artifact stored");
    assert!(String::from_utf8_lossy(&artifact).starts_with("<ApplicationResponse>"));

    let status = harness.orchestrator.status(&snapshot.id).expect("status");
    assert_eq!(status.state, DocumentState::Accepted);
    assert_eq!(status.authority_ref.as_deref(), Some(cufe.as_str()));

    let (package, bytes) = harness
        .orchestrator
        .package(&snapshot.id)
        .expect("package lookup")
        .expect("package attached");
    assert_eq!(package.name, format!("900123456_SETP990000001_{cufe}.zip"));
    assert_eq!(package.attempt_id, attempt.attempt_id);
    assert!(bytes.starts_with(b"PK"));
    assert!(contains(&bytes, b"authority_artifact.xml"));
    assert!(contains(&bytes, &artifact));

    let transitions: Vec<_> = harness
        .ledger
        .transitions(&snapshot.id)
        .expect("transitions")
        .into_iter()
        .map(|transition| (transition.from, transition.to))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (DocumentState::NotSent, DocumentState::Queued),
            (DocumentState::Queued, DocumentState::Submitting),
            (DocumentState::Submitting, DocumentState::Accepted),
        ]
    );
    assert_eq!(harness.channel.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn accepted_documents_are_locked_from_edits() {
    let harness = Harness::new(Vec::new());
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    harness.channel.push(Ok(accepted(&harness, &snapshot)));
    harness.orchestrator.post(&snapshot).expect("post");
    harness.orchestrator.process(&snapshot.id).await.expect("process");

    let again = harness.orchestrator.post(&snapshot).expect("repost");
    let PostOutcome::AlreadyAccepted { authority_ref } = again else {
        panic!("expected no-op, got {again:?}");
    };
    assert_eq!(authority_ref, Some(cufe(&harness, &snapshot)));

    let mut edited = snapshot.clone();
    edited.lines[0].unit_price_minor = 20_000;
    assert!(matches!(
        harness.orchestrator.post(&edited),
        Err(OrchestratorError::LockedAfterAcceptance(_))
    ));
    assert_eq!(harness.channel.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn documents_without_a_codec_are_not_sent() {
    let harness = Harness::new(Vec::new());
    let mut snapshot = sample_snapshot();
    snapshot.issuer.country_code = "US".to_string();

    let posted = harness.orchestrator.post(&snapshot).expect("post");
    let PostOutcome::NotSent(status) = posted else {
        panic!("expected not_sent, got {posted:?}");
    };
    assert_eq!(status.state, DocumentState::NotSent);
    assert_eq!(
        harness.orchestrator.process(&snapshot.id).await.expect("process"),
        StepOutcome::Skipped
    );
}

#[tokio::test(start_paused = true)]
async fn build_failures_reject_without_touching_the_network() {
    let harness = Harness::new(Vec::new());
    harness.register(&signing_credential());
    let mut broken = sample_snapshot();
    broken.issuer.registrations.clear();
    harness.orchestrator.post(&broken).expect("post");

    let attempt = recorded(harness.orchestrator.process(&broken.id).await.expect("process"));
    assert_eq!(attempt.outcome, Outcome::Rejected);
    assert_eq!(attempt.origin, Origin::Build);
    assert_eq!(
        attempt.errors[0].field.as_deref(),
        Some("issuer.registrations.dian.technical_key")
    );
    assert_eq!(harness.channel.calls(), 0);
    assert_eq!(
        harness.orchestrator.status(&broken.id).expect("status").state,
        DocumentState::Rejected
    );

    let fixed = sample_snapshot();
    harness.channel.push(Ok(accepted(&harness, &fixed)));
    assert!(matches!(
        harness.orchestrator.post(&fixed).expect("repost"),
        PostOutcome::Queued(_)
    ));
    let attempt = recorded(harness.orchestrator.process(&fixed.id).await.expect("process"));
    assert_eq!(attempt.seq, 2);
    assert_eq!(attempt.outcome, Outcome::Accepted);
}

#[tokio::test(start_paused = true)]
async fn missing_credentials_stop_before_signing() {
    let harness = Harness::new(Vec::new());
    let snapshot = sample_snapshot();
    harness.orchestrator.post(&snapshot).expect("post");

    let attempt = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(attempt.outcome, Outcome::Rejected);
    assert_eq!(attempt.origin, Origin::Credential);
    assert_eq!(attempt.errors[0].code, "CREDENTIAL_MISSING");
    assert_eq!(harness.channel.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_inside_one_attempt() {
    let harness = Harness::new(vec![
        Err(ChannelError::Timeout),
        Ok(ExchangeReply::new(503, "Service Unavailable")),
    ]);
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    harness.channel.push(Ok(accepted(&harness, &snapshot)));
    harness.orchestrator.post(&snapshot).expect("post");

    let attempt = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(attempt.outcome, Outcome::Accepted);
    assert_eq!(attempt.seq, 1);
    assert!(attempt.finished_at - attempt.started_at >= chrono::Duration::seconds(5));
    assert_eq!(harness.channel.calls(), 3);

    let keys: Vec<_> = harness
        .channel
        .requests()
        .into_iter()
        .map(|request| request.idempotency_key)
        .collect();
    assert!(keys.windows(2).all(|pair| pair[0] == pair[1]));
}

#[tokio::test(start_paused = true)]
async fn exhausted_transport_requeues_and_the_next_attempt_reuses_the_key() {
    let harness = Harness::new(vec![
        Err(ChannelError::Timeout),
        Err(ChannelError::Network("connection reset".to_string())),
        Ok(ExchangeReply::new(502, "Bad Gateway")),
        Err(ChannelError::Timeout),
    ]);
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    harness.orchestrator.post(&snapshot).expect("post");

    let failed = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(failed.outcome, Outcome::TransportError);
    assert_eq!(failed.origin, Origin::Transport);
    assert_eq!(failed.errors[0].code, TRANSPORT_ERROR);
    assert_eq!(
        harness.orchestrator.status(&snapshot.id).expect("status").state,
        DocumentState::Queued
    );

    harness
        .channel
        .push(Ok(ExchangeReply::new(200, dian_not_found_reply())));
    harness.channel.push(Ok(accepted(&harness, &snapshot)));
    let retried = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(retried.seq, 2);
    assert_eq!(retried.outcome, Outcome::Accepted);
    assert_eq!(retried.origin, Origin::Authority);
    assert_eq!(retried.idempotency_key, failed.idempotency_key);

    let requests = harness.channel.requests();
    assert_eq!(requests.len(), 6);
    assert!(is_lookup(&requests[4]));
    assert!(!is_lookup(&requests[5]));
    assert_eq!(requests[5].idempotency_key, failed.idempotency_key);
}

#[tokio::test(start_paused = true)]
async fn a_send_lost_in_transport_is_looked_up_before_resending() {
    let harness = Harness::new(vec![
        Err(ChannelError::Timeout),
        Err(ChannelError::Timeout),
        Err(ChannelError::Timeout),
        Err(ChannelError::Timeout),
    ]);
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    let cufe = cufe(&harness, &snapshot);
    harness.orchestrator.post(&snapshot).expect("post");
    let failed = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(failed.outcome, Outcome::TransportError);

    // The authority did get the first send; it answers the lookup with it.
    harness.channel.push(Ok(accepted(&harness, &snapshot)));
    let found = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(found.seq, 2);
    assert_eq!(found.outcome, Outcome::Accepted);
    assert_eq!(found.origin, Origin::Recovered);
    assert_eq!(found.authority_ref.as_deref(), Some(cufe.as_str()));
    assert_eq!(found.idempotency_key, failed.idempotency_key);

    let requests = harness.channel.requests();
    assert_eq!(requests.len(), 5);
    assert!(is_lookup(&requests[4]));
    assert_eq!(
        harness.orchestrator.status(&snapshot.id).expect("status").state,
        DocumentState::Accepted
    );
    assert!(harness.orchestrator.package(&snapshot.id).expect("lookup").is_some());
}

#[tokio::test(start_paused = true)]
async fn a_duplicate_on_resend_resolves_to_the_earlier_acceptance() {
    let harness = Harness::new(vec![Err(ChannelError::Timeout); 4]);
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    harness.orchestrator.post(&snapshot).expect("post");
    recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));

    // Lookup misses (authority still indexing), the resend is refused as a
    // duplicate, and the second lookup finds the acceptance.
    harness
        .channel
        .push(Ok(ExchangeReply::new(200, dian_not_found_reply())));
    harness
        .channel
        .push(Ok(ExchangeReply::new(200, dian_duplicate_reply())));
    harness.channel.push(Ok(accepted(&harness, &snapshot)));

    let attempt = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(attempt.seq, 2);
    assert_eq!(attempt.outcome, Outcome::Accepted);
    assert_eq!(attempt.origin, Origin::Recovered);
    assert!(attempt.errors.is_empty());

    let requests = harness.channel.requests();
    assert_eq!(requests.len(), 7);
    assert!(is_lookup(&requests[6]));
    let status = harness.orchestrator.status(&snapshot.id).expect("status");
    assert_eq!(status.state, DocumentState::Accepted);
}

#[tokio::test(start_paused = true)]
async fn zero_amount_credit_notes_go_through() {
    let harness = Harness::new(Vec::new());
    harness.register(&signing_credential());
    let mut note = sample_snapshot();
    note.id = DocumentId("NCSETP1".to_string());
    note.number = "NC1".to_string();
    note.kind = DocumentKind::CreditNote;
    note.lines = vec![line("Anulacion descuento", 1, 0, 1_900)];
    note.tax_totals[0].base_minor = 0;
    note.tax_totals[0].tax_minor = 0;
    note.issuer
        .registrations
        .insert("dian.software_pin".to_string(), "75315".to_string());
    note.source = Some(SourceReference {
        number: "SETP990000001".to_string(),
        issued_on: posting_time().date_naive(),
        authority_ref: Some("a".repeat(96)),
    });

    let Resolution::Codec(codec) = harness.orchestrator.registry().resolve_snapshot(&note) else {
        panic!("DIAN credit note codec resolves");
    };
    let payload = codec.build(&note).expect("zero-amount note builds");
    assert_eq!(payload.totals.net_minor, 0);
    assert_eq!(payload.totals.tax_minor, 0);
    let cude = payload.authority_ref.expect("CUDE derived");
    harness
        .channel
        .push(Ok(ExchangeReply::new(200, dian_accepted_reply(&cude))));

    harness.orchestrator.post(&note).expect("post");
    let attempt = recorded(harness.orchestrator.process(&note.id).await.expect("process"));
    assert_eq!(attempt.outcome, Outcome::Accepted);
    assert_eq!(attempt.authority_ref.as_deref(), Some(cude.as_str()));
    assert_eq!(harness.channel.calls(), 1);
    assert_eq!(
        harness.orchestrator.status(&note.id).expect("status").state,
        DocumentState::Accepted
    );
}

#[tokio::test(start_paused = true)]
async fn authority_rejection_preserves_the_duplicate_code() {
    let harness = Harness::new(vec![
        Ok(ExchangeReply::new(200, dian_duplicate_reply())),
        Ok(ExchangeReply::new(200, dian_not_found_reply())),
    ]);
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    harness.orchestrator.post(&snapshot).expect("post");

    let attempt = recorded(harness.orchestrator.process(&snapshot.id).await.expect("process"));
    assert_eq!(harness.channel.calls(), 2);
    assert_eq!(attempt.outcome, Outcome::Rejected);
    assert_eq!(attempt.origin, Origin::Authority);
    assert_eq!(attempt.errors[0].code, DUPLICATE_REFERENCE);
    assert!(attempt.errors[0].message.contains("Regla: 90"));
    assert!(attempt.response.is_some());

    let status = harness.orchestrator.status(&snapshot.id).expect("status");
    assert_eq!(status.state, DocumentState::Rejected);
    assert_eq!(status.errors[0].code, DUPLICATE_REFERENCE);
    assert!(harness.orchestrator.package(&snapshot.id).expect("lookup").is_none());

    let cancelled = harness
        .orchestrator
        .cancel(&snapshot.id, "issued on paper")
        .expect("cancel");
    assert_eq!(cancelled.state, DocumentState::Cancelled);
}

#[tokio::test(start_paused = true)]
async fn accepted_documents_cannot_be_cancelled() {
    let harness = Harness::new(Vec::new());
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    harness.channel.push(Ok(accepted(&harness, &snapshot)));
    harness.orchestrator.post(&snapshot).expect("post");
    harness.orchestrator.process(&snapshot.id).await.expect("process");

    assert!(harness.orchestrator.cancel(&snapshot.id, "too late").is_err());
}

#[tokio::test(start_paused = true)]
async fn deadline_expiry_hands_the_reservation_back() {
    let harness = Harness::with_settings(
        Vec::new(),
        OrchestratorSettings {
            deadline: Duration::from_secs(10),
            ..OrchestratorSettings::default()
        },
    );
    harness.register(&signing_credential());
    let snapshot = sample_snapshot();
    harness.orchestrator.post(&snapshot).expect("post");

    // Every call fails and backs off, so the retry budget outlives the deadline.
    let outcome = harness.orchestrator.process(&snapshot.id).await.expect("process");
    assert_eq!(outcome, StepOutcome::DeadlineExceeded { seq: 1 });

    let status = harness.orchestrator.status(&snapshot.id).expect("status");
    assert_eq!(status.state, DocumentState::Queued);
    assert_eq!(status.reserved_seq, Some(1));
    assert!(harness.orchestrator.attempts(&snapshot.id).expect("attempts").is_empty());
}
