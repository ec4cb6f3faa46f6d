use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use fiscal_pipeline::document::{Currency, DocumentSnapshot};
use fiscal_pipeline::pipeline::clock::{Clock, SystemClock};
use fiscal_pipeline::pipeline::credential::{CredentialKind, CredentialStore, NewCredential};
use fiscal_pipeline::pipeline::transport::{
    AuthorityChannel, ChannelError, ExchangeReply, ExchangeRequest, IdempotencyStore,
    TransportAdapter,
};
use fiscal_pipeline::pipeline::{
    CodecEndpoints, CodecRegistry, DocumentState, FiscalOrchestrator, OrchestratorSettings,
    PostOutcome, Resolution, SqliteLedger, StaticPdf, StepOutcome,
};

const FIXTURE: &str = include_str!("fixtures/co_invoice.json");

/// Authority that accepts whatever it receives under the given CUFE.
#[derive(Debug)]
struct AcceptingDian {
    cufe: String,
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl AuthorityChannel for AcceptingDian {
    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeReply, ChannelError> {
        self.seen
            .lock()
            .expect("seen mutex")
            .push(request.url.clone());
        let body = format!(
            "<s:Envelope><s:Body><SendBillSyncResponse><SendBillSyncResult>\
             <b:IsValid>true</b:IsValid><b:StatusCode>00</b:StatusCode>\
             <b:StatusDescription>Procesado Correctamente.</b:StatusDescription>\
             <b:XmlDocumentKey>{}</b:XmlDocumentKey>\
             </SendBillSyncResult></SendBillSyncResponse></s:Body></s:Envelope>",
            self.cufe
        );
        Ok(ExchangeReply::new(200, body))
    }
}

struct TempLedger(PathBuf);

impl TempLedger {
    fn new(name: &str) -> Self {
        let dir = std::env::temp_dir()
            .join(format!("fiscal-ledger-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).expect("temp dir");
        Self(dir.join("ledger.db"))
    }
}

impl Drop for TempLedger {
    fn drop(&mut self) {
        if let Some(dir) = self.0.parent() {
            std::fs::remove_dir_all(dir).ok();
        }
    }
}

fn snapshot() -> DocumentSnapshot {
    serde_json::from_str(FIXTURE).expect("fixture parses")
}

fn registry() -> Arc<CodecRegistry> {
    let endpoints = CodecEndpoints::new().with("co-dian", "http://dian.test");
    Arc::new(CodecRegistry::standard(&endpoints).expect("standard catalog"))
}

fn orchestrator(
    ledger: Arc<SqliteLedger>,
    channel: Arc<dyn AuthorityChannel>,
    worker: &str,
) -> FiscalOrchestrator<SqliteLedger, StaticPdf> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = TransportAdapter::new(
        channel,
        Arc::clone(&ledger) as Arc<dyn IdempotencyStore>,
        Arc::clone(&clock),
    );
    FiscalOrchestrator::new(
        registry(),
        ledger,
        transport,
        Arc::new(StaticPdf(b"%PDF-1.7 integration".to_vec())),
        clock,
        OrchestratorSettings {
            worker_id: worker.to_string(),
            ..OrchestratorSettings::default()
        },
    )
}

fn register_signing_key(ledger: &SqliteLedger) {
    ledger
        .register(
            NewCredential {
                issuer_tax_id: "900123456".to_string(),
                scope: "co-dian".to_string(),
                kind: CredentialKind::SigningKey,
                secret: (1..=32).collect(),
                certificate: b"-----BEGIN CERTIFICATE-----".to_vec(),
                not_before: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
                not_after: Utc.with_ymd_and_hms(2099, 12, 31, 0, 0, 0).unwrap(),
            },
            Utc::now(),
        )
        .expect("credential registers");
}

#[test]
fn json_snapshots_carry_engine_totals() {
    let snapshot = snapshot();
    assert_eq!(snapshot.lines.len(), 2);
    assert_eq!(snapshot.issuer.registration("dian.technical_key"), Some("tech-key-1"));

    let Resolution::Codec(codec) = registry().resolve_snapshot(&snapshot) else {
        panic!("Colombian invoices have a codec");
    };
    assert_eq!(codec.descriptor().id.to_string(), "CO:invoice:production");
    let payload = codec.build(&snapshot).expect("fixture builds");
    assert_eq!(payload.totals.net_minor, 22_000);
    assert_eq!(payload.totals.tax_minor, 4_180);
    assert_eq!(payload.authority_ref.as_deref().map(str::len), Some(96));
}

#[tokio::test]
async fn accepted_state_survives_a_restart() {
    let path = TempLedger::new("restart");
    let snapshot = snapshot();
    let Resolution::Codec(codec) = registry().resolve_snapshot(&snapshot) else {
        panic!("Colombian invoices have a codec");
    };
    let cufe = codec
        .build(&snapshot)
        .expect("fixture builds")
        .authority_ref
        .expect("CUFE");
    let channel = Arc::new(AcceptingDian {
        cufe: cufe.clone(),
        seen: Mutex::new(Vec::new()),
    });

    {
        let ledger = Arc::new(SqliteLedger::open(&path.0).expect("ledger opens"));
        register_signing_key(&ledger);
        let first = orchestrator(ledger, channel.clone(), "worker-a");
        assert!(matches!(
            first.post(&snapshot).expect("post"),
            PostOutcome::Queued(_)
        ));
        let outcome = first.process(&snapshot.id).await.expect("process");
        assert!(matches!(outcome, StepOutcome::Recorded(_)));
    }

    let ledger = Arc::new(SqliteLedger::open(&path.0).expect("ledger reopens"));
    let second = orchestrator(ledger, channel.clone(), "worker-b");
    let status = second.status(&snapshot.id).expect("status survives");
    assert_eq!(status.state, DocumentState::Accepted);
    assert_eq!(status.authority_ref.as_deref(), Some(cufe.as_str()));

    let PostOutcome::AlreadyAccepted { authority_ref } = second.post(&snapshot).expect("repost") else {
        panic!("accepted documents are not queued again");
    };
    assert_eq!(authority_ref, Some(cufe.clone()));

    let attempts = second.attempts(&snapshot.id).expect("replay");
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].seq, 1);

    let (package, bytes) = second
        .package(&snapshot.id)
        .expect("package lookup")
        .expect("package attached");
    assert_eq!(package.name, format!("900123456_SETP990000042_{cufe}.zip"));
    assert!(bytes.starts_with(b"PK"));

    let seen = channel.seen.lock().expect("seen mutex");
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("http://dian.test"));
}

#[tokio::test]
async fn documents_outside_the_catalog_are_never_sent() {
    let mut snapshot = snapshot();
    snapshot.issuer.country_code = "US".to_string();
    snapshot.currency = Currency::new("USD");
    assert!(matches!(
        registry().resolve_snapshot(&snapshot),
        Resolution::NotApplicable
    ));

    let channel = Arc::new(AcceptingDian {
        cufe: String::new(),
        seen: Mutex::new(Vec::new()),
    });
    let ledger = Arc::new(SqliteLedger::in_memory().expect("ledger opens"));
    let pipeline = orchestrator(ledger, channel.clone(), "worker-a");

    let PostOutcome::NotSent(status) = pipeline.post(&snapshot).expect("post") else {
        panic!("no codec means no submission");
    };
    assert_eq!(status.state, DocumentState::NotSent);
    assert!(matches!(
        pipeline.process(&snapshot.id).await.expect("process"),
        StepOutcome::Skipped
    ));
    assert!(channel.seen.lock().expect("seen mutex").is_empty());
}
