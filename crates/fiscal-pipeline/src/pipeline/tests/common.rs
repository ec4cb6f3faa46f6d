use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, FixedOffset, NaiveDate, TimeZone, Utc};

use crate::document::{
    Address, Currency, DocumentId, DocumentKind, DocumentLine, DocumentReferences,
    DocumentSnapshot, IdentificationScheme, LineTax, Party, PaymentInstruction, Quantity, TaxRate,
    TaxScheme, TaxTotal,
};
use crate::pipeline::assembler::StaticPdf;
use crate::pipeline::clock::TokioClock;
use crate::pipeline::codec::{
    AuthenticationMode, CodecDescriptor, CodecEndpoints, CodecId, CodecRegistry,
    CounterpartyField, Endpoints, IdempotencyKeyFormat, SignConvention,
};
use crate::pipeline::credential::{CredentialKind, CredentialRecord, CredentialStore, NewCredential};
use crate::pipeline::ledger::{LedgerError, SqliteLedger};
use crate::pipeline::orchestrator::{FiscalOrchestrator, OrchestratorSettings};
use crate::pipeline::payload::RoundingStrategy;
use crate::pipeline::signer::SignatureMode;
use crate::pipeline::transport::{
    AuthorityChannel, ChannelError, ExchangeReply, ExchangeRequest, IdempotencyStore,
    RetryPolicy, TransportAdapter,
};

pub(crate) const PDF: &[u8] = b"%PDF-1.7 fixture";

fn at(raw: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(raw).expect("fixture timestamp")
}

fn utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

/// Wall clock shared by the scenario harness: the afternoon the sample
/// documents are posted.
pub(crate) fn posting_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 15, 15, 30, 0).unwrap()
}

fn vat_total(rate: u32, base_minor: i64, tax_minor: i64) -> TaxTotal {
    TaxTotal {
        scheme: TaxScheme::Vat,
        rate: TaxRate(rate),
        base_minor,
        tax_minor,
    }
}

fn party(name: &str, tax_id: Option<&str>, scheme: IdentificationScheme, country: &str) -> Party {
    Party {
        name: name.to_string(),
        tax_id: tax_id.map(str::to_string),
        scheme,
        country_code: country.to_string(),
        address: None,
        email: None,
        registrations: BTreeMap::new(),
    }
}

fn address(street: &str, city: &str, postal_code: &str, country: &str) -> Address {
    Address {
        street: street.to_string(),
        city: city.to_string(),
        region: None,
        postal_code: Some(postal_code.to_string()),
        country_code: country.to_string(),
    }
}

/// VAT line without classification, priced in minor units.
pub(crate) fn line(description: &str, units: i64, unit_price_minor: i64, rate: u32) -> DocumentLine {
    DocumentLine {
        description: description.to_string(),
        quantity: Quantity::units(units),
        unit_price_minor,
        discount_minor: 0,
        taxes: vec![LineTax {
            scheme: TaxScheme::Vat,
            rate: TaxRate(rate),
            exemption_code: None,
        }],
        classification_code: None,
        product_code: None,
        unit_code: None,
    }
}

/// Colombian invoice: one line of 100.00 COP at 19%.
pub(crate) fn sample_snapshot() -> DocumentSnapshot {
    let mut issuer = party(
        "Ferreteria Andina SAS",
        Some("900123456"),
        IdentificationScheme::TaxRegistry,
        "CO",
    );
    issuer.address = Some(address("Calle 10 # 5-20", "Bogota", "110111", "CO"));
    issuer
        .registrations
        .insert("dian.technical_key".to_string(), "tech-key-1".to_string());

    DocumentSnapshot {
        id: DocumentId("SETP990000001".to_string()),
        kind: DocumentKind::Invoice,
        number: "SETP990000001".to_string(),
        profile: None,
        issuer,
        counterparty: party(
            "Constructora Los Andes",
            Some("800765432"),
            IdentificationScheme::TaxRegistry,
            "CO",
        ),
        currency: Currency::new("COP"),
        issued_at: at("2024-03-15T10:00:00-05:00"),
        due_date: None,
        lines: vec![line("Martillo", 1, 10_000, 1_900)],
        tax_totals: vec![vat_total(1_900, 10_000, 1_900)],
        source: None,
        references: DocumentReferences::default(),
        payment: None,
        fiscal_lock_date: None,
    }
}

/// Kenyan cash sale to an unregistered buyer: 1000.00 KES at 16%.
pub(crate) fn kenyan_sale() -> DocumentSnapshot {
    let mut issuer = party(
        "Nairobi Hardware Ltd",
        Some("P051234567X"),
        IdentificationScheme::TaxRegistry,
        "KE",
    );
    issuer
        .registrations
        .insert("etims.branch_id".to_string(), "00".to_string());

    let mut item = line("Cement 50kg", 1, 100_000, 1_600);
    item.classification_code = Some("5020230500".to_string());

    DocumentSnapshot {
        id: DocumentId("KE-INV-1042".to_string()),
        kind: DocumentKind::Invoice,
        number: "KE/2024/1042".to_string(),
        profile: None,
        issuer,
        counterparty: party("Walk-in customer", None, IdentificationScheme::NationalId, "KE"),
        currency: Currency::new("KES"),
        issued_at: at("2024-03-15T10:00:00+03:00"),
        due_date: None,
        lines: vec![item],
        tax_totals: vec![vat_total(1_600, 100_000, 16_000)],
        source: None,
        references: DocumentReferences::default(),
        payment: None,
        fiscal_lock_date: None,
    }
}

/// Italian B2B invoice to a recipient with an SdI code: 100.00 EUR at 22%.
pub(crate) fn italian_invoice() -> DocumentSnapshot {
    let mut issuer = party(
        "Officina Rossi S.r.l.",
        Some("01234567890"),
        IdentificationScheme::VatNumber,
        "IT",
    );
    issuer.address = Some(address("Via Roma 1", "Milano", "20121", "IT"));

    let mut counterparty = party(
        "Bianchi Costruzioni S.p.A.",
        Some("09876543210"),
        IdentificationScheme::VatNumber,
        "IT",
    );
    counterparty.address = Some(address("Corso Italia 8", "Torino", "10121", "IT"));
    counterparty
        .registrations
        .insert("sdi.recipient_code".to_string(), "ABC1234".to_string());

    DocumentSnapshot {
        id: DocumentId("IT-FT-2024-017".to_string()),
        kind: DocumentKind::Invoice,
        number: "2024-017".to_string(),
        profile: None,
        issuer,
        counterparty,
        currency: Currency::new("EUR"),
        issued_at: at("2024-03-15T10:00:00+01:00"),
        due_date: None,
        lines: vec![line("Manutenzione impianto", 1, 10_000, 2_200)],
        tax_totals: vec![vat_total(2_200, 10_000, 2_200)],
        source: None,
        references: DocumentReferences::default(),
        payment: None,
        fiscal_lock_date: None,
    }
}

/// Receipt collected by Ri.Ba.: 122.00 EUR due on 30 April 2024.
pub(crate) fn riba_receipt() -> DocumentSnapshot {
    let mut issuer = party(
        "Officina Rossi S.r.l.",
        Some("01234567890"),
        IdentificationScheme::VatNumber,
        "IT",
    );
    issuer.address = Some(address("Via Roma 1", "Milano", "20121", "IT"));
    for (key, value) in [
        ("riba.sia_code", "A1B2C"),
        ("riba.abi", "03069"),
        ("riba.cab", "09400"),
        ("riba.account", "000012345678"),
    ] {
        issuer.registrations.insert(key.to_string(), value.to_string());
    }

    let mut counterparty = party(
        "Mario Rossi",
        Some("RSSMRA80A01H501U"),
        IdentificationScheme::FiscalCode,
        "IT",
    );
    counterparty.address = Some(address("Via Garibaldi 3", "Roma", "00184", "IT"));

    DocumentSnapshot {
        id: DocumentId("IT-RB-2024-001".to_string()),
        kind: DocumentKind::Receipt,
        number: "RB-2024-001".to_string(),
        profile: None,
        issuer,
        counterparty,
        currency: Currency::new("EUR"),
        issued_at: at("2024-03-15T10:00:00+01:00"),
        due_date: NaiveDate::from_ymd_opt(2024, 4, 30),
        lines: vec![line("Canone marzo", 1, 10_000, 2_200)],
        tax_totals: vec![vat_total(2_200, 10_000, 2_200)],
        source: None,
        references: DocumentReferences::default(),
        payment: Some(PaymentInstruction {
            means_code: "MP12".to_string(),
            due_date: NaiveDate::from_ymd_opt(2024, 4, 30).expect("date"),
            bank_abi: Some("02008".to_string()),
            bank_cab: Some("01600".to_string()),
            bank_name: Some("UniCredit".to_string()),
        }),
        fiscal_lock_date: None,
    }
}

/// Manifest for precondition tests: VAT at 0, 19 and 22 percent only.
pub(crate) fn test_descriptor() -> CodecDescriptor {
    CodecDescriptor {
        id: CodecId::new("XX", DocumentKind::Invoice, "test"),
        family: "xx-test",
        schema_version: "1",
        endpoints: Endpoints {
            submit: "http://authority.test/submit".to_string(),
            status: None,
            lookup: None,
        },
        authentication: AuthenticationMode::EmbeddedSignature,
        credential_kind: None,
        signature: SignatureMode::None,
        rounding: RoundingStrategy::PerLine,
        sign_convention: SignConvention::AsPosted,
        idempotency: IdempotencyKeyFormat {
            prefix: "xx-",
            header: None,
        },
        timeout: Duration::from_secs(30),
        retry: RetryPolicy::default(),
        poll_interval: None,
        lookup_supported: false,
        pending_counts_as_issued: false,
        allowed_rates: vec![
            (TaxScheme::Vat, TaxRate(0)),
            (TaxScheme::Vat, TaxRate(1_900)),
            (TaxScheme::Vat, TaxRate(2_200)),
        ],
        required_counterparty: vec![CounterpartyField::TaxId],
        requires_classification: false,
        requires_exemption_for_zero_rate: false,
    }
}

/// Synchronous DIAN answer validating the document.
pub(crate) fn dian_accepted_reply(cufe: &str) -> String {
    let application_response = STANDARD.encode(format!(
        "<ApplicationResponse><cbc:UUID>{cufe}</cbc:UUID></ApplicationResponse>"
    ));
    format!(
        "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\">\
         <s:Body><SendBillSyncResponse xmlns=\"http://wcf.dian.colombia\">\
         <SendBillSyncResult xmlns:b=\"http://schemas.datacontract.org/2004/07/DianResponse\">\
         <b:ErrorMessage/>\
         <b:IsValid>true</b:IsValid>\
         <b:StatusCode>00</b:StatusCode>\
         <b:StatusDescription>Procesado Correctamente.</b:StatusDescription>\
         <b:StatusMessage>La Factura electronica SETP990000001, ha sido autorizada.</b:StatusMessage>\
         <b:XmlBase64Bytes>{application_response}</b:XmlBase64Bytes>\
         <b:XmlDocumentKey>{cufe}</b:XmlDocumentKey>\
         </SendBillSyncResult></SendBillSyncResponse></s:Body></s:Envelope>"
    )
}

/// DIAN rejection carrying rule 90: the document was already received.
pub(crate) fn dian_duplicate_reply() -> String {
    "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\">\
     <s:Body><SendBillSyncResponse xmlns=\"http://wcf.dian.colombia\">\
     <SendBillSyncResult xmlns:b=\"http://schemas.datacontract.org/2004/07/DianResponse\">\
     <b:ErrorMessage xmlns:c=\"http://schemas.microsoft.com/2003/10/Serialization/Arrays\">\
     <c:string>Regla: 90, Rechazo: Documento procesado anteriormente.</c:string>\
     </b:ErrorMessage>\
     <b:IsValid>false</b:IsValid>\
     <b:StatusCode>99</b:StatusCode>\
     <b:StatusDescription>Validacion contiene errores en campos mandatorios.</b:StatusDescription>\
     </SendBillSyncResult></SendBillSyncResponse></s:Body></s:Envelope>"
        .to_string()
}

/// DIAN `GetStatus` answer for a document it never saw.
pub(crate) fn dian_not_found_reply() -> String {
    "<s:Envelope xmlns:s=\"http://www.w3.org/2003/05/soap-envelope\">\
     <s:Body><GetStatusResponse xmlns=\"http://wcf.dian.colombia\">\
     <GetStatusResult xmlns:b=\"http://schemas.datacontract.org/2004/07/DianResponse\">\
     <b:IsValid>false</b:IsValid>\
     <b:StatusCode>66</b:StatusCode>\
     <b:StatusDescription>TrackId no existe en los registros de la DIAN.</b:StatusDescription>\
     </GetStatusResult></GetStatusResponse></s:Body></s:Envelope>"
        .to_string()
}

/// SdI acknowledgement of an upload, before any notification.
pub(crate) fn sdi_receipt(sdi_id: &str) -> String {
    format!(
        "<RispostaSdI><IdentificativoSdI>{sdi_id}</IdentificativoSdI>\
         <NomeFile>IT01234567890_24017.xml</NomeFile></RispostaSdI>"
    )
}

pub(crate) fn sdi_notification(sdi_id: &str, kind: &str, errors: &[(&str, &str)]) -> String {
    let errors = if errors.is_empty() {
        String::new()
    } else {
        let entries: String = errors
            .iter()
            .map(|(code, description)| {
                format!("<Errore><Codice>{code}</Codice><Descrizione>{description}</Descrizione></Errore>")
            })
            .collect();
        format!("<ListaErrori>{entries}</ListaErrori>")
    };
    format!(
        "<RispostaSdI><IdentificativoSdI>{sdi_id}</IdentificativoSdI>\
         <NomeFile>IT01234567890_24017.xml</NomeFile>\
         <EsitoNotifica><TipoNotifica>{kind}</TipoNotifica>{errors}</EsitoNotifica></RispostaSdI>"
    )
}

/// Ed25519 seed for the Colombian issuer, valid 2024 through 2026.
pub(crate) fn signing_credential() -> CredentialRecord {
    CredentialRecord {
        id: 1,
        issuer_tax_id: "900123456".to_string(),
        scope: "co-dian".to_string(),
        kind: CredentialKind::SigningKey,
        secret: (1..=32).collect(),
        certificate: b"-----BEGIN CERTIFICATE-----CO-----END CERTIFICATE-----".to_vec(),
        not_before: utc(2024, 1, 1),
        not_after: Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap(),
        revoked_at: None,
    }
}

pub(crate) fn hmac_credential() -> CredentialRecord {
    CredentialRecord {
        id: 2,
        issuer_tax_id: "01234567890".to_string(),
        scope: "it-sdi".to_string(),
        kind: CredentialKind::HmacSecret,
        secret: b"hub-shared-secret".to_vec(),
        certificate: Vec::new(),
        not_before: utc(2024, 1, 1),
        not_after: Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap(),
        revoked_at: None,
    }
}

pub(crate) fn api_key_credential() -> CredentialRecord {
    CredentialRecord {
        id: 3,
        issuer_tax_id: "P051234567X".to_string(),
        scope: "ke-etims".to_string(),
        kind: CredentialKind::ApiKey,
        secret: b"cmc-secret".to_vec(),
        certificate: Vec::new(),
        not_before: utc(2024, 1, 1),
        not_after: Utc.with_ymd_and_hms(2026, 12, 31, 23, 59, 59).unwrap(),
        revoked_at: None,
    }
}

pub(crate) fn new_credential(record: &CredentialRecord) -> NewCredential {
    NewCredential {
        issuer_tax_id: record.issuer_tax_id.clone(),
        scope: record.scope.clone(),
        kind: record.kind,
        secret: record.secret.clone(),
        certificate: record.certificate.clone(),
        not_before: record.not_before,
        not_after: record.not_after,
    }
}

/// Channel replaying a fixed script of outcomes. Once the script is spent
/// every call fails with a network error.
#[derive(Debug, Default)]
pub(crate) struct ScriptedChannel {
    script: Mutex<VecDeque<Result<ExchangeReply, ChannelError>>>,
    requests: Mutex<Vec<ExchangeRequest>>,
    latency: Option<Duration>,
    calls: AtomicUsize,
}

impl ScriptedChannel {
    pub(crate) fn new(script: Vec<Result<ExchangeReply, ChannelError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            ..Self::default()
        }
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub(crate) fn push(&self, outcome: Result<ExchangeReply, ChannelError>) {
        self.script.lock().expect("script mutex").push_back(outcome);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<ExchangeRequest> {
        self.requests.lock().expect("requests mutex").clone()
    }
}

#[async_trait]
impl AuthorityChannel for ScriptedChannel {
    async fn send(&self, request: &ExchangeRequest) -> Result<ExchangeReply, ChannelError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests
            .lock()
            .expect("requests mutex")
            .push(request.clone());
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let next = self.script.lock().expect("script mutex").pop_front();
        next.unwrap_or_else(|| Err(ChannelError::Network("script exhausted".to_string())))
    }
}

#[derive(Debug, Default)]
pub(crate) struct MemoryReplies {
    replies: Mutex<HashMap<String, ExchangeReply>>,
}

impl IdempotencyStore for MemoryReplies {
    fn remember(
        &self,
        key: &str,
        reply: &ExchangeReply,
        _received_at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        self.replies
            .lock()
            .map_err(|_| LedgerError::Poisoned)?
            .insert(key.to_string(), reply.clone());
        Ok(())
    }

    fn recall(&self, key: &str) -> Result<Option<ExchangeReply>, LedgerError> {
        Ok(self
            .replies
            .lock()
            .map_err(|_| LedgerError::Poisoned)?
            .get(key)
            .cloned())
    }
}

pub(crate) type TestOrchestrator = FiscalOrchestrator<SqliteLedger, StaticPdf>;

/// Orchestrator over an in-memory ledger, the standard catalog and a
/// scripted authority.
pub(crate) struct Harness {
    pub(crate) orchestrator: Arc<TestOrchestrator>,
    pub(crate) ledger: Arc<SqliteLedger>,
    pub(crate) channel: Arc<ScriptedChannel>,
}

impl Harness {
    /// Must run inside a paused tokio runtime so the clock follows timers.
    pub(crate) fn new(script: Vec<Result<ExchangeReply, ChannelError>>) -> Self {
        Self::with_settings(script, OrchestratorSettings::default())
    }

    pub(crate) fn with_settings(
        script: Vec<Result<ExchangeReply, ChannelError>>,
        settings: OrchestratorSettings,
    ) -> Self {
        let ledger = Arc::new(SqliteLedger::in_memory().expect("in-memory ledger"));
        let channel = Arc::new(ScriptedChannel::new(script));
        Self::assemble(ledger, channel, settings, posting_time())
    }

    /// Second orchestrator over the same ledger and authority, as a restarted
    /// worker would see them.
    pub(crate) fn restarted(&self, worker_id: &str) -> Self {
        let settings = OrchestratorSettings {
            worker_id: worker_id.to_string(),
            ..OrchestratorSettings::default()
        };
        Self::assemble(
            Arc::clone(&self.ledger),
            Arc::clone(&self.channel),
            settings,
            self.orchestrator.now(),
        )
    }

    fn assemble(
        ledger: Arc<SqliteLedger>,
        channel: Arc<ScriptedChannel>,
        settings: OrchestratorSettings,
        started: DateTime<Utc>,
    ) -> Self {
        let clock = Arc::new(TokioClock::starting_at(started));
        let registry = Arc::new(
            CodecRegistry::standard(&CodecEndpoints::new()).expect("standard catalog"),
        );
        let transport = TransportAdapter::new(
            Arc::clone(&channel) as Arc<dyn AuthorityChannel>,
            Arc::clone(&ledger) as Arc<dyn IdempotencyStore>,
            clock.clone(),
        );
        let orchestrator = Arc::new(FiscalOrchestrator::new(
            registry,
            Arc::clone(&ledger),
            transport,
            Arc::new(StaticPdf(PDF.to_vec())),
            clock,
            settings,
        ));
        Self {
            orchestrator,
            ledger,
            channel,
        }
    }

    pub(crate) fn register(&self, credential: &CredentialRecord) -> CredentialRecord {
        self.ledger
            .register(new_credential(credential), credential.not_before)
            .expect("credential registers")
    }
}
