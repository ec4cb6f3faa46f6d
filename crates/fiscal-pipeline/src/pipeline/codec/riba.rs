//! Italy, Ri.Ba. bank collection orders in the CBI fixed-width layout,
//! uploaded to the bank gateway with an HMAC over the flow.

use std::time::Duration;

use serde::Deserialize;

use crate::document::{DocumentKind, DocumentSnapshot, TaxRate, TaxScheme};
use crate::pipeline::credential::CredentialKind;
use crate::pipeline::interpreter::AuthorityReply;
use crate::pipeline::payload::{
    check_common, check_engine_totals, fold_lines, BuildError, Diagnostics, FixedWidthRecord,
    Payload, PayloadTotals, PayloadTree, RoundingStrategy, INVALID,
};
use crate::pipeline::signer::SignatureMode;
use crate::pipeline::transport::{ExchangeReply, ExchangeRequest, RetryPolicy};

use super::{
    endpoint_url, AuthenticationMode, Codec, CodecDescriptor, CodecId, CounterpartyField,
    Endpoints, EnvelopeError, Exchange, IdempotencyKeyFormat, SignConvention, SubmitContext,
};

pub const RECORD_WIDTH: usize = 120;

pub const SIA_CODE: &str = "riba.sia_code";
pub const CREDITOR_ABI: &str = "riba.abi";
pub const CREDITOR_CAB: &str = "riba.cab";
pub const CREDITOR_ACCOUNT: &str = "riba.account";

/// Causale for a Ri.Ba. collection.
const COLLECTION_REASON: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct RibaCodec {
    descriptor: CodecDescriptor,
}

impl RibaCodec {
    pub const FAMILY: &'static str = "it-cbi";
    pub const DEFAULT_BASE_URL: &'static str = "https://cbi-gateway.example.it/api";
    pub const PROFILE: &'static str = "riba";

    pub fn new(base_url: &str) -> Self {
        let descriptor = CodecDescriptor {
            id: CodecId::new("IT", DocumentKind::Receipt, Self::PROFILE),
            family: Self::FAMILY,
            schema_version: "CBI RIBA 6.10",
            endpoints: Endpoints {
                submit: endpoint_url(base_url, "flows"),
                status: None,
                lookup: None,
            },
            authentication: AuthenticationMode::BodyHmac {
                header: "X-Cbi-Signature",
            },
            credential_kind: Some(CredentialKind::HmacSecret),
            signature: SignatureMode::Hmac,
            rounding: RoundingStrategy::PerRate,
            sign_convention: SignConvention::AsPosted,
            idempotency: IdempotencyKeyFormat {
                prefix: "riba-",
                header: Some("X-Request-Id"),
            },
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
            poll_interval: None,
            lookup_supported: false,
            pending_counts_as_issued: false,
            allowed_rates: vec![
                (TaxScheme::Vat, TaxRate(0)),
                (TaxScheme::Vat, TaxRate(400)),
                (TaxScheme::Vat, TaxRate(1_000)),
                (TaxScheme::Vat, TaxRate(2_200)),
            ],
            required_counterparty: vec![CounterpartyField::TaxId, CounterpartyField::Address],
            requires_classification: false,
            requires_exemption_for_zero_rate: false,
        };
        Self { descriptor }
    }
}

impl Codec for RibaCodec {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn build(&self, snapshot: &DocumentSnapshot) -> Result<Payload, BuildError> {
        let mut diagnostics = Diagnostics::new();
        check_common(snapshot, &self.descriptor, &mut diagnostics);
        for key in [SIA_CODE, CREDITOR_ABI, CREDITOR_CAB, CREDITOR_ACCOUNT] {
            diagnostics.require(
                &format!("issuer.registrations.{key}"),
                snapshot.issuer.registration(key),
            );
        }
        match &snapshot.payment {
            Some(payment) => {
                diagnostics.require("payment.bank_abi", payment.bank_abi.as_deref());
                diagnostics.require("payment.bank_cab", payment.bank_cab.as_deref());
            }
            None => diagnostics.require("payment", None),
        }
        if snapshot.currency.code() != "EUR" {
            diagnostics.push("currency", INVALID, "Ri.Ba. flows are denominated in EUR");
        }
        diagnostics.finish()?;

        let folded = fold_lines(snapshot, self.descriptor.rounding);
        let mut totals = Diagnostics::new();
        check_engine_totals(snapshot, &folded, &mut totals);
        if folded.gross_minor() <= 0 {
            totals.push("lines", INVALID, "a collection order must have a positive amount");
        }
        totals.finish()?;

        let registration = |key| snapshot.issuer.registration(key).unwrap_or_default();
        let sia = registration(SIA_CODE);
        let debtor = &snapshot.counterparty;
        let empty = Default::default();
        let address = debtor.address.as_ref().unwrap_or(&empty);
        let (bank_abi, bank_cab, bank_name, due_date) = match &snapshot.payment {
            Some(payment) => (
                payment.bank_abi.as_deref().unwrap_or_default(),
                payment.bank_cab.as_deref().unwrap_or_default(),
                payment.bank_name.as_deref().unwrap_or_default(),
                payment.due_date,
            ),
            None => ("", "", "", snapshot.issue_date()),
        };
        let created = snapshot.issued_at.format("%d%m%y").to_string();
        let medium = format!("{sia}{}", sanitize(&snapshot.number));
        let amount = folded.gross_minor().unsigned_abs();
        let progressive = 1;

        let records = vec![
            record("IB")
                .text(4, 5, sia)
                .text(9, 5, registration(CREDITOR_ABI))
                .text(14, 6, &created)
                .text(20, 20, &medium)
                .text(114, 1, "E"),
            record("14")
                .number(4, 7, progressive)
                .text(23, 6, &due_date.format("%d%m%y").to_string())
                .number(29, 5, COLLECTION_REASON)
                .number(34, 13, amount)
                .text(47, 1, "-")
                .text(48, 5, registration(CREDITOR_ABI))
                .text(53, 5, registration(CREDITOR_CAB))
                .text(58, 12, registration(CREDITOR_ACCOUNT))
                .text(70, 5, bank_abi)
                .text(75, 5, bank_cab)
                .text(92, 5, sia)
                .text(97, 1, "4")
                .text(98, 16, debtor.tax_id().unwrap_or_default())
                .text(120, 1, "E"),
            record("20")
                .number(4, 7, progressive)
                .text(11, 24, &snapshot.issuer.name),
            record("30")
                .number(4, 7, progressive)
                .text(11, 60, &debtor.name)
                .text(71, 16, debtor.tax_id().unwrap_or_default()),
            record("40")
                .number(4, 7, progressive)
                .text(11, 30, &address.street)
                .text(41, 5, address.postal_code.as_deref().unwrap_or_default())
                .text(
                    46,
                    25,
                    &format!(
                        "{} {}",
                        address.city,
                        address.region.as_deref().unwrap_or_default()
                    ),
                )
                .text(71, 50, bank_name),
            record("50")
                .number(4, 7, progressive)
                .text(
                    11,
                    80,
                    &format!(
                        "FATT. N. {} DEL {}",
                        snapshot.number.trim(),
                        snapshot.issued_at.format("%d/%m/%y")
                    ),
                )
                .text(101, 16, snapshot.issuer.tax_id().unwrap_or_default()),
            record("51")
                .number(4, 7, progressive)
                .text(11, 10, &sanitize(&snapshot.number))
                .text(21, 20, &snapshot.issuer.name),
            record("70").number(4, 7, progressive),
            record("EF")
                .text(4, 5, sia)
                .text(9, 5, registration(CREDITOR_ABI))
                .text(14, 6, &created)
                .text(20, 20, &medium)
                .number(46, 7, 1)
                .number(53, 15, amount)
                .number(68, 15, 0)
                .number(83, 7, 9)
                .text(114, 1, "E"),
        ];

        let filename = format!("RIBA_{sia}_{}.txt", sanitize(&snapshot.number));
        let totals = PayloadTotals {
            net_minor: folded.net_minor,
            tax_minor: folded.tax_minor,
            gross_minor: folded.gross_minor(),
        };
        Payload::new(PayloadTree::Records(records), filename, totals)
    }

    fn submit_request(&self, context: &SubmitContext<'_>) -> Result<ExchangeRequest, BuildError> {
        Ok(ExchangeRequest::post(
            self.descriptor.endpoints.submit.clone(),
            "text/plain; charset=us-ascii",
            context.signed.bytes.clone(),
        )
        .header("X-Flow-Name", context.payload.filename.as_str())
        .idempotent(&self.descriptor.idempotency, context.idempotency_key)
        .authenticated(
            self.descriptor.authentication,
            context.signed,
            context.credential,
        ))
    }

    fn parse_reply(
        &self,
        exchange: Exchange,
        reply: &ExchangeReply,
    ) -> Result<AuthorityReply, EnvelopeError> {
        match serde_json::from_slice::<CbiReply>(&reply.body) {
            Ok(parsed) => Ok(AuthorityReply::Cbi(parsed)),
            // The gateway answers a bad signature with a bare 401.
            Err(_) if reply.status == 401 => Ok(AuthorityReply::Cbi(CbiReply {
                outcome: CbiOutcome::Unauthorized,
                flow_id: None,
                errors: Vec::new(),
            })),
            Err(error) => Err(EnvelopeError::new(exchange, error)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CbiReply {
    pub outcome: CbiOutcome,
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub errors: Vec<CbiError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum CbiOutcome {
    Accepted,
    Rejected,
    Duplicate,
    Unauthorized,
    Other(String),
}

impl From<String> for CbiOutcome {
    fn from(raw: String) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "ACCEPTED" => Self::Accepted,
            "REJECTED" => Self::Rejected,
            "DUPLICATE" => Self::Duplicate,
            "UNAUTHORIZED" => Self::Unauthorized,
            _ => Self::Other(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CbiError {
    pub code: String,
    #[serde(default)]
    pub message: String,
    /// Record type the gateway objected to, e.g. `14`.
    #[serde(default)]
    pub record: Option<String>,
}

fn record(kind: &str) -> FixedWidthRecord {
    FixedWidthRecord::new(RECORD_WIDTH).text(2, 2, kind)
}

fn sanitize(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}
