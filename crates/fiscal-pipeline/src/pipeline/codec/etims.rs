//! Kenya, KRA eTIMS: `saveSales` over the OSCU JSON API.
//!
//! Synchronous. There is no lookup by reference; duplicates are caught by the
//! authority on `invcNo` and by the reply cache on the idempotency key.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Number, Value};

use crate::document::{format_scaled, DocumentKind, DocumentSnapshot, TaxRate, TaxScheme};
use crate::pipeline::credential::CredentialKind;
use crate::pipeline::interpreter::AuthorityReply;
use crate::pipeline::payload::{
    check_common, check_engine_totals, fold_lines, BuildError, Diagnostics, FoldedDocument,
    FoldedTax, Payload, PayloadTotals, PayloadTree, RoundingStrategy, INVALID,
};
use crate::pipeline::signer::SignatureMode;
use crate::pipeline::transport::{ExchangeReply, ExchangeRequest, RetryPolicy};

use super::{
    endpoint_url, AuthenticationMode, Codec, CodecDescriptor, CodecId, Endpoints, EnvelopeError,
    Exchange, IdempotencyKeyFormat, SignConvention, SubmitContext,
};

pub const BRANCH_ID: &str = "etims.branch_id";
pub const API_KEY_HEADER: &str = "cmcKey";

const TAX_TYPES: [&str; 5] = ["A", "B", "C", "D", "E"];

#[derive(Debug, Clone)]
pub struct EtimsCodec {
    descriptor: CodecDescriptor,
}

impl EtimsCodec {
    pub const FAMILY: &'static str = "ke-etims";
    pub const DEFAULT_BASE_URL: &'static str = "https://etims-api.kra.go.ke/etims-api";
    pub const PROFILE: &'static str = "oscu";

    pub fn new(kind: DocumentKind, base_url: &str) -> Self {
        let descriptor = CodecDescriptor {
            id: CodecId::new("KE", kind, Self::PROFILE),
            family: Self::FAMILY,
            schema_version: "OSCU 2.0",
            endpoints: Endpoints {
                submit: endpoint_url(base_url, "trnsSales/saveSales"),
                status: None,
                lookup: None,
            },
            authentication: AuthenticationMode::ApiKey {
                header: API_KEY_HEADER,
            },
            credential_kind: Some(CredentialKind::ApiKey),
            signature: SignatureMode::None,
            rounding: RoundingStrategy::PerLine,
            sign_convention: SignConvention::AsPosted,
            idempotency: IdempotencyKeyFormat {
                prefix: "ke-",
                header: None,
            },
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            poll_interval: None,
            lookup_supported: false,
            pending_counts_as_issued: false,
            allowed_rates: vec![
                (TaxScheme::Vat, TaxRate(0)),
                (TaxScheme::Vat, TaxRate(800)),
                (TaxScheme::Vat, TaxRate(1_600)),
            ],
            required_counterparty: Vec::new(),
            requires_classification: true,
            requires_exemption_for_zero_rate: false,
        };
        Self { descriptor }
    }
}

impl Codec for EtimsCodec {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn build(&self, snapshot: &DocumentSnapshot) -> Result<Payload, BuildError> {
        let mut diagnostics = Diagnostics::new();
        check_common(snapshot, &self.descriptor, &mut diagnostics);
        diagnostics.require(
            &format!("issuer.registrations.{BRANCH_ID}"),
            snapshot.issuer.registration(BRANCH_ID),
        );
        let invoice_number = trailing_number(&snapshot.number);
        if invoice_number.is_none() {
            diagnostics.push("number", INVALID, "eTIMS invoice numbers must end in digits");
        }
        let original_number = match (&snapshot.source, snapshot.kind) {
            (Some(source), DocumentKind::CreditNote) => {
                let number = trailing_number(&source.number);
                if number.is_none() {
                    diagnostics.push(
                        "source.number",
                        INVALID,
                        "the refunded sale number must end in digits",
                    );
                }
                number.unwrap_or_default()
            }
            _ => 0,
        };
        diagnostics.finish()?;

        let folded = fold_lines(snapshot, self.descriptor.rounding);
        let mut totals = Diagnostics::new();
        check_engine_totals(snapshot, &folded, &mut totals);
        totals.finish()?;

        let tin = snapshot.issuer.tax_id().unwrap_or_default();
        let branch = snapshot.issuer.registration(BRANCH_ID).unwrap_or_default();
        let invoice_number = invoice_number.unwrap_or_default();
        let amounts = Amounts {
            scale: snapshot.currency.minor_unit_scale(),
        };

        let mut body = serde_json::Map::new();
        body.insert("tin".into(), json!(tin));
        body.insert("bhfId".into(), json!(branch));
        body.insert("invcNo".into(), json!(invoice_number));
        body.insert("orgInvcNo".into(), json!(original_number));
        body.insert("custTin".into(), json!(snapshot.counterparty.tax_id()));
        body.insert("custNm".into(), json!(snapshot.counterparty.name));
        body.insert("salesTyCd".into(), json!("N"));
        body.insert(
            "rcptTyCd".into(),
            json!(match snapshot.kind {
                DocumentKind::CreditNote => "R",
                _ => "S",
            }),
        );
        body.insert(
            "pmtTyCd".into(),
            json!(snapshot
                .payment
                .as_ref()
                .map_or("01", |payment| payment.means_code.as_str())),
        );
        body.insert("salesSttsCd".into(), json!("02"));
        body.insert(
            "cfmDt".into(),
            json!(snapshot.issued_at.format("%Y%m%d%H%M%S").to_string()),
        );
        body.insert(
            "salesDt".into(),
            json!(snapshot.issued_at.format("%Y%m%d").to_string()),
        );
        body.insert("totItemCnt".into(), json!(folded.lines.len()));

        for (code, (taxable, tax, rate)) in TAX_TYPES.iter().zip(tax_type_totals(&folded)) {
            body.insert(format!("taxblAmt{code}"), amounts.value(taxable));
            body.insert(format!("taxAmt{code}"), amounts.value(tax));
            body.insert(format!("taxRt{code}"), rate_value(rate));
        }
        body.insert("totTaxblAmt".into(), amounts.value(folded.net_minor));
        body.insert("totTaxAmt".into(), amounts.value(folded.tax_minor));
        body.insert("totAmt".into(), amounts.value(folded.gross_minor()));

        let items: Vec<Value> = folded
            .lines
            .iter()
            .map(|line| {
                let tax = line.vat();
                json!({
                    "itemSeq": line.position,
                    "itemCd": line.line.product_code,
                    "itemClsCd": line.line.classification_code,
                    "itemNm": line.line.description,
                    "qtyUnitCd": line.line.unit_code.as_deref().unwrap_or("U"),
                    "qty": quantity_value(line.line.quantity.milli()),
                    "prc": amounts.value(line.line.unit_price_minor),
                    "splyAmt": amounts.value(line.net_minor + line.line.discount_minor),
                    "dcAmt": amounts.value(line.line.discount_minor),
                    "taxTyCd": tax.map_or("D", tax_type),
                    "taxblAmt": amounts.value(line.net_minor),
                    "taxAmt": amounts.value(line.tax_minor()),
                    "totAmt": amounts.value(line.net_minor + line.tax_minor()),
                })
            })
            .collect();
        body.insert("itemList".into(), Value::Array(items));

        let filename = format!("{tin}_{branch}_{invoice_number}.json");
        let totals = PayloadTotals {
            net_minor: folded.net_minor,
            tax_minor: folded.tax_minor,
            gross_minor: folded.gross_minor(),
        };
        Payload::new(PayloadTree::Json(Value::Object(body)), filename, totals)
    }

    fn submit_request(&self, context: &SubmitContext<'_>) -> Result<ExchangeRequest, BuildError> {
        let issuer = &context.snapshot.issuer;
        Ok(ExchangeRequest::post(
            self.descriptor.endpoints.submit.clone(),
            "application/json",
            context.signed.bytes.clone(),
        )
        .header("tin", issuer.tax_id().unwrap_or_default())
        .header("bhfId", issuer.registration(BRANCH_ID).unwrap_or_default())
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
        serde_json::from_slice::<EtimsReply>(&reply.body)
            .map(AuthorityReply::Etims)
            .map_err(|error| EnvelopeError::new(exchange, error))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtimsReply {
    pub result_cd: String,
    #[serde(default)]
    pub result_msg: String,
    #[serde(default)]
    pub data: Option<EtimsReceiptData>,
}

/// Receipt signature block returned for an accepted sale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EtimsReceiptData {
    pub rcpt_no: u64,
    pub tot_rcpt_no: u64,
    pub intrl_data: String,
    pub rcpt_sign: String,
    pub sdc_id: String,
    pub mrc_no: String,
}

struct Amounts {
    scale: u32,
}

impl Amounts {
    fn value(&self, amount_minor: i64) -> Value {
        decimal_value(&format_scaled(amount_minor, self.scale, 2, '.'))
    }
}

fn decimal_value(rendered: &str) -> Value {
    rendered
        .parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map_or(Value::Null, Value::Number)
}

fn quantity_value(milli: i64) -> Value {
    decimal_value(&format_scaled(milli, 3, 3, '.'))
}

fn rate_value(rate: TaxRate) -> Value {
    decimal_value(&rate.to_string())
}

/// eTIMS tax type of a VAT line: A exempt, B standard, C zero rated,
/// D non-VAT, E reduced.
fn tax_type(tax: &FoldedTax) -> &'static str {
    match (tax.rate.basis(), tax.exemption_code.as_deref()) {
        (1_600, _) => "B",
        (800, _) => "E",
        (0, Some("A")) => "A",
        (0, Some("D")) => "D",
        _ => "C",
    }
}

/// `(taxable, tax, rate)` per tax type, in `A..E` order.
fn tax_type_totals(folded: &FoldedDocument<'_>) -> [(i64, i64, TaxRate); 5] {
    let mut totals = [
        (0, 0, TaxRate(0)),
        (0, 0, TaxRate(1_600)),
        (0, 0, TaxRate(0)),
        (0, 0, TaxRate(0)),
        (0, 0, TaxRate(800)),
    ];
    for line in &folded.lines {
        let code = line.vat().map_or("D", tax_type);
        if let Some(index) = TAX_TYPES.iter().position(|candidate| *candidate == code) {
            totals[index].0 += line.net_minor;
            totals[index].1 += line.tax_minor();
        }
    }
    totals
}

fn trailing_number(raw: &str) -> Option<u64> {
    let digits: String = raw
        .trim()
        .chars()
        .rev()
        .take_while(char::is_ascii_digit)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    digits.parse().ok()
}
