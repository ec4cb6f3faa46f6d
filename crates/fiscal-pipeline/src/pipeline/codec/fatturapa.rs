//! Italy, FatturaPA 1.2 through the Sistema di Interscambio.
//!
//! Asynchronous: the upload returns an SdI identifier and the outcome arrives
//! later as a notification (`RC`, `MC`, `DT` or `NS`). The `sdi` profile uses a
//! detached signature; the `hub` profile authenticates to an intermediary with
//! an HMAC of the body.

use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::Reader;
use serde::Deserialize;

use crate::document::{
    format_scaled, Address, DocumentKind, DocumentSnapshot, IdentificationScheme, Party, TaxRate,
    TaxScheme,
};
use crate::pipeline::credential::CredentialKind;
use crate::pipeline::interpreter::AuthorityReply;
use crate::pipeline::payload::{
    check_common, check_engine_totals, fold_lines, BuildError, Diagnostics, FoldedLine, Payload,
    PayloadTotals, PayloadTree, RoundingStrategy, TaxBucket, XmlElement, REQUIRED,
};
use crate::pipeline::signer::SignatureMode;
use crate::pipeline::transport::{ExchangeReply, ExchangeRequest, RetryPolicy};

use super::{
    endpoint_url, AuthenticationMode, Codec, CodecDescriptor, CodecId, CounterpartyField,
    Endpoints, EnvelopeError, Exchange, IdempotencyKeyFormat, QueryContext, SignConvention,
    SubmitContext,
};

const FPR_NS: &str = "http://ivaservizi.agenziaentrate.gov.it/docs/xsd/fatture/v1.2";
const REPLY_ROOT: &str = "RispostaSdI";
/// Recipient code meaning "deliver by PEC or to the tax drawer".
const NO_RECIPIENT_CODE: &str = "0000000";

pub const RECIPIENT_CODE: &str = "sdi.recipient_code";
pub const TAX_REGIME: &str = "sdi.tax_regime";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FatturaPaProfile {
    /// Direct channel, detached CAdES-style signature.
    Sdi,
    /// Accredited intermediary, HMAC-authenticated.
    Hub,
}

impl FatturaPaProfile {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sdi => "sdi",
            Self::Hub => "hub",
        }
    }
}

#[derive(Debug, Clone)]
pub struct FatturaPaCodec {
    descriptor: CodecDescriptor,
}

impl FatturaPaCodec {
    pub const FAMILY: &'static str = "it-sdi";
    pub const DEFAULT_BASE_URL: &'static str = "https://api.sdi.fatturapa.gov.it/v1";

    pub fn new(kind: DocumentKind, profile: FatturaPaProfile, base_url: &str) -> Self {
        let (authentication, credential_kind, signature) = match profile {
            FatturaPaProfile::Sdi => (
                AuthenticationMode::DetachedSignature {
                    header: "X-Signature",
                },
                CredentialKind::SigningKey,
                SignatureMode::Detached,
            ),
            FatturaPaProfile::Hub => (
                AuthenticationMode::BodyHmac {
                    header: "X-Hub-Signature",
                },
                CredentialKind::HmacSecret,
                SignatureMode::Hmac,
            ),
        };
        let descriptor = CodecDescriptor {
            id: CodecId::new("IT", kind, profile.as_str()),
            family: Self::FAMILY,
            schema_version: "FPR12",
            endpoints: Endpoints {
                submit: endpoint_url(base_url, "fatture"),
                status: Some(endpoint_url(base_url, "notifiche")),
                lookup: Some(endpoint_url(base_url, "fatture/ricerca")),
            },
            authentication,
            credential_kind: Some(credential_kind),
            signature,
            rounding: RoundingStrategy::PerRate,
            sign_convention: SignConvention::AsPosted,
            idempotency: IdempotencyKeyFormat {
                prefix: "it-",
                header: Some("Idempotency-Key"),
            },
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            poll_interval: Some(Duration::from_secs(300)),
            lookup_supported: true,
            // SdI treats a file as issued once it holds the identifier.
            pending_counts_as_issued: true,
            allowed_rates: vec![
                (TaxScheme::Vat, TaxRate(0)),
                (TaxScheme::Vat, TaxRate(400)),
                (TaxScheme::Vat, TaxRate(500)),
                (TaxScheme::Vat, TaxRate(1_000)),
                (TaxScheme::Vat, TaxRate(2_200)),
            ],
            required_counterparty: vec![CounterpartyField::TaxId, CounterpartyField::Address],
            requires_classification: false,
            requires_exemption_for_zero_rate: true,
        };
        Self { descriptor }
    }

    fn query(
        &self,
        url: Option<&String>,
        root: &str,
        name: &str,
        value: &str,
    ) -> Option<ExchangeRequest> {
        let body = XmlElement::new(root)
            .attr("xmlns", FPR_NS)
            .child(XmlElement::leaf(name, value))
            .to_document_bytes()
            .ok()?;
        Some(ExchangeRequest::post(url?.clone(), "application/xml", body))
    }
}

impl Codec for FatturaPaCodec {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn build(&self, snapshot: &DocumentSnapshot) -> Result<Payload, BuildError> {
        let mut diagnostics = Diagnostics::new();
        check_common(snapshot, &self.descriptor, &mut diagnostics);
        if snapshot.issuer.address.is_none() {
            diagnostics.push("issuer.address", REQUIRED, "issuer.address is required");
        }
        diagnostics.finish()?;

        let folded = fold_lines(snapshot, self.descriptor.rounding);
        let mut totals = Diagnostics::new();
        check_engine_totals(snapshot, &folded, &mut totals);
        totals.finish()?;

        let issuer_vat = snapshot.issuer.tax_id().unwrap_or_default();
        let money = |amount_minor: i64| {
            format_scaled(
                self.descriptor
                    .sign_convention
                    .apply(snapshot.kind, amount_minor),
                snapshot.currency.minor_unit_scale(),
                2,
                '.',
            )
        };

        let recipient_code = snapshot
            .counterparty
            .registration(RECIPIENT_CODE)
            .unwrap_or(NO_RECIPIENT_CODE);
        let pec = (recipient_code == NO_RECIPIENT_CODE)
            .then(|| snapshot.counterparty.email.as_deref())
            .flatten()
            .map(|email| XmlElement::leaf("PECDestinatario", email));

        let header = XmlElement::new("FatturaElettronicaHeader")
            .child(
                XmlElement::new("DatiTrasmissione")
                    .child(vat_identifier("IdTrasmittente", "IT", issuer_vat))
                    .child(XmlElement::leaf("ProgressivoInvio", progressive(&snapshot.number)))
                    .child(XmlElement::leaf("FormatoTrasmissione", "FPR12"))
                    .child(XmlElement::leaf("CodiceDestinatario", recipient_code))
                    .optional(pec),
            )
            .child(
                XmlElement::new("CedentePrestatore")
                    .child(
                        party_data(&snapshot.issuer).child(XmlElement::leaf(
                            "RegimeFiscale",
                            snapshot.issuer.registration(TAX_REGIME).unwrap_or("RF01"),
                        )),
                    )
                    .optional(snapshot.issuer.address.as_ref().map(seat)),
            )
            .child(
                XmlElement::new("CessionarioCommittente")
                    .child(party_data(&snapshot.counterparty))
                    .optional(snapshot.counterparty.address.as_ref().map(seat)),
            );

        let document_type = match snapshot.kind {
            DocumentKind::CreditNote => "TD04",
            DocumentKind::DebitNote => "TD05",
            DocumentKind::Invoice | DocumentKind::Receipt => "TD01",
        };

        let mut general = XmlElement::new("DatiGenerali").child(
            XmlElement::new("DatiGeneraliDocumento")
                .child(XmlElement::leaf("TipoDocumento", document_type))
                .child(XmlElement::leaf("Divisa", snapshot.currency.code()))
                .child(XmlElement::leaf(
                    "Data",
                    snapshot.issued_at.format("%Y-%m-%d").to_string(),
                ))
                .child(XmlElement::leaf("Numero", snapshot.number.trim()))
                .child(XmlElement::leaf(
                    "ImportoTotaleDocumento",
                    money(folded.gross_minor()),
                )),
        );
        if let Some(order) = &snapshot.references.purchase_order {
            general.push(
                XmlElement::new("DatiOrdineAcquisto")
                    .child(XmlElement::leaf("IdDocumento", order.as_str())),
            );
        }
        for tag in &snapshot.references.contract_tags {
            general.push(
                XmlElement::new("DatiContratto").child(XmlElement::leaf("IdDocumento", tag.as_str())),
            );
        }
        if let Some(source) = &snapshot.source {
            general.push(
                XmlElement::new("DatiFattureCollegate")
                    .child(XmlElement::leaf("IdDocumento", source.number.as_str()))
                    .child(XmlElement::leaf(
                        "Data",
                        source.issued_on.format("%Y-%m-%d").to_string(),
                    )),
            );
        }

        let goods = XmlElement::new("DatiBeniServizi")
            .children(folded.lines.iter().map(|line| detail_line(line, &money)))
            .children(folded.buckets_for(TaxScheme::Vat).map(|bucket| summary(bucket, &money)));

        let payment = snapshot.payment.as_ref().map(|payment| {
            XmlElement::new("DatiPagamento")
                .child(XmlElement::leaf("CondizioniPagamento", "TP02"))
                .child(
                    XmlElement::new("DettaglioPagamento")
                        .child(XmlElement::leaf("ModalitaPagamento", payment.means_code.as_str()))
                        .child(XmlElement::leaf(
                            "DataScadenzaPagamento",
                            payment.due_date.format("%Y-%m-%d").to_string(),
                        ))
                        .child(XmlElement::leaf("ImportoPagamento", money(folded.gross_minor())))
                        .optional(
                            payment
                                .bank_name
                                .as_deref()
                                .map(|bank| XmlElement::leaf("IstitutoFinanziario", bank)),
                        )
                        .optional(payment.bank_abi.as_deref().map(|abi| XmlElement::leaf("ABI", abi)))
                        .optional(payment.bank_cab.as_deref().map(|cab| XmlElement::leaf("CAB", cab))),
                )
        });

        let body = XmlElement::new("FatturaElettronicaBody")
            .child(general)
            .child(goods)
            .optional(payment);

        let root = XmlElement::new("p:FatturaElettronica")
            .attr("versione", "FPR12")
            .attr("xmlns:p", FPR_NS)
            .child(header)
            .child(body);

        let filename = format!("IT{issuer_vat}_{}.xml", progressive(&snapshot.number));
        let totals = PayloadTotals {
            net_minor: folded.net_minor,
            tax_minor: folded.tax_minor,
            gross_minor: folded.gross_minor(),
        };
        Payload::new(PayloadTree::Xml(root), filename, totals)
    }

    fn submit_request(&self, context: &SubmitContext<'_>) -> Result<ExchangeRequest, BuildError> {
        Ok(ExchangeRequest::post(
            self.descriptor.endpoints.submit.clone(),
            "application/xml",
            context.signed.bytes.clone(),
        )
        .header("X-Filename", context.payload.filename.as_str())
        .idempotent(&self.descriptor.idempotency, context.idempotency_key)
        .authenticated(
            self.descriptor.authentication,
            context.signed,
            context.credential,
        ))
    }

    fn status_request(&self, context: &QueryContext<'_>) -> Option<ExchangeRequest> {
        self.query(
            self.descriptor.endpoints.status.as_ref(),
            "RichiestaStato",
            "IdentificativoSdI",
            context.tracking_ref?,
        )
    }

    fn lookup_request(&self, context: &QueryContext<'_>) -> Option<ExchangeRequest> {
        self.query(
            self.descriptor.endpoints.lookup.as_ref(),
            "RichiestaFile",
            "NomeFile",
            &context.payload.filename,
        )
    }

    fn parse_reply(
        &self,
        exchange: Exchange,
        reply: &ExchangeReply,
    ) -> Result<AuthorityReply, EnvelopeError> {
        parse_reply(exchange, &reply.body).map(AuthorityReply::Sdi)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdiReply {
    pub sdi_id: Option<String>,
    pub filename: Option<String>,
    pub notification: Option<SdiNotification>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdiNotification {
    pub kind: SdiNotificationKind,
    pub errors: Vec<SdiError>,
    /// Notification document as received.
    pub raw: Option<Vec<u8>>,
}

/// `TipoNotifica`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdiNotificationKind {
    /// `RC`, ricevuta di consegna.
    Delivered,
    /// `MC`, mancata consegna; the invoice is issued and sits in the tax drawer.
    NotDelivered,
    /// `DT`, decorrenza termini.
    TermsElapsed,
    /// `NS`, notifica di scarto.
    Discarded,
    Other(String),
}

impl From<&str> for SdiNotificationKind {
    fn from(raw: &str) -> Self {
        match raw.trim() {
            "RC" => Self::Delivered,
            "MC" => Self::NotDelivered,
            "DT" => Self::TermsElapsed,
            "NS" => Self::Discarded,
            other => Self::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdiError {
    pub code: String,
    pub description: String,
}

#[derive(Debug, Deserialize)]
struct ReplyEnvelope {
    #[serde(rename = "IdentificativoSdI", default)]
    sdi_id: Option<String>,
    #[serde(rename = "NomeFile", default)]
    filename: Option<String>,
    #[serde(rename = "EsitoNotifica", default)]
    notification: Option<NotificationEnvelope>,
}

#[derive(Debug, Deserialize)]
struct NotificationEnvelope {
    #[serde(rename = "TipoNotifica")]
    kind: String,
    #[serde(rename = "ListaErrori", default)]
    errors: Option<ErrorList>,
}

#[derive(Debug, Deserialize)]
struct ErrorList {
    #[serde(rename = "Errore", default)]
    errors: Vec<ErrorEnvelope>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "Codice")]
    code: String,
    #[serde(rename = "Descrizione", default)]
    description: String,
}

fn parse_reply(exchange: Exchange, body: &[u8]) -> Result<SdiReply, EnvelopeError> {
    match root_name(body) {
        Some(name) if name == REPLY_ROOT => {}
        Some(name) => {
            return Err(EnvelopeError::new(
                exchange,
                format!("unexpected root element {name}"),
            ))
        }
        None => return Err(EnvelopeError::new(exchange, "empty reply")),
    }

    let text = std::str::from_utf8(body).map_err(|error| EnvelopeError::new(exchange, error))?;
    let envelope: ReplyEnvelope =
        quick_xml::de::from_str(text).map_err(|error| EnvelopeError::new(exchange, error))?;

    let sdi_id = envelope.sdi_id.filter(|id| !id.trim().is_empty());
    if sdi_id.is_none() && exchange != Exchange::Lookup {
        return Err(EnvelopeError::new(exchange, "reply carries no IdentificativoSdI"));
    }

    let notification = envelope.notification.map(|notification| SdiNotification {
        kind: SdiNotificationKind::from(notification.kind.as_str()),
        errors: notification
            .errors
            .map(|list| list.errors)
            .unwrap_or_default()
            .into_iter()
            .map(|error| SdiError {
                code: error.code,
                description: error.description,
            })
            .collect(),
        raw: Some(body.to_vec()),
    });

    Ok(SdiReply {
        sdi_id,
        filename: envelope.filename,
        notification,
    })
}

fn root_name(body: &[u8]) -> Option<String> {
    let mut reader = Reader::from_reader(body);
    let mut buffer = Vec::new();
    loop {
        match reader.read_event_into(&mut buffer).ok()? {
            Event::Start(start) | Event::Empty(start) => {
                return Some(String::from_utf8_lossy(start.local_name().as_ref()).into_owned())
            }
            Event::Eof => return None,
            _ => {}
        }
        buffer.clear();
    }
}

/// Five-character `ProgressivoInvio` taken from the document number.
fn progressive(number: &str) -> String {
    let alphanumeric: Vec<char> = number
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .collect();
    let tail: String = alphanumeric[alphanumeric.len().saturating_sub(5)..]
        .iter()
        .collect();
    format!("{tail:0>5}")
}

fn vat_identifier(name: &str, country: &str, code: &str) -> XmlElement {
    XmlElement::new(name)
        .child(XmlElement::leaf("IdPaese", country))
        .child(XmlElement::leaf("IdCodice", code))
}

fn party_data(party: &Party) -> XmlElement {
    let tax_id = party.tax_id().unwrap_or_default();
    let identifier = match party.scheme {
        IdentificationScheme::FiscalCode | IdentificationScheme::NationalId => {
            XmlElement::leaf("CodiceFiscale", tax_id)
        }
        _ => vat_identifier("IdFiscaleIVA", &party.country_code, tax_id),
    };
    XmlElement::new("DatiAnagrafici")
        .child(identifier)
        .child(
            XmlElement::new("Anagrafica")
                .child(XmlElement::leaf("Denominazione", party.name.as_str())),
        )
}

fn seat(address: &Address) -> XmlElement {
    XmlElement::new("Sede")
        .child(XmlElement::leaf("Indirizzo", address.street.as_str()))
        .child(XmlElement::leaf(
            "CAP",
            address.postal_code.as_deref().unwrap_or("00000"),
        ))
        .child(XmlElement::leaf("Comune", address.city.as_str()))
        .optional(
            address
                .region
                .as_deref()
                .map(|region| XmlElement::leaf("Provincia", region)),
        )
        .child(XmlElement::leaf("Nazione", address.country_code.as_str()))
}

fn rate(rate: TaxRate) -> String {
    rate.to_string()
}

fn detail_line(line: &FoldedLine<'_>, money: &impl Fn(i64) -> String) -> XmlElement {
    let vat = line.vat();
    let discount = (line.line.discount_minor > 0).then(|| {
        XmlElement::new("ScontoMaggiorazione")
            .child(XmlElement::leaf("Tipo", "SC"))
            .child(XmlElement::leaf("Importo", money(line.line.discount_minor)))
    });
    XmlElement::new("DettaglioLinee")
        .child(XmlElement::leaf("NumeroLinea", line.position.to_string()))
        .optional(line.line.product_code.as_deref().map(|code| {
            XmlElement::new("CodiceArticolo")
                .child(XmlElement::leaf("CodiceTipo", "INTERNO"))
                .child(XmlElement::leaf("CodiceValore", code))
        }))
        .child(XmlElement::leaf("Descrizione", line.line.description.as_str()))
        .child(XmlElement::leaf(
            "Quantita",
            format_scaled(line.line.quantity.milli(), 3, 3, '.'),
        ))
        .optional(
            line.line
                .unit_code
                .as_deref()
                .map(|unit| XmlElement::leaf("UnitaMisura", unit)),
        )
        .child(XmlElement::leaf("PrezzoUnitario", money(line.line.unit_price_minor)))
        .optional(discount)
        .child(XmlElement::leaf("PrezzoTotale", money(line.net_minor)))
        .child(XmlElement::leaf(
            "AliquotaIVA",
            vat.map_or_else(|| rate(TaxRate(0)), |tax| rate(tax.rate)),
        ))
        .optional(
            vat.and_then(|tax| tax.exemption_code.as_deref())
                .map(|code| XmlElement::leaf("Natura", code)),
        )
}

fn summary(bucket: &TaxBucket, money: &impl Fn(i64) -> String) -> XmlElement {
    XmlElement::new("DatiRiepilogo")
        .child(XmlElement::leaf("AliquotaIVA", rate(bucket.rate)))
        .optional(
            bucket
                .exemption_code
                .as_deref()
                .map(|code| XmlElement::leaf("Natura", code)),
        )
        .child(XmlElement::leaf("ImponibileImporto", money(bucket.base_minor)))
        .child(XmlElement::leaf("Imposta", money(bucket.tax_minor)))
        .child(XmlElement::leaf("EsigibilitaIVA", "I"))
}
