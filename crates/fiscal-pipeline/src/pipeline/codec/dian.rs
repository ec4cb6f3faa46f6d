//! Colombia, DIAN: UBL 2.1 invoices and notes over the SOAP web service.
//!
//! The production profile answers synchronously through `SendBillSync`; the
//! `habilitacion` test-set profile answers with a tracking key and is polled
//! through `GetStatusZip`. The CUFE/CUDE is computed locally, so a lookup by
//! reference (`GetStatus`) works even when the submission reply was lost.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use sha2::{Digest, Sha384};

use crate::document::{
    format_scaled, DocumentKind, DocumentSnapshot, IdentificationScheme, Party, TaxRate, TaxScheme,
};
use crate::pipeline::archive::stored_zip;
use crate::pipeline::credential::CredentialKind;
use crate::pipeline::interpreter::AuthorityReply;
use crate::pipeline::payload::{
    check_common, check_engine_totals, fold_lines, leaf_texts, BuildError, Diagnostics,
    FoldedDocument, FoldedLine, Payload, PayloadTotals, PayloadTree, RoundingStrategy,
    XmlElement,
};
use crate::pipeline::signer::SignatureMode;
use crate::pipeline::transport::{ExchangeReply, ExchangeRequest, RetryPolicy};

use super::{
    AuthenticationMode, Codec, CodecDescriptor, CodecId, CounterpartyField,
    Endpoints, EnvelopeError, Exchange, IdempotencyKeyFormat, QueryContext, SignConvention,
    SubmitContext,
};

const SOAP_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WCF_NS: &str = "http://wcf.dian.colombia";
const ACTION_PREFIX: &str = "http://wcf.dian.colombia/IWcfDianCustomerServices/";

pub const TECHNICAL_KEY: &str = "dian.technical_key";
pub const SOFTWARE_PIN: &str = "dian.software_pin";
pub const TEST_SET_ID: &str = "dian.test_set_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DianProfile {
    Production,
    Habilitacion,
}

impl DianProfile {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Production => "production",
            Self::Habilitacion => "habilitacion",
        }
    }

    /// `TipoAmbiente` / `ProfileExecutionID`.
    const fn environment(self) -> &'static str {
        match self {
            Self::Production => "1",
            Self::Habilitacion => "2",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DianCodec {
    descriptor: CodecDescriptor,
    profile: DianProfile,
}

impl DianCodec {
    pub const FAMILY: &'static str = "co-dian";
    pub const DEFAULT_BASE_URL: &'static str =
        "https://vpfe.dian.gov.co/WcfDianCustomerServices.svc";

    pub fn new(kind: DocumentKind, profile: DianProfile, base_url: &str) -> Self {
        let service = base_url.trim_end_matches('/').to_string();
        let descriptor = CodecDescriptor {
            id: CodecId::new("CO", kind, profile.as_str()),
            family: Self::FAMILY,
            schema_version: "UBL 2.1 / Anexo Tecnico 1.9",
            endpoints: Endpoints {
                submit: service.clone(),
                status: matches!(profile, DianProfile::Habilitacion).then(|| service.clone()),
                lookup: Some(service),
            },
            authentication: AuthenticationMode::EmbeddedSignature,
            credential_kind: Some(CredentialKind::SigningKey),
            signature: SignatureMode::EnvelopedXml,
            rounding: RoundingStrategy::PerLine,
            sign_convention: SignConvention::AsPosted,
            idempotency: IdempotencyKeyFormat {
                prefix: "co-",
                header: None,
            },
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            poll_interval: matches!(profile, DianProfile::Habilitacion)
                .then(|| Duration::from_secs(60)),
            lookup_supported: true,
            pending_counts_as_issued: false,
            allowed_rates: vec![
                (TaxScheme::Vat, TaxRate(0)),
                (TaxScheme::Vat, TaxRate(500)),
                (TaxScheme::Vat, TaxRate(1_900)),
                (TaxScheme::Consumption, TaxRate(800)),
            ],
            required_counterparty: vec![CounterpartyField::TaxId],
            requires_classification: false,
            requires_exemption_for_zero_rate: false,
        };
        Self {
            descriptor,
            profile,
        }
    }

    fn document_names(&self) -> DocumentNames {
        match self.descriptor.id.kind {
            DocumentKind::CreditNote => DocumentNames {
                root: "CreditNote",
                namespace: "urn:oasis:names:specification:ubl:schema:xsd:CreditNote-2",
                line: "cac:CreditNoteLine",
                quantity: "cbc:CreditedQuantity",
                type_code: Some(("cbc:CreditNoteTypeCode", "91")),
                prefix: "nc",
                key_scheme: "CUDE-SHA384",
                profile_label: "DIAN 2.1: Nota Crédito de Factura Electrónica de Venta",
            },
            DocumentKind::DebitNote => DocumentNames {
                root: "DebitNote",
                namespace: "urn:oasis:names:specification:ubl:schema:xsd:DebitNote-2",
                line: "cac:DebitNoteLine",
                quantity: "cbc:DebitedQuantity",
                type_code: None,
                prefix: "nd",
                key_scheme: "CUDE-SHA384",
                profile_label: "DIAN 2.1: Nota Débito de Factura Electrónica de Venta",
            },
            DocumentKind::Invoice | DocumentKind::Receipt => DocumentNames {
                root: "Invoice",
                namespace: "urn:oasis:names:specification:ubl:schema:xsd:Invoice-2",
                line: "cac:InvoiceLine",
                quantity: "cbc:InvoicedQuantity",
                type_code: Some(("cbc:InvoiceTypeCode", "01")),
                prefix: "fv",
                key_scheme: "CUFE-SHA384",
                profile_label: "DIAN 2.1: Factura Electrónica de Venta",
            },
        }
    }

    fn key_registration(&self) -> &'static str {
        match self.descriptor.id.kind {
            DocumentKind::CreditNote | DocumentKind::DebitNote => SOFTWARE_PIN,
            DocumentKind::Invoice | DocumentKind::Receipt => TECHNICAL_KEY,
        }
    }

    fn soap_request(&self, action: &str, operation: XmlElement) -> Option<ExchangeRequest> {
        let envelope = XmlElement::new("soap:Envelope")
            .attr("xmlns:soap", SOAP_NS)
            .attr("xmlns:wcf", WCF_NS)
            .child(XmlElement::new("soap:Header"))
            .child(XmlElement::new("soap:Body").child(operation));
        let body = envelope.to_document_bytes().ok()?;
        Some(ExchangeRequest::post(
            self.descriptor.endpoints.submit.clone(),
            &format!("application/soap+xml; charset=utf-8; action=\"{ACTION_PREFIX}{action}\""),
            body,
        ))
    }
}

struct DocumentNames {
    root: &'static str,
    namespace: &'static str,
    line: &'static str,
    quantity: &'static str,
    type_code: Option<(&'static str, &'static str)>,
    prefix: &'static str,
    key_scheme: &'static str,
    profile_label: &'static str,
}

impl Codec for DianCodec {
    fn descriptor(&self) -> &CodecDescriptor {
        &self.descriptor
    }

    fn build(&self, snapshot: &DocumentSnapshot) -> Result<Payload, BuildError> {
        let mut diagnostics = Diagnostics::new();
        check_common(snapshot, &self.descriptor, &mut diagnostics);
        let key_registration = self.key_registration();
        diagnostics.require(
            &format!("issuer.registrations.{key_registration}"),
            snapshot.issuer.registration(key_registration),
        );
        if self.profile == DianProfile::Habilitacion {
            diagnostics.require(
                &format!("issuer.registrations.{TEST_SET_ID}"),
                snapshot.issuer.registration(TEST_SET_ID),
            );
        }
        diagnostics.finish()?;

        let folded = fold_lines(snapshot, self.descriptor.rounding);
        let mut totals = Diagnostics::new();
        check_engine_totals(snapshot, &folded, &mut totals);
        totals.finish()?;

        let names = self.document_names();
        let amounts = Amounts::new(snapshot, self.descriptor.sign_convention);
        let document_key = document_key(snapshot, &folded, &amounts, key_registration, self.profile);

        let mut root = XmlElement::new(names.root)
            .attr("xmlns", names.namespace)
            .attr(
                "xmlns:cac",
                "urn:oasis:names:specification:ubl:schema:xsd:CommonAggregateComponents-2",
            )
            .attr(
                "xmlns:cbc",
                "urn:oasis:names:specification:ubl:schema:xsd:CommonBasicComponents-2",
            )
            .attr(
                "xmlns:ext",
                "urn:oasis:names:specification:ubl:schema:xsd:CommonExtensionComponents-2",
            )
            .attr("xmlns:sts", "dian:gov:co:facturaelectronica:Structures-2-1")
            .child(
                XmlElement::new("ext:UBLExtensions").child(
                    XmlElement::new("ext:UBLExtension")
                        .child(XmlElement::new("ext:ExtensionContent")),
                ),
            )
            .child(XmlElement::leaf("cbc:UBLVersionID", "UBL 2.1"))
            .child(XmlElement::leaf("cbc:CustomizationID", "10"))
            .child(XmlElement::leaf("cbc:ProfileID", names.profile_label))
            .child(XmlElement::leaf(
                "cbc:ProfileExecutionID",
                self.profile.environment(),
            ))
            .child(XmlElement::leaf("cbc:ID", snapshot.number.trim()))
            .child(
                XmlElement::leaf("cbc:UUID", document_key.clone())
                    .attr("schemeID", self.profile.environment())
                    .attr("schemeName", names.key_scheme),
            )
            .child(XmlElement::leaf(
                "cbc:IssueDate",
                snapshot.issued_at.format("%Y-%m-%d").to_string(),
            ))
            .child(XmlElement::leaf(
                "cbc:IssueTime",
                snapshot.issued_at.format("%H:%M:%S%:z").to_string(),
            ))
            .optional(
                snapshot
                    .due_date
                    .map(|due| XmlElement::leaf("cbc:DueDate", due.format("%Y-%m-%d").to_string())),
            )
            .optional(
                names
                    .type_code
                    .map(|(element, code)| XmlElement::leaf(element, code)),
            )
            .child(XmlElement::leaf(
                "cbc:DocumentCurrencyCode",
                snapshot.currency.code(),
            ))
            .child(XmlElement::leaf(
                "cbc:LineCountNumeric",
                folded.lines.len().to_string(),
            ))
            .optional(snapshot.references.purchase_order.as_deref().map(|order| {
                XmlElement::new("cac:OrderReference").child(XmlElement::leaf("cbc:ID", order))
            }));

        if let Some(source) = &snapshot.source {
            root.push(
                XmlElement::new("cac:BillingReference").child(
                    XmlElement::new("cac:InvoiceDocumentReference")
                        .child(XmlElement::leaf("cbc:ID", source.number.as_str()))
                        .optional(source.authority_ref.as_deref().map(|cufe| {
                            XmlElement::leaf("cbc:UUID", cufe).attr("schemeName", "CUFE-SHA384")
                        }))
                        .child(XmlElement::leaf(
                            "cbc:IssueDate",
                            source.issued_on.format("%Y-%m-%d").to_string(),
                        )),
                ),
            );
        }

        root.push(
            XmlElement::new("cac:AccountingSupplierParty")
                .child(XmlElement::leaf("cbc:AdditionalAccountID", "1"))
                .child(party(&snapshot.issuer)),
        );
        root.push(
            XmlElement::new("cac:AccountingCustomerParty")
                .child(XmlElement::leaf("cbc:AdditionalAccountID", "1"))
                .child(party(&snapshot.counterparty)),
        );

        if let Some(payment) = &snapshot.payment {
            root.push(
                XmlElement::new("cac:PaymentMeans")
                    .child(XmlElement::leaf("cbc:ID", "2"))
                    .child(XmlElement::leaf(
                        "cbc:PaymentMeansCode",
                        payment.means_code.as_str(),
                    ))
                    .child(XmlElement::leaf(
                        "cbc:PaymentDueDate",
                        payment.due_date.format("%Y-%m-%d").to_string(),
                    )),
            );
        }

        for scheme in [TaxScheme::Vat, TaxScheme::Consumption] {
            let subtotals: Vec<XmlElement> = folded
                .buckets_for(scheme)
                .map(|bucket| {
                    tax_subtotal(&amounts, scheme, bucket.rate, bucket.base_minor, bucket.tax_minor)
                })
                .collect();
            if subtotals.is_empty() {
                continue;
            }
            root.push(
                XmlElement::new("cac:TaxTotal")
                    .child(amounts.element("cbc:TaxAmount", folded.scheme_total(scheme)))
                    .children(subtotals),
            );
        }

        root.push(
            XmlElement::new("cac:LegalMonetaryTotal")
                .child(amounts.element("cbc:LineExtensionAmount", folded.net_minor))
                .child(amounts.element("cbc:TaxExclusiveAmount", folded.net_minor))
                .child(amounts.element("cbc:TaxInclusiveAmount", folded.gross_minor()))
                .child(amounts.element("cbc:PayableAmount", folded.gross_minor())),
        );

        for line in &folded.lines {
            root.push(document_line(&names, &amounts, line));
        }

        let nit = snapshot.issuer.tax_id().unwrap_or_default();
        let filename = format!(
            "{}{:0>10}{}.xml",
            names.prefix,
            sanitize(nit),
            sanitize(&snapshot.number).to_ascii_lowercase()
        );
        let totals = PayloadTotals {
            net_minor: folded.net_minor,
            tax_minor: folded.tax_minor,
            gross_minor: folded.gross_minor(),
        };

        Ok(Payload::new(PayloadTree::Xml(root), filename, totals)?.with_authority_ref(document_key))
    }

    fn submit_request(&self, context: &SubmitContext<'_>) -> Result<ExchangeRequest, BuildError> {
        let zip_name = context.payload.filename.replace(".xml", ".zip");
        let archive = stored_zip(&[(context.payload.filename.as_str(), &context.signed.bytes)])
            .map_err(|error| BuildError::single("payload", "ARCHIVE", error.to_string()))?;

        let (action, mut operation) = match self.profile {
            DianProfile::Production => ("SendBillSync", XmlElement::new("wcf:SendBillSync")),
            DianProfile::Habilitacion => {
                ("SendTestSetAsync", XmlElement::new("wcf:SendTestSetAsync"))
            }
        };
        operation.push(XmlElement::leaf("wcf:fileName", zip_name));
        operation.push(XmlElement::leaf("wcf:contentFile", STANDARD.encode(archive)));
        if self.profile == DianProfile::Habilitacion {
            let test_set = context
                .snapshot
                .issuer
                .registration(TEST_SET_ID)
                .unwrap_or_default();
            operation.push(XmlElement::leaf("wcf:testSetId", test_set));
        }

        let request = self.soap_request(action, operation).ok_or_else(|| {
            BuildError::single("payload", "SERIALIZATION", "SOAP envelope could not be written")
        })?;
        Ok(request
            .idempotent(&self.descriptor.idempotency, context.idempotency_key)
            .authenticated(
                self.descriptor.authentication,
                context.signed,
                context.credential,
            ))
    }

    fn status_request(&self, context: &QueryContext<'_>) -> Option<ExchangeRequest> {
        let track_id = context.tracking_ref?;
        self.descriptor.endpoints.status.as_ref()?;
        self.soap_request(
            "GetStatusZip",
            XmlElement::new("wcf:GetStatusZip").child(XmlElement::leaf("wcf:trackId", track_id)),
        )
    }

    fn lookup_request(&self, context: &QueryContext<'_>) -> Option<ExchangeRequest> {
        let document_key = context.payload.authority_ref.as_deref()?;
        self.soap_request(
            "GetStatus",
            XmlElement::new("wcf:GetStatus").child(XmlElement::leaf("wcf:trackId", document_key)),
        )
    }

    fn parse_reply(
        &self,
        exchange: Exchange,
        reply: &ExchangeReply,
    ) -> Result<AuthorityReply, EnvelopeError> {
        parse_reply(exchange, &reply.body).map(AuthorityReply::Dian)
    }
}

/// DIAN `StatusCode` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DianStatus {
    /// `00`
    Valid,
    /// `99`
    Invalid,
    /// `66`
    NotFound,
    /// `98`, still being validated.
    Processing,
    /// Test-set upload acknowledged with a `ZipKey`.
    Received,
    Other(String),
}

impl DianStatus {
    fn from_code(code: &str) -> Self {
        match code.trim() {
            "00" | "0" => Self::Valid,
            "99" => Self::Invalid,
            "66" => Self::NotFound,
            "98" => Self::Processing,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn code(&self) -> String {
        match self {
            Self::Valid => "00".to_string(),
            Self::Invalid => "99".to_string(),
            Self::NotFound => "66".to_string(),
            Self::Processing => "98".to_string(),
            Self::Received => "RECEIVED".to_string(),
            Self::Other(code) => code.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DianReply {
    pub is_valid: bool,
    pub status: DianStatus,
    pub status_description: String,
    pub messages: Vec<String>,
    /// CUFE/CUDE echoed by the authority.
    pub document_key: Option<String>,
    pub track_id: Option<String>,
    /// Decoded `ApplicationResponse` document.
    pub application_response: Option<Vec<u8>>,
}

fn parse_reply(exchange: Exchange, body: &[u8]) -> Result<DianReply, EnvelopeError> {
    let texts = leaf_texts(body).map_err(|error| EnvelopeError::new(exchange, error))?;
    let first = |name: &str| {
        texts
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.clone())
            .filter(|value| !value.is_empty())
    };

    let track_id = first("ZipKey");
    let status = match (first("StatusCode"), &track_id) {
        (Some(code), _) => DianStatus::from_code(&code),
        (None, Some(_)) => DianStatus::Received,
        (None, None) => {
            return Err(EnvelopeError::new(
                exchange,
                "reply carries neither StatusCode nor ZipKey",
            ))
        }
    };

    let messages = texts
        .iter()
        .filter(|(key, _)| key == "string" || key == "ProcessedMessage")
        .map(|(_, value)| value.clone())
        .collect();
    let application_response = first("XmlBase64Bytes").and_then(|encoded| STANDARD.decode(encoded).ok());

    Ok(DianReply {
        is_valid: first("IsValid").is_some_and(|value| value.eq_ignore_ascii_case("true")),
        status,
        status_description: first("StatusDescription").unwrap_or_default(),
        messages,
        document_key: first("XmlDocumentKey"),
        track_id,
        application_response,
    })
}

/// Fixed two-decimal rendering in the document currency.
struct Amounts {
    currency: String,
    scale: u32,
    kind: DocumentKind,
    convention: SignConvention,
}

impl Amounts {
    fn new(snapshot: &DocumentSnapshot, convention: SignConvention) -> Self {
        Self {
            currency: snapshot.currency.code().to_string(),
            scale: snapshot.currency.minor_unit_scale(),
            kind: snapshot.kind,
            convention,
        }
    }

    fn format(&self, amount_minor: i64) -> String {
        format_scaled(self.convention.apply(self.kind, amount_minor), self.scale, 2, '.')
    }

    fn element(&self, name: &str, amount_minor: i64) -> XmlElement {
        XmlElement::leaf(name, self.format(amount_minor)).attr("currencyID", self.currency.as_str())
    }
}

/// CUFE/CUDE: SHA-384 over the legally defined concatenation.
fn document_key(
    snapshot: &DocumentSnapshot,
    folded: &FoldedDocument<'_>,
    amounts: &Amounts,
    key_registration: &str,
    profile: DianProfile,
) -> String {
    let ica: i64 = 0;
    let source = [
        snapshot.number.trim().to_string(),
        snapshot.issued_at.format("%Y-%m-%d").to_string(),
        snapshot.issued_at.format("%H:%M:%S%:z").to_string(),
        amounts.format(folded.net_minor),
        "01".to_string(),
        amounts.format(folded.scheme_total(TaxScheme::Vat)),
        "04".to_string(),
        amounts.format(folded.scheme_total(TaxScheme::Consumption)),
        "03".to_string(),
        amounts.format(ica),
        amounts.format(folded.gross_minor()),
        snapshot.issuer.tax_id().unwrap_or_default().to_string(),
        snapshot.counterparty.tax_id().unwrap_or_default().to_string(),
        snapshot
            .issuer
            .registration(key_registration)
            .unwrap_or_default()
            .to_string(),
        profile.environment().to_string(),
    ]
    .concat();
    hex::encode(Sha384::digest(source.as_bytes()))
}

fn scheme_identifier(scheme: IdentificationScheme) -> &'static str {
    match scheme {
        IdentificationScheme::TaxRegistry | IdentificationScheme::VatNumber => "31",
        IdentificationScheme::NationalId => "13",
        IdentificationScheme::Passport => "41",
        IdentificationScheme::FiscalCode | IdentificationScheme::Foreign => "42",
    }
}

fn tax_scheme(scheme: TaxScheme) -> XmlElement {
    let (id, name) = match scheme {
        TaxScheme::Vat => ("01", "IVA"),
        TaxScheme::Consumption => ("04", "INC"),
    };
    XmlElement::new("cac:TaxScheme")
        .child(XmlElement::leaf("cbc:ID", id))
        .child(XmlElement::leaf("cbc:Name", name))
}

fn party(party: &Party) -> XmlElement {
    let address = party.address.as_ref().map(|address| {
        XmlElement::new("cac:PhysicalLocation").child(
            XmlElement::new("cac:Address")
                .child(XmlElement::leaf("cbc:CityName", address.city.as_str()))
                .optional(
                    address
                        .region
                        .as_deref()
                        .map(|region| XmlElement::leaf("cbc:CountrySubentity", region)),
                )
                .child(
                    XmlElement::new("cac:AddressLine")
                        .child(XmlElement::leaf("cbc:Line", address.street.as_str())),
                )
                .child(
                    XmlElement::new("cac:Country")
                        .child(XmlElement::leaf("cbc:IdentificationCode", address.country_code.as_str())),
                ),
        )
    });

    XmlElement::new("cac:Party")
        .child(
            XmlElement::new("cac:PartyName").child(XmlElement::leaf("cbc:Name", party.name.as_str())),
        )
        .optional(address)
        .child(
            XmlElement::new("cac:PartyTaxScheme")
                .child(XmlElement::leaf("cbc:RegistrationName", party.name.as_str()))
                .child(
                    XmlElement::leaf("cbc:CompanyID", party.tax_id().unwrap_or_default())
                        .attr("schemeAgencyID", "195")
                        .attr("schemeName", scheme_identifier(party.scheme)),
                )
                .child(tax_scheme(TaxScheme::Vat)),
        )
        .optional(party.email.as_deref().map(|email| {
            XmlElement::new("cac:Contact").child(XmlElement::leaf("cbc:ElectronicMail", email))
        }))
}

fn tax_subtotal(
    amounts: &Amounts,
    scheme: TaxScheme,
    rate: TaxRate,
    base_minor: i64,
    tax_minor: i64,
) -> XmlElement {
    XmlElement::new("cac:TaxSubtotal")
        .child(amounts.element("cbc:TaxableAmount", base_minor))
        .child(amounts.element("cbc:TaxAmount", tax_minor))
        .child(
            XmlElement::new("cac:TaxCategory")
                .child(XmlElement::leaf(
                    "cbc:Percent",
                    format_scaled(i64::from(rate.basis()), TaxRate::SCALE, 2, '.'),
                ))
                .child(tax_scheme(scheme)),
        )
}

fn document_line(names: &DocumentNames, amounts: &Amounts, line: &FoldedLine<'_>) -> XmlElement {
    let unit = line.line.unit_code.as_deref().unwrap_or("94");
    let taxes = line.taxes.iter().map(|tax| {
        XmlElement::new("cac:TaxTotal")
            .child(amounts.element("cbc:TaxAmount", tax.tax_minor))
            .child(tax_subtotal(amounts, tax.scheme, tax.rate, tax.base_minor, tax.tax_minor))
    });

    XmlElement::new(names.line)
        .child(XmlElement::leaf("cbc:ID", line.position.to_string()))
        .child(
            XmlElement::leaf(
                names.quantity,
                format_scaled(line.line.quantity.milli(), 3, 3, '.'),
            )
            .attr("unitCode", unit),
        )
        .child(amounts.element("cbc:LineExtensionAmount", line.net_minor))
        .children(taxes)
        .child(
            XmlElement::new("cac:Item")
                .child(XmlElement::leaf("cbc:Description", line.line.description.as_str()))
                .optional(line.line.product_code.as_deref().map(|code| {
                    XmlElement::new("cac:StandardItemIdentification")
                        .child(XmlElement::leaf("cbc:ID", code).attr("schemeID", "999"))
                })),
        )
        .child(
            XmlElement::new("cac:Price")
                .child(amounts.element("cbc:PriceAmount", line.line.unit_price_minor))
                .child(XmlElement::leaf("cbc:BaseQuantity", "1.000").attr("unitCode", unit)),
        )
}

fn sanitize(raw: &str) -> String {
    raw.chars().filter(char::is_ascii_alphanumeric).collect()
}
