use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::money::{Currency, Money, Quantity, TaxRate};

/// Stable identifier of an accounting document in the upstream engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(pub String);

impl DocumentId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    Invoice,
    CreditNote,
    DebitNote,
    Receipt,
}

impl DocumentKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invoice => "invoice",
            Self::CreditNote => "credit_note",
            Self::DebitNote => "debit_note",
            Self::Receipt => "receipt",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "invoice" => Some(Self::Invoice),
            "credit_note" => Some(Self::CreditNote),
            "debit_note" => Some(Self::DebitNote),
            "receipt" => Some(Self::Receipt),
            _ => None,
        }
    }

    /// Credit and debit notes amend a previously issued document.
    pub const fn amends_source(self) -> bool {
        matches!(self, Self::CreditNote | Self::DebitNote)
    }
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a party's tax identifier is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentificationScheme {
    VatNumber,
    TaxRegistry,
    FiscalCode,
    NationalId,
    Passport,
    Foreign,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub street: String,
    pub city: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    pub country_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Party {
    pub name: String,
    #[serde(default)]
    pub tax_id: Option<String>,
    pub scheme: IdentificationScheme,
    pub country_code: String,
    #[serde(default)]
    pub address: Option<Address>,
    #[serde(default)]
    pub email: Option<String>,
    /// Jurisdiction registrations such as technical keys or branch codes,
    /// keyed `"<authority>.<name>"`.
    #[serde(default)]
    pub registrations: BTreeMap<String, String>,
}

impl Party {
    pub fn registration(&self, key: &str) -> Option<&str> {
        self.registrations
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn tax_id(&self) -> Option<&str> {
        self.tax_id
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxScheme {
    Vat,
    Consumption,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTax {
    pub scheme: TaxScheme,
    pub rate: TaxRate,
    /// Exemption or nature code required by some authorities for zero rates.
    #[serde(default)]
    pub exemption_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentLine {
    pub description: String,
    pub quantity: Quantity,
    pub unit_price_minor: i64,
    #[serde(default)]
    pub discount_minor: i64,
    #[serde(default)]
    pub taxes: Vec<LineTax>,
    #[serde(default)]
    pub classification_code: Option<String>,
    #[serde(default)]
    pub product_code: Option<String>,
    #[serde(default)]
    pub unit_code: Option<String>,
}

impl DocumentLine {
    /// Net line amount: quantity times unit price, minus the discount.
    /// `None` when it does not fit in minor units.
    pub fn checked_net_minor(&self) -> Option<i64> {
        let gross = super::money::round_div(
            i128::from(self.quantity.milli()) * i128::from(self.unit_price_minor),
            1_000,
        );
        i64::try_from(gross).ok()?.checked_sub(self.discount_minor)
    }

    /// Net amount of a line that passed the build preconditions; those
    /// reject lines whose amount overflows, so the fallback is never read.
    pub fn net_minor(&self) -> i64 {
        self.checked_net_minor().unwrap_or_default()
    }
}

/// Tax totals as computed by the accounting engine at posting time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxTotal {
    pub scheme: TaxScheme,
    pub rate: TaxRate,
    pub base_minor: i64,
    pub tax_minor: i64,
}

/// Document amended by a credit or debit note.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceReference {
    pub number: String,
    pub issued_on: NaiveDate,
    #[serde(default)]
    pub authority_ref: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentReferences {
    #[serde(default)]
    pub purchase_order: Option<String>,
    #[serde(default)]
    pub contract_tags: Vec<String>,
}

/// Collection instructions for documents settled through bank orders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentInstruction {
    pub means_code: String,
    pub due_date: NaiveDate,
    #[serde(default)]
    pub bank_abi: Option<String>,
    #[serde(default)]
    pub bank_cab: Option<String>,
    #[serde(default)]
    pub bank_name: Option<String>,
}

/// Frozen view of one posted accounting document.
///
/// The pipeline never mutates a snapshot; an upstream change produces a new
/// snapshot with a different [`DocumentSnapshot::content_hash`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    pub id: DocumentId,
    pub kind: DocumentKind,
    pub number: String,
    #[serde(default)]
    pub profile: Option<String>,
    pub issuer: Party,
    pub counterparty: Party,
    pub currency: Currency,
    pub issued_at: DateTime<FixedOffset>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    pub lines: Vec<DocumentLine>,
    #[serde(default)]
    pub tax_totals: Vec<TaxTotal>,
    #[serde(default)]
    pub source: Option<SourceReference>,
    #[serde(default)]
    pub references: DocumentReferences,
    #[serde(default)]
    pub payment: Option<PaymentInstruction>,
    /// Last date of the closed accounting period; documents dated on or before
    /// it cannot be reported.
    #[serde(default)]
    pub fiscal_lock_date: Option<NaiveDate>,
}

impl DocumentSnapshot {
    pub fn issue_date(&self) -> NaiveDate {
        self.issued_at.date_naive()
    }

    pub fn money(&self, amount_minor: i64) -> Money {
        Money::new(amount_minor, self.currency.clone())
    }

    /// SHA-256 over the canonical JSON encoding.
    pub fn content_hash(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&encoded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn net_amount_applies_quantity_and_discount() {
        let line = DocumentLine {
            description: "Consulting".to_string(),
            quantity: Quantity(2_500),
            unit_price_minor: 4_000,
            discount_minor: 1_000,
            taxes: Vec::new(),
            classification_code: None,
            product_code: None,
            unit_code: None,
        };
        assert_eq!(line.net_minor(), 9_000);
    }

    #[test]
    fn overflowing_line_amounts_are_not_truncated() {
        let line = DocumentLine {
            description: "Bulk".to_string(),
            quantity: Quantity::units(1_000_000),
            unit_price_minor: i64::MAX / 2,
            discount_minor: 0,
            taxes: Vec::new(),
            classification_code: None,
            product_code: None,
            unit_code: None,
        };
        assert_eq!(line.checked_net_minor(), None);

        let discounted = DocumentLine {
            quantity: Quantity::units(1),
            unit_price_minor: 0,
            discount_minor: i64::MIN,
            ..line
        };
        assert_eq!(discounted.checked_net_minor(), None);
    }

    #[test]
    fn kind_round_trips_through_labels() {
        for kind in [
            DocumentKind::Invoice,
            DocumentKind::CreditNote,
            DocumentKind::DebitNote,
            DocumentKind::Receipt,
        ] {
            assert_eq!(DocumentKind::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(DocumentKind::parse("proforma"), None);
    }

    #[test]
    fn blank_registrations_are_ignored() {
        let mut registrations = BTreeMap::new();
        registrations.insert("dian.technical_key".to_string(), "  ".to_string());
        let party = Party {
            name: "Acme".to_string(),
            tax_id: Some(" ".to_string()),
            scheme: IdentificationScheme::TaxRegistry,
            country_code: "CO".to_string(),
            address: None,
            email: None,
            registrations,
        };
        assert!(party.registration("dian.technical_key").is_none());
        assert!(party.tax_id().is_none());
    }
}
