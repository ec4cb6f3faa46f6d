use crate::document::{DocumentSnapshot, TaxScheme};
use crate::pipeline::codec::{CodecDescriptor, CounterpartyField};
use crate::pipeline::interpreter::ErrorDetail;

use super::fold::FoldedDocument;
use super::BuildError;

pub const REQUIRED: &str = "REQUIRED";
pub const INVALID: &str = "INVALID";

/// Collects per-field diagnostics before any payload is emitted.
#[derive(Debug, Default)]
pub struct Diagnostics(Vec<ErrorDetail>);

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, field: &str, code: &str, message: impl Into<String>) {
        self.0.push(ErrorDetail::field(field, code, message));
    }

    /// Records a `REQUIRED` diagnostic when `value` is missing or blank.
    pub fn require(&mut self, field: &str, value: Option<&str>) {
        if value.map_or(true, |value| value.trim().is_empty()) {
            self.push(field, REQUIRED, format!("{field} is required"));
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn finish(self) -> Result<(), BuildError> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(BuildError(self.0))
        }
    }
}

/// Preconditions shared by every codec: lines present, amounts sane, rates
/// allowed, mandatory parties, open accounting period and source references.
pub fn check_common(
    snapshot: &DocumentSnapshot,
    descriptor: &CodecDescriptor,
    diagnostics: &mut Diagnostics,
) {
    diagnostics.require("number", Some(snapshot.number.as_str()));
    diagnostics.require("issuer.tax_id", snapshot.issuer.tax_id());
    diagnostics.require("issuer.name", Some(snapshot.issuer.name.as_str()));

    if snapshot.currency.code().len() != 3 {
        diagnostics.push("currency", INVALID, "currency must be an ISO 4217 code");
    }

    for field in &descriptor.required_counterparty {
        let missing = match field {
            CounterpartyField::TaxId => snapshot.counterparty.tax_id().is_none(),
            CounterpartyField::Address => snapshot.counterparty.address.is_none(),
            CounterpartyField::Email => snapshot
                .counterparty
                .email
                .as_deref()
                .map_or(true, |email| email.trim().is_empty()),
        };
        if missing {
            diagnostics.push(
                field.path(),
                REQUIRED,
                format!("{} is required by {}", field.path(), descriptor.id),
            );
        }
    }

    if let Some(lock_date) = snapshot.fiscal_lock_date {
        if snapshot.issue_date() <= lock_date {
            diagnostics.push(
                "issued_at",
                "LOCKED_PERIOD",
                format!("issue date falls in the period closed on {lock_date}"),
            );
        }
    }

    if snapshot.kind.amends_source() && snapshot.source.is_none() {
        diagnostics.push(
            "source",
            REQUIRED,
            format!("a {} must reference the document it amends", snapshot.kind),
        );
    }

    if snapshot.lines.is_empty() {
        diagnostics.push("lines", "EMPTY", "document has no lines");
    }

    let document_net = snapshot
        .lines
        .iter()
        .try_fold(0_i64, |total, line| total.checked_add(line.checked_net_minor()?));
    if document_net.is_none() && snapshot.lines.iter().all(|line| line.checked_net_minor().is_some()) {
        diagnostics.push("lines", INVALID, "document total does not fit in minor units");
    }

    let requires_vat = descriptor
        .allowed_rates
        .iter()
        .any(|(scheme, _)| *scheme == TaxScheme::Vat);

    for (index, line) in snapshot.lines.iter().enumerate() {
        let prefix = format!("lines[{index}]");
        if line.description.trim().is_empty() {
            diagnostics.push(&format!("{prefix}.description"), REQUIRED, "line description is required");
        }
        if line.quantity.milli() <= 0 {
            diagnostics.push(&format!("{prefix}.quantity"), INVALID, "quantity must be positive");
        }
        if line.unit_price_minor < 0 || line.discount_minor < 0 {
            diagnostics.push(
                &format!("{prefix}.unit_price"),
                INVALID,
                "prices and discounts are posted as non-negative amounts",
            );
        }
        match line.checked_net_minor() {
            None => diagnostics.push(
                &format!("{prefix}.unit_price"),
                INVALID,
                "line amount does not fit in minor units",
            ),
            Some(net) if net < 0 => {
                diagnostics.push(&format!("{prefix}.discount"), INVALID, "discount exceeds the line amount")
            }
            Some(_) => {}
        }
        if descriptor.requires_classification {
            diagnostics.require(
                &format!("{prefix}.classification_code"),
                line.classification_code.as_deref(),
            );
        }
        if requires_vat && !line.taxes.iter().any(|tax| tax.scheme == TaxScheme::Vat) {
            diagnostics.push(&format!("{prefix}.taxes"), REQUIRED, "line carries no VAT rate");
        }

        for (tax_index, tax) in line.taxes.iter().enumerate() {
            let tax_field = format!("{prefix}.taxes[{tax_index}]");
            if !descriptor.allows_rate(tax.scheme, tax.rate) {
                diagnostics.push(
                    &format!("{tax_field}.rate"),
                    "RATE_NOT_ALLOWED",
                    format!("rate {}% is not accepted by {}", tax.rate, descriptor.id),
                );
            }
            if descriptor.requires_exemption_for_zero_rate && tax.rate.is_zero() {
                diagnostics.require(
                    &format!("{tax_field}.exemption_code"),
                    tax.exemption_code.as_deref(),
                );
            }
        }
    }
}

/// Cross-checks the folded tax buckets against the totals the accounting
/// engine captured, allowing one minor unit of drift per line.
pub fn check_engine_totals(
    snapshot: &DocumentSnapshot,
    folded: &FoldedDocument<'_>,
    diagnostics: &mut Diagnostics,
) {
    let tolerance = snapshot.lines.len().max(1) as i64;
    for (index, total) in snapshot.tax_totals.iter().enumerate() {
        let computed: i64 = folded
            .buckets
            .iter()
            .filter(|bucket| bucket.scheme == total.scheme && bucket.rate == total.rate)
            .map(|bucket| bucket.tax_minor)
            .sum();
        if (computed - total.tax_minor).abs() > tolerance {
            diagnostics.push(
                &format!("tax_totals[{index}]"),
                "TOTAL_MISMATCH",
                format!(
                    "engine reports {} tax at {}% but lines fold to {}",
                    total.tax_minor, total.rate, computed
                ),
            );
        }
    }
}
