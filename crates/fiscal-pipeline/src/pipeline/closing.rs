//! Tax closing view: documents that count as legally issued in a period.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::warn;

use crate::document::{DocumentId, DocumentKind};
use crate::pipeline::codec::{CodecId, CodecRegistry};
use crate::pipeline::ledger::{DocumentState, IssuedDocument, LedgerError, LedgerStore};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosingEntry {
    pub document_id: DocumentId,
    pub number: String,
    pub kind: DocumentKind,
    pub codec: CodecId,
    pub state: DocumentState,
    pub authority_ref: Option<String>,
    pub issue_date: NaiveDate,
    pub currency: String,
    /// Signed according to the codec's convention for credit notes.
    pub net_minor: i64,
    pub tax_minor: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClosingTotals {
    pub net_minor: i64,
    pub tax_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosingView {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub entries: Vec<ClosingEntry>,
    /// Keyed by ISO currency code.
    pub totals: BTreeMap<String, ClosingTotals>,
}

/// Accepted documents always count; `pending_authority` ones only when their
/// codec's manifest says so.
pub fn closing_view<L: LedgerStore + ?Sized>(
    ledger: &L,
    registry: &CodecRegistry,
    from: NaiveDate,
    to: NaiveDate,
) -> Result<ClosingView, LedgerError> {
    let mut entries = Vec::new();
    let mut totals: BTreeMap<String, ClosingTotals> = BTreeMap::new();

    for issued in ledger.issued_between(from, to)? {
        let Some(entry) = entry_for(registry, issued) else {
            continue;
        };
        let bucket = totals.entry(entry.currency.clone()).or_default();
        bucket.net_minor += entry.net_minor;
        bucket.tax_minor += entry.tax_minor;
        entries.push(entry);
    }

    entries.sort_by(|a, b| {
        (a.issue_date, &a.number, &a.document_id.0).cmp(&(b.issue_date, &b.number, &b.document_id.0))
    });
    Ok(ClosingView {
        from,
        to,
        entries,
        totals,
    })
}

fn entry_for(registry: &CodecRegistry, issued: IssuedDocument) -> Option<ClosingEntry> {
    let IssuedDocument { status, snapshot } = issued;
    let codec_id = status.codec?;
    let Some(codec) = registry.get(&codec_id) else {
        warn!(document = %status.document_id, codec = %codec_id, "closing skips document of unknown codec");
        return None;
    };
    let descriptor = codec.descriptor();
    let counts = match status.state {
        DocumentState::Accepted => true,
        DocumentState::PendingAuthority => descriptor.pending_counts_as_issued,
        _ => false,
    };
    if !counts {
        return None;
    }

    let net: i64 = snapshot.tax_totals.iter().map(|total| total.base_minor).sum();
    let tax: i64 = snapshot.tax_totals.iter().map(|total| total.tax_minor).sum();
    Some(ClosingEntry {
        document_id: status.document_id,
        issue_date: snapshot.issue_date(),
        number: snapshot.number,
        kind: snapshot.kind,
        codec: codec_id,
        state: status.state,
        authority_ref: status.authority_ref,
        currency: snapshot.currency.code().to_string(),
        net_minor: descriptor.sign_convention.apply(snapshot.kind, net),
        tax_minor: descriptor.sign_convention.apply(snapshot.kind, tax),
    })
}
