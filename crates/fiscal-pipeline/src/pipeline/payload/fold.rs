use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::document::{DocumentLine, DocumentSnapshot, TaxRate, TaxScheme};

/// Where tax rounding happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingStrategy {
    /// Round each line's tax, then sum the rounded amounts.
    PerLine,
    /// Sum the bases per rate, then apply the rate once.
    PerRate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldedTax {
    pub scheme: TaxScheme,
    pub rate: TaxRate,
    pub exemption_code: Option<String>,
    pub base_minor: i64,
    pub tax_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldedLine<'a> {
    /// 1-based position in the document body.
    pub position: usize,
    pub line: &'a DocumentLine,
    pub net_minor: i64,
    pub taxes: Vec<FoldedTax>,
}

impl FoldedLine<'_> {
    pub fn tax_minor(&self) -> i64 {
        self.taxes.iter().map(|tax| tax.tax_minor).sum()
    }

    pub fn vat(&self) -> Option<&FoldedTax> {
        self.taxes.iter().find(|tax| tax.scheme == TaxScheme::Vat)
    }
}

/// One aggregated `(scheme, rate, exemption)` summary row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaxBucket {
    pub scheme: TaxScheme,
    pub rate: TaxRate,
    pub exemption_code: Option<String>,
    pub base_minor: i64,
    pub tax_minor: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldedDocument<'a> {
    pub lines: Vec<FoldedLine<'a>>,
    /// Ordered by scheme, rate, then exemption code.
    pub buckets: Vec<TaxBucket>,
    pub net_minor: i64,
    pub tax_minor: i64,
}

impl FoldedDocument<'_> {
    pub fn gross_minor(&self) -> i64 {
        self.net_minor + self.tax_minor
    }

    pub fn scheme_total(&self, scheme: TaxScheme) -> i64 {
        self.buckets
            .iter()
            .filter(|bucket| bucket.scheme == scheme)
            .map(|bucket| bucket.tax_minor)
            .sum()
    }

    pub fn buckets_for(&self, scheme: TaxScheme) -> impl Iterator<Item = &TaxBucket> {
        self.buckets
            .iter()
            .filter(move |bucket| bucket.scheme == scheme)
    }
}

/// Folds the snapshot's lines into line amounts and tax buckets.
pub fn fold_lines(snapshot: &DocumentSnapshot, strategy: RoundingStrategy) -> FoldedDocument<'_> {
    let lines: Vec<FoldedLine<'_>> = snapshot
        .lines
        .iter()
        .enumerate()
        .map(|(index, line)| {
            let net_minor = line.net_minor();
            let taxes = line
                .taxes
                .iter()
                .map(|tax| FoldedTax {
                    scheme: tax.scheme,
                    rate: tax.rate,
                    exemption_code: tax.exemption_code.clone(),
                    base_minor: net_minor,
                    tax_minor: tax.rate.apply(net_minor),
                })
                .collect();
            FoldedLine {
                position: index + 1,
                line,
                net_minor,
                taxes,
            }
        })
        .collect();

    let mut grouped: BTreeMap<(TaxScheme, TaxRate, Option<String>), (i64, i64)> = BTreeMap::new();
    for line in &lines {
        for tax in &line.taxes {
            let entry = grouped
                .entry((tax.scheme, tax.rate, tax.exemption_code.clone()))
                .or_insert((0, 0));
            entry.0 += tax.base_minor;
            entry.1 += tax.tax_minor;
        }
    }

    let buckets: Vec<TaxBucket> = grouped
        .into_iter()
        .map(|((scheme, rate, exemption_code), (base_minor, line_tax))| {
            let tax_minor = match strategy {
                RoundingStrategy::PerLine => line_tax,
                RoundingStrategy::PerRate => rate.apply(base_minor),
            };
            TaxBucket {
                scheme,
                rate,
                exemption_code,
                base_minor,
                tax_minor,
            }
        })
        .collect();

    let net_minor = lines.iter().map(|line| line.net_minor).sum();
    let tax_minor = buckets.iter().map(|bucket| bucket.tax_minor).sum();

    FoldedDocument {
        lines,
        buckets,
        net_minor,
        tax_minor,
    }
}
