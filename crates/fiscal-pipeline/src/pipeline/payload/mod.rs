//! Format-neutral intermediate trees produced by the codec builders.
//!
//! A builder folds the snapshot's lines, emits a tree in schema order and
//! serializes it once. Serialization is deterministic: attribute order is
//! insertion order, JSON objects are key-sorted and fixed-width records are
//! padded to their declared width.

mod fixed_width;
mod fold;
mod preconditions;
mod xml;

pub use fixed_width::FixedWidthRecord;
pub use fold::{fold_lines, FoldedDocument, FoldedLine, FoldedTax, RoundingStrategy, TaxBucket};
pub use preconditions::{check_common, check_engine_totals, Diagnostics, INVALID, REQUIRED};
pub use xml::{leaf_texts, XmlElement, XmlNode};

use serde::Serialize;

use crate::pipeline::interpreter::ErrorDetail;

/// Builder failure carrying one diagnostic per offending field.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("document failed {} payload precondition(s)", .0.len())]
pub struct BuildError(pub Vec<ErrorDetail>);

impl BuildError {
    pub fn single(field: &str, code: &str, message: impl Into<String>) -> Self {
        Self(vec![ErrorDetail::field(field, code, message)])
    }

    pub fn details(&self) -> &[ErrorDetail] {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PayloadTree {
    Xml(XmlElement),
    Records(Vec<FixedWidthRecord>),
    Json(serde_json::Value),
}

impl PayloadTree {
    pub fn media_type(&self) -> &'static str {
        match self {
            Self::Xml(_) => "application/xml",
            Self::Records(_) => "text/plain",
            Self::Json(_) => "application/json",
        }
    }

    /// Serialized bytes; XML carries the UTF-8 declaration.
    pub fn serialize(&self) -> Result<Vec<u8>, BuildError> {
        match self {
            Self::Xml(root) => root.to_document_bytes().map_err(|err| {
                BuildError::single("payload", "SERIALIZATION", err.to_string())
            }),
            Self::Records(records) => {
                let mut bytes = Vec::with_capacity(records.len() * 122);
                for record in records {
                    bytes.extend_from_slice(record.as_bytes());
                    bytes.extend_from_slice(b"\r\n");
                }
                Ok(bytes)
            }
            Self::Json(value) => serde_json::to_vec(value).map_err(|err| {
                BuildError::single("payload", "SERIALIZATION", err.to_string())
            }),
        }
    }
}

/// Aggregates computed from the ordered body, in minor units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PayloadTotals {
    pub net_minor: i64,
    pub tax_minor: i64,
    pub gross_minor: i64,
}

/// Built payload ready for signing.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub tree: PayloadTree,
    pub bytes: Vec<u8>,
    pub filename: String,
    /// Reference the authority derives deterministically from the payload
    /// (for example a CUFE), known before submission.
    pub authority_ref: Option<String>,
    pub totals: PayloadTotals,
}

impl Payload {
    pub fn new(
        tree: PayloadTree,
        filename: impl Into<String>,
        totals: PayloadTotals,
    ) -> Result<Self, BuildError> {
        let bytes = tree.serialize()?;
        Ok(Self {
            tree,
            bytes,
            filename: filename.into(),
            authority_ref: None,
            totals,
        })
    }

    pub fn with_authority_ref(mut self, reference: impl Into<String>) -> Self {
        self.authority_ref = Some(reference.into());
        self
    }

    pub fn media_type(&self) -> &'static str {
        self.tree.media_type()
    }
}
