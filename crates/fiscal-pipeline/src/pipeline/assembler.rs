//! Attached-document package: source PDF, signed payload and authority reply
//! in one reproducible archive.

use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::document::DocumentSnapshot;
use crate::pipeline::archive::{stored_zip, ArchiveError};

const PDF_ENTRY: &str = "document.pdf";

/// Renders the printable form of a document. Printable layouts live outside
/// the pipeline; this is the seam they plug into.
pub trait SourcePdfProvider: Send + Sync {
    fn source_pdf(&self, snapshot: &DocumentSnapshot) -> Result<Vec<u8>, PdfError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("source PDF unavailable: {0}")]
pub struct PdfError(pub String);

#[derive(Debug, thiserror::Error)]
pub enum AssemblyError {
    #[error(transparent)]
    Pdf(#[from] PdfError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

/// Inputs for one package. Entry order is fixed: PDF, signed payload, reply,
/// then the authority artifact when there is one.
#[derive(Debug, Clone, Copy)]
pub struct PackageParts<'a> {
    pub issuer_tax_id: &'a str,
    pub document_number: &'a str,
    pub authority_ref: &'a str,
    pub pdf: &'a [u8],
    pub payload_name: &'a str,
    pub signed_payload: &'a [u8],
    pub reply: &'a [u8],
    pub artifact: Option<&'a [u8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssembledPackage {
    pub name: String,
    pub bytes: Vec<u8>,
    /// SHA-256 of `bytes`, hex encoded.
    pub content_hash: String,
}

pub fn assemble(parts: &PackageParts<'_>) -> Result<AssembledPackage, AssemblyError> {
    let payload_name = sanitize(parts.payload_name);
    let reply_name = format!("authority_reply.{}", reply_extension(parts.reply));
    let artifact_name = parts
        .artifact
        .map(|artifact| format!("authority_artifact.{}", reply_extension(artifact)));
    let mut entries = vec![
        (PDF_ENTRY, parts.pdf),
        (payload_name.as_str(), parts.signed_payload),
        (reply_name.as_str(), parts.reply),
    ];
    if let (Some(name), Some(artifact)) = (artifact_name.as_deref(), parts.artifact) {
        entries.push((name, artifact));
    }
    let bytes = stored_zip(&entries)?;
    let content_hash = hex::encode(Sha256::digest(&bytes));
    Ok(AssembledPackage {
        name: package_name(parts.issuer_tax_id, parts.document_number, parts.authority_ref),
        bytes,
        content_hash,
    })
}

/// `{issuer_tax_id}_{document_number}_{authority_ref}.zip` with every
/// character outside `[A-Za-z0-9.-]` replaced by `_`.
pub fn package_name(issuer_tax_id: &str, document_number: &str, authority_ref: &str) -> String {
    format!(
        "{}_{}_{}.zip",
        sanitize(issuer_tax_id),
        sanitize(document_number),
        sanitize(authority_ref)
    )
}

fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

fn reply_extension(reply: &[u8]) -> &'static str {
    match reply.iter().find(|byte| !byte.is_ascii_whitespace()) {
        Some(b'<') => "xml",
        Some(b'{') | Some(b'[') => "json",
        _ => "txt",
    }
}

/// Provider that returns the same bytes for every document; used where no
/// printable layout is wired in.
#[derive(Debug, Clone, Default)]
pub struct StaticPdf(pub Vec<u8>);

impl SourcePdfProvider for StaticPdf {
    fn source_pdf(&self, _snapshot: &DocumentSnapshot) -> Result<Vec<u8>, PdfError> {
        if self.0.is_empty() {
            return Err(PdfError("no PDF configured".to_string()));
        }
        Ok(self.0.clone())
    }
}

/// Reads `{root}/{document id}.pdf`, as dropped by the rendering service.
#[derive(Debug, Clone)]
pub struct PdfDirectory {
    root: PathBuf,
}

impl PdfDirectory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, snapshot: &DocumentSnapshot) -> PathBuf {
        self.root
            .join(format!("{}.pdf", sanitize(snapshot.id.as_str())))
    }
}

impl SourcePdfProvider for PdfDirectory {
    fn source_pdf(&self, snapshot: &DocumentSnapshot) -> Result<Vec<u8>, PdfError> {
        let path = self.path_for(snapshot);
        std::fs::read(&path).map_err(|err| PdfError(format!("{}: {err}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parts<'a>(reply: &'a [u8]) -> PackageParts<'a> {
        PackageParts {
            issuer_tax_id: "900123456",
            document_number: "SETP/990000001",
            authority_ref: "abc123",
            pdf: b"%PDF-1.7",
            payload_name: "fv0900123456setp990000001.xml",
            signed_payload: b"<Invoice/>",
            reply,
            artifact: None,
        }
    }

    #[test]
    fn names_are_sanitized() {
        assert_eq!(
            package_name("IT 0123", "2024/17", "ref:1"),
            "IT_0123_2024_17_ref_1.zip"
        );
    }

    #[test]
    fn same_inputs_give_same_hash() {
        let first = assemble(&parts(b"<ok/>")).expect("assembles");
        let second = assemble(&parts(b"<ok/>")).expect("assembles");
        assert_eq!(first, second);
        assert_eq!(first.name, "900123456_SETP_990000001_abc123.zip");
        assert_eq!(first.content_hash.len(), 64);

        let other = assemble(&parts(b"<changed/>")).expect("assembles");
        assert_ne!(first.content_hash, other.content_hash);
    }

    #[test]
    fn artifacts_become_a_fourth_entry() {
        let plain = assemble(&parts(b"<ok/>")).expect("assembles");
        let with_artifact = assemble(&PackageParts {
            artifact: Some(&b"<ApplicationResponse/>"[..]),
            ..parts(b"<ok/>")
        })
        .expect("assembles");

        assert_ne!(plain.content_hash, with_artifact.content_hash);
        let bytes = &with_artifact.bytes;
        let named = |name: &[u8]| bytes.windows(name.len()).any(|window| window == name);
        assert!(named(b"authority_artifact.xml"));
        assert!(named(b"<ApplicationResponse/>"));
        assert!(!plain.bytes.windows(18).any(|window| window == b"authority_artifact"));
    }

    #[test]
    fn reply_entry_follows_content() {
        assert_eq!(reply_extension(b"  <x/>"), "xml");
        assert_eq!(reply_extension(br#"{"a":1}"#), "json");
        assert_eq!(reply_extension(b""), "txt");
    }

    #[test]
    fn empty_static_pdf_is_an_error() {
        let snapshot = crate::pipeline::tests::common::sample_snapshot();
        assert!(StaticPdf::default().source_pdf(&snapshot).is_err());
    }

    #[test]
    fn pdf_directory_reads_by_document_id() {
        let root = std::env::temp_dir().join(format!("fiscal-pdf-{}", std::process::id()));
        std::fs::create_dir_all(&root).expect("temp dir");
        let snapshot = crate::pipeline::tests::common::sample_snapshot();
        let provider = PdfDirectory::new(&root);
        assert!(provider.source_pdf(&snapshot).is_err());

        std::fs::write(root.join("SETP990000001.pdf"), b"%PDF-1.7 rendered").expect("write");
        assert_eq!(
            provider.source_pdf(&snapshot).expect("reads"),
            b"%PDF-1.7 rendered".to_vec()
        );
        std::fs::remove_dir_all(&root).ok();
    }
}
