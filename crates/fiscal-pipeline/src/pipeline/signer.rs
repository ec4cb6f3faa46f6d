//! Signature and body authentication over built payloads.
//!
//! Signing never retries: every failure is either an operator problem with
//! the credential or a defect in the payload.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signer as _, SigningKey};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::pipeline::credential::{CredentialKind, CredentialRecord};
use crate::pipeline::payload::{Payload, PayloadTree, XmlElement};

type HmacSha256 = Hmac<Sha256>;

pub const HMAC_METADATA: &str = "hmac_sha256";
pub const DIGEST_METADATA: &str = "digest_sha256";
pub const SIGNATURE_METADATA: &str = "signature";

const XMLDSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
const C14N: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";
const ED25519: &str = "http://www.w3.org/2021/04/xmldsig-more#eddsa-ed25519";
const SHA256_URI: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
const ENVELOPED: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";
/// Placeholder UBL documents reserve for the signature.
const EXTENSION_CONTENT: &str = "ext:ExtensionContent";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMode {
    None,
    Hmac,
    EnvelopedXml,
    Detached,
}

impl SignatureMode {
    pub const fn credential_kind(self) -> Option<CredentialKind> {
        match self {
            Self::None => None,
            Self::Hmac => Some(CredentialKind::HmacSecret),
            Self::EnvelopedXml | Self::Detached => Some(CredentialKind::SigningKey),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignError {
    #[error("no {kind} credential registered for {issuer} in scope {scope}")]
    CredentialMissing {
        issuer: String,
        scope: String,
        kind: CredentialKind,
    },
    #[error("credential {id} is not valid at {at} (window {not_before} .. {not_after})")]
    CredentialExpired {
        id: i64,
        at: DateTime<Utc>,
        not_before: DateTime<Utc>,
        not_after: DateTime<Utc>,
    },
    #[error("credential {id} was revoked at {revoked_at}")]
    CredentialRevoked { id: i64, revoked_at: DateTime<Utc> },
    #[error("expected a {expected} credential, found {found}")]
    CredentialMismatch {
        expected: CredentialKind,
        found: CredentialKind,
    },
    #[error("signing failed: {0}")]
    SigningFailure(String),
}

impl SignError {
    pub const fn code(&self) -> &'static str {
        match self {
            Self::CredentialMissing { .. } => "CREDENTIAL_MISSING",
            Self::CredentialExpired { .. } => "CREDENTIAL_EXPIRED",
            Self::CredentialRevoked { .. } => "CREDENTIAL_REVOKED",
            Self::CredentialMismatch { .. } => "CREDENTIAL_MISMATCH",
            Self::SigningFailure(_) => "SIGNING_FAILURE",
        }
    }
}

/// Bytes to transmit plus what the signer derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub bytes: Vec<u8>,
    pub metadata: BTreeMap<String, String>,
    pub detached_signature: Option<Vec<u8>>,
}

pub fn sign(
    payload: &Payload,
    mode: SignatureMode,
    credential: Option<&CredentialRecord>,
    at: DateTime<Utc>,
) -> Result<SignedPayload, SignError> {
    match mode {
        SignatureMode::None => Ok(SignedPayload {
            bytes: payload.bytes.clone(),
            metadata: BTreeMap::new(),
            detached_signature: None,
        }),
        SignatureMode::Hmac => {
            let credential = usable(credential, CredentialKind::HmacSecret, at)?;
            hmac_body(payload, &credential.secret)
        }
        SignatureMode::Detached => {
            detached(payload, usable(credential, CredentialKind::SigningKey, at)?)
        }
        SignatureMode::EnvelopedXml => {
            enveloped(payload, usable(credential, CredentialKind::SigningKey, at)?)
        }
    }
}

fn usable(
    credential: Option<&CredentialRecord>,
    expected: CredentialKind,
    at: DateTime<Utc>,
) -> Result<&CredentialRecord, SignError> {
    let credential = credential.ok_or_else(|| {
        SignError::SigningFailure("signature mode requires a credential".to_string())
    })?;
    credential.check(expected, at)?;
    Ok(credential)
}

fn hmac_body(payload: &Payload, secret: &[u8]) -> Result<SignedPayload, SignError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|error| SignError::SigningFailure(error.to_string()))?;
    mac.update(&payload.bytes);
    let mut metadata = BTreeMap::new();
    metadata.insert(
        HMAC_METADATA.to_string(),
        hex::encode(mac.finalize().into_bytes()),
    );
    Ok(SignedPayload {
        bytes: payload.bytes.clone(),
        metadata,
        detached_signature: None,
    })
}

fn detached(payload: &Payload, credential: &CredentialRecord) -> Result<SignedPayload, SignError> {
    let key = signing_key(credential)?;
    let signature = key.sign(&payload.bytes).to_bytes().to_vec();
    let mut metadata = BTreeMap::new();
    metadata.insert(
        DIGEST_METADATA.to_string(),
        hex::encode(Sha256::digest(&payload.bytes)),
    );
    metadata.insert(SIGNATURE_METADATA.to_string(), STANDARD.encode(&signature));
    Ok(SignedPayload {
        bytes: payload.bytes.clone(),
        metadata,
        detached_signature: Some(signature),
    })
}

fn enveloped(payload: &Payload, credential: &CredentialRecord) -> Result<SignedPayload, SignError> {
    let PayloadTree::Xml(root) = &payload.tree else {
        return Err(SignError::SigningFailure(
            "enveloped signatures need an XML payload".to_string(),
        ));
    };
    let key = signing_key(credential)?;

    let canonical = root
        .to_canonical_bytes()
        .map_err(|error| SignError::SigningFailure(error.to_string()))?;
    let digest = STANDARD.encode(Sha256::digest(&canonical));

    let signed_info = signed_info(&digest);
    let signed_info_bytes = signed_info
        .to_canonical_bytes()
        .map_err(|error| SignError::SigningFailure(error.to_string()))?;
    let signature_value = STANDARD.encode(key.sign(&signed_info_bytes).to_bytes());

    let signature = XmlElement::new("ds:Signature")
        .attr("xmlns:ds", XMLDSIG_NS)
        .child(signed_info)
        .child(XmlElement::leaf("ds:SignatureValue", signature_value.clone()))
        .child(XmlElement::new("ds:KeyInfo").child(
            XmlElement::new("ds:X509Data").child(XmlElement::leaf(
                "ds:X509Certificate",
                STANDARD.encode(&credential.certificate),
            )),
        ));

    let mut signed_root = root.clone();
    match signed_root.find_mut(EXTENSION_CONTENT) {
        Some(slot) => slot.push(signature),
        None => signed_root.push(signature),
    }

    let bytes = signed_root
        .to_document_bytes()
        .map_err(|error| SignError::SigningFailure(error.to_string()))?;
    let mut metadata = BTreeMap::new();
    metadata.insert(DIGEST_METADATA.to_string(), digest);
    metadata.insert(SIGNATURE_METADATA.to_string(), signature_value);

    Ok(SignedPayload {
        bytes,
        metadata,
        detached_signature: None,
    })
}

/// `ds:SignedInfo` referencing the whole document by its SHA-256 digest.
pub(crate) fn signed_info(digest_b64: &str) -> XmlElement {
    XmlElement::new("ds:SignedInfo")
        .attr("xmlns:ds", XMLDSIG_NS)
        .child(XmlElement::new("ds:CanonicalizationMethod").attr("Algorithm", C14N))
        .child(XmlElement::new("ds:SignatureMethod").attr("Algorithm", ED25519))
        .child(
            XmlElement::new("ds:Reference")
                .attr("URI", "")
                .child(
                    XmlElement::new("ds:Transforms")
                        .child(XmlElement::new("ds:Transform").attr("Algorithm", ENVELOPED)),
                )
                .child(XmlElement::new("ds:DigestMethod").attr("Algorithm", SHA256_URI))
                .child(XmlElement::leaf("ds:DigestValue", digest_b64)),
        )
}

fn signing_key(credential: &CredentialRecord) -> Result<SigningKey, SignError> {
    let seed: [u8; 32] = credential.secret.as_slice().try_into().map_err(|_| {
        SignError::SigningFailure(format!(
            "credential {} does not hold a 32-byte Ed25519 seed",
            credential.id
        ))
    })?;
    Ok(SigningKey::from_bytes(&seed))
}
