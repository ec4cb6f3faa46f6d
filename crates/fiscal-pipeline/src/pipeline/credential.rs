use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::pipeline::ledger::LedgerError;
use crate::pipeline::signer::SignError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    ApiKey,
    HmacSecret,
    SigningKey,
}

impl CredentialKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ApiKey => "api_key",
            Self::HmacSecret => "hmac_secret",
            Self::SigningKey => "signing_key",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "api_key" => Some(Self::ApiKey),
            "hmac_secret" => Some(Self::HmacSecret),
            "signing_key" => Some(Self::SigningKey),
            _ => None,
        }
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Secret material an issuer holds for one authority.
#[derive(Clone, PartialEq, Eq)]
pub struct CredentialRecord {
    pub id: i64,
    pub issuer_tax_id: String,
    /// Codec family the credential is valid for.
    pub scope: String,
    pub kind: CredentialKind,
    pub secret: Vec<u8>,
    pub certificate: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("id", &self.id)
            .field("issuer_tax_id", &self.issuer_tax_id)
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .field("not_before", &self.not_before)
            .field("not_after", &self.not_after)
            .field("revoked_at", &self.revoked_at)
            .finish_non_exhaustive()
    }
}

impl CredentialRecord {
    /// Fails when the record is revoked, of the wrong kind, or `at` falls
    /// outside `[not_before, not_after]`.
    pub fn check(&self, expected: CredentialKind, at: DateTime<Utc>) -> Result<(), SignError> {
        if let Some(revoked_at) = self.revoked_at {
            return Err(SignError::CredentialRevoked {
                id: self.id,
                revoked_at,
            });
        }
        if self.kind != expected {
            return Err(SignError::CredentialMismatch {
                expected,
                found: self.kind,
            });
        }
        if at < self.not_before || at > self.not_after {
            return Err(SignError::CredentialExpired {
                id: self.id,
                at,
                not_before: self.not_before,
                not_after: self.not_after,
            });
        }
        Ok(())
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct NewCredential {
    pub issuer_tax_id: String,
    pub scope: String,
    pub kind: CredentialKind,
    pub secret: Vec<u8>,
    pub certificate: Vec<u8>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for NewCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewCredential")
            .field("issuer_tax_id", &self.issuer_tax_id)
            .field("scope", &self.scope)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Credential persistence. Reads are never cached so a revocation is seen by
/// the next attempt.
pub trait CredentialStore: Send + Sync {
    fn register(
        &self,
        credential: NewCredential,
        at: DateTime<Utc>,
    ) -> Result<CredentialRecord, LedgerError>;

    /// Most recent matching record, preferring unrevoked ones.
    fn current(
        &self,
        issuer_tax_id: &str,
        scope: &str,
        kind: CredentialKind,
    ) -> Result<Option<CredentialRecord>, LedgerError>;

    fn revoke(&self, id: i64, at: DateTime<Utc>) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> CredentialRecord {
        CredentialRecord {
            id: 7,
            issuer_tax_id: "900123456".to_string(),
            scope: "co-dian".to_string(),
            kind: CredentialKind::SigningKey,
            secret: vec![1; 32],
            certificate: b"CERT".to_vec(),
            not_before: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            not_after: Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap(),
            revoked_at: None,
        }
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let credential = record();
        assert!(credential
            .check(CredentialKind::SigningKey, credential.not_before)
            .is_ok());
        assert!(credential
            .check(CredentialKind::SigningKey, credential.not_after)
            .is_ok());
        let late = credential.not_after + chrono::Duration::seconds(1);
        assert!(matches!(
            credential.check(CredentialKind::SigningKey, late),
            Err(SignError::CredentialExpired { id: 7, .. })
        ));
    }

    #[test]
    fn revocation_and_kind_are_checked_first() {
        let mut credential = record();
        let inside = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        assert!(matches!(
            credential.check(CredentialKind::HmacSecret, inside),
            Err(SignError::CredentialMismatch { .. })
        ));
        credential.revoked_at = Some(inside);
        assert!(matches!(
            credential.check(CredentialKind::SigningKey, inside),
            Err(SignError::CredentialRevoked { .. })
        ));
    }

    #[test]
    fn debug_output_hides_secret_material() {
        let rendered = format!("{:?}", record());
        assert!(!rendered.contains("secret"));
        assert!(!rendered.contains("CERT"));
    }
}
