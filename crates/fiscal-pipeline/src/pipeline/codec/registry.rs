use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::document::{DocumentKind, DocumentSnapshot};

use super::dian::{DianCodec, DianProfile};
use super::etims::EtimsCodec;
use super::fatturapa::{FatturaPaCodec, FatturaPaProfile};
use super::riba::RibaCodec;
use super::{Codec, CodecId};

/// Base URLs per codec family, with overrides from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CodecEndpoints {
    overrides: BTreeMap<String, String>,
}

impl CodecEndpoints {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, family: &str, base_url: impl Into<String>) -> Self {
        self.overrides.insert(family.to_ascii_lowercase(), base_url.into());
        self
    }

    pub fn base_url(&self, family: &str, default: &str) -> String {
        self.overrides
            .get(family)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }
}

/// Outcome of looking a document up in the registry.
#[derive(Clone)]
pub enum Resolution {
    Codec(Arc<dyn Codec>),
    NotApplicable,
}

impl fmt::Debug for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Codec(codec) => f
                .debug_tuple("Codec")
                .field(&codec.descriptor().id)
                .finish(),
            Self::NotApplicable => f.write_str("NotApplicable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("codec {0} registered twice")]
    Duplicate(CodecId),
}

/// Closed catalog of codecs, built at startup and shared read-only.
#[derive(Default)]
pub struct CodecRegistry {
    codecs: BTreeMap<CodecId, Arc<dyn Codec>>,
    default_profiles: BTreeMap<(String, DocumentKind), String>,
}

impl fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodecRegistry")
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shipped catalog. The first profile registered for a `(country, kind)`
    /// pair is its default.
    pub fn standard(endpoints: &CodecEndpoints) -> Result<Self, RegistryError> {
        let mut registry = Self::new();

        let dian = endpoints.base_url(DianCodec::FAMILY, DianCodec::DEFAULT_BASE_URL);
        for profile in [DianProfile::Production, DianProfile::Habilitacion] {
            for kind in [
                DocumentKind::Invoice,
                DocumentKind::CreditNote,
                DocumentKind::DebitNote,
            ] {
                registry.register(Arc::new(DianCodec::new(kind, profile, &dian)))?;
            }
        }

        let etims = endpoints.base_url(EtimsCodec::FAMILY, EtimsCodec::DEFAULT_BASE_URL);
        for kind in [
            DocumentKind::Invoice,
            DocumentKind::CreditNote,
            DocumentKind::Receipt,
        ] {
            registry.register(Arc::new(EtimsCodec::new(kind, &etims)))?;
        }

        let sdi = endpoints.base_url(FatturaPaCodec::FAMILY, FatturaPaCodec::DEFAULT_BASE_URL);
        for profile in [FatturaPaProfile::Sdi, FatturaPaProfile::Hub] {
            for kind in [DocumentKind::Invoice, DocumentKind::CreditNote] {
                registry.register(Arc::new(FatturaPaCodec::new(kind, profile, &sdi)))?;
            }
        }

        let cbi = endpoints.base_url(RibaCodec::FAMILY, RibaCodec::DEFAULT_BASE_URL);
        registry.register(Arc::new(RibaCodec::new(&cbi)))?;

        Ok(registry)
    }

    pub fn register(&mut self, codec: Arc<dyn Codec>) -> Result<(), RegistryError> {
        let id = codec.descriptor().id.clone();
        if self.codecs.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        self.default_profiles
            .entry((id.country.clone(), id.kind))
            .or_insert_with(|| id.profile.clone());
        self.codecs.insert(id, codec);
        Ok(())
    }

    pub fn resolve(&self, country: &str, kind: DocumentKind, profile: Option<&str>) -> Resolution {
        let country = country.trim().to_ascii_uppercase();
        let profile = match profile.map(str::trim).filter(|value| !value.is_empty()) {
            Some(profile) => profile.to_ascii_lowercase(),
            None => match self.default_profiles.get(&(country.clone(), kind)) {
                Some(profile) => profile.clone(),
                None => return Resolution::NotApplicable,
            },
        };

        let id = CodecId {
            country,
            kind,
            profile,
        };
        match self.codecs.get(&id) {
            Some(codec) => Resolution::Codec(Arc::clone(codec)),
            None => Resolution::NotApplicable,
        }
    }

    /// Resolution keyed on the issuer's country.
    pub fn resolve_snapshot(&self, snapshot: &DocumentSnapshot) -> Resolution {
        self.resolve(
            &snapshot.issuer.country_code,
            snapshot.kind,
            snapshot.profile.as_deref(),
        )
    }

    pub fn get(&self, id: &CodecId) -> Option<Arc<dyn Codec>> {
        self.codecs.get(id).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &CodecId> {
        self.codecs.keys()
    }
}
