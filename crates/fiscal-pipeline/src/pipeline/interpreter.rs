//! Maps each authority's reply grammar onto pipeline outcomes.
//!
//! Every code a protocol documents is listed explicitly; anything else is a
//! rejection carrying the raw reply so an operator can read it verbatim.

use serde::{Deserialize, Serialize};

use crate::pipeline::codec::dian::{DianReply, DianStatus};
use crate::pipeline::codec::etims::EtimsReply;
use crate::pipeline::codec::fatturapa::{SdiNotificationKind, SdiReply};
use crate::pipeline::codec::riba::{CbiOutcome, CbiReply};
use crate::pipeline::ledger::Outcome;

/// Error code recorded when the authority already holds the document.
pub const DUPLICATE_REFERENCE: &str = "DUPLICATE_REFERENCE";
/// Error code for replies outside the documented grammar.
pub const UNRECOGNIZED_REPLY: &str = "UNRECOGNIZED_REPLY";

/// Structured error surfaced on the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl ErrorDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            field: None,
        }
    }

    pub fn field(field: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            field: Some(field.to_string()),
        }
    }
}

/// Parsed reply, one variant per protocol family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityReply {
    Dian(DianReply),
    Etims(EtimsReply),
    Sdi(SdiReply),
    Cbi(CbiReply),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interpretation {
    /// Never `TransportError`; that outcome is decided by the transport.
    pub outcome: Outcome,
    pub authority_ref: Option<String>,
    /// Identifier to poll with while the authority is still deciding.
    pub tracking_ref: Option<String>,
    pub errors: Vec<ErrorDetail>,
    /// Authority-issued document, e.g. an application response.
    pub artifact: Option<Vec<u8>>,
    pub credential_rejected: bool,
}

impl Interpretation {
    fn accepted(authority_ref: Option<String>) -> Self {
        Self {
            outcome: Outcome::Accepted,
            authority_ref,
            tracking_ref: None,
            errors: Vec::new(),
            artifact: None,
            credential_rejected: false,
        }
    }

    fn pending(tracking_ref: Option<String>) -> Self {
        Self {
            outcome: Outcome::PendingAuthority,
            authority_ref: None,
            tracking_ref,
            errors: Vec::new(),
            artifact: None,
            credential_rejected: false,
        }
    }

    fn rejected(errors: Vec<ErrorDetail>) -> Self {
        Self {
            outcome: Outcome::Rejected,
            authority_ref: None,
            tracking_ref: None,
            errors,
            artifact: None,
            credential_rejected: false,
        }
    }

    fn unrecognized(raw: &str) -> Self {
        Self::rejected(vec![ErrorDetail::new(UNRECOGNIZED_REPLY, raw)])
    }

    fn with_artifact(mut self, artifact: Option<Vec<u8>>) -> Self {
        self.artifact = artifact;
        self
    }
}

/// Classifies a parsed reply.
pub fn interpret(reply: &AuthorityReply) -> Interpretation {
    match reply {
        AuthorityReply::Dian(reply) => interpret_dian(reply),
        AuthorityReply::Etims(reply) => interpret_etims(reply),
        AuthorityReply::Sdi(reply) => interpret_sdi(reply),
        AuthorityReply::Cbi(reply) => interpret_cbi(reply),
    }
}

/// Classifies a lookup-by-reference reply; `None` when the authority has no
/// record of the document.
pub fn interpret_lookup(reply: &AuthorityReply) -> Option<Interpretation> {
    let not_found = match reply {
        AuthorityReply::Dian(reply) => reply.status == DianStatus::NotFound,
        AuthorityReply::Sdi(reply) => reply.sdi_id.is_none(),
        AuthorityReply::Etims(_) | AuthorityReply::Cbi(_) => false,
    };
    if not_found {
        None
    } else {
        Some(interpret(reply))
    }
}

fn interpret_dian(reply: &DianReply) -> Interpretation {
    match &reply.status {
        DianStatus::Valid if reply.is_valid => {
            Interpretation::accepted(reply.document_key.clone())
                .with_artifact(reply.application_response.clone())
        }
        DianStatus::Received => Interpretation::pending(reply.track_id.clone()),
        DianStatus::Processing => Interpretation::pending(None),
        DianStatus::Valid | DianStatus::Invalid | DianStatus::NotFound => {
            let errors = dian_errors(reply);
            let credential_rejected = errors.iter().any(|error| error.code == "ZE02");
            let mut interpretation = Interpretation::rejected(errors)
                .with_artifact(reply.application_response.clone());
            interpretation.credential_rejected = credential_rejected;
            interpretation
        }
        DianStatus::Other(code) => Interpretation::unrecognized(&format!(
            "StatusCode {code}: {}",
            reply.status_description
        )),
    }
}

fn dian_errors(reply: &DianReply) -> Vec<ErrorDetail> {
    if reply.messages.is_empty() {
        return vec![ErrorDetail::new(
            reply.status.code(),
            reply.status_description.clone(),
        )];
    }
    reply
        .messages
        .iter()
        .map(|message| {
            let rule = message
                .split_once("Regla:")
                .map(|(_, rest)| rest.split(',').next().unwrap_or_default().trim())
                .filter(|rule| !rule.is_empty());
            match rule {
                Some("90") => ErrorDetail::new(DUPLICATE_REFERENCE, message.clone()),
                Some(rule) => ErrorDetail::new(rule, message.clone()),
                None => ErrorDetail::new(reply.status.code(), message.clone()),
            }
        })
        .collect()
}

const ETIMS_CREDENTIAL_CODES: [&str; 2] = ["901", "902"];
const ETIMS_DUPLICATE_CODES: [&str; 1] = ["994"];
const ETIMS_REJECTION_CODES: [&str; 6] = ["001", "899", "910", "911", "921", "999"];

fn interpret_etims(reply: &EtimsReply) -> Interpretation {
    let code = reply.result_cd.as_str();
    if code == "000" {
        let authority_ref = reply
            .data
            .as_ref()
            .map(|data| format!("{}-{}", data.sdc_id, data.rcpt_no));
        let artifact = reply
            .data
            .as_ref()
            .and_then(|data| serde_json::to_vec(data).ok());
        return Interpretation::accepted(authority_ref).with_artifact(artifact);
    }

    if ETIMS_DUPLICATE_CODES.contains(&code) {
        return Interpretation::rejected(vec![ErrorDetail::new(
            DUPLICATE_REFERENCE,
            reply.result_msg.clone(),
        )]);
    }

    if ETIMS_CREDENTIAL_CODES.contains(&code) || ETIMS_REJECTION_CODES.contains(&code) {
        let mut interpretation = Interpretation::rejected(vec![ErrorDetail::new(
            format!("ETIMS-{code}"),
            reply.result_msg.clone(),
        )]);
        interpretation.credential_rejected = ETIMS_CREDENTIAL_CODES.contains(&code);
        return interpretation;
    }

    Interpretation::unrecognized(&format!("resultCd {code}: {}", reply.result_msg))
}

fn interpret_sdi(reply: &SdiReply) -> Interpretation {
    let Some(notification) = &reply.notification else {
        return Interpretation::pending(reply.sdi_id.clone());
    };

    match &notification.kind {
        SdiNotificationKind::Delivered
        | SdiNotificationKind::NotDelivered
        | SdiNotificationKind::TermsElapsed => {
            Interpretation::accepted(reply.sdi_id.clone()).with_artifact(notification.raw.clone())
        }
        SdiNotificationKind::Discarded => {
            let errors: Vec<ErrorDetail> = notification
                .errors
                .iter()
                .map(|error| match error.code.as_str() {
                    "00404" => ErrorDetail::new(DUPLICATE_REFERENCE, error.description.clone()),
                    other => ErrorDetail::new(other, error.description.clone()),
                })
                .collect();
            let credential_rejected = notification
                .errors
                .iter()
                .any(|error| error.code == "00102");
            let mut interpretation =
                Interpretation::rejected(errors).with_artifact(notification.raw.clone());
            interpretation.credential_rejected = credential_rejected;
            interpretation
        }
        SdiNotificationKind::Other(kind) => {
            Interpretation::unrecognized(&format!("TipoNotifica {kind}"))
        }
    }
}

fn interpret_cbi(reply: &CbiReply) -> Interpretation {
    match &reply.outcome {
        CbiOutcome::Accepted => Interpretation::accepted(reply.flow_id.clone()),
        CbiOutcome::Rejected => Interpretation::rejected(
            reply
                .errors
                .iter()
                .map(|error| {
                    let detail = ErrorDetail::new(error.code.clone(), error.message.clone());
                    match &error.record {
                        Some(record) => ErrorDetail {
                            field: Some(format!("record.{record}")),
                            ..detail
                        },
                        None => detail,
                    }
                })
                .collect(),
        ),
        CbiOutcome::Duplicate => Interpretation::rejected(vec![ErrorDetail::new(
            DUPLICATE_REFERENCE,
            "flow already received by the bank gateway",
        )]),
        CbiOutcome::Unauthorized => {
            let mut interpretation = Interpretation::rejected(vec![ErrorDetail::new(
                "UNAUTHORIZED",
                "bank gateway refused the credential",
            )]);
            interpretation.credential_rejected = true;
            interpretation
        }
        CbiOutcome::Other(outcome) => Interpretation::unrecognized(&format!("outcome {outcome}")),
    }
}
