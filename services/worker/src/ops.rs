//! Operator commands run against the configured ledger.

use crate::infra::{build_pipeline, day_end, day_start, Pipeline};
use chrono::NaiveDate;
use clap::Args;
use fiscal_pipeline::config::AppConfig;
use fiscal_pipeline::document::{DocumentId, DocumentSnapshot};
use fiscal_pipeline::error::AppError;
use fiscal_pipeline::pipeline::credential::{CredentialKind, CredentialStore, NewCredential};
use fiscal_pipeline::pipeline::{
    closing_view, PostOutcome, SchedulerSettings, StatusScheduler, StepOutcome,
};
use fiscal_pipeline::telemetry;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct PackageArgs {
    pub(crate) document: String,
    /// Directory the archive is written to
    #[arg(long, default_value = ".")]
    pub(crate) out: PathBuf,
}

#[derive(Args, Debug)]
pub(crate) struct ClosingArgs {
    /// First issue date included (YYYY-MM-DD)
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) from: NaiveDate,
    /// Last issue date included (YYYY-MM-DD)
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) to: NaiveDate,
}

#[derive(Args, Debug)]
pub(crate) struct CredentialArgs {
    /// Tax identifier of the issuer the credential belongs to
    #[arg(long)]
    pub(crate) issuer: String,
    /// Codec family, e.g. co-dian or it-sdi
    #[arg(long)]
    pub(crate) scope: String,
    /// api_key, hmac_secret or signing_key
    #[arg(long, value_parser = parse_kind)]
    pub(crate) kind: CredentialKind,
    /// File holding the raw secret bytes
    #[arg(long)]
    pub(crate) secret_file: PathBuf,
    /// Certificate presented alongside signatures
    #[arg(long)]
    pub(crate) certificate_file: Option<PathBuf>,
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) not_before: NaiveDate,
    #[arg(long, value_parser = crate::infra::parse_date)]
    pub(crate) not_after: NaiveDate,
}

fn parse_kind(raw: &str) -> Result<CredentialKind, String> {
    CredentialKind::parse(raw.trim())
        .ok_or_else(|| format!("unknown credential kind '{raw}'"))
}

/// Loads configuration, installs logging and wires the pipeline.
pub(crate) fn open() -> Result<(AppConfig, Arc<Pipeline>), AppError> {
    let config = AppConfig::load()?;
    telemetry::init(&config.telemetry)?;
    let pipeline = build_pipeline(&config.fiscal)?;
    Ok((config, pipeline))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value).map_err(std::io::Error::from)?;
    println!("{rendered}");
    Ok(())
}

pub(crate) async fn post(pipeline: &Pipeline, path: &Path) -> Result<(), AppError> {
    let raw = std::fs::read(path)?;
    let snapshot: DocumentSnapshot =
        serde_json::from_slice(&raw).map_err(std::io::Error::from)?;

    match pipeline.post(&snapshot)? {
        PostOutcome::AlreadyAccepted { authority_ref } => {
            println!(
                "{} already accepted ({})",
                snapshot.id,
                authority_ref.as_deref().unwrap_or("no reference")
            );
            return Ok(());
        }
        PostOutcome::Queued(_) => {
            match pipeline.process(&snapshot.id).await? {
                StepOutcome::DeadlineExceeded { seq } => {
                    println!("{} attempt {seq} ran out of time and stays queued", snapshot.id)
                }
                StepOutcome::Unresolved { seq } => println!(
                    "{} attempt {seq} could not be confirmed with the authority and stays queued",
                    snapshot.id
                ),
                StepOutcome::Recorded(_) | StepOutcome::Skipped => {}
            }
        }
        PostOutcome::NotSent(_) | PostOutcome::InFlight(_) => {}
    }
    print_json(&pipeline.status(&snapshot.id)?)
}

pub(crate) fn status(pipeline: &Pipeline, document: &str) -> Result<(), AppError> {
    print_json(&pipeline.status(&DocumentId(document.to_string()))?)
}

pub(crate) fn replay(pipeline: &Pipeline, document: &str) -> Result<(), AppError> {
    let id = DocumentId(document.to_string());
    pipeline.status(&id)?;
    print_json(&pipeline.attempts(&id)?)
}

pub(crate) fn cancel(pipeline: &Pipeline, document: &str, reason: &str) -> Result<(), AppError> {
    print_json(&pipeline.cancel(&DocumentId(document.to_string()), reason)?)
}

pub(crate) fn package(pipeline: &Pipeline, args: PackageArgs) -> Result<(), AppError> {
    let Some((package, bytes)) = pipeline.package(&DocumentId(args.document.clone()))? else {
        println!("{} has no accepted attempt yet", args.document);
        return Ok(());
    };
    std::fs::create_dir_all(&args.out)?;
    let target = args.out.join(&package.name);
    std::fs::write(&target, bytes)?;
    println!(
        "{} ({} bytes, sha256 {})",
        target.display(),
        package.size,
        package.content_hash
    );
    Ok(())
}

pub(crate) fn closing(pipeline: &Pipeline, args: ClosingArgs) -> Result<(), AppError> {
    if args.from > args.to {
        println!("closing period starts after it ends");
        return Ok(());
    }
    let view = closing_view(
        pipeline.ledger().as_ref(),
        pipeline.registry(),
        args.from,
        args.to,
    )?;
    print_json(&view)
}

pub(crate) async fn tick(pipeline: Arc<Pipeline>, settings: SchedulerSettings) -> Result<(), AppError> {
    let scheduler = StatusScheduler::new(pipeline, settings);
    print_json(&scheduler.tick().await?)
}

pub(crate) async fn recover(pipeline: &Pipeline) -> Result<(), AppError> {
    let outcomes = pipeline.recover_stale().await?;
    if outcomes.is_empty() {
        println!("no interrupted submissions");
    }
    for outcome in outcomes {
        match outcome {
            StepOutcome::Recorded(attempt) => println!(
                "{} attempt {} -> {} ({})",
                attempt.document_id,
                attempt.seq,
                attempt.outcome.as_str(),
                attempt.origin.as_str()
            ),
            StepOutcome::DeadlineExceeded { seq } => {
                println!("attempt {seq} ran out of time and was handed back")
            }
            StepOutcome::Unresolved { seq } => {
                println!("attempt {seq} could not be looked up and was handed back")
            }
            StepOutcome::Skipped => {}
        }
    }
    Ok(())
}

pub(crate) fn codecs(pipeline: &Pipeline) -> Result<(), AppError> {
    let mut ids: Vec<String> = pipeline.registry().ids().map(ToString::to_string).collect();
    ids.sort();
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

pub(crate) fn register_credential(
    pipeline: &Pipeline,
    args: CredentialArgs,
) -> Result<(), AppError> {
    let certificate = match &args.certificate_file {
        Some(path) => std::fs::read(path)?,
        None => Vec::new(),
    };
    let record = pipeline.ledger().register(
        NewCredential {
            issuer_tax_id: args.issuer,
            scope: args.scope,
            kind: args.kind,
            secret: std::fs::read(&args.secret_file)?,
            certificate,
            not_before: day_start(args.not_before),
            not_after: day_end(args.not_after),
        },
        pipeline.now(),
    )?;
    println!(
        "credential {} registered for {} ({}, {})",
        record.id, record.issuer_tax_id, record.scope, record.kind
    );
    Ok(())
}
