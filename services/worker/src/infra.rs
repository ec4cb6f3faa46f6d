use chrono::{DateTime, NaiveDate, Utc};
use fiscal_pipeline::config::FiscalConfig;
use fiscal_pipeline::error::AppError;
use fiscal_pipeline::pipeline::clock::{Clock, SystemClock};
use fiscal_pipeline::pipeline::transport::{
    AuthorityChannel, HttpChannel, IdempotencyStore, TransportAdapter,
};
use fiscal_pipeline::pipeline::{
    CodecRegistry, FiscalOrchestrator, PdfDirectory, SqliteLedger,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

pub(crate) type Pipeline = FiscalOrchestrator<SqliteLedger, PdfDirectory>;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

/// Wires the ledger, codec catalog, HTTP channel and PDF source from
/// configuration.
pub(crate) fn build_pipeline(config: &FiscalConfig) -> Result<Arc<Pipeline>, AppError> {
    let ledger = match &config.ledger_path {
        Some(path) => {
            info!(path = %path.display(), "opening submission ledger");
            SqliteLedger::open(path)?
        }
        None => {
            info!("submission ledger kept in memory");
            SqliteLedger::in_memory()?
        }
    };
    let ledger = Arc::new(ledger);
    let registry = Arc::new(CodecRegistry::standard(&config.codec_endpoints())?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport = TransportAdapter::new(
        Arc::new(HttpChannel::default()) as Arc<dyn AuthorityChannel>,
        Arc::clone(&ledger) as Arc<dyn IdempotencyStore>,
        Arc::clone(&clock),
    );

    Ok(Arc::new(FiscalOrchestrator::new(
        registry,
        ledger,
        transport,
        Arc::new(PdfDirectory::new(config.pdf_dir.clone())),
        clock,
        config.orchestrator_settings(),
    )))
}

pub(crate) fn parse_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|err| format!("failed to parse '{raw}' as YYYY-MM-DD ({err})"))
}

/// Start of `date` for a credential's validity window.
pub(crate) fn day_start(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(0, 0, 0).unwrap_or_default().and_utc()
}

/// Last second of `date`.
pub(crate) fn day_end(date: NaiveDate) -> DateTime<Utc> {
    date.and_hms_opt(23, 59, 59).unwrap_or_default().and_utc()
}
