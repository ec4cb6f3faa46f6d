//! Periodic driver: recovers interrupted submissions, drains the queue and
//! polls asynchronous authorities when their interval has elapsed.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::pipeline::assembler::SourcePdfProvider;
use crate::pipeline::credential::CredentialStore;
use crate::pipeline::ledger::{DocumentState, DocumentStatus, LedgerStore};
use crate::pipeline::orchestrator::{FiscalOrchestrator, OrchestratorError, StepOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick: Duration,
    /// Poll interval for codecs whose manifest does not name one.
    pub default_poll: Duration,
    pub batch_size: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            default_poll: Duration::from_secs(300),
            batch_size: 50,
        }
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub recovered: usize,
    pub submitted: usize,
    pub polled: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Recover,
    Submit,
    Poll,
}

impl TickReport {
    fn count(&mut self, step: Step, outcome: &StepOutcome) {
        let StepOutcome::Recorded(_) = outcome else {
            self.skipped += 1;
            return;
        };
        match step {
            Step::Recover => self.recovered += 1,
            Step::Submit => self.submitted += 1,
            Step::Poll => self.polled += 1,
        }
    }
}

pub struct StatusScheduler<L, P> {
    orchestrator: Arc<FiscalOrchestrator<L, P>>,
    settings: SchedulerSettings,
}

impl<L, P> StatusScheduler<L, P>
where
    L: LedgerStore + CredentialStore + 'static,
    P: SourcePdfProvider + 'static,
{
    pub fn new(orchestrator: Arc<FiscalOrchestrator<L, P>>, settings: SchedulerSettings) -> Self {
        Self {
            orchestrator,
            settings,
        }
    }

    pub async fn tick(&self) -> Result<TickReport, OrchestratorError> {
        let mut report = TickReport::default();

        for outcome in self.orchestrator.recover_stale().await? {
            report.count(Step::Recover, &outcome);
        }

        let ledger = self.orchestrator.ledger();
        for status in ledger.documents_in(DocumentState::Queued, self.settings.batch_size)? {
            match self.orchestrator.process(&status.document_id).await {
                Ok(outcome) => report.count(Step::Submit, &outcome),
                Err(error) => {
                    report.failed += 1;
                    warn!(document = %status.document_id, error = %error, "submission step failed");
                }
            }
        }

        for status in ledger.documents_in(DocumentState::PendingAuthority, self.settings.batch_size)? {
            if !self.poll_due(&status) {
                continue;
            }
            match self.orchestrator.follow_up(&status.document_id).await {
                Ok(outcome) => report.count(Step::Poll, &outcome),
                Err(error) => {
                    report.failed += 1;
                    warn!(document = %status.document_id, error = %error, "status poll failed");
                }
            }
        }

        if report != TickReport::default() {
            info!(
                recovered = report.recovered,
                submitted = report.submitted,
                polled = report.polled,
                skipped = report.skipped,
                failed = report.failed,
                "scheduler tick"
            );
        }
        Ok(report)
    }

    /// Ticks until `shutdown` resolves.
    pub async fn run<S>(&self, shutdown: S)
    where
        S: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.settings.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("scheduler stopping");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(error) = self.tick().await {
                        warn!(error = %error, "scheduler tick failed");
                    }
                }
            }
        }
    }

    fn poll_due(&self, status: &DocumentStatus) -> bool {
        let Some(last) = status.last_exchange_at else {
            return true;
        };
        let interval = status
            .codec
            .as_ref()
            .and_then(|id| self.orchestrator.registry().get(id))
            .and_then(|codec| codec.descriptor().poll_interval)
            .unwrap_or(self.settings.default_poll);
        let interval =
            chrono::Duration::from_std(interval).unwrap_or_else(|_| chrono::Duration::days(1));
        let due = last
            .checked_add_signed(interval)
            .map_or(false, |due| due <= self.orchestrator.now());
        if !due {
            debug!(document = %status.document_id, "status poll not yet due");
        }
        due
    }
}
