//! Submission pipeline from a posted snapshot to an authority-accepted,
//! packaged document.

pub mod archive;
pub mod assembler;
pub mod clock;
pub mod closing;
pub mod codec;
pub mod credential;
pub mod interpreter;
pub mod ledger;
pub mod orchestrator;
pub mod payload;
pub mod router;
pub mod scheduler;
pub mod signer;
pub mod transport;

pub use assembler::{PdfDirectory, SourcePdfProvider, StaticPdf};
pub use closing::{closing_view, ClosingView};
pub use codec::{CodecEndpoints, CodecId, CodecRegistry, Resolution};
pub use ledger::{DocumentState, DocumentStatus, LedgerError, LedgerStore, SqliteLedger};
pub use orchestrator::{
    FiscalOrchestrator, OrchestratorError, OrchestratorSettings, PostOutcome, StepOutcome,
};
pub use router::document_router;
pub use scheduler::{SchedulerSettings, StatusScheduler, TickReport};

#[cfg(test)]
mod tests;
