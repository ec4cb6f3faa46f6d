//! Read-only document snapshots handed over by the accounting engine.

pub mod money;
pub mod snapshot;

pub use money::{format_scaled, round_div, Currency, Money, Quantity, TaxRate};
pub use snapshot::{
    Address, DocumentId, DocumentKind, DocumentLine, DocumentReferences, DocumentSnapshot,
    IdentificationScheme, LineTax, Party, PaymentInstruction, SourceReference, TaxScheme, TaxTotal,
};
