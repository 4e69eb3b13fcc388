//! Reconciliation and order-lifecycle engine: matches upstream positions to
//! mirrored ones, filters, sizes, selects, and drives the exchange.

pub mod copier;
pub mod engine;
pub mod filter;
pub mod matcher;
pub mod reconciler;
pub mod selector;
pub mod sizer;
pub mod sltp;

pub use engine::Engine;
