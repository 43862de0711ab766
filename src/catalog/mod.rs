//! Flow/step catalog — static conversation configuration.
//!
//! Built once at startup into an immutable structure and shared behind an
//! `Arc`. Nothing mutates it at runtime; ledger rows reference steps by
//! `(flow, level)`.

pub mod model;
pub mod seed;

pub use model::{Catalog, ErrorKind, FlowId, Step, StepKey};
pub use seed::build_catalog;
