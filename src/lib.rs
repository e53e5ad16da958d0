//! `cacherelay` — a caching HTTP/1.x forward proxy.
//!
//! The reusable pieces live here as a library (mirroring the teacher's own
//! bin+lib split); `src/main.rs` is the thin CLI entry point that wires
//! them together. See DESIGN.md for the grounding ledger mapping each
//! module back to `original_source/` and the retrieval pack.

pub mod buffer;
pub mod cache;
pub mod client;
pub mod error;
pub mod mux;
pub mod parser;
pub mod target;

pub use cache::Cache;
pub use error::ProxyError;
pub use mux::{Mux, MuxHandle};
