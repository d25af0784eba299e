//! Collaborator contracts for the extraction pipeline.
//!
//! The pipeline depends only on these traits; the crate ships reference
//! implementations in `fetch`, `clean`, `llm` and `stores`.

pub mod cleaner;
pub mod detector;
pub mod fetcher;
pub mod llm;
pub mod pricing;
pub mod store;
