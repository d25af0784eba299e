//! LLM backend clients and pricing.

pub mod openai;
pub mod pricing;

pub use openai::OpenAiCompatClient;
pub use pricing::{ModelPrice, PriceTable};
