//! Model provider implementations for deepsearch.
//!
//! All providers implement the `deepsearch_core::Provider` trait.
//! [`endpoint::resolve`] picks the one configured for turns.

pub mod endpoint;
pub mod openai_compat;

pub use endpoint::{ModelEndpoint, resolve};
pub use openai_compat::OpenAiCompatProvider;
