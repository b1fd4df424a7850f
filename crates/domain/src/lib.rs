//! Shared domain types for the Talon gateway: errors, configuration, and
//! the provider-agnostic LLM message model.

pub mod chat;
pub mod config;
pub mod error;

pub use error::{Error, Result};
