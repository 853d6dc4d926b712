// src/lib.rs

//! Shannon: a provider-agnostic LLM gateway and tool execution layer.
//!
//! [`manager::Manager`] is the composition root most callers want; [`provider`] and [`clients`]
//! hold the vendor abstraction, [`tools`] the execution pipeline, and [`http`] the framework-neutral
//! request handlers for both.

pub mod budget;
pub mod cache;
pub mod clients;
pub mod config;
pub mod error;
pub mod event;
pub mod http;
pub mod manager;
pub mod metrics;
pub mod provider;
pub mod rate_limiter;
pub mod tools;

pub use error::GatewayError;
pub use manager::Manager;
pub use provider::{ChatMessage, CompletionRequest, CompletionResponse, MessageContent, MessageRole, ModelTier, Provider};
