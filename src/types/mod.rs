//! Core types for the tool execution core.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Strongly-typed identifiers (RequestId, TaskId, ChainId)
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for runtimes, pipeline, and backends

mod config;
mod errors;
mod ids;

pub use config::{
    AggregatorConfig, BackendConfig, Config, ObservabilityConfig, PipelineConfig, RetryConfig,
    RuntimeConfig, StreamingConfig,
};
pub use errors::{BackendFailure, Error, ErrorKind, Result};
pub use ids::{ChainId, RequestId, TaskId};
