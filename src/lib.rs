//! # Toolexec Core - Tool Execution Core
//!
//! Rust implementation of a tool execution core providing:
//! - A registry of named backends (in-process, sandboxed, remote) with
//!   lifecycle and health probing
//! - Aggregation of every enabled backend's tools into one namespaced catalog
//!   (`backend/tool`) with routing by qualified id
//! - Sandboxed runtimes (process, docker, wasm) enforcing security profiles,
//!   resource limits and hard deadlines
//! - A staged request pipeline with schema validation, authorization,
//!   bounded retries and per-tool health tracking
//! - Sequential tool chains with JSON path mappings between steps
//! - Streaming execution with progress events
//!
//! ## Architecture
//!
//! ```text
//!                    ┌───────────────────────────────────────────┐
//!   ToolRequest   →  │                ToolEngine                 │
//!   Chain         →  │  ┌──────────┐  ┌────────────┐             │
//!   stream        →  │  │ Pipeline │→ │ Aggregator │             │
//!                    │  └──────────┘  └─────┬──────┘             │
//!                    │                      ▼                    │
//!                    │              ┌──────────────┐             │
//!                    │              │   Registry   │             │
//!                    │              └──────┬───────┘             │
//!                    │       ┌─────────────┼─────────────┐       │
//!                    │       ▼             ▼             ▼       │
//!                    │    local       sandboxed       remote     │
//!                    │               (runtime)                   │
//!                    └───────────────────────────────────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

// Re-export public API
pub mod aggregator;
pub mod backend;
pub mod chain;
pub mod context;
pub mod engine;
pub mod pipeline;
pub mod runtime;
pub mod streaming;
pub mod tools;
pub mod types;

// Internal utilities
pub mod observability;
pub mod recovery;
pub mod validation;

pub use aggregator::{ToolAggregator, ToolListing};
pub use backend::{Backend, BackendKind, BackendRegistry};
pub use chain::{Chain, ChainExecutor, ChainResult, ChainStep};
pub use context::ExecContext;
pub use engine::{ToolEngine, ToolEngineBuilder};
pub use pipeline::{Pipeline, ToolRequest, ToolResult};
pub use streaming::{ExecutionStream, StreamEvent, StreamingExecutor};
pub use tools::{QualifiedToolId, Tool};
pub use types::{Config, Error, ErrorKind, Result};
