//! Tool model: metadata, qualified ids, schema validation, access control and
//! execution health tracking.

pub mod access;
pub mod health;
pub mod id;
pub mod schema;
pub mod tool;

pub use access::{AllowAll, Authorizer, ToolAccessPolicy};
pub use health::{HealthConfig, HealthLevel, SystemHealthReport, ToolHealthReport, ToolHealthTracker};
pub use id::{format_tool_id, is_qualified, parse_tool_id, QualifiedToolId};
pub use schema::{AcceptAll, JsonSchemaValidator, SchemaValidator};
pub use tool::{Arguments, Tool};
