pub mod confirm;
pub mod endpoints;
pub mod engine;
pub mod http;

pub use confirm::{ConfirmationOutcome, ConfirmationRecord, ConfirmationStore};
pub use endpoints::{EndpointStore, McpEndpoint};
pub use engine::McpEngine;
pub use http::{build_router, McpState};
