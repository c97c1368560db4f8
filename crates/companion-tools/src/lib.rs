//! companion-tools - Tool contract, registry and trust boundary
//!
//! Every capability the agent loop can invoke is a `Tool`: a named,
//! schema-described, phase-ordered unit of work. Outputs cross the trust
//! boundary before they reach the model, and outbound URL fetches go
//! through the SSRF guard.

pub mod registry;
pub mod ssrf;
pub mod tool;
pub mod tools;
pub mod trust;

pub use registry::{RegistryError, ToolRegistry};
pub use ssrf::{SsrfError, UrlGuard};
pub use tool::{ExecutionPhase, ImageRef, Tool, ToolContext, ToolError, ToolOutput};
pub use tools::fetch_url::FetchUrlTool;
pub use tools::keep_response::{KeepResponseArgs, KeepResponseTool};
pub use tools::load_attachment::LoadAttachmentTool;
pub use tools::send_message::{SendMessageArgs, SendMessageTool};
pub use tools::web_search::{SearchHit, SearchProvider, StaticSearchProvider, WebSearchTool};
pub use tools::workspace_search::WorkspaceSearchTool;
pub use trust::wrap_untrusted;

/// Tool names the runtime intercepts instead of executing.
pub const SEND_MESSAGE_TOOL: &str = "send_message";
pub const KEEP_RESPONSE_TOOL: &str = "keep_response";
