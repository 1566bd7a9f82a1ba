//! Tool servers for Cortex: transports, the tool registry, and the
//! dispatcher that routes calls between them.
//!
//! Tools live on external servers reached over three transports:
//! a child process speaking MCP on stdio, an MCP server behind HTTP POST +
//! server-sent events, or plain REST endpoints declared in configuration.
//! [`MultiMcp`] connects to all of them, builds one immutable
//! [`ToolRegistry`], and implements [`cortex_core::ToolDispatcher`].

pub mod dispatcher;
pub mod protocol;
pub mod registry;
pub mod schema;
pub mod sse;
pub mod transport;

pub use dispatcher::{MultiMcp, StartupFailure, StartupStage};
pub use registry::ToolRegistry;
pub use transport::{Connector, McpConnector, Transport, TransportError};
