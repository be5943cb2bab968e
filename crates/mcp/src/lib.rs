// MCP (Model Context Protocol) server for the Toolgate tool catalog,
// plus the built-in tools shared with the HTTP gateway

pub mod catalog;
pub mod protocol;
pub mod server;
pub mod tools;

pub use catalog::Catalog;
pub use server::{ConnectionInfo, McpServer, PROTOCOL_VERSION};
pub use tools::{default_tools, ToolsConfig};
