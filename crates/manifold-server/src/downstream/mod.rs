// crates/manifold-server/src/downstream/mod.rs
// Downstream MCP client layer: transports, connections, pooling

mod connection;
mod http;
mod logs;
mod manager;
pub mod protocol;
mod sse;
mod stdio;
mod transport;

pub use connection::ConnectionHandle;
pub use logs::StderrLog;
pub use manager::{ConnectionManager, Connector, RawTool};
pub use transport::Transport;
