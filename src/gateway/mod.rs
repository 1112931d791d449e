// Warden - Gateway Module
//
// Unix Domain Socket server for the capability broker: connection
// admission and registry, per-connection serving loops, request
// dispatch, and peer identification.

mod caller;
mod connection;
mod handlers;
mod uds;

pub use caller::CallerInfo;
pub use connection::{Connection, ConnectionInfo};
pub use uds::{default_socket_path, UdsServer};
