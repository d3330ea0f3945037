//! IPC server for gallery clients

pub mod protocol;
pub mod server;

pub use protocol::{
    parse_command, serialize_response, AssetPayload, Command, ErrorBody, Response,
    PROTOCOL_VERSION,
};
pub use server::{process_command, AppState, IpcServer};
