//! Wire-format types shared by `midterm-host` (the server side of the
//! local IPC transport) and `midterm-gateway` (the client side). Kept
//! here, rather than duplicated in each binary, so a frame is decoded by
//! exactly one implementation no matter which side of the connection
//! reads it -- the decode-once discipline applies equally to whoever
//! is holding the read half.

pub mod endpoint;
pub mod framing;
pub mod protocol;

pub use endpoint::resolve_endpoint;
