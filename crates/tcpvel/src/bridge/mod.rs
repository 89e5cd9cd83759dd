//! IPC bridge between the server and the producer process.
//!
//! - **protocol**: frame types (`Envelope`, `IncarnationId`)
//! - **codec**: length-delimited JSON framing for AsyncRead/AsyncWrite
//! - **transport**: Unix socket listener/connector and the address handed to the child
//! - **channel**: the parent-side queue and the producer-side non-blocking sender

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod transport;

pub use channel::{
    ChannelError, ChannelItem, ChannelReceiver, ChannelSender, CrossProcessChannel,
    DEFAULT_CHANNEL_CAPACITY, Poll,
};
pub use protocol::{Envelope, IncarnationId};
pub use transport::{CHANNEL_ENV_VAR, ChildChannelInfo, channel_info_from_env};
