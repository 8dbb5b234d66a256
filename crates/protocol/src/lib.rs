pub mod frame;
pub mod mapping;

pub use frame::*;
pub use mapping::{map_to_transport_event, TransportEvent};

/// Frames larger than this cause the socket to be closed with reason
/// `frame-too-large` (spec §4.A).
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// Current wire protocol version, reported in `HelloOk._protocol`.
pub const PROTOCOL_VERSION: u32 = 2;
