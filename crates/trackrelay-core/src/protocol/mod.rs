//! Protocol module containing message types, the binary codec, version
//! negotiation and the handshake sessions.

pub mod codec;
pub mod messages;
pub mod session;
pub mod version;

pub use codec::{
    decode_frame, decode_payload, encode_frame, encode_payload, FrameHeader, ProtocolError,
};
pub use messages::*;
pub use session::{
    ClientSession, MessageReader, MessageWriter, ServerSession, SessionError, SessionInfo,
};
pub use version::{negotiate_version, Capabilities};
