//! The tunnel wire protocol: length-prefixed, XOR-obfuscated frames
//! carrying a flat key/value action message.

pub mod frame;
pub mod message;

pub use frame::{decode_frame, encode_frame, FrameError, MAX_FRAME_LEN};
pub use message::{Action, Message, MessageError};
