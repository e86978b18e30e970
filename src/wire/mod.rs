//! Wire messages: envelopes, payloads, responses and their codec.

pub mod codec;
pub mod message;
pub mod response;

pub use codec::{decode_envelope, encode_envelope, frame_envelope, read_frame, MAX_FRAME_SIZE};
pub use message::{Envelope, MessageHeader, Payload, WireableType};
pub use response::{LockResult, Response, ResponsePayload, ResultCode, UnlockResult};
