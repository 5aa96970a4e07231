//! Wire-level message model and newline-delimited JSON framing.
//!
//! - `message`: [`Message`](message::Message) and its request, notification,
//!   and response variants.
//! - `codec`: [`NdjsonCodec`](codec::NdjsonCodec) plus cancellable
//!   reader/writer wrappers.

pub mod codec;
pub mod message;

pub use codec::{MessageReader, MessageWriter, NdjsonCodec, DEFAULT_MAX_LINE_BYTES};
pub use message::{Message, Notification, Request, RequestId, Response, RpcError};
