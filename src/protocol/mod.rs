//! Broker wire protocol: opcodes, framing and typed request bodies.
//!
//! Wire format (native byte order, no normalization):
//!
//! ```text
//! request: [u32 opcode][u32 request_size][56-byte body][segments…]
//! reply:   [u32 error ][u32 reply_size  ][56-byte body][reply data]
//! ```
//!
//! - [`opcode`] - the request enumeration and fast-path allow-list
//! - [`wire`] - request/reply envelopes and field cursors
//! - [`requests`] - typed bodies for the requests this crate issues

pub mod opcode;
pub mod requests;
pub mod wire;

pub use opcode::{Opcode, FAST_PATH};
pub use wire::{FieldReader, FieldWriter, Handle, Reply, ReplyBody, Request, RequestBody, RequestHeader};
