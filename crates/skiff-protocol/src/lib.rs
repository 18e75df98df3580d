//! # skiff-protocol
//!
//! Wire protocol definitions for the Skiff message broker.
//!
//! This crate defines the byte-level framing shared by brokers and clients:
//! the handshake, the 8-byte message header with its two length encodings,
//! the command vocabulary and the PUB/SUB control grammar.
//!
//! ## Commands
//!
//! - `Id` - Client identity
//! - `Pub` / `Sub` - Open a link to a queue or topic
//! - `Data` - Application payload
//! - `Ack` / `Error` - Replies to control messages
//! - `Noop` - Keepalive
//! - `Close` / `Kill` - Link teardown
//!
//! ## Example
//!
//! ```rust
//! use skiff_protocol::{codec, Command, Message, Target};
//!
//! let subscribe = Message::subscribe(&Target::queue("orders"));
//! let encoded = codec::encode(&subscribe);
//! let decoded = codec::decode(&encoded).unwrap();
//!
//! assert_eq!(decoded.command(), Command::Sub);
//! assert_eq!(decoded.target().unwrap(), Target::queue("orders"));
//! ```

pub mod codec;
pub mod command;
pub mod control;
pub mod handshake;
pub mod message;
pub mod pool;

pub use codec::{decode, encode, MessageCodec, ProtocolError};
pub use command::Command;
pub use control::{validate_name, Target, TargetKind};
pub use handshake::{handshake, MAGIC};
pub use message::Message;
pub use pool::{BufferAlloc, BytePool, HeapAlloc};
