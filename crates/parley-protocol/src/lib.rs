//! # parley-protocol
//!
//! Wire protocol definitions for the Parley message relay.
//!
//! This crate defines the newline-delimited JSON protocol spoken between
//! chat clients and the relay server: frame types, the streaming codec,
//! and the wire representation of chat messages.
//!
//! ## Frame Types
//!
//! - `AUTH` / `AUTH_SUCCESS` - Connection authentication
//! - `JOIN` / `JOIN_SUCCESS` / `LEAVE` / `LEAVE_SUCCESS` - Room membership
//! - `MESSAGE` - Send a message to a room
//! - `NEW_MESSAGE` - Live fan-out delivery
//! - `MESSAGE_HISTORY` - Backfill on join
//! - `ERROR` - Failure reporting
//!
//! ## Example
//!
//! ```rust
//! use parley_protocol::{codec, Frame};
//!
//! let frame = Frame::message("room-1", "Hello, world!");
//!
//! // Encode and decode
//! let encoded = codec::encode(&frame).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(frame, decoded);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, ProtocolError, MAX_FRAME_SIZE};
pub use frames::{Frame, MessageRecord};
