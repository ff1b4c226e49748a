//! Message framing on top of raw channel packets.
//!
//! Packets are decoded to text, reassembled into delimiter-terminated
//! messages, and fanned out to the subscribers of their channel.

pub mod assembler;
pub mod codec;
pub mod hub;
