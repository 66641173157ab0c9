// src/core/protocol/mod.rs

//! The NSQ v2 wire protocol: inbound frame decoding and outbound command
//! encoding.

pub mod command;
pub mod frame;

pub use command::{Command, MessageBody};
pub use frame::{Frame, HEARTBEAT, MAGIC_V2, NsqCodec};
