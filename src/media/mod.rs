//! Media handling for source datagrams
//!
//! This module provides the demultiplexing decision between raw MPEG-TS and
//! RTP-encapsulated TS. Header formats beyond what that decision needs are not
//! parsed.

pub mod demux;

pub use demux::{demux, Payload, PayloadType, Reject, MIN_PACKET_SIZE};
