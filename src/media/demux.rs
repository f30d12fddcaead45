//! Source datagram demultiplexing
//!
//! A source datagram carries either raw MPEG-TS packets or TS packets wrapped
//! in RTP. The decision is made per datagram:
//!
//! ```text
//! +------+-------------------------------------------+
//! | 0x47 | ... raw TS, whole datagram is payload     |
//! +------+-------------------------------------------+
//!
//! RTP (RFC 3550):
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |V=2|P|X|  CC   |M|     PT      |       sequence number         |
//! +---+-+-+-------+-+-------------+-------------------------------+
//! |                           timestamp                           |
//! +---------------------------------------------------------------+
//! |                             SSRC                              |
//! +---------------------------------------------------------------+
//! |                 CSRC list (CC * 4 bytes)                      |
//! +---------------------------------------------------------------+
//! | ext profile (2) | ext length in words (2) | ext data ...      |  if X
//! +---------------------------------------------------------------+
//! | payload ...                              | padding | pad len  |  if P
//! +---------------------------------------------------------------+
//! ```
//!
//! MPEG audio (PT 14) and MPEG video (PT 32) payloads carry an extra 4-byte
//! RFC 2250 header in front of the elementary stream data.

use std::ops::Range;

use bytes::Buf;

/// Size of one MPEG-TS packet; shorter payloads are discarded
pub const MIN_PACKET_SIZE: usize = 188;

/// MPEG-TS sync byte
pub const TS_SYNC_BYTE: u8 = 0x47;

/// Fixed RTP header length
pub const RTP_HEADER_SIZE: usize = 12;

/// RTP protocol version
pub const RTP_VERSION: u8 = 2;

/// RFC 2250 MPEG audio/video specific header length
const MPEG_ES_HEADER_SIZE: usize = 4;

/// RTP payload types with special handling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadType {
    /// MPEG audio elementary stream
    Mpa,
    /// MPEG video elementary stream
    Mpv,
    /// MPEG-2 transport stream
    Mp2t,
    Other(u8),
}

impl PayloadType {
    pub fn from_byte(b: u8) -> Self {
        match b & 0x7F {
            14 => PayloadType::Mpa,
            32 => PayloadType::Mpv,
            33 => PayloadType::Mp2t,
            other => PayloadType::Other(other),
        }
    }

    /// Bytes of payload-specific header preceding the data
    pub fn prefix_len(&self) -> usize {
        match self {
            PayloadType::Mpa | PayloadType::Mpv => MPEG_ES_HEADER_SIZE,
            _ => 0,
        }
    }
}

/// Why a datagram was discarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reject {
    /// Datagram or payload below [`MIN_PACKET_SIZE`]
    TooShort,
    /// Not TS and not RTP version 2
    BadVersion,
    /// Header fields point beyond the datagram
    Truncated,
}

/// How the payload was located
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Whole datagram is transport stream
    RawTs(Range<usize>),
    /// Payload extracted from an RTP packet
    Rtp {
        range: Range<usize>,
        payload_type: PayloadType,
    },
}

impl Payload {
    pub fn range(&self) -> Range<usize> {
        match self {
            Payload::RawTs(r) => r.clone(),
            Payload::Rtp { range, .. } => range.clone(),
        }
    }
}

/// Locate the transport-stream payload inside a source datagram
pub fn demux(datagram: &[u8]) -> Result<Payload, Reject> {
    if datagram.len() < MIN_PACKET_SIZE {
        return Err(Reject::TooShort);
    }

    if datagram[0] == TS_SYNC_BYTE {
        return Ok(Payload::RawTs(0..datagram.len()));
    }

    let (range, payload_type) = rtp_payload(datagram)?;
    if range.len() < MIN_PACKET_SIZE {
        return Err(Reject::TooShort);
    }

    Ok(Payload::Rtp {
        range,
        payload_type,
    })
}

fn rtp_payload(packet: &[u8]) -> Result<(Range<usize>, PayloadType), Reject> {
    let mut buf = packet;
    if buf.remaining() < RTP_HEADER_SIZE {
        return Err(Reject::Truncated);
    }

    let first = buf.get_u8();
    if first >> 6 != RTP_VERSION {
        return Err(Reject::BadVersion);
    }
    let padding = first & 0x20 != 0;
    let extension = first & 0x10 != 0;
    let csrc_count = (first & 0x0F) as usize;
    let payload_type = PayloadType::from_byte(buf.get_u8());

    let mut start = RTP_HEADER_SIZE + csrc_count * 4;
    let mut end = packet.len();

    if extension {
        if start + 4 > end {
            return Err(Reject::Truncated);
        }
        let mut ext = &packet[start + 2..start + 4];
        let words = ext.get_u16() as usize;
        start += 4 + words * 4;
    }

    if padding {
        let pad = packet[end - 1] as usize;
        end = end.checked_sub(pad).ok_or(Reject::Truncated)?;
    }

    start += payload_type.prefix_len();

    if start > end {
        return Err(Reject::Truncated);
    }

    Ok((start..end, payload_type))
}
