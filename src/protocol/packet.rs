//! Packet framing for the RPC wire protocol.
//!
//! Every unit on the wire is a packet: a fixed 24-byte header followed by a
//! variable body. The fixed header keeps parsing constant-time and lets the
//! write side compute an exact buffer size when it merges several packets
//! into a single socket write.
//!
//! Header layout (big-endian for multi-byte integers):
//!
//! | Bytes | Field                                   |
//! |-------|-----------------------------------------|
//! | 0     | magic: 41 = request, 42 = response      |
//! | 1     | opcode: 0 CALL, 1 HEARTBEAT, 2 OFFLINE  |
//! | 2     | serializer id for the body              |
//! | 3     | compression id for the body             |
//! | 4-7   | body length                             |
//! | 8-15  | packet id                               |
//! | 16    | response status (responses only)        |
//! | 17-23 | reserved, written as zero               |
//!
//! A response always carries the packet id of the request it answers.
//! Heartbeat and offline control packets use the reserved packet id 0.

use anyhow::{anyhow, bail};
use byteorder::{BigEndian, ByteOrder};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::cast::FromPrimitive;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::trace;

/// Size of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 24;

/// Magic byte marking a request packet.
pub const MAGIC_REQUEST: u8 = 41;
/// Magic byte marking a response packet.
pub const MAGIC_RESPONSE: u8 = 42;

/// Packet id reserved for control packets (heartbeat, offline).
pub const CONTROL_PACKET_ID: u64 = 0;

/// Operation carried by a packet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum Opcode {
    /// A remote method call or its response.
    Call = 0,
    /// Keep-alive probe; answered with a heartbeat response.
    Heartbeat = 1,
    /// Graceful-drain announcement from the server.
    Offline = 2,
}

/// Status byte of a response packet.
///
/// Only meaningful when `magic` is [`MAGIC_RESPONSE`]. The raw byte is kept
/// on the packet so that unrecognized statuses survive decoding and can be
/// surfaced to the caller instead of failing the channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(i8)]
pub enum ResponseStatus {
    Success = 0,
    TooBusy = -1,
    ClassNotFound = -2,
    NoSuchMethod = -3,
    IllegalArgument = -4,
    InvocationError = -5,
    InternalError = -100,
}

/// A single framing unit: header fields plus body bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub magic: u8,
    pub opcode: Opcode,
    pub serializer: u8,
    pub compression: u8,
    pub packet_id: u64,
    /// Raw status byte; interpret with [`ResponseStatus::from_i8`].
    pub status: i8,
    pub body: Vec<u8>,
}

impl Packet {
    /// Builds a CALL request carrying an encoded request message.
    pub fn call_request(packet_id: u64, serializer: u8, compression: u8, body: Vec<u8>) -> Packet {
        Packet {
            magic: MAGIC_REQUEST,
            opcode: Opcode::Call,
            serializer,
            compression,
            packet_id,
            status: 0,
            body,
        }
    }

    /// Builds a CALL response carrying an encoded return value or fault body.
    pub fn call_response(
        packet_id: u64,
        status: ResponseStatus,
        serializer: u8,
        compression: u8,
        body: Vec<u8>,
    ) -> Packet {
        Packet {
            magic: MAGIC_RESPONSE,
            opcode: Opcode::Call,
            serializer,
            compression,
            packet_id,
            status: status as i8,
            body,
        }
    }

    /// Builds a bodyless CALL response carrying only a status.
    pub fn status_response(packet_id: u64, status: ResponseStatus) -> Packet {
        Packet::call_response(packet_id, status, 0, 0, Vec::new())
    }

    pub fn heartbeat_request() -> Packet {
        Packet::control(MAGIC_REQUEST, Opcode::Heartbeat)
    }

    pub fn heartbeat_response() -> Packet {
        Packet::control(MAGIC_RESPONSE, Opcode::Heartbeat)
    }

    pub fn offline_request() -> Packet {
        Packet::control(MAGIC_REQUEST, Opcode::Offline)
    }

    pub fn offline_response() -> Packet {
        Packet::control(MAGIC_RESPONSE, Opcode::Offline)
    }

    fn control(magic: u8, opcode: Opcode) -> Packet {
        Packet {
            magic,
            opcode,
            serializer: 0,
            compression: 0,
            packet_id: CONTROL_PACKET_ID,
            status: ResponseStatus::Success as i8,
            body: Vec::new(),
        }
    }

    pub fn is_request(&self) -> bool {
        self.magic == MAGIC_REQUEST
    }

    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RESPONSE
    }

    /// Exact number of bytes this packet occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.body.len()
    }

    /// Appends the encoded packet to `dest`.
    ///
    /// Writing into a caller-owned buffer lets the channel concatenate a
    /// whole merge batch before touching the socket.
    pub fn encode_into(&self, dest: &mut Vec<u8>) {
        let mut header = [0u8; HEADER_LEN];
        header[0] = self.magic;
        header[1] = self.opcode as u8;
        header[2] = self.serializer;
        header[3] = self.compression;
        BigEndian::write_u32(&mut header[4..8], self.body.len() as u32);
        BigEndian::write_u64(&mut header[8..16], self.packet_id);
        header[16] = self.status as u8;
        dest.reserve(self.encoded_len());
        dest.extend_from_slice(&header);
        dest.extend_from_slice(&self.body);
    }
}

/// Reads one packet from a stream.
///
/// Returns `Ok(None)` when the peer closed the connection cleanly between
/// packets. EOF in the middle of a packet, an invalid magic byte, an unknown
/// opcode, or a body length above `max_body_len` are decode failures that
/// must kill the channel.
pub async fn read_packet<R>(src: &mut R, max_body_len: usize) -> anyhow::Result<Option<Packet>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        let n = src.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                // Clean close between packets.
                return Ok(None);
            }
            bail!("connection closed mid-header after {filled} bytes");
        }
        filled += n;
    }

    let magic = header[0];
    if magic != MAGIC_REQUEST && magic != MAGIC_RESPONSE {
        bail!("invalid packet magic {magic}");
    }
    let opcode =
        Opcode::from_u8(header[1]).ok_or_else(|| anyhow!("unknown opcode {}", header[1]))?;
    let body_len = BigEndian::read_u32(&header[4..8]) as usize;
    if body_len > max_body_len {
        bail!("packet body length {body_len} exceeds max {max_body_len}");
    }
    let packet_id = BigEndian::read_u64(&header[8..16]);
    let status = header[16] as i8;

    trace!("reading packet id:{packet_id} opcode:{opcode:?} body:{body_len}");
    let mut body = vec![0u8; body_len];
    src.read_exact(&mut body).await?;

    Ok(Some(Packet {
        magic,
        opcode,
        serializer: header[2],
        compression: header[3],
        packet_id,
        status,
        body,
    }))
}
