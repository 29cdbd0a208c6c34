//! Binary frame format shared by redirectors and data servers.
//!
//! Every exchange is one request frame followed by one response frame with the
//! same request id. The fixed 26-byte header is big-endian:
//!
//! ```text
//! magic:4 | version:1 | flags:1 | opcode:2 | request_id:8 | status:2 | payload_len:4 | checksum:4
//! ```
//!
//! `checksum` is the CRC32 of the payload. `status` is only meaningful on
//! response frames.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{Result, TransportError};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 26;

/// Protocol magic number ("XRDA").
pub const MAGIC: u32 = 0x5852_4441;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Session login carrying credentials.
    Login = 0x0001,
    /// Liveness round trip.
    Ping = 0x0002,
    /// Protocol version and node role.
    Protocol = 0x0003,
    /// Path location request to a redirector.
    Locate = 0x0101,
    /// Stat a path.
    Stat = 0x0102,
    /// Change permissions.
    Chmod = 0x0103,
    /// Create a directory.
    Mkdir = 0x0104,
    /// Remove a file.
    Rm = 0x0105,
    /// Remove an empty directory.
    Rmdir = 0x0106,
    /// Rename.
    Mv = 0x0107,
    /// One page of directory entries.
    Dirlist = 0x0108,
    /// Truncate a file.
    Truncate = 0x0109,
    /// Space summary of the file system holding a path.
    StatVfs = 0x010A,
    /// Submit a staging request.
    Prepare = 0x0201,
    /// Generic query (checksum and friends).
    Query = 0x0301,
}

impl Opcode {
    /// Returns the wire representation.
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Opcode {
    type Error = TransportError;

    fn try_from(raw: u16) -> Result<Self> {
        let op = match raw {
            0x0001 => Opcode::Login,
            0x0002 => Opcode::Ping,
            0x0003 => Opcode::Protocol,
            0x0101 => Opcode::Locate,
            0x0102 => Opcode::Stat,
            0x0103 => Opcode::Chmod,
            0x0104 => Opcode::Mkdir,
            0x0105 => Opcode::Rm,
            0x0106 => Opcode::Rmdir,
            0x0107 => Opcode::Mv,
            0x0108 => Opcode::Dirlist,
            0x0109 => Opcode::Truncate,
            0x010A => Opcode::StatVfs,
            0x0201 => Opcode::Prepare,
            0x0301 => Opcode::Query,
            other => return Err(TransportError::UnknownOpcode(other)),
        };
        Ok(op)
    }
}

impl std::fmt::Display for Opcode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Outcome tag carried by response frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ReplyStatus {
    /// Payload is the typed reply body.
    Ok = 0,
    /// Payload is an `ErrorReply`.
    Error = 1,
    /// Payload is a `RedirectReply`: another server is authoritative.
    Redirect = 2,
    /// Payload is a `WaitReply`: server busy, resend later.
    Wait = 3,
}

impl TryFrom<u16> for ReplyStatus {
    type Error = TransportError;

    fn try_from(raw: u16) -> Result<Self> {
        match raw {
            0 => Ok(ReplyStatus::Ok),
            1 => Ok(ReplyStatus::Error),
            2 => Ok(ReplyStatus::Redirect),
            3 => Ok(ReplyStatus::Wait),
            other => Err(TransportError::InvalidFrame {
                reason: format!("unknown reply status {}", other),
            }),
        }
    }
}

/// Frame flags for protocol control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Frame is a response.
    pub const RESPONSE: Self = Self(0x01);

    /// No flags set.
    pub fn empty() -> Self {
        Self(0)
    }

    /// Whether all bits of `other` are set.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// Raw byte representation.
    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// From raw byte representation.
    pub fn from_u8(b: u8) -> Self {
        Self(b)
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Frame header containing metadata about the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u8,
    /// Control flags
    pub flags: FrameFlags,
    /// Operation code
    pub opcode: Opcode,
    /// Request id used for response correlation
    pub request_id: u64,
    /// Reply status (responses only)
    pub status: ReplyStatus,
    /// Payload length in bytes
    pub payload_length: u32,
    /// CRC32 of the payload
    pub checksum: u32,
}

impl FrameHeader {
    /// Encodes the header into its fixed-size wire form.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.as_u8());
        buf.put_u16(self.opcode.as_u16());
        buf.put_u64(self.request_id);
        buf.put_u16(self.status as u16);
        buf.put_u32(self.payload_length);
        buf.put_u32(self.checksum);
    }

    /// Decodes and validates a header.
    pub fn decode(mut bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FRAME_HEADER_SIZE {
            return Err(TransportError::InvalidFrame {
                reason: format!("header too short: {} bytes", bytes.len()),
            });
        }
        let magic = bytes.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = bytes.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let flags = FrameFlags::from_u8(bytes.get_u8());
        let opcode = Opcode::try_from(bytes.get_u16())?;
        let request_id = bytes.get_u64();
        let status = ReplyStatus::try_from(bytes.get_u16())?;
        let payload_length = bytes.get_u32();
        if payload_length > MAX_PAYLOAD_SIZE {
            return Err(TransportError::PayloadTooLarge {
                size: payload_length,
                max_size: MAX_PAYLOAD_SIZE,
            });
        }
        let checksum = bytes.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            opcode,
            request_id,
            status,
            payload_length,
            checksum,
        })
    }
}

/// A single frame: header plus payload.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Payload data
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a request frame.
    pub fn request(opcode: Opcode, request_id: u64, payload: Vec<u8>) -> Self {
        Self::build(opcode, request_id, FrameFlags::empty(), ReplyStatus::Ok, payload)
    }

    /// Creates the response to `self` with the given status and payload.
    pub fn respond(&self, status: ReplyStatus, payload: Vec<u8>) -> Self {
        Self::build(
            self.header.opcode,
            self.header.request_id,
            FrameFlags::RESPONSE,
            status,
            payload,
        )
    }

    fn build(
        opcode: Opcode,
        request_id: u64,
        flags: FrameFlags,
        status: ReplyStatus,
        payload: Vec<u8>,
    ) -> Self {
        let header = FrameHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            opcode,
            request_id,
            status,
            payload_length: payload.len() as u32,
            checksum: crc32fast::hash(&payload),
        };
        Self { header, payload }
    }

    /// Operation code.
    pub fn opcode(&self) -> Opcode {
        self.header.opcode
    }

    /// Request id.
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }

    /// Reply status.
    pub fn status(&self) -> ReplyStatus {
        self.header.status
    }

    /// Whether this frame is a response.
    pub fn is_response(&self) -> bool {
        self.header.flags.contains(FrameFlags::RESPONSE)
    }

    /// Encodes header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        self.header.encode(&mut buf);
        buf.put_slice(&self.payload);
        buf.to_vec()
    }

    /// Decodes a complete frame from a buffer.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header = FrameHeader::decode(bytes)?;
        let body = &bytes[FRAME_HEADER_SIZE..];
        if body.len() != header.payload_length as usize {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "payload length {} does not match header {}",
                    body.len(),
                    header.payload_length
                ),
            });
        }
        let frame = Frame {
            header,
            payload: body.to_vec(),
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Verifies the payload checksum.
    pub fn validate(&self) -> Result<()> {
        let computed = crc32fast::hash(&self.payload);
        if computed != self.header.checksum {
            return Err(TransportError::ChecksumMismatch {
                expected: self.header.checksum,
                computed,
            });
        }
        Ok(())
    }
}
