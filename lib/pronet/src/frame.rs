//! Wire framing for session packets. Three `PackMode`s select how a packet is carried on top of
//! a stream or datagram transport; see the table in the session design. A zero-length frame is a
//! heartbeat in every mode.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flux::shared::{ErrorType, NetworkError, NetworkResult};
use std::io::{Cursor, Read, Write};

pub const RTP_HEADER_SIZE: usize = 12;
pub const EXT_SIZE: usize = 8;

/// Maximum plaintext payload for `Default`/`Tcp2` pack modes.
pub const MAX_PAYLOAD_SHORT: usize = 64 * 1024 - 1024;
/// Maximum plaintext payload for `Tcp4`.
pub const MAX_PAYLOAD_TCP4: usize = 96 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum PackMode {
    /// `Ext(8B) + RtpHeader(12B) + payload`.
    Default,
    /// `len(2B be) + payload`.
    Tcp2,
    /// `len(4B be) + payload`.
    Tcp4,
}

impl PackMode {
    pub fn max_payload(self) -> usize {
        match self {
            PackMode::Default | PackMode::Tcp2 => MAX_PAYLOAD_SHORT,
            PackMode::Tcp4 => MAX_PAYLOAD_TCP4,
        }
    }
}

/// The RFC-3550-derived fixed header carried in `Default` pack mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl Default for RtpHeader {
    fn default() -> Self {
        RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker: false,
            payload_type: 0,
            sequence: 0,
            timestamp: 0,
            ssrc: 0,
        }
    }
}

impl RtpHeader {
    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        let byte0 = (self.version & 0x03) << 6
            | (self.padding as u8) << 5
            | (self.extension as u8) << 4
            | (self.csrc_count & 0x0f);
        let byte1 = (self.marker as u8) << 7 | (self.payload_type & 0x7f);

        stream.write_u8(byte0)?;
        stream.write_u8(byte1)?;
        stream.write_u16::<BigEndian>(self.sequence)?;
        stream.write_u32::<BigEndian>(self.timestamp)?;
        stream.write_u32::<BigEndian>(self.ssrc)?;
        Ok(())
    }

    pub fn read<R: Read>(mut stream: R) -> NetworkResult<RtpHeader> {
        let byte0 = stream.read_u8()?;
        let byte1 = stream.read_u8()?;

        Ok(RtpHeader {
            version: byte0 >> 6,
            padding: byte0 & 0x20 != 0,
            extension: byte0 & 0x10 != 0,
            csrc_count: byte0 & 0x0f,
            marker: byte1 & 0x80 != 0,
            payload_type: byte1 & 0x7f,
            sequence: stream.read_u16::<BigEndian>()?,
            timestamp: stream.read_u32::<BigEndian>()?,
            ssrc: stream.read_u32::<BigEndian>()?,
        })
    }
}

/// The extended-flavor header prepended to `Default`-mode packets, carrying the mm band and the
/// authoritative frame boundary (`hdr_and_payload_size`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ext {
    pub mm_id: u32,
    pub mm_type: u8,
    pub key_frame: bool,
    pub first_packet: bool,
    pub hdr_and_payload_size: u16,
}

impl Ext {
    pub fn write<W: Write>(&self, mut stream: W) -> NetworkResult<()> {
        let flags = (self.key_frame as u8) << 7 | (self.first_packet as u8) << 6;

        stream.write_u32::<BigEndian>(self.mm_id)?;
        stream.write_u8(self.mm_type)?;
        stream.write_u8(flags)?;
        stream.write_u8(0)?; // reserved
        stream.write_u16::<BigEndian>(self.hdr_and_payload_size)?;
        Ok(())
    }

    pub fn read<R: Read>(mut stream: R) -> NetworkResult<Ext> {
        let mm_id = stream.read_u32::<BigEndian>()?;
        let mm_type = stream.read_u8()?;
        let flags = stream.read_u8()?;
        let _reserved = stream.read_u8()?;
        let hdr_and_payload_size = stream.read_u16::<BigEndian>()?;

        Ok(Ext {
            mm_id,
            mm_type,
            key_frame: flags & 0x80 != 0,
            first_packet: flags & 0x40 != 0,
            hdr_and_payload_size,
        })
    }
}

/// A fully assembled RTP packet, laid out as `Ext | RtpHeader | payload` in one contiguous buffer
/// so a transport can hand it to the socket with a single write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub ext: Ext,
    pub hdr: RtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn encoded_len(&self) -> usize {
        EXT_SIZE + RTP_HEADER_SIZE + self.payload.len()
    }

    pub fn write(&self, out: &mut [u8]) -> NetworkResult<usize> {
        let total = self.encoded_len();
        if out.len() < total {
            return Err(NetworkError::Wait);
        }

        let mut cursor = Cursor::new(&mut out[..total]);
        self.ext.write(&mut cursor)?;
        self.hdr.write(&mut cursor)?;
        cursor.write_all(&self.payload)?;
        Ok(total)
    }

    pub fn read(buf: &[u8]) -> NetworkResult<RtpPacket> {
        if buf.len() < EXT_SIZE + RTP_HEADER_SIZE {
            return Err(NetworkError::Wait);
        }

        let mut cursor = Cursor::new(buf);
        let ext = Ext::read(&mut cursor)?;
        let hdr = RtpHeader::read(&mut cursor)?;
        let payload_start = cursor.position() as usize;

        if buf.len() < payload_start {
            return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
        }

        Ok(RtpPacket {
            ext,
            hdr,
            payload: buf[payload_start..].to_vec(),
        })
    }
}

/// Result of attempting to locate one frame boundary at the head of a recv-pool buffer.
pub enum FrameBoundary {
    /// Not enough data buffered yet to determine the frame length.
    Incomplete,
    /// A complete frame of `total_len` bytes (header + payload) starts at offset 0; the payload
    /// is `buf[payload_offset..payload_offset + payload_len]`.
    Complete {
        total_len: usize,
        payload_offset: usize,
        payload_len: usize,
    },
}

/// Locate the next frame boundary in `buf` per `mode`. For `Default`, the `Ext` header supplies
/// `hdr_and_payload_size`. For `Tcp2`/`Tcp4`, the length prefix is authoritative and the caller
/// re-attaches `mm_id`/`mm_type` from session info since no `Ext` travels on the wire.
pub fn find_frame_boundary(buf: &[u8], mode: PackMode) -> NetworkResult<FrameBoundary> {
    match mode {
        PackMode::Default => {
            if buf.len() < EXT_SIZE {
                return Ok(FrameBoundary::Incomplete);
            }

            let mut cursor = Cursor::new(&buf[..EXT_SIZE]);
            let ext = Ext::read(&mut cursor)?;
            let body_len = ext.hdr_and_payload_size as usize;
            let total_len = EXT_SIZE + body_len;

            if body_len > 0 && body_len < RTP_HEADER_SIZE {
                return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
            }

            if buf.len() < total_len {
                return Ok(FrameBoundary::Incomplete);
            }

            let payload_offset = EXT_SIZE + if body_len == 0 { 0 } else { RTP_HEADER_SIZE };
            let payload_len = if body_len == 0 { 0 } else { body_len - RTP_HEADER_SIZE };

            Ok(FrameBoundary::Complete {
                total_len,
                payload_offset,
                payload_len,
            })
        }
        PackMode::Tcp2 => find_length_prefixed(buf, 2, MAX_PAYLOAD_SHORT),
        PackMode::Tcp4 => find_length_prefixed(buf, 4, MAX_PAYLOAD_TCP4),
    }
}

fn find_length_prefixed(buf: &[u8], prefix_len: usize, max_payload: usize) -> NetworkResult<FrameBoundary> {
    if buf.len() < prefix_len {
        return Ok(FrameBoundary::Incomplete);
    }

    let payload_len = if prefix_len == 2 {
        (&buf[..2]).read_u16::<BigEndian>()? as usize
    } else {
        (&buf[..4]).read_u32::<BigEndian>()? as usize
    };

    if payload_len > max_payload {
        return Err(NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    let total_len = prefix_len + payload_len;
    if buf.len() < total_len {
        return Ok(FrameBoundary::Incomplete);
    }

    Ok(FrameBoundary::Complete {
        total_len,
        payload_offset: prefix_len,
        payload_len,
    })
}

/// Write a zero-length heartbeat frame for `mode` into `out`, returning the bytes written.
pub fn write_heartbeat(mode: PackMode, out: &mut [u8]) -> NetworkResult<usize> {
    match mode {
        PackMode::Default => {
            let ext = Ext {
                mm_id: 0,
                mm_type: 0,
                key_frame: false,
                first_packet: false,
                hdr_and_payload_size: 0,
            };
            let mut cursor = Cursor::new(&mut out[..EXT_SIZE]);
            ext.write(&mut cursor)?;
            Ok(EXT_SIZE)
        }
        PackMode::Tcp2 => {
            (&mut out[..2]).write_u16::<BigEndian>(0)?;
            Ok(2)
        }
        PackMode::Tcp4 => {
            (&mut out[..4]).write_u32::<BigEndian>(0)?;
            Ok(4)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rtp_header_roundtrip() {
        let hdr = RtpHeader {
            version: 2,
            padding: true,
            extension: false,
            csrc_count: 3,
            marker: true,
            payload_type: 96,
            sequence: 4242,
            timestamp: 0xdead_beef,
            ssrc: 0x1234_5678,
        };

        let mut buf = [0u8; RTP_HEADER_SIZE];
        hdr.write(&mut buf[..]).unwrap();

        let parsed = RtpHeader::read(&buf[..]).unwrap();
        assert_eq!(hdr, parsed);
    }

    #[test]
    fn test_ext_roundtrip() {
        let ext = Ext {
            mm_id: 7,
            mm_type: 11,
            key_frame: true,
            first_packet: false,
            hdr_and_payload_size: 900,
        };

        let mut buf = [0u8; EXT_SIZE];
        ext.write(&mut buf[..]).unwrap();

        let parsed = Ext::read(&buf[..]).unwrap();
        assert_eq!(ext, parsed);
    }

    #[test]
    fn test_default_frame_boundary_incomplete_then_complete() {
        let packet = RtpPacket {
            ext: Ext {
                mm_id: 1,
                mm_type: 1,
                key_frame: false,
                first_packet: true,
                hdr_and_payload_size: (RTP_HEADER_SIZE + 5) as u16,
            },
            hdr: RtpHeader::default(),
            payload: vec![1, 2, 3, 4, 5],
        };

        let mut buf = vec![0u8; packet.encoded_len()];
        packet.write(&mut buf).unwrap();

        assert!(matches!(
            find_frame_boundary(&buf[..EXT_SIZE], PackMode::Default).unwrap(),
            FrameBoundary::Incomplete
        ));

        match find_frame_boundary(&buf, PackMode::Default).unwrap() {
            FrameBoundary::Complete {
                total_len,
                payload_offset,
                payload_len,
            } => {
                assert_eq!(total_len, buf.len());
                assert_eq!(&buf[payload_offset..payload_offset + payload_len], &[1, 2, 3, 4, 5]);
            }
            FrameBoundary::Incomplete => panic!("expected complete frame"),
        }
    }

    #[test]
    fn test_tcp4_length_prefixed_boundary() {
        let mut buf = vec![];
        buf.write_u32::<BigEndian>(3).unwrap();
        buf.extend_from_slice(&[9, 8, 7]);

        match find_frame_boundary(&buf, PackMode::Tcp4).unwrap() {
            FrameBoundary::Complete {
                total_len,
                payload_offset,
                payload_len,
            } => {
                assert_eq!(total_len, 7);
                assert_eq!(payload_offset, 4);
                assert_eq!(payload_len, 3);
            }
            FrameBoundary::Incomplete => panic!("expected complete frame"),
        }
    }

    #[test]
    fn test_tcp2_oversize_payload_rejected() {
        let mut buf = vec![];
        buf.write_u16::<BigEndian>(u16::max_value()).unwrap();

        let result = find_frame_boundary(&buf, PackMode::Tcp2);
        assert_eq!(result.unwrap_err(), NetworkError::Fatal(ErrorType::PayloadTooLarge));
    }

    #[test]
    fn test_heartbeat_is_zero_length_frame() {
        let mut buf = [0xffu8; 8];
        let n = write_heartbeat(PackMode::Tcp4, &mut buf).unwrap();
        assert_eq!(n, 4);

        match find_frame_boundary(&buf[..4], PackMode::Tcp4).unwrap() {
            FrameBoundary::Complete {
                total_len,
                payload_len,
                ..
            } => {
                assert_eq!(total_len, 4);
                assert_eq!(payload_len, 0);
            }
            FrameBoundary::Incomplete => panic!("expected complete frame"),
        }
    }
}
