//! Wire shapes exchanged during the extended session handshake (§4.9) and the UDP-Ex nonce
//! sync. Multi-byte scalars are big-endian on the wire; reserved ranges are zero-filled on write
//! and ignored on read, to preserve forward compatibility per the open question in the design
//! notes.

use crate::frame::PackMode;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flux::shared::{NetworkResult, SizedRead, SizedWrite};
use std::io::Write;

pub const PASSWORD_HASH_SIZE: usize = 32;
pub const USER_DATA_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionType {
    UdpClient = 1,
    UdpServer = 2,
    TcpClient = 3,
    TcpServer = 4,
    UdpClientEx = 5,
    UdpServerEx = 6,
    TcpClientEx = 7,
    TcpServerEx = 8,
    SslClientEx = 9,
    SslServerEx = 10,
    Mcast = 11,
    McastEx = 12,
}

impl SessionType {
    /// Extended flavors run the §4.5/§4.9 handshake; plain flavors skip straight to `Ready`.
    pub fn is_extended(self) -> bool {
        matches!(
            self,
            SessionType::UdpClientEx
                | SessionType::UdpServerEx
                | SessionType::TcpClientEx
                | SessionType::TcpServerEx
                | SessionType::SslClientEx
                | SessionType::SslServerEx
                | SessionType::McastEx
        )
    }

    pub fn is_tls(self) -> bool {
        matches!(self, SessionType::SslClientEx | SessionType::SslServerEx)
    }
}

/// `RTP_SESSION_INFO`, the handshake payload a client sends once the extended preamble (and
/// optional TLS handshake) has completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionInfo {
    pub local_version: u16,
    pub remote_version: u16,
    pub session_type: u8,
    pub mm_type: u8,
    pub pack_mode: u8,
    pub some_id: u32,
    pub mm_id: u32,
    pub in_src_mm_id: u32,
    pub out_src_mm_id: u32,
    pub password_hash: [u8; PASSWORD_HASH_SIZE],
    pub user_data: [u8; USER_DATA_SIZE],
}

impl SessionInfo {
    pub const WIRE_SIZE: usize = 2 + 2 + 1 + 1 + 1 + 1 + PASSWORD_HASH_SIZE + 40 + 4 + 4 + 4 + 4 + USER_DATA_SIZE;

    pub fn pack_mode(&self) -> Option<PackMode> {
        match self.pack_mode {
            0 => Some(PackMode::Default),
            2 => Some(PackMode::Tcp2),
            4 => Some(PackMode::Tcp4),
            _ => None,
        }
    }

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u16::<BigEndian>(self.local_version)?;
        stream.write_u16::<BigEndian>(self.remote_version)?;
        stream.write_u8(self.session_type)?;
        stream.write_u8(self.mm_type)?;
        stream.write_u8(self.pack_mode)?;
        stream.write_u8(0)?; // reserved1
        stream.write_all(&self.password_hash)?;
        stream.write_all(&[0u8; 40])?; // reserved2
        stream.write_u32::<BigEndian>(self.some_id)?;
        stream.write_u32::<BigEndian>(self.mm_id)?;
        stream.write_u32::<BigEndian>(self.in_src_mm_id)?;
        stream.write_u32::<BigEndian>(self.out_src_mm_id)?;
        stream.write_all(&self.user_data)?;
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<SessionInfo> {
        let local_version = stream.read_u16::<BigEndian>()?;
        let remote_version = stream.read_u16::<BigEndian>()?;
        let session_type = stream.read_u8()?;
        let mm_type = stream.read_u8()?;
        let pack_mode = stream.read_u8()?;
        let _reserved1 = stream.read_u8()?;

        let mut password_hash = [0u8; PASSWORD_HASH_SIZE];
        stream.read_exact(&mut password_hash)?;

        let mut reserved2 = [0u8; 40];
        stream.read_exact(&mut reserved2)?;

        let some_id = stream.read_u32::<BigEndian>()?;
        let mm_id = stream.read_u32::<BigEndian>()?;
        let in_src_mm_id = stream.read_u32::<BigEndian>()?;
        let out_src_mm_id = stream.read_u32::<BigEndian>()?;

        let mut user_data = [0u8; USER_DATA_SIZE];
        stream.read_exact(&mut user_data)?;

        Ok(SessionInfo {
            local_version,
            remote_version,
            session_type,
            mm_type,
            pack_mode,
            some_id,
            mm_id,
            in_src_mm_id,
            out_src_mm_id,
            password_hash,
            user_data,
        })
    }
}

/// `RTP_SESSION_ACK`, sent by the server once the password hash matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionAck {
    pub version: u16,
}

impl SessionAck {
    pub const WIRE_SIZE: usize = 2 + 30;

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u16::<BigEndian>(self.version)?;
        stream.write_all(&[0u8; 30])?;
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<SessionAck> {
        let version = stream.read_u16::<BigEndian>()?;
        let mut reserved = [0u8; 30];
        stream.read_exact(&mut reserved)?;
        Ok(SessionAck { version })
    }
}

/// `RTP_UDPX_SYNC`, the 3-way nonce exchange UDP-Ex sessions perform before the framed
/// handshake, to bind the client's remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpxSync {
    pub version: u16,
    pub nonce: [u8; 14],
}

impl UdpxSync {
    pub const WIRE_SIZE: usize = 2 + 14 + 14 + 2;

    pub fn checksum(&self) -> u16 {
        self.nonce.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
    }

    pub fn write<W: SizedWrite>(&self, stream: &mut W) -> NetworkResult<()> {
        stream.write_u16::<BigEndian>(self.version)?;
        stream.write_all(&[0u8; 14])?; // reserved
        stream.write_all(&self.nonce)?;
        stream.write_u16::<BigEndian>(self.checksum())?;
        Ok(())
    }

    pub fn read<R: SizedRead>(stream: &mut R) -> NetworkResult<UdpxSync> {
        let version = stream.read_u16::<BigEndian>()?;
        let mut reserved = [0u8; 14];
        stream.read_exact(&mut reserved)?;

        let mut nonce = [0u8; 14];
        stream.read_exact(&mut nonce)?;

        let received_checksum = stream.read_u16::<BigEndian>()?;
        let sync = UdpxSync { version, nonce };

        if received_checksum != sync.checksum() {
            return Err(flux::shared::NetworkError::Fatal(flux::shared::ErrorType::Crypto));
        }

        Ok(sync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_session_info_roundtrip() {
        let info = SessionInfo {
            local_version: 1,
            remote_version: 0,
            session_type: SessionType::TcpServerEx as u8,
            mm_type: 11,
            pack_mode: 0,
            some_id: 7,
            mm_id: 8,
            in_src_mm_id: 9,
            out_src_mm_id: 10,
            password_hash: [0xab; PASSWORD_HASH_SIZE],
            user_data: [0x11; USER_DATA_SIZE],
        };

        let mut buf = vec![0u8; SessionInfo::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            info.write(&mut cursor).unwrap();
        }

        let mut cursor = Cursor::new(&buf[..]);
        let parsed = SessionInfo::read(&mut cursor).unwrap();
        assert_eq!(info, parsed);
    }

    #[test]
    fn test_udpx_sync_checksum_validated() {
        let nonce = [1u8; 14];
        let sync = UdpxSync { version: 2, nonce };

        let mut buf = vec![0u8; UdpxSync::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            sync.write(&mut cursor).unwrap();
        }

        let mut cursor = Cursor::new(&buf[..]);
        let parsed = UdpxSync::read(&mut cursor).unwrap();
        assert_eq!(parsed, sync);
        assert_eq!(parsed.checksum(), 14);
    }

    #[test]
    fn test_udpx_sync_bad_checksum_rejected() {
        let nonce = [1u8; 14];
        let sync = UdpxSync { version: 2, nonce };

        let mut buf = vec![0u8; UdpxSync::WIRE_SIZE];
        {
            let mut cursor = Cursor::new(&mut buf[..]);
            sync.write(&mut cursor).unwrap();
        }

        // Corrupt the checksum field (last 2 bytes).
        let len = buf.len();
        buf[len - 1] ^= 0xff;

        let mut cursor = Cursor::new(&buf[..]);
        assert!(UdpxSync::read(&mut cursor).is_err());
    }
}
