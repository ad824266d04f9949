//! Little-endian body layouts for the request/response/bulk-data protocol.

use bedrock::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Write;

/// Transport-level classification of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Cmd = 0,
    Rsp = 1,
    Data = 2,
    DataAck = 3,
}

impl PacketType {
    #[inline]
    pub fn from_u8(raw: u8) -> Result<PacketType> {
        Ok(match raw {
            0 => PacketType::Cmd,
            1 => PacketType::Rsp,
            2 => PacketType::Data,
            3 => PacketType::DataAck,
            _ => return Err(Error::InvalidArgument),
        })
    }
}

impl From<PacketType> for u8 {
    #[inline]
    fn from(packet_type: PacketType) -> u8 {
        packet_type as u8
    }
}

/// Leading fields of a CMD body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmdHeader {
    pub command_id: u16,
    pub request_id: u32,
}

impl CmdHeader {
    pub const SIZE: usize = 6;

    pub fn read(buffer: &[u8]) -> Result<CmdHeader> {
        if buffer.len() < Self::SIZE {
            return Err(Error::InvalidArgument);
        }

        let mut stream = buffer;

        Ok(CmdHeader {
            command_id: stream.read_u16::<LittleEndian>()?,
            request_id: stream.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> Result<()> {
        stream.write_u16::<LittleEndian>(self.command_id)?;
        stream.write_u32::<LittleEndian>(self.request_id).map_err(Into::into)
    }
}

/// Leading fields of an RSP body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RspHeader {
    pub command_id: u16,
    pub request_id: u32,
    pub return_code: i16,
}

impl RspHeader {
    pub const SIZE: usize = 8;

    pub fn read(buffer: &[u8]) -> Result<RspHeader> {
        if buffer.len() < Self::SIZE {
            return Err(Error::InvalidArgument);
        }

        let mut stream = buffer;

        Ok(RspHeader {
            command_id: stream.read_u16::<LittleEndian>()?,
            request_id: stream.read_u32::<LittleEndian>()?,
            return_code: stream.read_i16::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> Result<()> {
        stream.write_u16::<LittleEndian>(self.command_id)?;
        stream.write_u32::<LittleEndian>(self.request_id)?;
        stream.write_i16::<LittleEndian>(self.return_code).map_err(Into::into)
    }
}

/// Leading fields of a DATA body; the payload follows immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataHeader {
    pub request_id: u32,
    pub offset: u32,
}

impl DataHeader {
    pub const SIZE: usize = 8;

    pub fn read(buffer: &[u8]) -> Result<DataHeader> {
        if buffer.len() < Self::SIZE {
            return Err(Error::InvalidArgument);
        }

        let mut stream = buffer;

        Ok(DataHeader {
            request_id: stream.read_u32::<LittleEndian>()?,
            offset: stream.read_u32::<LittleEndian>()?,
        })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> Result<()> {
        stream.write_u32::<LittleEndian>(self.request_id)?;
        stream.write_u32::<LittleEndian>(self.offset).map_err(Into::into)
    }
}

/// DATA_ACK body: the request id followed by up to eight acknowledged
/// payload offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAck {
    pub request_id: u32,
    pub offsets: Vec<u32>,
}

impl DataAck {
    pub const MAX_OFFSETS: usize = 8;

    pub fn read(buffer: &[u8]) -> Result<DataAck> {
        if buffer.len() < 4 || (buffer.len() - 4) % 4 != 0 {
            return Err(Error::InvalidArgument);
        }

        let count = (buffer.len() - 4) / 4;

        if count > Self::MAX_OFFSETS {
            return Err(Error::InvalidArgument);
        }

        let mut stream = buffer;
        let request_id = stream.read_u32::<LittleEndian>()?;

        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(stream.read_u32::<LittleEndian>()?);
        }

        Ok(DataAck { request_id, offsets })
    }

    pub fn write<W: Write>(&self, mut stream: W) -> Result<()> {
        if self.offsets.len() > Self::MAX_OFFSETS {
            return Err(Error::InvalidArgument);
        }

        stream.write_u32::<LittleEndian>(self.request_id)?;
        for &offset in &self.offsets {
            stream.write_u32::<LittleEndian>(offset)?;
        }

        Ok(())
    }

    /// Bytes this body occupies on the wire.
    #[inline]
    pub fn size(&self) -> usize {
        4 + self.offsets.len() * 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_type_codes() {
        assert_eq!(PacketType::from_u8(0).unwrap(), PacketType::Cmd);
        assert_eq!(PacketType::from_u8(3).unwrap(), PacketType::DataAck);
        assert_eq!(PacketType::from_u8(4).unwrap_err(), Error::InvalidArgument);

        assert_eq!(u8::from(PacketType::Rsp), 1);
    }

    #[test]
    fn test_cmd_header_roundtrip() {
        let header = CmdHeader {
            command_id: 0x0102,
            request_id: 0xdead_beef,
        };

        let mut raw = Vec::new();
        header.write(&mut raw).unwrap();

        assert_eq!(raw, vec![0x02, 0x01, 0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(CmdHeader::read(&raw).unwrap(), header);
    }

    #[test]
    fn test_cmd_header_short_body() {
        assert_eq!(CmdHeader::read(&[0; 5]).unwrap_err(), Error::InvalidArgument);
    }

    #[test]
    fn test_rsp_header_roundtrip() {
        let header = RspHeader {
            command_id: 7,
            request_id: 1234,
            return_code: -22,
        };

        let mut raw = Vec::new();
        header.write(&mut raw).unwrap();

        assert_eq!(raw.len(), RspHeader::SIZE);
        assert_eq!(RspHeader::read(&raw).unwrap(), header);
    }

    #[test]
    fn test_data_header_roundtrip() {
        let header = DataHeader {
            request_id: 55,
            offset: 4096,
        };

        let mut raw = Vec::new();
        header.write(&mut raw).unwrap();

        assert_eq!(raw.len(), DataHeader::SIZE);
        assert_eq!(DataHeader::read(&raw).unwrap(), header);
    }

    #[test]
    fn test_data_ack_roundtrip() {
        let ack = DataAck {
            request_id: 99,
            offsets: vec![0, 128, 256],
        };

        let mut raw = Vec::new();
        ack.write(&mut raw).unwrap();

        assert_eq!(raw.len(), ack.size());
        assert_eq!(DataAck::read(&raw).unwrap(), ack);
    }

    #[test]
    fn test_data_ack_empty() {
        let ack = DataAck {
            request_id: 1,
            offsets: Vec::new(),
        };

        let mut raw = Vec::new();
        ack.write(&mut raw).unwrap();

        assert_eq!(raw.len(), 4);
        assert_eq!(DataAck::read(&raw).unwrap().offsets.len(), 0);
    }

    #[test]
    fn test_data_ack_bounds() {
        // Nine offsets exceed the cap in both directions.
        let ack = DataAck {
            request_id: 1,
            offsets: (0..9).collect(),
        };

        let mut raw = Vec::new();
        assert_eq!(ack.write(&mut raw).unwrap_err(), Error::InvalidArgument);

        let raw = vec![0u8; 4 + 9 * 4];
        assert_eq!(DataAck::read(&raw).unwrap_err(), Error::InvalidArgument);

        // Trailing partial offset is malformed.
        let raw = vec![0u8; 7];
        assert_eq!(DataAck::read(&raw).unwrap_err(), Error::InvalidArgument);
    }
}
