//! TCP segment header

use bitflags::bitflags;
use byteorder::{BigEndian, ByteOrder};

/// Header length without options
pub const TCP_HEADER_LEN: usize = 20;

/// Kind and length of the maximum segment size option
const OPTION_MSS: u8 = 2;
const OPTION_MSS_LEN: usize = 4;
const OPTION_END: u8 = 0;
const OPTION_NOP: u8 = 1;

bitflags! {
    /// Control bits of a segment
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// TCP packet header structure
///
/// Represents the 20-byte TCP header as defined in RFC 793, plus the one
/// option this stack sends and understands (MSS).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    /// Header length in bytes, options included
    pub data_offset: usize,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
    pub mss: Option<u16>,
}

impl TcpHeader {
    pub fn new(src_port: u16, dst_port: u16, seq_number: u32, ack_number: u32, flags: TcpFlags, window_size: u16) -> Self {
        TcpHeader {
            src_port,
            dst_port,
            seq_number,
            ack_number,
            data_offset: TCP_HEADER_LEN,
            flags,
            window_size,
            checksum: 0,
            urgent_ptr: 0,
            mss: None,
        }
    }

    /// Advertise `mss` in the options
    pub fn with_mss(mut self, mss: u16) -> Self {
        self.mss = Some(mss);
        self.data_offset = TCP_HEADER_LEN + OPTION_MSS_LEN;
        self
    }

    /// Parse TCP header from byte slice
    ///
    /// Returns None if the data is too short or the data offset points
    /// outside the segment
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }
        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < TCP_HEADER_LEN || data_offset > data.len() {
            return None;
        }

        Some(TcpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            seq_number: BigEndian::read_u32(&data[4..8]),
            ack_number: BigEndian::read_u32(&data[8..12]),
            data_offset,
            flags: TcpFlags::from_bits_truncate(data[13]),
            window_size: BigEndian::read_u16(&data[14..16]),
            checksum: BigEndian::read_u16(&data[16..18]),
            urgent_ptr: BigEndian::read_u16(&data[18..20]),
            mss: Self::parse_mss(&data[TCP_HEADER_LEN..data_offset]),
        })
    }

    fn parse_mss(mut options: &[u8]) -> Option<u16> {
        while let Some(&kind) = options.first() {
            match kind {
                OPTION_END => return None,
                OPTION_NOP => options = &options[1..],
                _ => {
                    let len = *options.get(1)? as usize;
                    if len < 2 || len > options.len() {
                        return None;
                    }
                    if kind == OPTION_MSS && len == OPTION_MSS_LEN {
                        return Some(BigEndian::read_u16(&options[2..4]));
                    }
                    options = &options[len..];
                }
            }
        }
        None
    }

    /// Write the header into `out`, which must be `data_offset` long
    pub fn write(&self, out: &mut [u8]) {
        BigEndian::write_u16(&mut out[0..2], self.src_port);
        BigEndian::write_u16(&mut out[2..4], self.dst_port);
        BigEndian::write_u32(&mut out[4..8], self.seq_number);
        BigEndian::write_u32(&mut out[8..12], self.ack_number);
        out[12] = ((self.data_offset / 4) as u8) << 4;
        out[13] = self.flags.bits();
        BigEndian::write_u16(&mut out[14..16], self.window_size);
        BigEndian::write_u16(&mut out[16..18], self.checksum);
        BigEndian::write_u16(&mut out[18..20], self.urgent_ptr);
        if let Some(mss) = self.mss {
            out[20] = OPTION_MSS;
            out[21] = OPTION_MSS_LEN as u8;
            BigEndian::write_u16(&mut out[22..24], mss);
        }
    }

    pub fn is_syn(&self) -> bool {
        self.flags.contains(TcpFlags::SYN)
    }

    pub fn is_ack(&self) -> bool {
        self.flags.contains(TcpFlags::ACK)
    }

    pub fn is_fin(&self) -> bool {
        self.flags.contains(TcpFlags::FIN)
    }

    pub fn is_rst(&self) -> bool {
        self.flags.contains(TcpFlags::RST)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_syn_carries_mss() {
        let header = TcpHeader::new(1024, 80, 7, 0, TcpFlags::SYN, 8192).with_mss(1460);
        let mut bytes = [0u8; 24];
        header.write(&mut bytes);
        assert_eq!(bytes[12], 6 << 4);
        let parsed = TcpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_syn() && !parsed.is_ack());
    }

    #[test]
    fn test_options_skip_nops_and_unknown_kinds() {
        let mut bytes = [0u8; 32];
        TcpHeader::new(1, 2, 3, 4, TcpFlags::SYN | TcpFlags::ACK, 100).write(&mut bytes);
        bytes[12] = 8 << 4;
        bytes[20..32].copy_from_slice(&[1, 1, 4, 2, 3, 3, 7, 2, 4, 0x05, 0xb4, 0]);
        let parsed = TcpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.mss, Some(1460));
        assert_eq!(parsed.data_offset, 32);
    }

    #[test]
    fn test_bad_data_offset_rejected() {
        let mut bytes = [0u8; 20];
        bytes[12] = 2 << 4;
        assert!(TcpHeader::from_bytes(&bytes).is_none());
        bytes[12] = 15 << 4;
        assert!(TcpHeader::from_bytes(&bytes).is_none());
    }
}
