//! The 64-byte fixed E2E header that precedes (or stands in for) a
//! payload on the wire (spec.md §3 "E2E Header", §6).

use crate::error::{Result, XddError};

pub const HEADER_LEN: usize = 64;
pub const COOKIE_LEN: usize = 16;

const MAGIC_DATA: u32 = 0x5844_4441; // "XDDA" in spirit: DATA magic
const MAGIC_EOF: u32 = 0x5844_4545; // EOF magic

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Magic {
    Data,
    Eof,
}

/// On-wire E2E header. Field order and widths are fixed per spec.md §3;
/// encoded big-endian, mirroring the TCP framing header in spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct E2EHeader {
    pub magic: Magic,
    pub cookie: [u8; COOKIE_LEN],
    pub worker_number: u32,
    pub sequence: u64,
    pub send_time: u64,
    pub recv_time: u64,
    pub byte_offset: u64,
    pub data_length: u64,
}

impl E2EHeader {
    pub fn data(
        cookie: [u8; COOKIE_LEN],
        worker_number: u32,
        sequence: u64,
        byte_offset: u64,
        data_length: u64,
    ) -> Self {
        Self {
            magic: Magic::Data,
            cookie,
            worker_number,
            sequence,
            send_time: 0,
            recv_time: 0,
            byte_offset,
            data_length,
        }
    }

    pub fn eof(cookie: [u8; COOKIE_LEN], worker_number: u32, sequence: u64) -> Self {
        Self {
            magic: Magic::Eof,
            cookie,
            worker_number,
            sequence,
            send_time: 0,
            recv_time: 0,
            byte_offset: 0,
            data_length: 0,
        }
    }

    pub fn is_eof(&self) -> bool {
        self.magic == Magic::Eof
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        let magic = match self.magic {
            Magic::Data => MAGIC_DATA,
            Magic::Eof => MAGIC_EOF,
        };
        buf[0..4].copy_from_slice(&magic.to_be_bytes());
        buf[4..20].copy_from_slice(&self.cookie);
        buf[20..24].copy_from_slice(&self.worker_number.to_be_bytes());
        buf[24..32].copy_from_slice(&self.sequence.to_be_bytes());
        buf[32..40].copy_from_slice(&self.send_time.to_be_bytes());
        buf[40..48].copy_from_slice(&self.recv_time.to_be_bytes());
        buf[48..56].copy_from_slice(&self.byte_offset.to_be_bytes());
        buf[56..64].copy_from_slice(&self.data_length.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(XddError::Protocol(format!(
                "truncated E2E header: expected {HEADER_LEN} bytes, got {}",
                buf.len()
            )));
        }
        let magic_raw = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        let magic = match magic_raw {
            MAGIC_DATA => Magic::Data,
            MAGIC_EOF => Magic::Eof,
            other => {
                return Err(XddError::Protocol(format!("unexpected E2E header magic: {other:#x}")))
            }
        };
        let mut cookie = [0u8; COOKIE_LEN];
        cookie.copy_from_slice(&buf[4..20]);
        Ok(Self {
            magic,
            cookie,
            worker_number: u32::from_be_bytes(buf[20..24].try_into().unwrap()),
            sequence: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
            send_time: u64::from_be_bytes(buf[32..40].try_into().unwrap()),
            recv_time: u64::from_be_bytes(buf[40..48].try_into().unwrap()),
            byte_offset: u64::from_be_bytes(buf[48..56].try_into().unwrap()),
            data_length: u64::from_be_bytes(buf[56..64].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_header_roundtrips() {
        let header = E2EHeader::data([7u8; COOKIE_LEN], 3, 42, 1_048_576, 65536);
        let encoded = header.encode();
        assert_eq!(encoded.len(), HEADER_LEN);
        let decoded = E2EHeader::decode(&encoded).unwrap();
        assert_eq!(decoded, header);
        assert!(!decoded.is_eof());
    }

    #[test]
    fn eof_header_roundtrips() {
        let header = E2EHeader::eof([1u8; COOKIE_LEN], 2, 99);
        let decoded = E2EHeader::decode(&header.encode()).unwrap();
        assert!(decoded.is_eof());
        assert_eq!(decoded.sequence, 99);
    }

    #[test]
    fn decode_rejects_truncated_buffer() {
        let err = E2EHeader::decode(&[0u8; 10]).unwrap_err();
        assert!(matches!(err, XddError::Protocol(_)));
    }

    #[test]
    fn decode_rejects_unknown_magic() {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..4].copy_from_slice(&0xFFFF_FFFFu32.to_be_bytes());
        let err = E2EHeader::decode(&buf).unwrap_err();
        assert!(matches!(err, XddError::Protocol(_)));
    }
}
