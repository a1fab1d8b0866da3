//! 세그먼트 정의 및 직렬화
//!
//! 모든 필드는 네트워크 바이트 순서(big-endian)로 기록된다.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +---------------------------------------------------------------+
//! |                        sequence_number                        |
//! +---------------------------------------------------------------+
//! |                          ack_number                           |
//! +-------------------------------+-------------------------------+
//! |            control            |            window             |
//! +-------------------------------+-------------------------------+
//! |                           data_len                            |
//! +---------------------------------------------------------------+
//! |                  future_use0 / 1 / 2 (3 words)                |
//! +---------------------------------------------------------------+
//! |                           checksum                            |
//! +---------------------------------------------------------------+
//! ```
//!
//! 체크섬은 CRC32 이며, 체크섬 필드를 0 으로 둔 헤더와 페이로드를
//! [`CHECKSUM_BUFFER_LEN`] 크기의 0 으로 채운 버퍼에 넣고 버퍼 전체에 대해
//! 계산한다. 송신자와 수신자는 페이로드 길이와 무관하게 같은 바이트 수를 본다.

use std::fmt;
use std::ops::{BitOr, BitOrAssign};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// 고정 헤더 크기 (8 × 4 바이트)
pub const HEADER_LEN: usize = 32;

/// 체크섬 계산용 정규 버퍼 크기
pub const CHECKSUM_BUFFER_LEN: usize = 8192;

/// 한 세그먼트가 실을 수 있는 최대 페이로드
pub const MAX_PAYLOAD_LEN: usize = CHECKSUM_BUFFER_LEN - HEADER_LEN;

const CHECKSUM_OFFSET: usize = 28;

/// 제어 플래그 집합
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Control(u16);

impl Control {
    pub const NONE: Control = Control(0);
    pub const ACK: Control = Control(0x1000);
    pub const RST: Control = Control(0x2000);
    pub const SYN: Control = Control(0x4000);
    pub const FIN: Control = Control(0x8000);

    pub const SYN_ACK: Control = Control(0x4000 | 0x1000);
    pub const FIN_ACK: Control = Control(0x8000 | 0x1000);

    pub const fn from_bits(bits: u16) -> Self {
        Control(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    /// `flags` 의 모든 비트가 설정되어 있는지 확인
    pub const fn has(self, flags: Control) -> bool {
        self.0 & flags.0 == flags.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for Control {
    type Output = Control;

    fn bitor(self, rhs: Control) -> Control {
        Control(self.0 | rhs.0)
    }
}

impl BitOrAssign for Control {
    fn bitor_assign(&mut self, rhs: Control) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [
            (Control::SYN, "SYN"),
            (Control::FIN, "FIN"),
            (Control::RST, "RST"),
            (Control::ACK, "ACK"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.has(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        let unknown = self.0 & !0xF000;
        if unknown != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{:#06x}", unknown)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Control({})", self)
    }
}

/// 세그먼트 헤더
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// 첫 페이로드 바이트의 스트림 위치 (핸드쉐이크 중에는 nonce)
    pub seq: u32,

    /// 상대에게서 다음에 기대하는 스트림 위치 (누적 ACK)
    pub ack: u32,

    pub control: Control,

    /// 수신 버퍼 여유 공간
    pub window: u16,

    /// 실제 페이로드 길이
    pub data_len: u32,

    /// 예약 필드 (항상 0)
    pub future_use: [u32; 3],

    pub checksum: u32,
}

impl Header {
    pub fn new(seq: u32, ack: u32, control: Control, window: u16) -> Self {
        Self {
            seq,
            ack,
            control,
            window,
            data_len: 0,
            future_use: [0; 3],
            checksum: 0,
        }
    }

    fn put(&self, buf: &mut impl BufMut, checksum: u32) {
        buf.put_u32(self.seq);
        buf.put_u32(self.ack);
        buf.put_u16(self.control.bits());
        buf.put_u16(self.window);
        buf.put_u32(self.data_len);
        for word in self.future_use {
            buf.put_u32(word);
        }
        buf.put_u32(checksum);
    }

    fn parse(mut bytes: &[u8]) -> Self {
        let seq = bytes.get_u32();
        let ack = bytes.get_u32();
        let control = Control::from_bits(bytes.get_u16());
        let window = bytes.get_u16();
        let data_len = bytes.get_u32();
        let future_use = [bytes.get_u32(), bytes.get_u32(), bytes.get_u32()];
        let checksum = bytes.get_u32();

        Self {
            seq,
            ack,
            control,
            window,
            data_len,
            future_use,
            checksum,
        }
    }
}

/// 헤더 + 페이로드
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub header: Header,
    pub payload: Bytes,
}

impl Segment {
    /// 페이로드 없는 제어 세그먼트
    pub fn control(seq: u32, ack: u32, control: Control, window: u16) -> Self {
        Self {
            header: Header::new(seq, ack, control, window),
            payload: Bytes::new(),
        }
    }

    /// 데이터 세그먼트 (수신측 누적 ACK 를 함께 싣는다)
    pub fn data(seq: u32, ack: u32, window: u16, payload: Bytes) -> Self {
        let mut header = Header::new(seq, ack, Control::ACK, window);
        header.data_len = payload.len() as u32;
        Self { header, payload }
    }

    /// 이 세그먼트 다음의 시퀀스 번호
    pub fn end_seq(&self) -> u32 {
        self.header.seq.wrapping_add(self.payload.len() as u32)
    }

    /// 전송할 바이트로 직렬화 (헤더 + 실제 페이로드 길이)
    pub fn encode(&self) -> Result<Bytes> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::MalformedSegment {
                len: HEADER_LEN + self.payload.len(),
            });
        }

        let mut header = self.header.clone();
        header.data_len = self.payload.len() as u32;

        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        header.put(&mut buf, 0);
        buf.extend_from_slice(&self.payload);

        let checksum = crc32fast::hash(&pad_to_canonical(&buf));
        buf[CHECKSUM_OFFSET..HEADER_LEN].copy_from_slice(&checksum.to_be_bytes());

        Ok(buf.freeze())
    }

    /// 바이트에서 세그먼트 역직렬화 (체크섬은 검증하지 않음)
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::MalformedSegment { len: bytes.len() });
        }

        let header = Header::parse(&bytes[..HEADER_LEN]);
        let data_len = header.data_len as usize;
        if data_len > bytes.len() - HEADER_LEN || data_len > MAX_PAYLOAD_LEN {
            return Err(Error::MalformedSegment { len: bytes.len() });
        }

        let payload = Bytes::copy_from_slice(&bytes[HEADER_LEN..HEADER_LEN + data_len]);
        Ok(Self { header, payload })
    }

    /// 역직렬화 + 체크섬 검증
    pub fn decode_verified(bytes: &[u8]) -> Result<Self> {
        let segment = Self::decode(bytes)?;
        let expected = compute_checksum(&segment.header, &segment.payload);
        if expected != segment.header.checksum {
            return Err(Error::ChecksumMismatch {
                expected,
                got: segment.header.checksum,
            });
        }
        Ok(segment)
    }

    pub fn has_valid_checksum(&self) -> bool {
        verify_checksum(&self.header, &self.payload)
    }
}

/// 바이트열을 정규 체크섬 버퍼에 복사하고 나머지를 0 으로 채운다
///
/// 버퍼보다 긴 입력은 잘린다.
pub fn pad_to_canonical(bytes: &[u8]) -> [u8; CHECKSUM_BUFFER_LEN] {
    let mut canonical = [0u8; CHECKSUM_BUFFER_LEN];
    let len = bytes.len().min(CHECKSUM_BUFFER_LEN);
    canonical[..len].copy_from_slice(&bytes[..len]);
    canonical
}

/// 체크섬 필드를 0 으로 둔 헤더와 페이로드에 대한 CRC32
pub fn compute_checksum(header: &Header, payload: &[u8]) -> u32 {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    header.put(&mut buf, 0);
    buf.extend_from_slice(payload);
    crc32fast::hash(&pad_to_canonical(&buf))
}

/// 수신한 헤더의 체크섬이 내용과 일치하는지 확인
pub fn verify_checksum(header: &Header, payload: &[u8]) -> bool {
    compute_checksum(header, payload) == header.checksum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Segment {
        Segment::data(0x0102_0304, 0x0506_0708, 4096, Bytes::from_static(b"hello microtcp"))
    }

    #[test]
    fn test_encode_decode() {
        let segment = sample();
        let bytes = segment.encode().unwrap();
        assert_eq!(bytes.len(), HEADER_LEN + segment.payload.len());

        let decoded = Segment::decode_verified(&bytes).unwrap();
        assert_eq!(decoded.header.seq, segment.header.seq);
        assert_eq!(decoded.header.ack, segment.header.ack);
        assert_eq!(decoded.header.control, Control::ACK);
        assert_eq!(decoded.header.window, 4096);
        assert_eq!(decoded.header.data_len, 14);
        assert_eq!(decoded.payload, segment.payload);
        assert!(decoded.has_valid_checksum());
    }

    #[test]
    fn test_big_endian_layout() {
        let bytes = Segment::control(0x0102_0304, 0x0506_0708, Control::SYN_ACK, 0x0A0B)
            .encode()
            .unwrap();
        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0x05, 0x06, 0x07, 0x08]);
        assert_eq!(&bytes[8..10], &[0x50, 0x00]);
        assert_eq!(&bytes[10..12], &[0x0A, 0x0B]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 0]);
        assert_eq!(&bytes[16..28], &[0u8; 12]);
    }

    #[test]
    fn test_single_bit_flip_detected() {
        let bytes = sample().encode().unwrap();
        for byte in 0..bytes.len() {
            for bit in 0..8 {
                let mut corrupted = bytes.to_vec();
                corrupted[byte] ^= 1 << bit;
                // data_len 비트가 바뀌면 길이 검사에서 먼저 걸릴 수 있다
                match Segment::decode_verified(&corrupted) {
                    Err(Error::ChecksumMismatch { .. }) | Err(Error::MalformedSegment { .. }) => {}
                    other => panic!("flip at byte {} bit {} not detected: {:?}", byte, bit, other),
                }
            }
        }
    }

    #[test]
    fn test_payload_changes_checksum() {
        let a = Segment::data(1, 1, 100, Bytes::from_static(b"a")).encode().unwrap();
        let b = Segment::data(1, 1, 100, Bytes::from_static(b"b")).encode().unwrap();
        assert_ne!(&a[CHECKSUM_OFFSET..HEADER_LEN], &b[CHECKSUM_OFFSET..HEADER_LEN]);
    }

    #[test]
    fn test_pad_to_canonical() {
        let padded = pad_to_canonical(b"abc");
        assert_eq!(&padded[..3], b"abc");
        assert!(padded[3..].iter().all(|&b| b == 0));

        let oversized = vec![1u8; CHECKSUM_BUFFER_LEN + 10];
        assert!(pad_to_canonical(&oversized).iter().all(|&b| b == 1));
    }

    #[test]
    fn test_decode_short_buffer() {
        assert!(matches!(
            Segment::decode(&[0u8; HEADER_LEN - 1]),
            Err(Error::MalformedSegment { len: 31 })
        ));
        assert!(Segment::decode(&[]).is_err());
    }

    #[test]
    fn test_decode_truncated_payload() {
        let mut bytes = sample().encode().unwrap().to_vec();
        bytes.pop();
        assert!(matches!(
            Segment::decode(&bytes),
            Err(Error::MalformedSegment { .. })
        ));
    }

    #[test]
    fn test_reserved_fields_round_trip() {
        let mut segment = Segment::control(9, 10, Control::ACK, 0);
        segment.header.future_use = [1, 2, 3];
        let decoded = Segment::decode_verified(&segment.encode().unwrap()).unwrap();
        assert_eq!(decoded.header.future_use, [1, 2, 3]);

        let plain = Segment::decode(&Segment::control(9, 10, Control::ACK, 0).encode().unwrap())
            .unwrap();
        assert_eq!(plain.header.future_use, [0; 3]);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let segment = Segment::data(0, 0, 0, Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1]));
        assert!(matches!(segment.encode(), Err(Error::MalformedSegment { .. })));

        let max = Segment::data(0, 0, 0, Bytes::from(vec![7u8; MAX_PAYLOAD_LEN]));
        assert!(Segment::decode_verified(&max.encode().unwrap()).is_ok());
    }

    #[test]
    fn test_control_flags() {
        assert!(Control::SYN_ACK.has(Control::SYN));
        assert!(Control::SYN_ACK.has(Control::ACK));
        assert!(!Control::SYN_ACK.has(Control::FIN));
        assert!(Control::FIN_ACK.has(Control::FIN | Control::ACK));
        assert_eq!(Control::SYN | Control::ACK, Control::SYN_ACK);
        assert_eq!(Control::SYN_ACK.bits(), 20480);
        assert_eq!(Control::FIN_ACK.bits(), 36864);
        assert_eq!(Control::FIN_ACK.to_string(), "FIN|ACK");
        assert_eq!(Control::NONE.to_string(), "NONE");
    }

    #[test]
    fn test_end_seq_wraps() {
        let segment = Segment::data(u32::MAX - 1, 0, 0, Bytes::from_static(b"abcd"));
        assert_eq!(segment.end_seq(), 2);
    }
}
