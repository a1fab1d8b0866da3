//! 에러 타입 정의

use thiserror::Error;

use crate::segment::Control;
use crate::state::ConnectionState;

/// microTCP 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    /// 하위 데이터그램 전송 실패 (연결은 INVALID 로 전이)
    #[error("전송 계층 에러: {0}")]
    Transport(#[from] std::io::Error),

    #[error("잘못된 세그먼트: {len} bytes")]
    MalformedSegment { len: usize },

    /// 핸드쉐이크/종료 단계에서만 외부로 노출됨
    #[error("체크섬 불일치: expected {expected:08X}, got {got:08X}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("프로토콜 위반: expected {expected}, got {got}")]
    ProtocolViolation { expected: Control, got: Control },

    #[error("타임아웃: {op}")]
    Timeout { op: &'static str },

    #[error("잘못된 상태에서 호출: {op} ({state})")]
    InvalidState {
        op: &'static str,
        state: ConnectionState,
    },

    #[error("연결이 무효화됨")]
    ConnectionInvalid,

    #[error("설정 오류: {0}")]
    Config(String),
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
