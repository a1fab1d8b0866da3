//! # microTCP
//!
//! UDP 위에서 동작하는 신뢰성 있는 바이트 스트림 전송 프로토콜
//!
//! ## 핵심 특징
//! - **3-way 핸드쉐이크 / 4-segment 종료**: 명시적 상태 머신
//! - **누적 ACK**: 순서대로 도착한 바이트만 전달, 중복 ACK 로 손실 신호
//! - **흐름 제어**: 수신 버퍼 여유 공간을 윈도우로 광고, 윈도우 0 이면 probe
//! - **AIMD 혼잡 제어**: slow start + congestion avoidance, fast retransmit
//! - **적응형 RTO**: SRTT/RTTVAR 추정, Karn 규칙, 지수 back-off
//! - **CRC32 체크섬**: 고정 크기 정규 버퍼 기준

pub mod config;
pub mod congestion;
pub mod connection;
pub mod error;
pub mod nonce;
pub mod receiver;
pub mod rto;
pub mod segment;
pub mod sender;
pub mod simulator;
pub mod state;
pub mod stats;
pub mod transport;

pub use config::Config;
pub use connection::Connection;
pub use error::{Error, Result};
pub use nonce::{NonceSource, NONCE_LIMIT};
pub use receiver::RecvOutcome;
pub use segment::{Control, Header, Segment};
pub use simulator::{LossyTransport, MemoryTransport, RecordingTransport};
pub use state::ConnectionState;
pub use stats::ConnectionStats;
pub use transport::{Transport, UdpTransport};

/// 기본 최대 세그먼트 크기 (바이트)
pub const DEFAULT_MSS: usize = 1400;

/// 기본 수신 버퍼 크기 (바이트)
pub const DEFAULT_RECV_BUFFER_LEN: usize = 8192;
