//! 프로토콜 설정

use std::time::Duration;

use crate::segment::{CHECKSUM_BUFFER_LEN, HEADER_LEN};
use crate::{Error, Result, DEFAULT_MSS, DEFAULT_RECV_BUFFER_LEN};

/// microTCP 연결 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 최대 세그먼트 크기 (페이로드 바이트)
    pub mss: usize,

    /// 수신 버퍼 크기 (광고 윈도우의 상한)
    pub recv_buffer_len: usize,

    /// 연결 생성 시 가정하는 상대 광고 윈도우
    pub init_window: u16,

    /// 초기 혼잡 윈도우 (바이트)
    pub init_cwnd: u32,

    /// 초기 slow start threshold (바이트)
    pub init_ssthresh: u32,

    /// 혼잡 윈도우 상한 (바이트)
    pub max_cwnd: u32,

    /// ACK 대기 타임아웃 = 초기 RTO (밀리초)
    pub ack_timeout_ms: u64,

    /// RTO 하한 (밀리초)
    pub min_rto_ms: u64,

    /// RTO 상한 (밀리초)
    pub max_rto_ms: u64,

    /// 핸드쉐이크/종료 단계별 응답 대기 시간 (밀리초)
    pub handshake_timeout_ms: u64,

    /// 핸드쉐이크/종료 세그먼트 최대 전송 횟수
    pub handshake_attempts: u32,

    /// accept()가 첫 SYN 을 기다리는 최대 시간 (None 이면 무제한)
    pub accept_timeout_ms: Option<u64>,

    /// 연속 재전송 타임아웃 허용 횟수 (초과 시 연결 무효화)
    pub max_retransmissions: u32,

    /// 능동 종료 후 재전송된 FIN+ACK 에 응답하며 머무는 시간 (밀리초)
    ///
    /// 상대의 FIN+ACK 재전송 주기(`handshake_timeout_ms`)의 두 배 이상이어야 한다.
    pub time_wait_ms: u64,
}

/// TIME_WAIT 가 덮어야 하는 상대 재전송 주기 수
const TIME_WAIT_CYCLES: u64 = 2;

impl Default for Config {
    fn default() -> Self {
        Self {
            mss: DEFAULT_MSS,
            recv_buffer_len: DEFAULT_RECV_BUFFER_LEN,
            init_window: DEFAULT_RECV_BUFFER_LEN as u16, // 8192
            init_cwnd: 3 * DEFAULT_MSS as u32,          // 4200
            init_ssthresh: DEFAULT_RECV_BUFFER_LEN as u32,
            max_cwnd: 64 * 1024,
            ack_timeout_ms: 200,
            min_rto_ms: 50,
            max_rto_ms: 5_000,
            handshake_timeout_ms: 1_000,
            handshake_attempts: 5,
            accept_timeout_ms: None,
            max_retransmissions: 12,
            time_wait_ms: 2_000,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 손실이 많은 링크용 설정
    pub fn lossy_network() -> Self {
        Self {
            mss: 1000,
            init_cwnd: 2000,
            init_ssthresh: 4000,
            max_cwnd: 16 * 1024,
            ack_timeout_ms: 300,
            min_rto_ms: 100,
            max_rto_ms: 10_000,
            handshake_timeout_ms: 2_000,
            handshake_attempts: 8,
            max_retransmissions: 24,
            time_wait_ms: 4_000,
            ..Self::default()
        }
    }

    /// 루프백/테스트용 설정 (짧은 타임아웃)
    pub fn loopback() -> Self {
        Self {
            ack_timeout_ms: 20,
            min_rto_ms: 5,
            max_rto_ms: 500,
            handshake_timeout_ms: 200,
            time_wait_ms: 400,
            ..Self::default()
        }
    }

    /// 설정값 일관성 검증
    pub fn validate(&self) -> Result<()> {
        if self.mss == 0 || self.mss > CHECKSUM_BUFFER_LEN - HEADER_LEN {
            return Err(Error::Config(format!(
                "mss must be in 1..={}, got {}",
                CHECKSUM_BUFFER_LEN - HEADER_LEN,
                self.mss
            )));
        }
        if self.recv_buffer_len == 0 || self.recv_buffer_len > u16::MAX as usize {
            return Err(Error::Config(format!(
                "recv_buffer_len must fit the 16-bit window, got {}",
                self.recv_buffer_len
            )));
        }
        let mss = self.mss as u32;
        if self.max_cwnd < mss || self.init_cwnd < mss || self.init_cwnd > self.max_cwnd {
            return Err(Error::Config(format!(
                "cwnd bounds inconsistent: mss={} init_cwnd={} max_cwnd={}",
                mss, self.init_cwnd, self.max_cwnd
            )));
        }
        if self.init_ssthresh < mss {
            return Err(Error::Config(format!(
                "init_ssthresh {} below one mss",
                self.init_ssthresh
            )));
        }
        if self.handshake_attempts == 0 {
            return Err(Error::Config("handshake_attempts must be at least 1".into()));
        }
        if self.time_wait_ms < TIME_WAIT_CYCLES * self.handshake_timeout_ms {
            return Err(Error::Config(format!(
                "time_wait_ms {} shorter than {} x handshake_timeout_ms {}",
                self.time_wait_ms, TIME_WAIT_CYCLES, self.handshake_timeout_ms
            )));
        }
        if self.min_rto_ms > self.max_rto_ms {
            return Err(Error::Config(format!(
                "min_rto_ms {} > max_rto_ms {}",
                self.min_rto_ms, self.max_rto_ms
            )));
        }
        Ok(())
    }

    /// 초기 RTO
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    /// 핸드쉐이크 단계별 대기 시간
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn time_wait(&self) -> Duration {
        Duration::from_millis(self.time_wait_ms)
    }

    pub fn accept_timeout(&self) -> Option<Duration> {
        self.accept_timeout_ms.map(Duration::from_millis)
    }
}
