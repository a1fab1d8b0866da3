//! AIMD 혼잡 제어 (Slow Start + Congestion Avoidance)

use crate::Config;

#[derive(Debug, Clone)]
pub struct CongestionControl {
    cwnd: u32,
    ssthresh: u32,
    mss: u32,
    max_cwnd: u32,

    /// Congestion Avoidance 구간에서 누적된 ACK 바이트
    acked_in_window: u32,
}

impl CongestionControl {
    pub fn new(mss: u32, init_cwnd: u32, init_ssthresh: u32, max_cwnd: u32) -> Self {
        let mss = mss.max(1);
        let max_cwnd = max_cwnd.max(mss);
        Self {
            cwnd: init_cwnd.clamp(mss, max_cwnd),
            ssthresh: init_ssthresh.max(mss),
            mss,
            max_cwnd,
            acked_in_window: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.mss as u32,
            config.init_cwnd,
            config.init_ssthresh,
            config.max_cwnd,
        )
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn ssthresh(&self) -> u32 {
        self.ssthresh
    }

    pub fn in_slow_start(&self) -> bool {
        self.cwnd < self.ssthresh
    }

    // 호출 위치: 새 데이터를 확인하는 누적 ACK 수신 시
    pub fn on_ack(&mut self, newly_acked: u32) {
        if newly_acked == 0 {
            return;
        }

        if self.in_slow_start() {
            // ACK 하나당 1 MSS (지수 증가)
            self.cwnd = self.cwnd.saturating_add(self.mss);
        } else {
            // 윈도우 하나 분량이 확인될 때마다 1 MSS (선형 증가)
            self.acked_in_window = self.acked_in_window.saturating_add(newly_acked);
            if self.acked_in_window >= self.cwnd {
                self.acked_in_window -= self.cwnd;
                self.cwnd = self.cwnd.saturating_add(self.mss);
            }
        }

        self.cwnd = self.cwnd.min(self.max_cwnd);
    }

    // 호출 위치: 재전송 타임아웃
    pub fn on_timeout(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(self.mss);
        self.cwnd = self.mss;
        self.acked_in_window = 0;
    }

    // 호출 위치: 중복 ACK 3개 (fast retransmit)
    pub fn on_fast_retransmit(&mut self) {
        self.ssthresh = (self.cwnd / 2).max(self.mss);
        self.cwnd = self.ssthresh.min(self.max_cwnd);
        self.acked_in_window = 0;
    }
}
