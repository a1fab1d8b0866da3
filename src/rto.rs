//! 재전송 타임아웃(RTO) 추정
//!
//! RFC 6298 방식: `RTO = SRTT + 4 × RTTVAR`, 타임아웃마다 두 배로 back-off.
//! 재전송된 세그먼트의 RTT 는 표본으로 쓰지 않는다 (Karn).

use std::time::Duration;

use crate::Config;

#[derive(Debug, Clone)]
pub struct RetransmitTimer {
    initial_rto: Duration,
    min_rto: Duration,
    max_rto: Duration,

    /// 현재 RTO
    current_rto: Duration,

    /// Smoothed RTT
    srtt: Option<Duration>,

    /// RTT 분산
    rttvar: Duration,
}

impl RetransmitTimer {
    pub fn new(initial_rto: Duration, min_rto: Duration, max_rto: Duration) -> Self {
        let initial_rto = initial_rto.clamp(min_rto, max_rto);
        Self {
            initial_rto,
            min_rto,
            max_rto,
            current_rto: initial_rto,
            srtt: None,
            rttvar: Duration::ZERO,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.ack_timeout(),
            Duration::from_millis(config.min_rto_ms),
            Duration::from_millis(config.max_rto_ms),
        )
    }

    pub fn rto(&self) -> Duration {
        self.current_rto
    }

    pub fn srtt(&self) -> Option<Duration> {
        self.srtt
    }

    /// 새 RTT 표본 반영
    pub fn record_sample(&mut self, sample: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(sample);
                self.rttvar = sample / 2;
            }
            Some(srtt) => {
                let diff = sample.abs_diff(srtt);
                self.rttvar = self.rttvar * 3 / 4 + diff / 4;
                self.srtt = Some(srtt * 7 / 8 + sample / 8);
            }
        }
        self.reset();
    }

    // 호출 위치: 재전송 타임아웃
    pub fn back_off(&mut self) {
        self.current_rto = self.current_rto.saturating_mul(2).min(self.max_rto);
    }

    /// 추정값으로 RTO 복원 (표본이 없으면 초기값)
    pub fn reset(&mut self) {
        self.current_rto = match self.srtt {
            Some(srtt) => (srtt + self.rttvar * 4).clamp(self.min_rto, self.max_rto),
            None => self.initial_rto,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timer() -> RetransmitTimer {
        RetransmitTimer::new(
            Duration::from_millis(200),
            Duration::from_millis(10),
            Duration::from_secs(2),
        )
    }

    #[test]
    fn test_initial_rto() {
        let t = timer();
        assert_eq!(t.rto(), Duration::from_millis(200));
        assert!(t.srtt().is_none());
    }

    #[test]
    fn test_first_sample() {
        let mut t = timer();
        t.record_sample(Duration::from_millis(40));
        // 40 + 4 × 20
        assert_eq!(t.rto(), Duration::from_millis(120));
        assert_eq!(t.srtt(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_back_off_capped() {
        let mut t = timer();
        t.back_off();
        assert_eq!(t.rto(), Duration::from_millis(400));
        for _ in 0..10 {
            t.back_off();
        }
        assert_eq!(t.rto(), Duration::from_secs(2));

        t.reset();
        assert_eq!(t.rto(), Duration::from_millis(200));
    }

    #[test]
    fn test_rto_respects_minimum() {
        let mut t = timer();
        for _ in 0..20 {
            t.record_sample(Duration::from_micros(50));
        }
        assert_eq!(t.rto(), Duration::from_millis(10));
    }
}
