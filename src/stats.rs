//! 연결 통계

use std::time::{Duration, Instant};

/// 연결 하나의 전송 통계
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    /// 시작 시간
    pub start_time: Instant,

    /// 전송한 세그먼트 수 (재전송 포함)
    pub segments_sent: u64,

    /// 수신한 세그먼트 수 (체크섬 실패 포함)
    pub segments_received: u64,

    /// 타임아웃/fast retransmit 로 재전송한 세그먼트 수
    pub retransmissions: u64,

    /// 중복 ACK 3개로 인한 재전송 수
    pub fast_retransmits: u64,

    /// 재전송 타임아웃 발생 수
    pub timeouts: u64,

    /// 수신한 중복 ACK 수
    pub duplicate_acks: u64,

    /// 체크섬/형식 오류로 버린 세그먼트 수
    pub checksum_drops: u64,

    /// 상대가 누적 확인한 바이트
    pub bytes_acked: u64,

    /// 애플리케이션에 전달한 바이트
    pub bytes_delivered: u64,
}

impl ConnectionStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            segments_sent: 0,
            segments_received: 0,
            retransmissions: 0,
            fast_retransmits: 0,
            timeouts: 0,
            duplicate_acks: 0,
            checksum_drops: 0,
            bytes_acked: 0,
            bytes_delivered: 0,
        }
    }

    /// 경과 시간
    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// 처리율 (bytes/sec), 송수신 중 큰 쪽 기준
    pub fn throughput(&self) -> f64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed == 0.0 {
            return 0.0;
        }
        self.bytes_acked.max(self.bytes_delivered) as f64 / elapsed
    }

    /// 재전송 비율
    pub fn retransmission_rate(&self) -> f64 {
        if self.segments_sent == 0 {
            return 0.0;
        }
        self.retransmissions as f64 / self.segments_sent as f64
    }

    /// 통계 요약 문자열
    pub fn summary(&self) -> String {
        format!(
            "Elapsed: {:.2}s | Sent: {} segs | Recv: {} segs | Acked: {} B | Delivered: {} B | Throughput: {:.2} MB/s | Retx: {} ({} fast, {} timeouts) | DupACKs: {} | Drops: {}",
            self.elapsed().as_secs_f64(),
            self.segments_sent,
            self.segments_received,
            self.bytes_acked,
            self.bytes_delivered,
            self.throughput() / 1_000_000.0,
            self.retransmissions,
            self.fast_retransmits,
            self.timeouts,
            self.duplicate_acks,
            self.checksum_drops,
        )
    }
}

impl Default for ConnectionStats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retransmission_rate() {
        let mut stats = ConnectionStats::new();
        assert_eq!(stats.retransmission_rate(), 0.0);

        stats.segments_sent = 10;
        stats.retransmissions = 2;
        assert!((stats.retransmission_rate() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_summary_contains_counters() {
        let mut stats = ConnectionStats::new();
        stats.bytes_acked = 10_000;
        stats.fast_retransmits = 3;
        let summary = stats.summary();
        assert!(summary.contains("Acked: 10000 B"));
        assert!(summary.contains("3 fast"));
    }
}
