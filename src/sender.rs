//! 송신 경로
//!
//! 라운드마다 `min(광고 윈도우, 혼잡 윈도우, 남은 바이트)` 만큼을 MSS 단위
//! 세그먼트로 잘라 보내고, 그 라운드가 누적 ACK 로 모두 확인될 때까지 기다린다.
//!
//! - 재전송 타임아웃: 가장 오래된 미확인 세그먼트 하나만 재전송, 혼잡 신호
//! - 중복 ACK 3개: fast retransmit
//! - 광고 윈도우가 0 이면 1 바이트 probe

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::connection::{Connection, Inbound};
use crate::segment::{Control, Segment};
use crate::state::ConnectionState;
use crate::transport::Transport;
use crate::{Error, Result};

/// fast retransmit 를 일으키는 중복 ACK 수
pub const DUP_ACK_THRESHOLD: u32 = 3;

/// 이번 라운드에 보낼 수 있는 바이트
///
/// 광고 윈도우가 0 이면 1 바이트 probe.
pub fn eligible_bytes(advertised_window: u16, cwnd: u32, remaining: usize) -> usize {
    if advertised_window == 0 {
        return remaining.min(1);
    }
    (advertised_window as usize)
        .min(cwnd as usize)
        .min(remaining)
}

/// `eligible` 바이트를 MSS 세그먼트들로 분할: (라운드 내 오프셋, 길이)
///
/// 마지막 세그먼트만 MSS 보다 짧을 수 있다.
pub fn partition(eligible: usize, mss: usize) -> impl Iterator<Item = (usize, usize)> {
    let mss = mss.max(1);
    (0..eligible)
        .step_by(mss)
        .map(move |start| (start, mss.min(eligible - start)))
}

/// 전송 후 ACK 를 기다리는 세그먼트
#[derive(Debug)]
struct InFlight {
    seq: u32,
    payload: Bytes,
    sent_at: Instant,

    /// 전송 횟수 (1 이면 재전송 없음)
    transmissions: u32,
}

impl InFlight {
    fn end_seq(&self) -> u32 {
        self.seq.wrapping_add(self.payload.len() as u32)
    }
}

/// 누적 ACK 처리 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOutcome {
    /// 확인 지점이 전진함
    Advanced {
        newly_acked: u32,

        /// 재전송되지 않은 세그먼트에서만 (Karn)
        rtt_sample: Option<Duration>,
    },

    /// 같은 지점을 다시 확인한 순수 ACK (누적 횟수)
    Duplicate(u32),

    /// 범위 밖이거나 의미 없는 ACK
    Stale,
}

/// 송신 윈도우: 미확인 세그먼트와 재전송 타이머
#[derive(Debug)]
pub(crate) struct SendWindow {
    /// 가장 오래된 미확인 바이트
    base: u32,

    /// 다음에 보낼 바이트
    next: u32,

    segments: VecDeque<InFlight>,
    dup_acks: u32,

    /// 가장 오래된 세그먼트 재전송 타이머 시작 시각
    timer_start: Instant,
}

impl SendWindow {
    pub fn new(base: u32) -> Self {
        Self {
            base,
            next: base,
            segments: VecDeque::new(),
            dup_acks: 0,
            timer_start: Instant::now(),
        }
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    fn outstanding(&self) -> u32 {
        self.next.wrapping_sub(self.base)
    }

    pub fn push(&mut self, seq: u32, payload: Bytes, now: Instant) {
        if self.segments.is_empty() {
            self.timer_start = now;
        }
        self.next = seq.wrapping_add(payload.len() as u32);
        self.segments.push_back(InFlight {
            seq,
            payload,
            sent_at: now,
            transmissions: 1,
        });
    }

    pub fn deadline(&self, rto: Duration) -> Instant {
        self.timer_start + rto
    }

    /// 가장 오래된 미확인 세그먼트를 재전송 대상으로 표시하고 돌려준다
    pub fn retransmit_oldest(&mut self, now: Instant) -> Option<(u32, Bytes)> {
        let oldest = self.segments.front_mut()?;
        oldest.transmissions += 1;
        oldest.sent_at = now;
        self.timer_start = now;
        Some((oldest.seq, oldest.payload.clone()))
    }

    /// 누적 ACK 반영
    ///
    /// `pure` 는 페이로드 없는 ACK 여부. 데이터 세그먼트에 실린 같은 ack 는
    /// 중복 ACK 로 세지 않는다.
    pub fn on_ack(&mut self, ack: u32, pure: bool, now: Instant) -> AckOutcome {
        let advance = ack.wrapping_sub(self.base);
        if advance == 0 {
            if pure && !self.segments.is_empty() {
                self.dup_acks += 1;
                return AckOutcome::Duplicate(self.dup_acks);
            }
            return AckOutcome::Stale;
        }
        if advance > self.outstanding() {
            return AckOutcome::Stale;
        }

        let mut rtt_sample = None;
        while let Some(front) = self.segments.front_mut() {
            if front.end_seq().wrapping_sub(self.base) <= advance {
                if front.transmissions == 1 {
                    rtt_sample = Some(now.saturating_duration_since(front.sent_at));
                }
                self.segments.pop_front();
                continue;
            }

            // 세그먼트 중간까지 확인된 경우 남은 부분만 유지
            let start = front.seq.wrapping_sub(self.base);
            if start < advance {
                let cut = (advance - start) as usize;
                front.payload = front.payload.slice(cut..);
                front.seq = ack;
            }
            break;
        }

        self.base = ack;
        self.dup_acks = 0;
        self.timer_start = now;
        AckOutcome::Advanced {
            newly_acked: advance,
            rtt_sample,
        }
    }
}

/// ACK 대기 한 단계의 결과
enum RoundEvent {
    Continue,
    PeerClosed,
}

impl<T: Transport> Connection<T> {
    /// 데이터 전송
    ///
    /// 전송되고 누적 확인된 바이트 수를 돌려준다. 도중에 상대가 종료하면
    /// 그때까지 확인된 바이트 수만 돌려준다.
    pub async fn send(&mut self, data: &[u8]) -> Result<usize> {
        self.state.require("send", &[ConnectionState::Established])?;
        if data.is_empty() {
            return Ok(0);
        }

        let base = self.local_seq;
        let mss = self.config.mss;
        let mut window = SendWindow::new(base);
        let mut handed = 0usize;
        let mut consecutive_timeouts = 0u32;

        while handed < data.len() {
            let eligible = eligible_bytes(
                self.advertised_window,
                self.congestion.cwnd(),
                data.len() - handed,
            );
            if self.advertised_window == 0 {
                debug!("광고 윈도우 0, 1 byte probe");
            }

            for (start, len) in partition(eligible, mss) {
                let offset = handed + start;
                let seq = base.wrapping_add(offset as u32);
                let payload = Bytes::copy_from_slice(&data[offset..offset + len]);
                if let Err(err) = self.transmit_data(seq, payload.clone()).await {
                    warn!("송신 중단: {} bytes 가 전송 계층에 전달됨", offset);
                    return Err(err);
                }
                window.push(seq, payload, Instant::now());
            }
            handed += eligible;
            self.local_seq = base.wrapping_add(handed as u32);
            debug!(
                "라운드 전송: {} bytes / {} segs (cwnd={}, win={})",
                eligible,
                window.len(),
                self.congestion.cwnd(),
                self.advertised_window
            );

            while !window.is_empty() {
                let event = self
                    .await_ack(&mut window, &mut consecutive_timeouts)
                    .await?;
                if let RoundEvent::PeerClosed = event {
                    let acked = window.base().wrapping_sub(base) as usize;
                    self.local_seq = window.base();
                    info!("송신 중 상대 종료: {}/{} bytes 확인됨", acked, data.len());
                    return Ok(acked);
                }
            }
        }

        debug!(
            "send 완료: {} bytes (cwnd={}, ssthresh={}, rto={:?})",
            data.len(),
            self.congestion.cwnd(),
            self.congestion.ssthresh(),
            self.rto.rto()
        );
        Ok(data.len())
    }

    async fn transmit_data(&mut self, seq: u32, payload: Bytes) -> Result<()> {
        let seg = Segment::data(seq, self.local_ack(), self.recv_buf.window(), payload);
        self.transmit(&seg).await
    }

    async fn await_ack(
        &mut self,
        window: &mut SendWindow,
        consecutive_timeouts: &mut u32,
    ) -> Result<RoundEvent> {
        let deadline = window.deadline(self.rto.rto());
        let seg = match self.recv_inbound("send", Some(deadline)).await {
            Ok(Inbound::Segment(seg, _)) => seg,
            Ok(Inbound::Corrupt(_)) | Ok(Inbound::Foreign) => return Ok(RoundEvent::Continue),
            Err(Error::Timeout { .. }) => {
                self.on_retransmit_timeout(window, consecutive_timeouts)
                    .await?;
                return Ok(RoundEvent::Continue);
            }
            Err(err) => return Err(err),
        };

        match seg.header.control {
            Control::FIN_ACK => {
                self.on_peer_fin(&seg).await?;
                self.state.close_by_peer()?;
                return Ok(RoundEvent::PeerClosed);
            }
            Control::SYN_ACK => {
                debug!("SYN+ACK 재수신, 핸드쉐이크 ACK 재전송");
                self.send_ack(self.local_ack()).await?;
                return Ok(RoundEvent::Continue);
            }
            Control::SYN => {
                debug!("오래된 SYN 무시");
                return Ok(RoundEvent::Continue);
            }
            Control::ACK => {}
            other => {
                return Err(self.fail(Error::ProtocolViolation {
                    expected: Control::ACK,
                    got: other,
                }))
            }
        }

        // 상대가 살아 있음
        *consecutive_timeouts = 0;

        let pure = seg.payload.is_empty();
        if !pure {
            self.absorb_payload(&seg, None).await?;
        }

        match window.on_ack(seg.header.ack, pure, Instant::now()) {
            AckOutcome::Advanced {
                newly_acked,
                rtt_sample,
            } => {
                self.advertised_window = seg.header.window;
                self.congestion.on_ack(newly_acked);
                if let Some(sample) = rtt_sample {
                    self.rto.record_sample(sample);
                }
                self.stats.bytes_acked += newly_acked as u64;
                debug!(
                    "ACK {} (+{} bytes), cwnd={} ssthresh={}",
                    seg.header.ack,
                    newly_acked,
                    self.congestion.cwnd(),
                    self.congestion.ssthresh()
                );
            }
            AckOutcome::Duplicate(count) => {
                self.advertised_window = seg.header.window;
                self.stats.duplicate_acks += 1;
                if count == DUP_ACK_THRESHOLD {
                    self.fast_retransmit(window).await?;
                }
            }
            AckOutcome::Stale => debug!("오래된 ACK 무시: ack={}", seg.header.ack),
        }

        Ok(RoundEvent::Continue)
    }

    async fn on_retransmit_timeout(
        &mut self,
        window: &mut SendWindow,
        consecutive_timeouts: &mut u32,
    ) -> Result<()> {
        *consecutive_timeouts += 1;
        self.stats.timeouts += 1;
        if *consecutive_timeouts > self.config.max_retransmissions {
            return Err(self.fail(Error::Timeout { op: "send" }));
        }

        self.congestion.on_timeout();
        self.rto.back_off();

        if let Some((seq, payload)) = window.retransmit_oldest(Instant::now()) {
            warn!(
                "재전송 타임아웃: seq={} 재전송 (rto={:?}, cwnd={}, ssthresh={})",
                seq,
                self.rto.rto(),
                self.congestion.cwnd(),
                self.congestion.ssthresh()
            );
            self.stats.retransmissions += 1;
            self.transmit_data(seq, payload).await?;
        }
        Ok(())
    }

    async fn fast_retransmit(&mut self, window: &mut SendWindow) -> Result<()> {
        self.congestion.on_fast_retransmit();

        if let Some((seq, payload)) = window.retransmit_oldest(Instant::now()) {
            warn!(
                "중복 ACK {}개: seq={} fast retransmit (cwnd={})",
                DUP_ACK_THRESHOLD,
                seq,
                self.congestion.cwnd()
            );
            self.stats.fast_retransmits += 1;
            self.stats.retransmissions += 1;
            self.transmit_data(seq, payload).await?;
        }
        Ok(())
    }
}
