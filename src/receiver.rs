//! 수신 경로
//!
//! - 순서대로 도착한 바이트만 받아들인다 (재정렬 버퍼 없음)
//! - 앞선 세그먼트는 버리고 마지막 누적 ACK 를 다시 보낸다 (중복 ACK)
//! - 이미 받은 세그먼트도 현재 위치를 다시 확인한다
//! - 체크섬이 틀린 세그먼트는 도착하지 않은 것으로 취급

use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::time::Instant;
use tracing::debug;

use crate::connection::{Connection, Inbound};
use crate::segment::{Control, Segment};
use crate::state::ConnectionState;
use crate::transport::Transport;
use crate::{Error, Result};

/// receive() 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvOutcome {
    /// 호출자 버퍼에 n 바이트 전달
    Delivered(usize),

    /// 상대가 종료함 (더 이상 데이터 없음)
    EndOfStream,
}

/// 세그먼트 하나를 수신 버퍼에 넣은 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SegmentOutcome {
    /// 새 바이트 n 개를 받아들임
    Accepted(usize),

    /// 기대 위치보다 앞선 세그먼트
    OutOfOrder,

    /// 이미 받은 바이트
    Duplicate,

    /// 버퍼 여유 없음
    NoRoom,
}

/// 누적 ACK 수신 버퍼
#[derive(Debug)]
pub(crate) struct ReceiveBuffer {
    /// 다음에 기대하는 스트림 위치
    expected: u32,

    /// 받았지만 아직 애플리케이션에 넘기지 않은 바이트
    pending: BytesMut,

    capacity: usize,
}

impl ReceiveBuffer {
    pub fn new(expected: u32, capacity: usize) -> Self {
        Self {
            expected,
            pending: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    // 호출 위치: 핸드쉐이크 완료 시
    pub fn reset(&mut self, expected: u32) {
        self.expected = expected;
        self.pending.clear();
    }

    pub fn expected(&self) -> u32 {
        self.expected
    }

    pub fn buffered(&self) -> usize {
        self.pending.len()
    }

    fn free(&self) -> usize {
        self.capacity.saturating_sub(self.pending.len())
    }

    /// 광고할 윈도우 (여유 공간)
    pub fn window(&self) -> u16 {
        self.free().min(u16::MAX as usize) as u16
    }

    pub fn on_segment(&mut self, seq: u32, payload: &[u8]) -> SegmentOutcome {
        let offset = seq.wrapping_sub(self.expected) as i32;
        if offset > 0 {
            return SegmentOutcome::OutOfOrder;
        }

        // 앞부분은 이미 받았을 수 있음
        let already = offset.unsigned_abs() as usize;
        if already >= payload.len() {
            return SegmentOutcome::Duplicate;
        }

        let fresh = &payload[already..];
        let take = fresh.len().min(self.free());
        if take == 0 {
            return SegmentOutcome::NoRoom;
        }

        self.pending.extend_from_slice(&fresh[..take]);
        self.expected = self.expected.wrapping_add(take as u32);
        SegmentOutcome::Accepted(take)
    }

    /// 받은 바이트를 호출자 버퍼로 복사
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.advance(n);
        n
    }
}

impl<T: Transport> Connection<T> {
    /// 데이터 수신
    ///
    /// 이미 받아둔 바이트가 있으면 바로 돌려주고, 없으면 다음 세그먼트를 기다린다.
    /// 상대가 종료하면 [`RecvOutcome::EndOfStream`].
    pub async fn receive(&mut self, buf: &mut [u8]) -> Result<RecvOutcome> {
        self.receive_until(buf, None).await
    }

    /// 데드라인이 있는 receive. 초과하면 `Timeout` 이지만 연결은 유지된다.
    pub async fn receive_timeout(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<RecvOutcome> {
        self.receive_until(buf, Some(Instant::now() + timeout)).await
    }

    async fn receive_until(
        &mut self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<RecvOutcome> {
        self.state.require(
            "receive",
            &[ConnectionState::Established, ConnectionState::ClosingByPeer],
        )?;

        if self.recv_buf.buffered() > 0 && !buf.is_empty() {
            let n = self.recv_buf.read(buf);
            self.stats.bytes_delivered += n as u64;
            return Ok(RecvOutcome::Delivered(n));
        }
        if self.state.state() == ConnectionState::ClosingByPeer {
            return Ok(RecvOutcome::EndOfStream);
        }
        if buf.is_empty() {
            return Ok(RecvOutcome::Delivered(0));
        }

        loop {
            let seg = match self.recv_inbound("receive", deadline).await? {
                Inbound::Segment(seg, _) => seg,
                Inbound::Corrupt(_) | Inbound::Foreign => continue,
            };

            match seg.header.control {
                Control::FIN_ACK => {
                    self.on_peer_fin(&seg).await?;
                    self.state.close_by_peer()?;
                    return Ok(RecvOutcome::EndOfStream);
                }
                Control::SYN_ACK => {
                    // 상대가 핸드쉐이크 마지막 ACK 를 못 받음
                    debug!("SYN+ACK 재수신, 핸드쉐이크 ACK 재전송");
                    self.send_ack(self.local_ack()).await?;
                }
                Control::SYN => debug!("오래된 SYN 무시"),
                Control::ACK => {
                    self.advertised_window = seg.header.window;
                    if seg.payload.is_empty() {
                        continue;
                    }
                    let n = self.absorb_payload(&seg, Some(&mut *buf)).await?;
                    if n > 0 {
                        return Ok(RecvOutcome::Delivered(n));
                    }
                }
                other => {
                    return Err(self.fail(Error::ProtocolViolation {
                        expected: Control::ACK,
                        got: other,
                    }))
                }
            }
        }
    }

    /// 데이터 세그먼트를 수신 버퍼에 넣고 누적 ACK 전송
    ///
    /// `out` 이 있으면 ACK 전에 호출자 버퍼로 먼저 옮겨서, 광고 윈도우가
    /// 실제 여유 공간을 반영하게 한다.
    pub(crate) async fn absorb_payload(
        &mut self,
        seg: &Segment,
        out: Option<&mut [u8]>,
    ) -> Result<usize> {
        let seq = seg.header.seq;
        let delivered = match self.recv_buf.on_segment(seq, &seg.payload) {
            SegmentOutcome::Accepted(n) => {
                debug!("seq={} 에서 {} bytes 수신", seq, n);
                match out {
                    Some(buf) => {
                        let n = self.recv_buf.read(buf);
                        self.stats.bytes_delivered += n as u64;
                        n
                    }
                    None => 0,
                }
            }
            SegmentOutcome::OutOfOrder => {
                debug!(
                    "순서 어긋난 세그먼트 seq={} (기대 {}), 중복 ACK",
                    seq,
                    self.recv_buf.expected()
                );
                0
            }
            SegmentOutcome::Duplicate => {
                debug!("이미 받은 세그먼트 seq={}, 재확인", seq);
                0
            }
            SegmentOutcome::NoRoom => {
                debug!("수신 버퍼 가득 참, seq={} 폐기", seq);
                0
            }
        };

        self.send_ack(self.recv_buf.expected()).await?;
        Ok(delivered)
    }
}
