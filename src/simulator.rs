//! 테스트/벤치마크용 전송 구현
//!
//! - [`MemoryTransport`]: 프로세스 내부 링크 (tokio mpsc)
//! - [`LossyTransport`]: 송신 측 손실/손상 주입 (시드 고정 확률 + 인덱스 지정)
//! - [`RecordingTransport`]: 송신한 데이터그램 기록

use std::collections::HashSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tracing::debug;

use crate::transport::Transport;

static NEXT_MEMORY_PORT: AtomicU16 = AtomicU16::new(20_000);

type Datagram = (Bytes, SocketAddr);

/// 메모리 링크의 한쪽 끝
///
/// UDP 처럼 상대가 사라져도 송신은 성공하고, 수신은 계속 대기한다.
#[derive(Debug)]
pub struct MemoryTransport {
    local: SocketAddr,
    peer: SocketAddr,
    tx: mpsc::UnboundedSender<Datagram>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
}

impl MemoryTransport {
    /// 서로 연결된 두 끝점 생성
    pub fn pair() -> (Self, Self) {
        let a_addr = Self::next_addr();
        let b_addr = Self::next_addr();
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();

        let a = Self {
            local: a_addr,
            peer: b_addr,
            tx: a_tx,
            rx: tokio::sync::Mutex::new(a_rx),
        };
        let b = Self {
            local: b_addr,
            peer: a_addr,
            tx: b_tx,
            rx: tokio::sync::Mutex::new(b_rx),
        };
        (a, b)
    }

    fn next_addr() -> SocketAddr {
        let port = NEXT_MEMORY_PORT.fetch_add(1, Ordering::Relaxed);
        SocketAddr::from((Ipv4Addr::LOCALHOST, port))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for MemoryTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.local)
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        if target != self.peer {
            // 링크 밖 주소: 조용히 유실
            return Ok(buf.len());
        }
        let _ = self.tx.send((Bytes::copy_from_slice(buf), self.local));
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((data, from)) => {
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                Ok((len, from))
            }
            None => std::future::pending().await,
        }
    }
}

/// 손실/손상 주입 링크
///
/// 송신하는 데이터그램마다 0부터 인덱스를 매기고, 지정된 인덱스는 항상
/// 버리거나 손상시킨다. 나머지는 시드 고정 난수로 확률 적용.
#[derive(Debug)]
pub struct LossyTransport<T> {
    inner: T,
    rng: Mutex<StdRng>,
    loss_rate: f64,
    corrupt_rate: f64,
    drop_indices: HashSet<u64>,
    corrupt_indices: HashSet<u64>,
    next_index: AtomicU64,
    dropped: AtomicU64,
    corrupted: AtomicU64,
}

enum Fault {
    None,
    Drop,
    Corrupt,
}

impl<T: Transport> LossyTransport<T> {
    pub fn new(inner: T, seed: u64) -> Self {
        Self {
            inner,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            loss_rate: 0.0,
            corrupt_rate: 0.0,
            drop_indices: HashSet::new(),
            corrupt_indices: HashSet::new(),
            next_index: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            corrupted: AtomicU64::new(0),
        }
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_corrupt_rate(mut self, rate: f64) -> Self {
        self.corrupt_rate = rate.clamp(0.0, 1.0);
        self
    }

    /// 지정한 송신 인덱스의 데이터그램을 버림
    pub fn drop_datagrams(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.drop_indices.extend(indices);
        self
    }

    /// 지정한 송신 인덱스의 데이터그램 마지막 바이트를 뒤집음
    pub fn corrupt_datagrams(mut self, indices: impl IntoIterator<Item = u64>) -> Self {
        self.corrupt_indices.extend(indices);
        self
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn corrupted(&self) -> u64 {
        self.corrupted.load(Ordering::Relaxed)
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn decide(&self, index: u64) -> Fault {
        if self.drop_indices.contains(&index) {
            return Fault::Drop;
        }
        if self.corrupt_indices.contains(&index) {
            return Fault::Corrupt;
        }

        let mut rng = self.rng.lock();
        if self.loss_rate > 0.0 && rng.gen_bool(self.loss_rate) {
            Fault::Drop
        } else if self.corrupt_rate > 0.0 && rng.gen_bool(self.corrupt_rate) {
            Fault::Corrupt
        } else {
            Fault::None
        }
    }
}

impl<T: Transport> Transport for LossyTransport<T> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        match self.decide(index) {
            Fault::None => self.inner.send_to(buf, target).await,
            Fault::Drop => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!("datagram #{} dropped ({} bytes)", index, buf.len());
                Ok(buf.len())
            }
            Fault::Corrupt => {
                self.corrupted.fetch_add(1, Ordering::Relaxed);
                debug!("datagram #{} corrupted ({} bytes)", index, buf.len());
                let mut damaged = buf.to_vec();
                if let Some(last) = damaged.last_mut() {
                    *last ^= 0x01;
                }
                self.inner.send_to(&damaged, target).await
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}

/// 송신 데이터그램을 그대로 기록하는 래퍼
#[derive(Debug)]
pub struct RecordingTransport<T> {
    inner: T,
    sent: Arc<Mutex<Vec<Bytes>>>,
}

impl<T: Transport> RecordingTransport<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// 연결이 전송 계층을 해제한 뒤에도 기록을 볼 수 있는 핸들
    pub fn log(&self) -> Arc<Mutex<Vec<Bytes>>> {
        self.sent.clone()
    }
}

impl<T: Transport> Transport for RecordingTransport<T> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.sent.lock().push(Bytes::copy_from_slice(buf));
        self.inner.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.inner.recv_from(buf).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_memory_pair_delivers() {
        let (a, b) = MemoryTransport::pair();
        let b_addr = b.local_addr().unwrap();
        a.send_to(b"hello", b_addr).await.unwrap();

        let mut buf = [0u8; 3];
        let (len, from) = b.recv_from(&mut buf).await.unwrap();
        // 버퍼보다 긴 데이터그램은 잘림
        assert_eq!(len, 3);
        assert_eq!(&buf, b"hel");
        assert_eq!(from, a.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_memory_recv_pends_after_peer_drop() {
        let (a, b) = MemoryTransport::pair();
        drop(a);
        let mut buf = [0u8; 8];
        let res = tokio::time::timeout(Duration::from_millis(20), b.recv_from(&mut buf)).await;
        assert!(res.is_err());
    }

    #[tokio::test]
    async fn test_scripted_faults() {
        let (a, b) = MemoryTransport::pair();
        let target = b.local_addr().unwrap();
        let lossy = LossyTransport::new(a, 1)
            .drop_datagrams([1])
            .corrupt_datagrams([2]);

        for i in 0..3u8 {
            lossy.send_to(&[i, 0xAA], target).await.unwrap();
        }
        assert_eq!(lossy.dropped(), 1);
        assert_eq!(lossy.corrupted(), 1);

        let mut buf = [0u8; 8];
        let (len, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0, 0xAA]);
        let (len, _) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[2, 0xAB]);
    }

    #[tokio::test]
    async fn test_loss_rate_is_seeded() {
        async fn run(seed: u64) -> u64 {
            let (a, b) = MemoryTransport::pair();
            let target = b.local_addr().unwrap();
            let lossy = LossyTransport::new(a, seed).with_loss_rate(0.3);
            for _ in 0..200 {
                lossy.send_to(&[0u8; 4], target).await.unwrap();
            }
            lossy.dropped()
        }

        let first = run(9).await;
        assert_eq!(first, run(9).await);
        assert!(first > 20 && first < 110, "dropped {}", first);
    }

    #[tokio::test]
    async fn test_recording() {
        let (a, b) = MemoryTransport::pair();
        let target = b.local_addr().unwrap();
        let rec = RecordingTransport::new(a);
        let log = rec.log();
        rec.send_to(b"one", target).await.unwrap();
        rec.send_to(b"two", target).await.unwrap();
        drop(rec);
        assert_eq!(log.lock().len(), 2);
        assert_eq!(&log.lock()[1][..], b"two");
    }
}
