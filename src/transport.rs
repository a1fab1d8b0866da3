//! 데이터그램 전송 바인딩
//!
//! 연결은 [`Transport`] 하나를 독점 소유한다. 수신 타임아웃은 호출자가
//! `tokio::time::timeout_at` 으로 건다. 닫기는 drop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;

use tokio::net::{ToSocketAddrs, UdpSocket};

/// 주소 지정 데이터그램 송수신
pub trait Transport: Send + Sync + 'static {
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// 데이터그램 하나 전송
    fn send_to(
        &self,
        buf: &[u8],
        target: SocketAddr,
    ) -> impl Future<Output = io::Result<usize>> + Send;

    /// 데이터그램 하나 수신 (버퍼보다 크면 잘림)
    fn recv_from(
        &self,
        buf: &mut [u8],
    ) -> impl Future<Output = io::Result<(usize, SocketAddr)>> + Send;
}

/// tokio UDP 소켓 기반 전송
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self { socket })
    }
}

impl Transport for UdpTransport {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.socket.send_to(buf, target).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
