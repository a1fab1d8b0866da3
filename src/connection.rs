//! 연결: 생성, 3-way 핸드쉐이크, 4-segment 종료
//!
//! 데이터 전송 경로는 `sender`/`receiver` 모듈이 같은 [`Connection`] 에
//! `impl` 블록으로 붙인다. 모든 연산은 `&mut self` 를 받으므로 한 연결의
//! 연산은 항상 직렬화된다.

use std::net::SocketAddr;

use tokio::net::ToSocketAddrs;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::congestion::CongestionControl;
use crate::nonce::NonceSource;
use crate::receiver::ReceiveBuffer;
use crate::rto::RetransmitTimer;
use crate::segment::{Control, Segment};
use crate::state::{ConnectionState, StateMachine};
use crate::stats::ConnectionStats;
use crate::transport::{Transport, UdpTransport};
use crate::{Config, Error, Result};

/// 수신 데이터그램 버퍼 크기
const DATAGRAM_BUF_LEN: usize = 65_535;

/// 수신한 데이터그램 분류
#[derive(Debug)]
pub(crate) enum Inbound {
    Segment(Segment, SocketAddr),

    /// 체크섬 불일치 또는 형식 오류
    Corrupt(Error),

    /// 연결 상대가 아닌 주소에서 온 데이터그램
    Foreign,
}

/// microTCP 연결 하나
pub struct Connection<T: Transport> {
    pub(crate) config: Config,
    pub(crate) state: StateMachine,

    /// CLOSED/INVALID 에서 정확히 한 번 해제
    transport: Option<T>,

    /// connect/accept 에서 한 번만 설정
    peer: Option<SocketAddr>,

    /// 다음에 보낼 스트림 위치
    pub(crate) local_seq: u32,

    /// 상대가 광고한 수신 윈도우
    pub(crate) advertised_window: u16,

    pub(crate) congestion: CongestionControl,
    pub(crate) rto: RetransmitTimer,
    nonce: NonceSource,

    /// 순서대로 받은 바이트 + 다음 기대 위치 (local_ack)
    pub(crate) recv_buf: ReceiveBuffer,

    /// 상대 FIN+ACK 의 시퀀스 번호
    pub(crate) peer_fin: Option<u32>,

    pub(crate) stats: ConnectionStats,
    datagram: Vec<u8>,
}

impl<T: Transport> Connection<T> {
    /// 새 연결 생성 (UNKNOWN)
    pub fn new(transport: T, config: Config) -> Result<Self> {
        Self::with_nonce_source(transport, config, NonceSource::from_entropy())
    }

    /// nonce 생성기를 지정해서 생성 (테스트에서 고정 시드 사용)
    pub fn with_nonce_source(transport: T, config: Config, nonce: NonceSource) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            state: StateMachine::new(),
            transport: Some(transport),
            peer: None,
            local_seq: 0,
            advertised_window: config.init_window,
            congestion: CongestionControl::from_config(&config),
            rto: RetransmitTimer::from_config(&config),
            nonce,
            recv_buf: ReceiveBuffer::new(0, config.recv_buffer_len),
            peer_fin: None,
            stats: ConnectionStats::new(),
            datagram: vec![0u8; DATAGRAM_BUF_LEN],
            config,
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.state.state()
    }

    pub fn local_seq(&self) -> u32 {
        self.local_seq
    }

    /// 상대에게서 다음에 기대하는 스트림 위치
    pub fn local_ack(&self) -> u32 {
        self.recv_buf.expected()
    }

    pub fn congestion_window(&self) -> u32 {
        self.congestion.cwnd()
    }

    pub fn slow_start_threshold(&self) -> u32 {
        self.congestion.ssthresh()
    }

    pub fn advertised_window(&self) -> u16 {
        self.advertised_window
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn stats(&self) -> &ConnectionStats {
        &self.stats
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.transport.as_ref() {
            Some(transport) => Ok(transport.local_addr()?),
            None => Err(self.released_error("local_addr")),
        }
    }

    /// 전송 계층이 이미 해제되었는지
    pub fn is_released(&self) -> bool {
        self.transport.is_none()
    }

    /// 능동 연결: SYN → SYN+ACK → ACK
    pub async fn connect(&mut self, peer: SocketAddr) -> Result<()> {
        self.state.require("connect", &[ConnectionState::Unknown])?;
        self.peer = Some(peer);

        let isn = self.nonce.next_nonce();
        let expected_ack = isn.wrapping_add(1);
        let syn = Segment::control(isn, 0, Control::SYN, self.recv_buf.window());
        info!("{} 에 연결 시도 (SYN seq={})", peer, isn);

        for attempt in 1..=self.config.handshake_attempts {
            if attempt > 1 {
                warn!("SYN 재전송 ({}/{})", attempt, self.config.handshake_attempts);
            }
            self.transmit(&syn).await?;

            let deadline = Instant::now() + self.config.handshake_timeout();
            while let Some(seg) = self.next_control_segment("connect", deadline).await? {
                let control = seg.header.control;
                if control != Control::SYN_ACK {
                    return Err(self.fail(Error::ProtocolViolation {
                        expected: Control::SYN_ACK,
                        got: control,
                    }));
                }
                if seg.header.ack != expected_ack {
                    debug!("오래된 SYN+ACK 무시: ack={}", seg.header.ack);
                    continue;
                }

                self.local_seq = expected_ack;
                self.recv_buf.reset(seg.header.seq.wrapping_add(1));
                self.send_ack(self.local_ack()).await?;
                self.state.establish()?;
                info!(
                    "연결 수립: {} (local_seq={}, local_ack={})",
                    peer,
                    self.local_seq,
                    self.local_ack()
                );
                return Ok(());
            }
        }

        Err(self.fail(Error::Timeout { op: "connect" }))
    }

    /// 수동 연결: SYN 대기 → SYN+ACK → ACK 대기
    ///
    /// 마지막 ACK 가 유실되어도 같은 ack 번호를 실은 데이터 세그먼트가
    /// 먼저 오면 연결을 수립하고 그 데이터를 받아둔다.
    pub async fn accept(&mut self) -> Result<SocketAddr> {
        self.state.require("accept", &[ConnectionState::Unknown])?;

        let deadline = self.config.accept_timeout().map(|t| Instant::now() + t);
        let (syn, peer) = loop {
            match self.recv_inbound("accept", deadline).await {
                Ok(Inbound::Segment(seg, from)) => {
                    if seg.header.control != Control::SYN {
                        return Err(self.fail(Error::ProtocolViolation {
                            expected: Control::SYN,
                            got: seg.header.control,
                        }));
                    }
                    break (seg, from);
                }
                Ok(Inbound::Corrupt(err)) => return Err(self.fail(err)),
                Ok(Inbound::Foreign) => continue,
                Err(err @ Error::Timeout { .. }) => return Err(self.fail(err)),
                Err(err) => return Err(err),
            }
        };

        self.peer = Some(peer);
        self.recv_buf.reset(syn.header.seq.wrapping_add(1));

        let isn = self.nonce.next_nonce();
        let expected_ack = isn.wrapping_add(1);
        self.local_seq = expected_ack;
        let syn_ack = Segment::control(
            isn,
            self.local_ack(),
            Control::SYN_ACK,
            self.recv_buf.window(),
        );
        debug!("{} 의 SYN 수신 (seq={}), SYN+ACK seq={}", peer, syn.header.seq, isn);

        for attempt in 1..=self.config.handshake_attempts {
            if attempt > 1 {
                warn!("SYN+ACK 재전송 ({}/{})", attempt, self.config.handshake_attempts);
            }
            self.transmit(&syn_ack).await?;

            let deadline = Instant::now() + self.config.handshake_timeout();
            while let Some(seg) = self.next_control_segment("accept", deadline).await? {
                let control = seg.header.control;
                if control == Control::SYN {
                    debug!("SYN 재수신, SYN+ACK 재전송");
                    self.transmit(&syn_ack).await?;
                    continue;
                }
                if control != Control::ACK && control != Control::FIN_ACK {
                    return Err(self.fail(Error::ProtocolViolation {
                        expected: Control::ACK,
                        got: control,
                    }));
                }
                if seg.header.ack != expected_ack {
                    debug!("오래된 ACK 무시: ack={}", seg.header.ack);
                    continue;
                }

                self.state.establish()?;
                info!(
                    "연결 수립: {} (local_seq={}, local_ack={})",
                    peer,
                    self.local_seq,
                    self.local_ack()
                );

                if control == Control::FIN_ACK {
                    self.on_peer_fin(&seg).await?;
                    self.state.close_by_peer()?;
                } else if !seg.payload.is_empty() {
                    self.absorb_payload(&seg, None).await?;
                }
                return Ok(peer);
            }
        }

        Err(self.fail(Error::Timeout { op: "accept" }))
    }

    /// 연결 종료
    ///
    /// ESTABLISHED 에서는 능동 종료, CLOSING_BY_PEER 에서는 수동 종료.
    pub async fn close(&mut self) -> Result<()> {
        self.state.require(
            "close",
            &[ConnectionState::Established, ConnectionState::ClosingByPeer],
        )?;

        if self.state.state() == ConnectionState::ClosingByPeer {
            self.passive_close().await
        } else {
            self.active_close().await
        }
    }

    async fn active_close(&mut self) -> Result<()> {
        let fin_seq = self.nonce.next_nonce();
        let expected_ack = fin_seq.wrapping_add(1);
        let fin = Segment::control(
            fin_seq,
            self.local_ack(),
            Control::FIN_ACK,
            self.recv_buf.window(),
        );
        info!("종료 시작 (FIN+ACK seq={})", fin_seq);

        let mut acked = false;
        'attempts: for attempt in 1..=self.config.handshake_attempts {
            if attempt > 1 {
                warn!("FIN+ACK 재전송 ({}/{})", attempt, self.config.handshake_attempts);
            }
            self.transmit(&fin).await?;

            let deadline = Instant::now() + self.config.handshake_timeout();
            while let Some(seg) = self.next_control_segment("close", deadline).await? {
                let control = seg.header.control;
                if control == Control::FIN_ACK {
                    // 동시 종료이거나, 우리 FIN 까지 확인하는 상대 FIN+ACK
                    self.on_peer_fin(&seg).await?;
                } else if control != Control::ACK {
                    return Err(self.fail(Error::ProtocolViolation {
                        expected: Control::ACK,
                        got: control,
                    }));
                }

                if seg.header.ack == expected_ack {
                    acked = true;
                    break 'attempts;
                }
                debug!("오래된 ACK 무시: ack={}", seg.header.ack);
            }
        }
        if !acked {
            return Err(self.fail(Error::Timeout { op: "close" }));
        }
        self.state.close_by_host()?;

        if self.peer_fin.is_none() {
            debug!("FIN+ACK 확인됨, 상대 FIN+ACK 대기");
            let deadline = Instant::now()
                + self.config.handshake_timeout() * self.config.handshake_attempts;
            loop {
                let Some(seg) = self.next_control_segment("close", deadline).await? else {
                    return Err(self.fail(Error::Timeout { op: "close" }));
                };
                match seg.header.control {
                    Control::FIN_ACK => {
                        self.on_peer_fin(&seg).await?;
                        break;
                    }
                    Control::ACK => debug!("종료 중 ACK 무시: ack={}", seg.header.ack),
                    other => {
                        return Err(self.fail(Error::ProtocolViolation {
                            expected: Control::FIN_ACK,
                            got: other,
                        }))
                    }
                }
            }
        }

        self.time_wait().await;
        self.state.finish()?;
        self.release();
        info!("연결 종료 (능동): {}", self.stats.summary());
        Ok(())
    }

    async fn passive_close(&mut self) -> Result<()> {
        let Some(peer_fin) = self.peer_fin else {
            return Err(Error::InvalidState {
                op: "close",
                state: self.state.state(),
            });
        };

        let ack = peer_fin.wrapping_add(1);
        let fin_seq = self.nonce.next_nonce();
        let expected_ack = fin_seq.wrapping_add(1);
        let fin = Segment::control(fin_seq, ack, Control::FIN_ACK, self.recv_buf.window());
        info!("종료 응답 (FIN+ACK seq={})", fin_seq);

        for attempt in 1..=self.config.handshake_attempts {
            if attempt > 1 {
                warn!("FIN+ACK 재전송 ({}/{})", attempt, self.config.handshake_attempts);
            }
            self.send_ack(ack).await?;
            self.transmit(&fin).await?;

            let deadline = Instant::now() + self.config.handshake_timeout();
            while let Some(seg) = self.next_control_segment("close", deadline).await? {
                let control = seg.header.control;
                if control == Control::FIN_ACK {
                    debug!("상대 FIN+ACK 재수신, ACK 와 FIN+ACK 재전송");
                    self.send_ack(ack).await?;
                    self.transmit(&fin).await?;
                    continue;
                }
                if control != Control::ACK {
                    return Err(self.fail(Error::ProtocolViolation {
                        expected: Control::ACK,
                        got: control,
                    }));
                }
                if seg.header.ack != expected_ack {
                    debug!("오래된 ACK 무시: ack={}", seg.header.ack);
                    continue;
                }

                self.state.finish()?;
                self.release();
                info!("연결 종료 (수동): {}", self.stats.summary());
                return Ok(());
            }
        }

        Err(self.fail(Error::Timeout { op: "close" }))
    }

    /// 마지막 ACK 유실에 대비해 잠시 머물며 재전송된 FIN+ACK 에 응답
    ///
    /// 종료 절차는 이미 끝났으므로 여기서의 전송 계층 에러는 대기만 끝낸다.
    async fn time_wait(&mut self) {
        let deadline = Instant::now() + self.config.time_wait();
        loop {
            match self.recv_classified("close", Some(deadline)).await {
                Ok(Inbound::Segment(seg, _)) if seg.header.control == Control::FIN_ACK => {
                    debug!("FIN+ACK 재수신, 마지막 ACK 재전송");
                    let ack = Segment::control(
                        self.local_seq,
                        seg.header.seq.wrapping_add(1),
                        Control::ACK,
                        self.recv_buf.window(),
                    );
                    if let Err(err) = self.send_segment(&ack).await {
                        warn!("TIME_WAIT 중 ACK 전송 실패: {}", err);
                        break;
                    }
                }
                Ok(_) => continue,
                Err(Error::Timeout { .. }) => break,
                Err(err) => {
                    warn!("TIME_WAIT 중 수신 실패: {}", err);
                    break;
                }
            }
        }
    }

    // 호출 위치: receive/send/close 에서 상대 FIN+ACK 관찰
    pub(crate) async fn on_peer_fin(&mut self, seg: &Segment) -> Result<()> {
        let seq = seg.header.seq;
        if self.peer_fin.is_none() {
            info!("상대가 종료 시작 (FIN+ACK seq={})", seq);
        }
        self.peer_fin = Some(seq);
        self.send_ack(seq.wrapping_add(1)).await
    }

    /// 현재 시퀀스 번호로 순수 ACK 전송
    pub(crate) async fn send_ack(&mut self, ack: u32) -> Result<()> {
        let seg = Segment::control(self.local_seq, ack, Control::ACK, self.recv_buf.window());
        self.transmit(&seg).await
    }

    /// 세그먼트 하나 전송. 전송 계층 에러는 연결을 무효화한다.
    pub(crate) async fn transmit(&mut self, segment: &Segment) -> Result<()> {
        match self.send_segment(segment).await {
            Err(err @ Error::Transport(_)) => Err(self.fail(err)),
            other => other,
        }
    }

    async fn send_segment(&mut self, segment: &Segment) -> Result<()> {
        let bytes = segment.encode()?;
        let Some(peer) = self.peer else {
            return Err(Error::InvalidState {
                op: "transmit",
                state: self.state.state(),
            });
        };
        match self.transport.as_ref() {
            Some(transport) => transport.send_to(&bytes, peer).await?,
            None => return Err(self.released_error("transmit")),
        };

        self.stats.segments_sent += 1;
        debug!(
            "→ {} seq={} ack={} len={} win={}",
            segment.header.control,
            segment.header.seq,
            segment.header.ack,
            segment.payload.len(),
            segment.header.window
        );
        Ok(())
    }

    /// 데이터그램 하나 수신 후 분류
    ///
    /// 데드라인 초과는 `Timeout` 으로 돌려주고 연결은 유지한다.
    /// 전송 계층 에러는 연결을 무효화한다.
    pub(crate) async fn recv_inbound(
        &mut self,
        op: &'static str,
        deadline: Option<Instant>,
    ) -> Result<Inbound> {
        match self.recv_classified(op, deadline).await {
            Err(err @ Error::Transport(_)) => Err(self.fail(err)),
            other => other,
        }
    }

    async fn recv_classified(
        &mut self,
        op: &'static str,
        deadline: Option<Instant>,
    ) -> Result<Inbound> {
        let Some(transport) = self.transport.as_ref() else {
            return Err(self.released_error(op));
        };
        let recv = transport.recv_from(&mut self.datagram);
        let result = match deadline {
            Some(deadline) => match timeout_at(deadline, recv).await {
                Ok(result) => result,
                Err(_) => return Err(Error::Timeout { op }),
            },
            None => recv.await,
        };

        let (len, from) = result?;

        if let Some(peer) = self.peer {
            if from != peer {
                debug!("연결 상대가 아닌 {} 의 데이터그램 무시", from);
                return Ok(Inbound::Foreign);
            }
        }
        self.stats.segments_received += 1;

        match Segment::decode_verified(&self.datagram[..len]) {
            Ok(seg) => {
                debug!(
                    "← {} seq={} ack={} len={} win={}",
                    seg.header.control,
                    seg.header.seq,
                    seg.header.ack,
                    seg.payload.len(),
                    seg.header.window
                );
                Ok(Inbound::Segment(seg, from))
            }
            Err(err) => {
                self.stats.checksum_drops += 1;
                warn!("세그먼트 폐기 ({} bytes): {}", len, err);
                Ok(Inbound::Corrupt(err))
            }
        }
    }

    /// 핸드쉐이크/종료용 수신: 손상된 세그먼트는 치명적, 데드라인 초과는 `None`
    async fn next_control_segment(
        &mut self,
        op: &'static str,
        deadline: Instant,
    ) -> Result<Option<Segment>> {
        loop {
            match self.recv_inbound(op, Some(deadline)).await {
                Ok(Inbound::Segment(seg, _)) => return Ok(Some(seg)),
                Ok(Inbound::Corrupt(err)) => return Err(self.fail(err)),
                Ok(Inbound::Foreign) => continue,
                Err(Error::Timeout { .. }) => return Ok(None),
                Err(err) => return Err(err),
            }
        }
    }

    /// INVALID 로 전이하고 전송 계층 해제
    pub(crate) fn fail(&mut self, err: Error) -> Error {
        if !self.state.is_invalid() {
            warn!("연결 무효화 ({}): {}", self.state.state(), err);
        }
        self.state.invalidate();
        self.release();
        err
    }

    fn release(&mut self) {
        if self.transport.take().is_some() {
            debug!("전송 계층 해제");
        }
    }

    fn released_error(&self, op: &'static str) -> Error {
        if self.state.is_invalid() {
            Error::ConnectionInvalid
        } else {
            Error::InvalidState {
                op,
                state: self.state.state(),
            }
        }
    }
}

impl Connection<UdpTransport> {
    /// UDP 소켓을 바인딩해서 연결 생성
    pub async fn bind(addr: impl ToSocketAddrs, config: Config) -> Result<Self> {
        let transport = UdpTransport::bind(addr).await?;
        Self::new(transport, config)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::simulator::MemoryTransport;

    /// 테스트용 설정: 짧은 타임아웃, 넉넉한 최소 RTO
    pub fn test_config() -> Config {
        Config {
            handshake_timeout_ms: 300,
            time_wait_ms: 600,
            min_rto_ms: 100,
            ..Config::loopback()
        }
    }

    /// 지정한 횟수만큼 보낸 뒤 송신이 실패하고, 스위치로 수신도 실패시킬 수 있는 전송
    pub struct FaultyTransport {
        inner: MemoryTransport,
        sends_allowed: usize,
        sent: AtomicUsize,
        recv_broken: Arc<AtomicBool>,
    }

    impl FaultyTransport {
        pub fn new(inner: MemoryTransport, sends_allowed: usize) -> Self {
            Self {
                inner,
                sends_allowed,
                sent: AtomicUsize::new(0),
                recv_broken: Arc::new(AtomicBool::new(false)),
            }
        }

        /// true 로 바꾸면 이후 recv_from 이 에러를 돌려준다
        pub fn recv_switch(&self) -> Arc<AtomicBool> {
            self.recv_broken.clone()
        }
    }

    impl Transport for FaultyTransport {
        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }

        async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            if self.sent.fetch_add(1, Ordering::SeqCst) >= self.sends_allowed {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
            }
            self.inner.send_to(buf, target).await
        }

        async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            if self.recv_broken.load(Ordering::SeqCst) {
                return Err(io::Error::new(io::ErrorKind::ConnectionReset, "link down"));
            }
            self.inner.recv_from(buf).await
        }
    }

    /// 두 연결을 동시에 connect/accept
    pub async fn establish<A: Transport, B: Transport>(
        client: &mut Connection<A>,
        server: &mut Connection<B>,
    ) {
        let server_addr = server.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(client.connect(server_addr), server.accept());
        connected.unwrap();
        accepted.unwrap();
    }

    pub async fn memory_pair(
        client_config: Config,
        server_config: Config,
    ) -> (Connection<MemoryTransport>, Connection<MemoryTransport>) {
        let (a, b) = MemoryTransport::pair();
        let mut client =
            Connection::with_nonce_source(a, client_config, NonceSource::seeded(1)).unwrap();
        let mut server =
            Connection::with_nonce_source(b, server_config, NonceSource::seeded(2)).unwrap();
        establish(&mut client, &mut server).await;
        (client, server)
    }

    pub async fn send_raw(transport: &MemoryTransport, segment: &Segment) {
        let bytes = segment.encode().unwrap();
        transport
            .send_to(&bytes, transport.peer_addr())
            .await
            .unwrap();
    }

    pub async fn recv_raw(transport: &MemoryTransport, wait: Duration) -> Option<Segment> {
        let mut buf = vec![0u8; 65_535];
        let (len, _) = tokio::time::timeout(wait, transport.recv_from(&mut buf))
            .await
            .ok()?
            .unwrap();
        Some(Segment::decode_verified(&buf[..len]).unwrap())
    }

    /// 원시 세그먼트로 직접 핸드쉐이크를 수행하는 상대
    ///
    /// 반환값: (상대의 다음 seq, 서버의 다음 seq)
    pub async fn raw_handshake(
        server: &mut Connection<MemoryTransport>,
        raw: &MemoryTransport,
        raw_isn: u32,
    ) -> (u32, u32) {
        let peer = async {
            send_raw(raw, &Segment::control(raw_isn, 0, Control::SYN, 8192)).await;
            let syn_ack = recv_raw(raw, Duration::from_secs(1)).await.unwrap();
            assert_eq!(syn_ack.header.control, Control::SYN_ACK);
            assert_eq!(syn_ack.header.ack, raw_isn.wrapping_add(1));

            let server_next = syn_ack.header.seq.wrapping_add(1);
            send_raw(
                raw,
                &Segment::control(raw_isn.wrapping_add(1), server_next, Control::ACK, 8192),
            )
            .await;
            server_next
        };

        let (accepted, server_next) = tokio::join!(server.accept(), peer);
        accepted.unwrap();
        (raw_isn.wrapping_add(1), server_next)
    }
}
