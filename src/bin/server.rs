//! microTCP 서버 (수신자)
//!
//! 연결 하나를 수락해서 스트림 끝까지 받은 데이터를 파일에 기록
//!
//! 사용법:
//!   cargo run --release --bin microtcp-server -- --bind 0.0.0.0:9000 --output received.bin
//!
//! 예시:
//!   # 수신 방향 20% 손실 시뮬레이션
//!   cargo run --release --bin microtcp-server -- -o received.bin --loss 0.2

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Instant;

use clap::{Parser, ValueEnum};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use microtcp::{Config, Connection, LossyTransport, RecvOutcome, Transport, UdpTransport};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Profile {
    Default,
    Lossy,
    Loopback,
}

impl Profile {
    fn config(self) -> Config {
        match self {
            Profile::Default => Config::default(),
            Profile::Lossy => Config::lossy_network(),
            Profile::Loopback => Config::loopback(),
        }
    }
}

/// microTCP 서버 - 연결 하나를 수락해서 파일로 저장
#[derive(Debug, Parser)]
#[command(name = "microtcp-server", version)]
struct Args {
    /// 바인드 주소
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// 수신 데이터 저장 경로
    #[arg(short, long)]
    output: PathBuf,

    /// 설정 프로파일
    #[arg(long, value_enum, default_value_t = Profile::Default)]
    profile: Profile,

    /// 송신 데이터그램 손실 확률 (0.0~1.0)
    #[arg(long)]
    loss: Option<f64>,

    /// 손실 시뮬레이션 시드
    #[arg(long, default_value_t = 0)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 설정
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();
    let config = args.profile.config();
    info!("microTCP server starting on {}", args.bind);

    let transport = UdpTransport::bind(args.bind).await?;
    match args.loss {
        Some(rate) => {
            info!("Simulated loss: {:.1}%", rate * 100.0);
            let lossy = LossyTransport::new(transport, args.seed).with_loss_rate(rate);
            serve(Connection::new(lossy, config)?, &args.output).await?;
        }
        None => serve(Connection::new(transport, config)?, &args.output).await?,
    }

    Ok(())
}

async fn serve<T: Transport>(
    mut conn: Connection<T>,
    output: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Waiting for client connection...");
    let peer = conn.accept().await?;
    info!("Client connected: {}", peer);

    let mut file = File::create(output).await?;
    let mut buf = vec![0u8; conn.config().recv_buffer_len];
    let mut total = 0usize;
    let start = Instant::now();

    loop {
        match conn.receive(&mut buf).await? {
            RecvOutcome::Delivered(n) => {
                file.write_all(&buf[..n]).await?;
                total += n;
            }
            RecvOutcome::EndOfStream => break,
        }
    }
    file.flush().await?;
    conn.close().await?;

    let elapsed = start.elapsed().as_secs_f64();
    let megabytes = total as f64 / 1_000_000.0;
    info!("Transfer complete!");
    info!("  Received: {:.2} MB -> {:?}", megabytes, output);
    info!("  Time: {:.2}s", elapsed);
    if elapsed > 0.0 {
        info!("  Throughput: {:.2} MB/s", megabytes / elapsed);
    }
    info!("  {}", conn.stats().summary());

    Ok(())
}
