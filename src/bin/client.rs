//! microTCP 클라이언트 (송신자)
//!
//! 서버에 연결해서 파일을 보내고 연결을 닫는다
//!
//! 사용법:
//!   cargo run --release --bin microtcp-client -- --server 127.0.0.1:9000 --file data.bin
//!
//! 예시:
//!   # 손실 환경 프로파일 + 송신 방향 10% 손실
//!   cargo run --release --bin microtcp-client -- -s 127.0.0.1:9000 -f data.bin --profile lossy --loss 0.1

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use microtcp::{Config, Connection, LossyTransport, Transport, UdpTransport};

/// 파일을 읽어 들이는 단위
const READ_CHUNK: usize = 4096;

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

/// microTCP 클라이언트 - 파일을 서버로 전송
#[derive(Debug, Parser)]
#[command(name = "microtcp-client", version)]
struct Args {
    /// 서버 주소
    #[arg(short, long, default_value = "127.0.0.1:9000")]
    server: SocketAddr,

    /// 로컬 바인드 주소 (0 = 자동 할당)
    #[arg(short, long, default_value = "0.0.0.0:0")]
    bind: SocketAddr,

    /// 전송할 파일 경로
    #[arg(short, long)]
    file: PathBuf,

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
    info!("microTCP client starting...");

    let transport = UdpTransport::bind(args.bind).await?;
    match args.loss {
        Some(rate) => {
            info!("Simulated loss: {:.1}%", rate * 100.0);
            let lossy = LossyTransport::new(transport, args.seed).with_loss_rate(rate);
            upload(Connection::new(lossy, config)?, args.server, &args.file).await?;
        }
        None => upload(Connection::new(transport, config)?, args.server, &args.file).await?,
    }

    Ok(())
}

async fn upload<T: Transport>(
    mut conn: Connection<T>,
    server: SocketAddr,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut file = File::open(path).await?;

    conn.connect(server).await?;
    info!("Connected to {}", server);

    let mut chunk = vec![0u8; READ_CHUNK];
    let mut total = 0usize;
    loop {
        let n = file.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        let sent = conn.send(&chunk[..n]).await?;
        total += sent;
        if sent < n {
            // 상대가 먼저 닫음
            info!("Peer closed after {} bytes", total);
            break;
        }
    }

    conn.close().await?;
    info!("Sent {} bytes from {:?}", total, path);
    info!("{}", conn.stats().summary());

    Ok(())
}
