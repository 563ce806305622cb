//! `udp-intake`：在本机端口上运行收包模块，并从交接队列中逐个取出、记录、回收报文。
//!
//! 日志级别通过 `RUST_LOG` 控制，缺省为 `info`。
//! `--config` 指向的 TOML 文件整体载入配置存储：顶层键归收包模块，`[pool]` 分表归缓冲池；
//! 命令行参数覆盖文件中的同名键。

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use crossbeam_channel::TryRecvError;
use tracing_subscriber::EnvFilter;

use intake_buffer::{PoolConfig, SlabPacketPool};
use intake_core::{PoolDirectory, SettingsStore};
use intake_transport_udp::{
    UdpSocketConfig, UdpSocketModule,
    config::{KEY_BUFFER_SIZE, KEY_SOCKET_PORT, KEY_SOCKET_TIMEOUT},
};

#[derive(Debug, Parser)]
#[command(name = "udp-intake")]
#[command(about = "Single-socket UDP intake loop draining datagrams from a bounded queue")]
struct Cli {
    /// TOML file with module settings
    #[arg(long)]
    config: Option<PathBuf>,
    /// Port to bind (0 picks an ephemeral port)
    #[arg(long)]
    port: Option<u16>,
    /// Capacity of the handoff queue
    #[arg(long)]
    queue_capacity: Option<usize>,
    /// Receive timeout in milliseconds (0 blocks without bound)
    #[arg(long)]
    timeout_ms: Option<u64>,
    /// Exit after this many datagrams
    #[arg(long)]
    max_packets: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let base = match &cli.config {
        Some(path) => SettingsStore::from_toml_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => SettingsStore::new(),
    };
    let settings = apply_overrides(base, &cli)?;
    let config = UdpSocketConfig::from_settings(&settings)?;

    let pools = PoolDirectory::new();
    let pool = SlabPacketPool::new(PoolConfig::from_settings(&settings)?);
    pools.register(config.pool_connection.clone(), Arc::new(pool.clone()));

    let module = UdpSocketModule::new("udp-intake", settings, pools);
    module.init()?;
    module.start()?;

    let queue = module
        .packet_queue()
        .context("module has no handoff queue after start")?;
    let failures = module
        .tick_failures()
        .context("module has no tick group after start")?;

    let mut drained = 0u64;
    let outcome = loop {
        if cli.max_packets.is_some_and(|limit| drained >= limit) {
            break Ok(());
        }
        match failures.try_recv() {
            Ok(failure) if failure.error.is_fatal() => {
                break Err(anyhow::Error::new(failure.error).context("receive loop stopped"));
            }
            Ok(_) | Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => bail!("tick group went away"),
        }
        if let Some(packet) = queue.poll_timeout(Duration::from_millis(200)) {
            drained += 1;
            tracing::info!(
                from = ?packet.endpoint(),
                len = packet.len(),
                seq = drained,
                "datagram received"
            );
            packet.recycle();
        }
    };

    module.stop_force()?;
    module.destroy()?;
    tracing::info!(
        drained,
        stats = ?module.stats(),
        pool = ?pool,
        "udp intake finished"
    );
    outcome
}

/// 把命令行参数写到文件配置之上。
fn apply_overrides(settings: SettingsStore, cli: &Cli) -> anyhow::Result<SettingsStore> {
    if let Some(port) = cli.port {
        settings.set(KEY_SOCKET_PORT, port.to_string())?;
    }
    if let Some(capacity) = cli.queue_capacity {
        settings.set(KEY_BUFFER_SIZE, capacity.to_string())?;
    }
    if let Some(timeout) = cli.timeout_ms {
        settings.set(KEY_SOCKET_TIMEOUT, timeout.to_string())?;
    }
    Ok(settings)
}
