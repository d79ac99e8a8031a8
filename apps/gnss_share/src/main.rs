//! gnss_share 守护进程主入口
//!
//! ```bash
//! gnss_share                   # 服务模式
//! gnss_share --syslog          # 日志写入 journald
//! gnss_share store             # 保存 AGPS 数据后退出
//! gnss_share load /tmp/agps    # 从指定目录加载 AGPS 数据后退出
//! ```

mod signals;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use crossbeam_channel::unbounded;
use gnss_share::gnss_device::{GnssDriver, build_driver};
use gnss_share::{ClientPool, Config, Coordinator, MaintenanceOp, Server};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// GNSS 共享守护进程
///
/// 在 Unix socket 上向多个客户端分发 GNSS 接收机的 NMEA 输出，
/// 有客户端时才打开设备。
#[derive(Parser, Debug)]
#[command(name = "gnss_share")]
#[command(about = "Share a GNSS receiver's NMEA stream over a Unix socket", long_about = None)]
#[command(version)]
struct Args {
    /// 配置文件（默认 /etc/gnss_share.conf，其次 ./gnss_share.conf）
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 输出调试日志
    #[arg(short, long)]
    verbose: bool,

    /// 日志写入 syslog（journald）而不是标准错误
    #[arg(long)]
    syslog: bool,

    /// 不指定时以服务模式运行
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// 保存历书和星历后退出
    Store {
        /// AGPS 目录（默认使用配置中的 agps_directory）
        dir: Option<PathBuf>,
    },
    /// 加载历书和星历后退出
    ///
    /// 目录中应有 almanac.txt 和 ephemeris.txt。
    Load {
        /// AGPS 目录（默认使用配置中的 agps_directory）
        dir: Option<PathBuf>,
    },
}

fn init_logging(verbose: bool, syslog: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("gnss_share={level},gnss_device={level}"))
    });
    let registry = tracing_subscriber::registry().with(filter);

    if syslog {
        match tracing_journald::layer() {
            Ok(journald) => {
                registry
                    .with(journald.with_syslog_identifier("gnss_share".into()))
                    .init();
                return;
            },
            // 订阅器尚未安装，只能直接写标准错误
            Err(e) => eprintln!("journald unavailable ({}), logging to stderr", e),
        }
    }
    registry.with(tracing_subscriber::fmt::layer()).init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.verbose, args.syslog);

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        },
    }
}

fn run(args: Args) -> Result<()> {
    let config_path = Config::locate(args.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    let mut driver = build_driver(&config.driver_config());
    info!("Using {}", driver.describe());

    match args.command {
        Some(Command::Store { dir }) => {
            let dir = dir.unwrap_or_else(|| config.agps_directory.clone());
            driver
                .save(&dir)
                .with_context(|| format!("storing AGPS data to {}", dir.display()))
        },
        Some(Command::Load { dir }) => {
            let dir = dir.unwrap_or_else(|| config.agps_directory.clone());
            driver
                .load(&dir)
                .with_context(|| format!("loading AGPS data from {}", dir.display()))
        },
        None => serve(&config, driver),
    }
}

/// 删除 socket 文件（退出时）
struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => info!("Removed socket {}", self.0.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {},
            Err(e) => warn!("Failed to remove socket {}: {}", self.0.display(), e),
        }
    }
}

fn serve(config: &Config, driver: Box<dyn GnssDriver>) -> Result<()> {
    let pool = Arc::new(ClientPool::new());
    let (events_tx, events_rx) = unbounded();

    let server = Server::bind(&config.socket, config.socket_group())
        .with_context(|| format!("binding {}", config.socket.display()))?;
    let _socket = SocketGuard(server.path().to_path_buf());

    server
        .spawn(Arc::clone(&pool), events_tx.clone())
        .context("starting listener")?;
    signals::spawn(events_tx).context("installing signal handlers")?;

    let mut coordinator = Coordinator::new(driver, pool, &config.agps_directory);
    if config.load_on_start {
        coordinator.maintenance(MaintenanceOp::Load)?;
    }

    coordinator.run(&events_rx).context("GNSS device failure")?;

    if config.store_on_exit {
        coordinator.maintenance(MaintenanceOp::Store)?;
    }
    info!("Exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_subcommands() {
        let args = Args::try_parse_from(["gnss_share", "-c", "/tmp/g.conf", "store"]).unwrap();
        assert_eq!(args.config, Some(PathBuf::from("/tmp/g.conf")));
        assert!(matches!(args.command, Some(Command::Store { dir: None })));

        let args = Args::try_parse_from(["gnss_share", "load", "/tmp/agps"]).unwrap();
        match args.command {
            Some(Command::Load { dir }) => assert_eq!(dir, Some(PathBuf::from("/tmp/agps"))),
            other => panic!("unexpected command: {:?}", other),
        }

        let args = Args::try_parse_from(["gnss_share", "-v", "--syslog"]).unwrap();
        assert!(args.verbose);
        assert!(args.syslog);
        assert!(args.command.is_none());

        assert!(Args::try_parse_from(["gnss_share", "dump"]).is_err());
    }
}
