//! # stmctl
//!
//! STM Teseo 模块维护工具。
//!
//! ```bash
//! stmctl get 201                 # 读取 CDB 201
//! stmctl set 201 0x1f            # 写入并保存，模块随后复位
//! stmctl -s -d /dev/ttyS1 reset  # 串口直连的模块
//! ```
//!
//! 操作期间需要独占设备，运行前应停止 gnss_share 或确认没有客户端连接。

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gnss_device::{DriverConfig, DriverKind, build_stm};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "stmctl")]
#[command(about = "Maintenance tool for STM Teseo GNSS modules", long_about = None)]
#[command(version)]
struct Cli {
    /// 设备路径
    #[arg(short, long, default_value = "/dev/gnss0")]
    device: PathBuf,

    /// 波特率（只对 -s 有效）
    #[arg(short, long, default_value_t = 9600)]
    baud: u32,

    /// 设备是串口（/dev/tty*），不经过内核 GNSS 子系统
    #[arg(short, long)]
    serial: bool,

    /// 命令应答期限（秒）
    #[arg(short, long, default_value_t = 10, value_parser = clap::value_parser!(u64).range(1..))]
    timeout: u64,

    /// 输出调试日志
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 读取 CDB 参数
    Get {
        /// CDB ID
        cdb: u32,
    },
    /// 写入 CDB 参数（保存到 NVM 并复位模块）
    Set {
        /// CDB ID
        cdb: u32,
        /// 参数值（十进制或 0x 十六进制）
        #[arg(value_parser = parse_value)]
        value: u64,
    },
    /// 恢复出厂配置
    Restore,
    /// 复位模块
    Reset,
}

fn parse_value(raw: &str) -> Result<u64, String> {
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => raw.parse::<u64>(),
    };
    parsed.map_err(|e| format!("invalid value {:?}: {}", raw, e))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("stmctl={level},gnss_device={level}"))),
        )
        .init();

    let config = DriverConfig {
        kind: if cli.serial {
            DriverKind::StmSerial
        } else {
            DriverKind::Stm
        },
        device_path: cli.device.clone(),
        baud_rate: cli.baud,
        command_timeout: Duration::from_secs(cli.timeout),
    };
    let mut stm = build_stm(&config);

    match cli.command {
        Command::Get { cdb } => {
            let value = stm
                .get_param(cdb)
                .with_context(|| format!("unable to get CDB ID {}", cdb))?;
            println!("{}: 0x{:02X}", cdb, value);
        },
        Command::Set { cdb, value } => {
            stm.set_param(cdb, value)
                .with_context(|| format!("unable to set CDB ID {} to {:#x}", cdb, value))?;
            println!("{}: set to 0x{:02X}, module reset", cdb, value);
        },
        Command::Restore => {
            stm.restore_defaults().context("unable to restore defaults")?;
            println!("Module configuration restored, module reset");
        },
        Command::Reset => {
            stm.reset().context("unable to reset module")?;
            println!("Module reset");
        },
    }
    Ok(())
}
