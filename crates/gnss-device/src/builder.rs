//! 驱动构造
//!
//! 传输方式在启动时根据配置选定一次，之后上层只面对 trait 对象。

use crate::serial::DEFAULT_BAUD_RATE;
use crate::stm::DEFAULT_COMMAND_TIMEOUT;
use crate::{GnssDriver, KernelGnssTransport, SerialTransport, StmControl, StmDriver};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// 驱动类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum DriverKind {
    /// STM 模块，经内核 GNSS 子系统访问（`/dev/gnssN`）
    #[default]
    Stm,
    /// STM 模块，直接经串口访问（`/dev/ttyN`）
    StmSerial,
}

impl FromStr for DriverKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stm" => Ok(DriverKind::Stm),
            "stm_serial" => Ok(DriverKind::StmSerial),
            other => Err(format!(
                "unsupported device driver {:?} (expected \"stm\" or \"stm_serial\")",
                other
            )),
        }
    }
}

impl fmt::Display for DriverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverKind::Stm => f.write_str("stm"),
            DriverKind::StmSerial => f.write_str("stm_serial"),
        }
    }
}

/// 构造驱动所需的设备参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverConfig {
    pub kind: DriverKind,
    pub device_path: PathBuf,
    /// 只对 `stm_serial` 有效
    pub baud_rate: u32,
    pub command_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            kind: DriverKind::Stm,
            device_path: PathBuf::from("/dev/gnss0"),
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl DriverConfig {
    fn serial_transport(&self) -> SerialTransport {
        SerialTransport::new(self.device_path.to_string_lossy(), self.baud_rate)
    }

    fn kernel_transport(&self) -> KernelGnssTransport {
        KernelGnssTransport::new(&self.device_path)
    }
}

/// 构造流式/AGPS 驱动
pub fn build_driver(config: &DriverConfig) -> Box<dyn GnssDriver> {
    match config.kind {
        DriverKind::Stm => Box::new(
            StmDriver::new(config.kernel_transport()).with_command_timeout(config.command_timeout),
        ),
        DriverKind::StmSerial => Box::new(
            StmDriver::new(config.serial_transport()).with_command_timeout(config.command_timeout),
        ),
    }
}

/// 构造维护操作接口（参数读写、复位）
pub fn build_stm(config: &DriverConfig) -> Box<dyn StmControl> {
    match config.kind {
        DriverKind::Stm => Box::new(
            StmDriver::new(config.kernel_transport()).with_command_timeout(config.command_timeout),
        ),
        DriverKind::StmSerial => Box::new(
            StmDriver::new(config.serial_transport()).with_command_timeout(config.command_timeout),
        ),
    }
}
