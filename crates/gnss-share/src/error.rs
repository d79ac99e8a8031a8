//! gnss-share 错误类型

use gnss_device::DeviceError;
use std::path::PathBuf;
use thiserror::Error;

/// 配置文件错误
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Socket 服务错误（均为启动期致命错误）
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    /// socket 路径上已存在非 socket 文件，拒绝删除
    #[error("Refusing to replace {0}: not a socket")]
    NotASocket(PathBuf),
    #[error("Group not found: {0}")]
    GroupNotFound(String),
    #[error("Failed to set socket ownership: {0}")]
    Ownership(#[from] nix::errno::Errno),
}

/// 协调器错误
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// 会话错误通道上报的设备错误（致命）
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),
    #[error("Streaming session panicked")]
    SessionPanicked,
    /// 驱动不在协调器手中（上一次会话异常结束）
    #[error("Device driver unavailable")]
    DriverUnavailable,
    #[error("Failed to spawn session thread: {0}")]
    Spawn(std::io::Error),
}
