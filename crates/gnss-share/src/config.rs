//! 守护进程配置（TOML）
//!
//! ```toml
//! socket = "/run/gnss-share.sock"
//! group = "geoclue"
//! device_driver = "stm"        # stm | stm_serial
//! device_path = "/dev/gnss0"
//! device_baud_rate = 9600      # 只对 stm_serial 有效
//! agps_directory = "/var/cache/gnss_share"
//! ```
//!
//! 所有字段都有默认值；运行期间配置不可变。

use crate::error::ConfigError;
use gnss_device::{DriverConfig, DriverKind};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "/etc/gnss_share.conf";
/// 系统路径不存在时尝试的本地配置文件
pub const LOCAL_CONFIG_PATH: &str = "gnss_share.conf";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unix socket 路径
    pub socket: PathBuf,
    /// socket 所属组（空字符串表示不修改）
    pub group: String,
    pub device_driver: DriverKind,
    pub device_path: PathBuf,
    pub device_baud_rate: u32,
    /// AGPS 数据目录
    pub agps_directory: PathBuf,
    /// 命令应答期限（秒）
    pub command_timeout_secs: u64,
    /// 启动后立即加载 AGPS 数据
    pub load_on_start: bool,
    /// 退出前保存 AGPS 数据
    pub store_on_exit: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket: PathBuf::from("/run/gnss-share.sock"),
            group: "geoclue".to_string(),
            device_driver: DriverKind::Stm,
            device_path: PathBuf::from("/dev/gnss0"),
            device_baud_rate: 9600,
            agps_directory: PathBuf::from("/var/cache/gnss_share"),
            command_timeout_secs: 10,
            load_on_start: false,
            store_on_exit: false,
        }
    }
}

impl Config {
    /// 解析 TOML 文本并校验
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// 从文件加载
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded config from {}", path.display());
        Self::from_toml_str(&contents)
    }

    /// 确定要使用的配置文件
    ///
    /// 显式指定的路径优先；否则依次尝试 `/etc/gnss_share.conf` 和 `./gnss_share.conf`，
    /// 都不存在时返回系统路径（加载时报告读取失败）。
    pub fn locate(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        [DEFAULT_CONFIG_PATH, LOCAL_CONFIG_PATH]
            .iter()
            .map(PathBuf::from)
            .find(|p| p.is_file())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socket.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("socket path is empty".to_string()));
        }
        if self.device_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("device_path is empty".to_string()));
        }
        if self.device_driver == DriverKind::StmSerial && self.device_baud_rate == 0 {
            return Err(ConfigError::Invalid(
                "device_baud_rate must be non-zero for stm_serial".to_string(),
            ));
        }
        if self.command_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "command_timeout_secs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// socket 所属组（未配置时为 `None`）
    pub fn socket_group(&self) -> Option<&str> {
        let group = self.group.trim();
        (!group.is_empty()).then_some(group)
    }

    pub fn driver_config(&self) -> DriverConfig {
        DriverConfig {
            kind: self.device_driver,
            device_path: self.device_path.clone(),
            baud_rate: self.device_baud_rate,
            command_timeout: Duration::from_secs(self.command_timeout_secs),
        }
    }
}
