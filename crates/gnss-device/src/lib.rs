//! # GNSS Device Layer
//!
//! GNSS 接收机硬件抽象层，提供统一的设备接口抽象。
//!
//! ## 分层
//!
//! ```text
//! GnssDriver (trait)            ← 协调器只看到这一层
//!     ↑ 实现
//! StmDriver<T: Transport>       ← STM Teseo 命令/应答、AGPS 持久化、CDB 参数
//!     ↓ 使用
//! Transport / LineLink (trait)  ← 行级收发
//!     ↓ 实现
//! KernelGnssTransport | SerialTransport | MockTransport
//! ```
//!
//! 设备链路在任意时刻只有一个所有者：`GnssDriver` 的方法都要求 `&mut self`，
//! 由上层（协调器）保证串行调用，驱动内部不加锁。

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

pub mod builder;
pub mod kernel;
mod line_reader;
pub mod mock;
pub mod serial;
pub mod stm;

pub use builder::{DriverConfig, DriverKind, build_driver, build_stm};
pub use kernel::KernelGnssTransport;
pub use mock::{MockStm, MockTransport};
pub use serial::SerialTransport;
pub use stm::{ALMANAC_FILE, EPHEMERIS_FILE, StmControl, StmDriver};

/// 设备层统一错误类型
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),
    #[error("Device Error: {0}")]
    Device(#[from] DeviceFault),
    /// 单次读取超时（链路层，没有完整的一行可读）
    #[error("Read timeout")]
    Timeout,
    /// 命令在期限内没有得到应答
    #[error("Command {command:?} not acknowledged within {waited:?}")]
    CommandTimeout { command: String, waited: Duration },
    #[error("Device not open")]
    NotOpen,
    #[error("Link closed by device")]
    Closed,
}

impl DeviceError {
    /// 链路是否已不可用（需要重新打开设备）
    ///
    /// 命令级失败（被拒绝、应答超时、应答格式错误）不算致命。
    pub fn is_fatal(&self) -> bool {
        match self {
            DeviceError::Io(_) | DeviceError::Serial(_) | DeviceError::Closed => true,
            DeviceError::NotOpen => true,
            DeviceError::Device(fault) => fault.is_fatal(),
            DeviceError::Timeout | DeviceError::CommandTimeout { .. } => false,
        }
    }

    /// 构造结构化设备错误的便捷方法
    pub fn fault(kind: DeviceFaultKind, message: impl Into<String>) -> Self {
        DeviceError::Device(DeviceFault::new(kind, message))
    }
}

/// 设备错误的结构化分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFaultKind {
    Unknown,
    /// 设备节点不存在
    NotFound,
    /// 打开后没有等到启动横幅
    NotReady,
    /// 设备明确拒绝了命令或数据行
    Rejected,
    /// 应答无法解析
    InvalidResponse,
}

/// 结构化设备错误
#[derive(Error, Debug, Clone)]
#[error("{kind:?}: {message}")]
pub struct DeviceFault {
    pub kind: DeviceFaultKind,
    pub message: String,
}

impl DeviceFault {
    pub fn new(kind: DeviceFaultKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            DeviceFaultKind::NotFound | DeviceFaultKind::NotReady
        )
    }
}

impl From<String> for DeviceFault {
    fn from(message: String) -> Self {
        Self::new(DeviceFaultKind::Unknown, message)
    }
}

impl From<&str> for DeviceFault {
    fn from(message: &str) -> Self {
        Self::new(DeviceFaultKind::Unknown, message)
    }
}

/// 已建立的行级链路
///
/// `read_line` 返回去掉行尾 `\r\n` 的原始字节；没有数据时可以返回
/// [`DeviceError::Timeout`]，调用方据此在行边界检查取消/期限。
pub trait LineLink: Send {
    fn read_line(&mut self) -> Result<Vec<u8>, DeviceError>;
    /// 写入一行（实现负责追加 `\r\n`）
    fn write_line(&mut self, line: &str) -> Result<(), DeviceError>;
}

/// 设备访问方式（内核 GNSS 子系统 / 串口）
///
/// 启动时选定一次，运行期间不再改变。
pub trait Transport: Send {
    type Link: LineLink;

    /// 打开设备并等待其可用
    fn connect(&self) -> Result<Self::Link, DeviceError>;

    /// 人类可读的描述（用于日志）
    fn describe(&self) -> String;
}

/// 设备输出的接收端（广播池实现此 trait）
pub trait LineSink: Send + Sync {
    fn send_line(&self, line: &[u8]);
}

/// 协作式取消信号
///
/// 流式读取在每个行边界检查一次，停止延迟上限为一行的传输时间。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消（幂等）
    ///
    /// 返回本次调用之前是否已经取消过。
    pub fn cancel(&self) -> bool {
        // Release: 取消之前的写入对读取线程可见
        self.cancelled.swap(true, Ordering::AcqRel)
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// GNSS 设备驱动能力集
///
/// 所有方法都要求独占访问；`load`/`save` 只会在没有流式会话时被调用。
pub trait GnssDriver: Send {
    /// 打开物理链路（已打开时为空操作）
    fn open(&mut self) -> Result<(), DeviceError>;

    /// 关闭物理链路（未打开时为空操作）
    fn close(&mut self) -> Result<(), DeviceError>;

    /// 流式读取设备输出，直到被取消或链路出错
    ///
    /// 正常取消返回 `Ok(())`；链路错误以 `Err` 返回，由调用方转发到错误通道。
    /// 返回前设备一定已关闭。
    fn start(&mut self, sink: &dyn LineSink, cancel: &CancelToken) -> Result<(), DeviceError>;

    /// 从目录恢复历书/星历
    fn load(&mut self, dir: &Path) -> Result<(), DeviceError>;

    /// 把历书/星历保存到目录
    fn save(&mut self, dir: &Path) -> Result<(), DeviceError>;

    /// 人类可读的描述（用于日志）
    fn describe(&self) -> String {
        "gnss device".to_string()
    }
}

impl<D: GnssDriver + ?Sized> GnssDriver for Box<D> {
    fn open(&mut self) -> Result<(), DeviceError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        (**self).close()
    }

    fn start(&mut self, sink: &dyn LineSink, cancel: &CancelToken) -> Result<(), DeviceError> {
        (**self).start(sink, cancel)
    }

    fn load(&mut self, dir: &Path) -> Result<(), DeviceError> {
        (**self).load(dir)
    }

    fn save(&mut self, dir: &Path) -> Result<(), DeviceError> {
        (**self).save(dir)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
