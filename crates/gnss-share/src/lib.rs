//! # gnss-share
//!
//! 把一个 GNSS 接收机的 NMEA 输出通过 Unix socket 分发给多个本地客户端。
//!
//! ## 组件
//!
//! ```text
//! GnssDriver ──行──▶ ClientPool ──每客户端队列──▶ Server 投递线程 ──▶ socket
//!     ▲                                              │
//!     │ start/stop/load/save                         │ 连接/断开
//!     └──────────────── Coordinator ◀────────────────┘
//!                           ▲
//!                           │ SIGUSR1 / SIGUSR2 / SIGTERM
//! ```
//!
//! - [`ClientPool`]：客户端集合 + 广播（唯一加锁的结构）
//! - [`Coordinator`]：按客户端引用计数启停设备，串行执行 AGPS 加载/保存
//! - [`Server`]：接受连接，每个客户端一个投递线程
//! - [`Config`]：TOML 配置

pub mod config;
pub mod coordinator;
pub mod error;
pub mod pool;
pub mod server;

pub use config::Config;
pub use coordinator::{ControlEvent, Coordinator, CoordinatorState, MaintenanceOp};
pub use error::{ConfigError, CoordinatorError, ServerError};
pub use pool::{ClientId, ClientPool};
pub use server::Server;

// 重新导出设备层，二进制只依赖本 crate 即可
pub use gnss_device;
