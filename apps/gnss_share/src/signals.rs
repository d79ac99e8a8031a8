//! 信号处理线程
//!
//! - SIGUSR1 → 加载 AGPS 数据
//! - SIGUSR2 → 保存 AGPS 数据
//! - SIGINT / SIGTERM → 有序退出

use crossbeam_channel::Sender;
use gnss_share::{ControlEvent, MaintenanceOp};
use signal_hook::consts::{SIGINT, SIGTERM, SIGUSR1, SIGUSR2};
use signal_hook::iterator::Signals;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::info;

/// 信号对应的控制事件
pub fn event_for(signal: i32) -> Option<ControlEvent> {
    match signal {
        SIGUSR1 => Some(ControlEvent::Maintenance(MaintenanceOp::Load)),
        SIGUSR2 => Some(ControlEvent::Maintenance(MaintenanceOp::Store)),
        SIGINT | SIGTERM => Some(ControlEvent::Shutdown),
        _ => None,
    }
}

/// 注册信号并启动转发线程
pub fn spawn(events: Sender<ControlEvent>) -> io::Result<JoinHandle<()>> {
    let mut signals = Signals::new([SIGUSR1, SIGUSR2, SIGINT, SIGTERM])?;

    thread::Builder::new().name("signals".into()).spawn(move || {
        for signal in signals.forever() {
            let Some(event) = event_for(signal) else {
                continue;
            };
            info!("Received signal {}: {:?}", signal, event);
            if events.send(event).is_err() {
                break;
            }
        }
    })
}
