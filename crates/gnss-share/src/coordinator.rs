//! 设备生命周期协调器
//!
//! 根据在线客户端数量启动/停止设备流式会话，并在会话之间串行执行 AGPS 加载/保存。
//!
//! ```text
//!            0 → 1                      load/store
//!   IDLE ──────────────▶ STREAMING ─────────────────▶ SUSPENDED_FOR_MAINTENANCE
//!    ▲  ◀──────────────              ◀───────────────   │
//!    │       → 0                        clients ≥ 1      │
//!    └───────────────────────────────────────────────────┘
//!                         clients = 0
//! ```
//!
//! 所有状态转换都在同一个控制循环中完成。设备驱动在空闲时由协调器持有，
//! 会话运行时被移交到会话线程，`join` 时交还，因此同一时刻只有一个所有者。

use crate::error::CoordinatorError;
use crossbeam_channel::{Receiver, Sender, select, unbounded};
use gnss_device::{CancelToken, DeviceError, GnssDriver, LineSink};
use parking_lot::RwLock;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// 维护操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceOp {
    /// 从 AGPS 目录恢复到设备
    Load,
    /// 从设备保存到 AGPS 目录
    Store,
}

impl fmt::Display for MaintenanceOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenanceOp::Load => f.write_str("load"),
            MaintenanceOp::Store => f.write_str("store"),
        }
    }
}

/// 控制循环的输入事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    ClientConnected,
    ClientDisconnected,
    Maintenance(MaintenanceOp),
    Shutdown,
}

/// 协调器状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoordinatorState {
    #[default]
    Idle,
    Streaming,
    SuspendedForMaintenance,
}

/// 一次流式会话
struct Session {
    cancel: CancelToken,
    handle: JoinHandle<Box<dyn GnssDriver>>,
    started_at: Instant,
}

/// 设备生命周期协调器
pub struct Coordinator {
    /// 空闲时持有的驱动；会话运行时为 `None`
    driver: Option<Box<dyn GnssDriver>>,
    session: Option<Session>,
    sink: Arc<dyn LineSink>,
    agps_dir: PathBuf,
    /// 在线客户端数量（只由连接/断开事件驱动）
    clients: usize,
    state: Arc<RwLock<CoordinatorState>>,
    error_tx: Sender<DeviceError>,
    error_rx: Receiver<DeviceError>,
}

impl Coordinator {
    pub fn new(
        driver: Box<dyn GnssDriver>,
        sink: Arc<dyn LineSink>,
        agps_dir: impl Into<PathBuf>,
    ) -> Self {
        let (error_tx, error_rx) = unbounded();
        Self {
            driver: Some(driver),
            session: None,
            sink,
            agps_dir: agps_dir.into(),
            clients: 0,
            state: Arc::new(RwLock::new(CoordinatorState::Idle)),
            error_tx,
            error_rx,
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    /// 共享的状态句柄（可以在其他线程观察维护期间的状态）
    pub fn state_handle(&self) -> Arc<RwLock<CoordinatorState>> {
        Arc::clone(&self.state)
    }

    pub fn clients(&self) -> usize {
        self.clients
    }

    pub fn agps_dir(&self) -> &Path {
        &self.agps_dir
    }

    fn set_state(&self, state: CoordinatorState) {
        *self.state.write() = state;
    }

    /// 控制循环：处理事件直到收到 `Shutdown`（或事件通道关闭）
    ///
    /// 会话错误通道上的任何错误都是致命的：停止会话后返回错误。
    pub fn run(&mut self, events: &Receiver<ControlEvent>) -> Result<(), CoordinatorError> {
        let errors = self.error_rx.clone();
        info!("Coordinator started");

        loop {
            select! {
                recv(events) -> event => match event {
                    Ok(ControlEvent::Shutdown) | Err(_) => break,
                    Ok(event) => self.handle_event(event)?,
                },
                recv(errors) -> err => {
                    if let Ok(err) = err {
                        error!("Device session failed: {}", err);
                        self.stop_session()?;
                        return Err(CoordinatorError::Device(err));
                    }
                },
            }
        }

        info!("Coordinator shutting down");
        self.stop_session()
    }

    /// 处理单个事件
    pub fn handle_event(&mut self, event: ControlEvent) -> Result<(), CoordinatorError> {
        debug!("Control event: {:?}", event);
        match event {
            ControlEvent::ClientConnected => {
                self.clients += 1;
                if self.clients == 1 && self.session.is_none() {
                    self.start_session()?;
                }
                Ok(())
            },
            ControlEvent::ClientDisconnected => {
                self.clients = self.clients.saturating_sub(1);
                if self.clients == 0 {
                    self.stop_session()?;
                }
                Ok(())
            },
            ControlEvent::Maintenance(op) => self.maintenance(op),
            ControlEvent::Shutdown => self.stop_session(),
        }
    }

    /// 执行一次维护操作
    ///
    /// 运行中的会话先被同步停止，期间状态为 `SuspendedForMaintenance`；
    /// 空闲时执行则保持 `Idle`。操作失败只记录警告。结束后如果仍有客户端，
    /// 启动新会话。
    pub fn maintenance(&mut self, op: MaintenanceOp) -> Result<(), CoordinatorError> {
        let was_streaming = self.session.is_some();
        self.stop_session()?;
        if was_streaming {
            self.set_state(CoordinatorState::SuspendedForMaintenance);
        }

        let driver = self
            .driver
            .as_mut()
            .ok_or(CoordinatorError::DriverUnavailable)?;
        let dir = self.agps_dir.as_path();
        info!("AGPS {} ({})", op, dir.display());
        let result = match op {
            MaintenanceOp::Load => driver.load(dir),
            MaintenanceOp::Store => driver.save(dir),
        };
        match result {
            Ok(()) => info!("AGPS {} finished", op),
            Err(e) => warn!("AGPS {} failed: {}", op, e),
        }

        self.set_state(CoordinatorState::Idle);
        if self.clients > 0 {
            self.start_session()?;
        }
        Ok(())
    }

    fn start_session(&mut self) -> Result<(), CoordinatorError> {
        if self.session.is_some() {
            return Ok(());
        }
        let mut driver = self
            .driver
            .take()
            .ok_or(CoordinatorError::DriverUnavailable)?;

        let cancel = CancelToken::new();
        let token = cancel.clone();
        let sink = Arc::clone(&self.sink);
        let errors = self.error_tx.clone();

        info!("Starting {}", driver.describe());
        let handle = thread::Builder::new()
            .name("gnss_session".into())
            .spawn(move || {
                if let Err(e) = driver.start(&*sink, &token) {
                    // 控制循环已退出时没有人接收，忽略
                    let _ = errors.send(e);
                }
                driver
            })
            .map_err(CoordinatorError::Spawn)?;

        self.session = Some(Session {
            cancel,
            handle,
            started_at: Instant::now(),
        });
        self.set_state(CoordinatorState::Streaming);
        Ok(())
    }

    /// 停止当前会话并取回驱动（没有会话时为空操作）
    fn stop_session(&mut self) -> Result<(), CoordinatorError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };

        session.cancel.cancel();
        let driver = session
            .handle
            .join()
            .map_err(|_| CoordinatorError::SessionPanicked)?;
        self.driver = Some(driver);
        self.set_state(CoordinatorState::Idle);

        info!(
            "Stopped streaming after {:.1}s",
            session.started_at.elapsed().as_secs_f64()
        );
        Ok(())
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if let Err(e) = self.stop_session() {
            warn!("Failed to stop session on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Action {
        Start,
        Stop,
        Load,
        Store,
    }

    /// 记录调用顺序的驱动；`start` 阻塞直到取消
    struct RecordingDriver {
        log: Arc<Mutex<Vec<Action>>>,
        fail_start: bool,
    }

    impl GnssDriver for RecordingDriver {
        fn open(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn start(&mut self, sink: &dyn LineSink, cancel: &CancelToken) -> Result<(), DeviceError> {
            self.log.lock().push(Action::Start);
            if self.fail_start {
                return Err(DeviceError::Closed);
            }
            while !cancel.is_cancelled() {
                sink.send_line(b"$GPGGA,*00");
                thread::sleep(Duration::from_millis(1));
            }
            self.log.lock().push(Action::Stop);
            Ok(())
        }

        fn load(&mut self, _dir: &Path) -> Result<(), DeviceError> {
            self.log.lock().push(Action::Load);
            Ok(())
        }

        fn save(&mut self, _dir: &Path) -> Result<(), DeviceError> {
            self.log.lock().push(Action::Store);
            Err(DeviceError::fault(
                gnss_device::DeviceFaultKind::Rejected,
                "store fails but is not fatal",
            ))
        }
    }

    struct NullSink;

    impl LineSink for NullSink {
        fn send_line(&self, _line: &[u8]) {}
    }

    fn coordinator(fail_start: bool) -> (Coordinator, Arc<Mutex<Vec<Action>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let driver = RecordingDriver {
            log: Arc::clone(&log),
            fail_start,
        };
        let coordinator = Coordinator::new(Box::new(driver), Arc::new(NullSink), "/tmp/agps");
        (coordinator, log)
    }

    #[test]
    fn test_single_client_start_stop() {
        let (mut c, log) = coordinator(false);
        c.handle_event(ControlEvent::ClientConnected).unwrap();
        assert_eq!(c.state(), CoordinatorState::Streaming);
        c.handle_event(ControlEvent::ClientDisconnected).unwrap();
        assert_eq!(c.state(), CoordinatorState::Idle);
        assert_eq!(*log.lock(), vec![Action::Start, Action::Stop]);
    }

    #[test]
    fn test_overlapping_clients_share_one_session() {
        let (mut c, log) = coordinator(false);
        c.handle_event(ControlEvent::ClientConnected).unwrap();
        c.handle_event(ControlEvent::ClientConnected).unwrap();
        c.handle_event(ControlEvent::ClientDisconnected).unwrap();
        assert_eq!(c.state(), CoordinatorState::Streaming);
        c.handle_event(ControlEvent::ClientDisconnected).unwrap();
        assert_eq!(*log.lock(), vec![Action::Start, Action::Stop]);
        assert_eq!(c.clients(), 0);
    }

    #[test]
    fn test_maintenance_mid_stream() {
        let (mut c, log) = coordinator(false);
        c.handle_event(ControlEvent::ClientConnected).unwrap();
        c.handle_event(ControlEvent::Maintenance(MaintenanceOp::Load)).unwrap();
        assert_eq!(c.state(), CoordinatorState::Streaming);
        c.handle_event(ControlEvent::ClientDisconnected).unwrap();

        assert_eq!(
            *log.lock(),
            vec![Action::Start, Action::Stop, Action::Load, Action::Start, Action::Stop]
        );
    }

    #[test]
    fn test_maintenance_while_idle() {
        let (mut c, log) = coordinator(false);
        // 保存失败不致命
        c.handle_event(ControlEvent::Maintenance(MaintenanceOp::Store)).unwrap();
        assert_eq!(c.state(), CoordinatorState::Idle);
        assert_eq!(*log.lock(), vec![Action::Store]);
    }

    #[test]
    fn test_spurious_disconnect_does_not_underflow() {
        let (mut c, log) = coordinator(false);
        c.handle_event(ControlEvent::ClientDisconnected).unwrap();
        assert_eq!(c.clients(), 0);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_run_until_shutdown() {
        let (mut c, log) = coordinator(false);
        let (tx, rx) = unbounded();
        tx.send(ControlEvent::ClientConnected).unwrap();
        tx.send(ControlEvent::Maintenance(MaintenanceOp::Store)).unwrap();
        tx.send(ControlEvent::Shutdown).unwrap();

        c.run(&rx).unwrap();
        assert_eq!(
            *log.lock(),
            vec![Action::Start, Action::Stop, Action::Store, Action::Start, Action::Stop]
        );
        assert_eq!(c.state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_session_error_is_fatal() {
        let (mut c, log) = coordinator(true);
        let (tx, rx) = unbounded();
        tx.send(ControlEvent::ClientConnected).unwrap();

        let result = c.run(&rx);
        assert!(matches!(
            result,
            Err(CoordinatorError::Device(DeviceError::Closed))
        ));
        assert_eq!(*log.lock(), vec![Action::Start]);
        assert_eq!(c.state(), CoordinatorState::Idle);
        drop(tx);
    }

    /// 在 `load` 内部读取协调器状态的驱动
    struct ObservingDriver {
        state: Arc<Mutex<Option<Arc<RwLock<CoordinatorState>>>>>,
        seen: Arc<Mutex<Vec<CoordinatorState>>>,
    }

    impl GnssDriver for ObservingDriver {
        fn open(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn close(&mut self) -> Result<(), DeviceError> {
            Ok(())
        }

        fn start(&mut self, _sink: &dyn LineSink, cancel: &CancelToken) -> Result<(), DeviceError> {
            while !cancel.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            Ok(())
        }

        fn load(&mut self, _dir: &Path) -> Result<(), DeviceError> {
            if let Some(state) = self.state.lock().as_ref() {
                self.seen.lock().push(*state.read());
            }
            Ok(())
        }

        fn save(&mut self, _dir: &Path) -> Result<(), DeviceError> {
            Ok(())
        }
    }

    fn observing_coordinator() -> (Coordinator, Arc<Mutex<Vec<CoordinatorState>>>) {
        let state = Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let driver = ObservingDriver {
            state: Arc::clone(&state),
            seen: Arc::clone(&seen),
        };
        let c = Coordinator::new(Box::new(driver), Arc::new(NullSink), "/tmp/agps");
        *state.lock() = Some(c.state_handle());
        (c, seen)
    }

    #[test]
    fn test_state_during_idle_maintenance() {
        let (mut c, seen) = observing_coordinator();
        c.handle_event(ControlEvent::Maintenance(MaintenanceOp::Load)).unwrap();
        assert_eq!(*seen.lock(), vec![CoordinatorState::Idle]);
        assert_eq!(c.state(), CoordinatorState::Idle);
    }

    #[test]
    fn test_state_during_streaming_maintenance() {
        let (mut c, seen) = observing_coordinator();
        c.handle_event(ControlEvent::ClientConnected).unwrap();
        c.handle_event(ControlEvent::Maintenance(MaintenanceOp::Load)).unwrap();
        assert_eq!(*seen.lock(), vec![CoordinatorState::SuspendedForMaintenance]);
        assert_eq!(c.state(), CoordinatorState::Streaming);
        c.handle_event(ControlEvent::ClientDisconnected).unwrap();
        assert_eq!(c.state(), CoordinatorState::Idle);
    }

    /// 会话的启动和停止严格交替，并以停止结束
    fn assert_sessions_balanced(log: &[Action]) {
        let mut streaming = false;
        for action in log {
            match action {
                Action::Start => {
                    assert!(!streaming, "second start without stop: {:?}", log);
                    streaming = true;
                },
                Action::Stop => {
                    assert!(streaming, "stop without start: {:?}", log);
                    streaming = false;
                },
                Action::Load | Action::Store => {
                    assert!(!streaming, "maintenance during session: {:?}", log);
                },
            }
        }
        assert!(!streaming, "session left running: {:?}", log);
    }

    #[test]
    fn test_run_with_racing_disconnect_and_maintenance() {
        for _ in 0..20 {
            let (mut c, log) = coordinator(false);
            let (tx, rx) = unbounded();
            let control = thread::spawn(move || {
                c.run(&rx).unwrap();
                c
            });

            let senders: Vec<_> = [
                ControlEvent::ClientConnected,
                ControlEvent::Maintenance(MaintenanceOp::Store),
                ControlEvent::ClientDisconnected,
            ]
            .into_iter()
            .map(|event| {
                let tx = tx.clone();
                thread::spawn(move || tx.send(event).unwrap())
            })
            .collect();
            for sender in senders {
                sender.join().unwrap();
            }
            tx.send(ControlEvent::Shutdown).unwrap();

            let c = control.join().unwrap();
            assert_eq!(c.state(), CoordinatorState::Idle);
            let log = log.lock();
            assert_eq!(log.iter().filter(|a| **a == Action::Store).count(), 1);
            assert_sessions_balanced(&log);
        }
    }
}
