//! Unix socket 服务
//!
//! 每个连接一个投递线程：从该客户端的队列取出数据写入 socket，写失败即视为断开。
//! 客户端只接收数据，从不发送。

use crate::coordinator::ControlEvent;
use crate::error::ServerError;
use crate::pool::{ClientId, ClientPool};
use bytes::Bytes;
use crossbeam_channel::{Receiver, Sender};
use nix::unistd::{Group, chown};
use std::fs::{self, Permissions};
use std::io::{ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// socket 文件权限
pub const SOCKET_MODE: u32 = 0o660;

/// 已绑定的 socket 服务
pub struct Server {
    path: PathBuf,
    listener: UnixListener,
}

impl Server {
    /// 绑定 socket，设置权限和所属组
    ///
    /// 上次异常退出留下的 socket 文件会被删除；路径上的普通文件或符号链接不会。
    pub fn bind(path: &Path, group: Option<&str>) -> Result<Self, ServerError> {
        remove_stale_socket(path)?;

        let listener = UnixListener::bind(path)?;
        fs::set_permissions(path, Permissions::from_mode(SOCKET_MODE))?;

        if let Some(name) = group {
            let group = Group::from_name(name)?
                .ok_or_else(|| ServerError::GroupNotFound(name.to_string()))?;
            chown(path, None, Some(group.gid))?;
            debug!("Socket group set to {} ({})", name, group.gid);
        }

        Ok(Self {
            path: path.to_path_buf(),
            listener,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 在独立线程上接受连接
    pub fn spawn(
        self,
        pool: Arc<ClientPool>,
        events: Sender<ControlEvent>,
    ) -> Result<JoinHandle<()>, ServerError> {
        info!("Accepting connections at {}", self.path.display());
        let handle = thread::Builder::new()
            .name("gnss_accept".into())
            .spawn(move || accept_loop(self.listener, pool, events))?;
        Ok(handle)
    }
}

/// 删除残留的 socket 文件
fn remove_stale_socket(path: &Path) -> Result<(), ServerError> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_socket() => {
            fs::remove_file(path)?;
            debug!("Removed stale socket {}", path.display());
            Ok(())
        },
        Ok(_) => Err(ServerError::NotASocket(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ServerError::Io(e)),
    }
}

fn accept_loop(listener: UnixListener, pool: Arc<ClientPool>, events: Sender<ControlEvent>) {
    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Failed to accept connection: {}", e);
                continue;
            },
        };

        let (id, queue) = pool.register();
        if events.send(ControlEvent::ClientConnected).is_err() {
            // 控制循环已退出，守护进程正在关闭
            pool.unregister(id);
            break;
        }
        info!("Client {} connected ({} total)", id, pool.count());

        let client_pool = Arc::clone(&pool);
        let client_events = events.clone();
        let spawned = thread::Builder::new()
            .name(format!("gnss_client_{}", id))
            .spawn(move || deliver(id, stream, queue, &client_pool, &client_events));
        if let Err(e) = spawned {
            // 线程和连接一起被丢弃，按断开处理
            warn!("Failed to spawn delivery thread for client {}: {}", id, e);
            pool.unregister(id);
            let _ = events.send(ControlEvent::ClientDisconnected);
        }
    }
}

/// 投递循环：写失败后注销、关闭连接并通知协调器
fn deliver(
    id: ClientId,
    mut stream: UnixStream,
    queue: Receiver<Bytes>,
    pool: &ClientPool,
    events: &Sender<ControlEvent>,
) {
    for msg in queue.iter() {
        if let Err(e) = stream.write_all(&msg) {
            debug!("Client {} write failed: {}", id, e);
            break;
        }
    }

    pool.unregister(id);
    let _ = stream.shutdown(Shutdown::Both);
    info!("Client {} disconnected", id);
    let _ = events.send(ControlEvent::ClientDisconnected);
}
