//! 客户端广播池
//!
//! 只保存每个客户端的发送队列；连接本身由各自的投递线程持有。
//! 客户端集合是整个守护进程中唯一加锁的结构。

use bytes::{Bytes, BytesMut};
use crossbeam_channel::{Receiver, Sender, unbounded};
use gnss_device::LineSink;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// 客户端 ID（池内唯一，单调递增）
pub type ClientId = u64;

/// 默认行结束符
pub const DEFAULT_TERMINATOR: &[u8] = b"\n";

/// 客户端广播池
pub struct ClientPool {
    clients: Mutex<HashMap<ClientId, Sender<Bytes>>>,
    next_id: AtomicU64,
    terminator: Bytes,
}

impl Default for ClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientPool {
    pub fn new() -> Self {
        Self::with_terminator(DEFAULT_TERMINATOR)
    }

    pub fn with_terminator(terminator: &[u8]) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            terminator: Bytes::copy_from_slice(terminator),
        }
    }

    /// 注册客户端，返回其 ID 和发送队列的接收端
    ///
    /// 队列无界，广播永远不会阻塞。
    pub fn register(&self) -> (ClientId, Receiver<Bytes>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = unbounded();
        self.clients.lock().insert(id, tx);
        (id, rx)
    }

    /// 注销客户端（重复注销为空操作）
    ///
    /// 返回客户端在注销前是否存在。
    pub fn unregister(&self, id: ClientId) -> bool {
        self.clients.lock().remove(&id).is_some()
    }

    /// 向所有已注册客户端投递同一行（追加行结束符）
    pub fn broadcast(&self, line: &[u8]) {
        let mut msg = BytesMut::with_capacity(line.len() + self.terminator.len());
        msg.extend_from_slice(line);
        msg.extend_from_slice(&self.terminator);
        let msg = msg.freeze();

        let clients = self.clients.lock();
        for tx in clients.values() {
            // 接收端已关闭说明投递线程正在退出，它会自己注销
            let _ = tx.send(msg.clone());
        }
    }

    pub fn count(&self) -> usize {
        self.clients.lock().len()
    }
}

impl LineSink for ClientPool {
    fn send_line(&self, line: &[u8]) {
        self.broadcast(line);
    }
}
