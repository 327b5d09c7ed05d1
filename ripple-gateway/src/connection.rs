//! 单个客户端连接
//!
//! 连接身份是 (user_id, device_id)；同身份的新连接会顶掉旧连接。每个
//! 连接额外携带进程内唯一的 conn_id，清理路径用它判断自己是否仍持有
//! 管理器中的条目，避免被顶掉的连接误伤接替者。

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

use ripple_im_core::protocol::Frame;
use ripple_im_core::utils::unix_now_millis;

/// 连接在管理器中的键
pub type ConnKey = (i64, String);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub struct Connection {
    conn_id: u64,
    pub user_id: i64,
    pub device_id: String,
    sender: mpsc::Sender<Frame>,
    close_tx: watch::Sender<bool>,
    /// 最近活跃时间（Unix 毫秒），接收循环写、清理任务读
    last_active: AtomicI64,
}

impl Connection {
    /// 创建连接，返回连接与发送 worker 消费的出站队列
    pub fn new(
        user_id: i64,
        device_id: &str,
        queue_capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(queue_capacity);
        let (close_tx, _) = watch::channel(false);
        let conn = Arc::new(Self {
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            device_id: device_id.to_string(),
            sender,
            close_tx,
            last_active: AtomicI64::new(unix_now_millis()),
        });
        (conn, receiver)
    }

    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    pub fn key(&self) -> ConnKey {
        (self.user_id, self.device_id.clone())
    }

    /// 无阻塞入队；队列满或连接已关闭时丢弃并返回 false
    ///
    /// 丢弃是刻意的：一个慢消费者不能拖住整个扇出，客户端靠拉取补齐。
    pub fn try_send(&self, frame: Frame) -> bool {
        if self.is_closed() {
            warn!(
                user_id = self.user_id,
                device_id = %self.device_id,
                "connection closed, cannot send frame"
            );
            return false;
        }
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    user_id = self.user_id,
                    device_id = %self.device_id,
                    "send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(
                    user_id = self.user_id,
                    device_id = %self.device_id,
                    "send queue closed, dropping frame"
                );
                false
            }
        }
    }

    /// 触发关闭信号；边沿触发且幂等，重复关闭安全
    pub fn close(&self) {
        self.close_tx.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.close_tx.borrow()
    }

    /// 订阅关闭信号，worker 在 select 中等待
    pub fn close_signal(&self) -> watch::Receiver<bool> {
        self.close_tx.subscribe()
    }

    /// 刷新活跃时间
    pub fn touch(&self) {
        self.last_active.store(unix_now_millis(), Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let idle_millis = unix_now_millis() - self.last_active.load(Ordering::Relaxed);
        Duration::from_millis(idle_millis.max(0) as u64)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&self, by: Duration) {
        self.last_active
            .store(unix_now_millis() - by.as_millis() as i64, Ordering::Relaxed);
    }
}
