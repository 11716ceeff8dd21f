//! 活动时钟：记录最后一次前台交互，并持有当前周期的取消令牌
//!
//! 任何前台事件调用 mark_activity()：刷新时钟，同时取消正在运行的周期（执行器在步骤边界看到后停止）。
//! 时钟使用 tokio::time::Instant，测试中可用暂停时间推进。

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug)]
pub struct ActivityMonitor {
    last_activity: Mutex<Instant>,
    cycle: Mutex<Option<CancellationToken>>,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self {
            last_activity: Mutex::new(Instant::now()),
            cycle: Mutex::new(None),
        }
    }

    /// 前台活动：刷新时钟并打断正在运行的周期
    pub fn mark_activity(&self) {
        *self.last_activity.lock() = Instant::now();
        if let Some(token) = self.cycle.lock().as_ref() {
            if !token.is_cancelled() {
                tracing::info!("foreground activity, interrupting cycle");
                token.cancel();
            }
        }
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        self.idle_for() >= threshold
    }

    /// 周期开始：返回 parent 的子令牌，前台活动或 parent 取消都会触发它
    pub fn begin_cycle(&self, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        *self.cycle.lock() = Some(token.clone());
        token
    }

    /// 周期结束：丢弃令牌并重置时钟，避免周期背靠背触发
    pub fn end_cycle(&self) {
        self.cycle.lock().take();
        *self.last_activity.lock() = Instant::now();
    }

    pub fn cycle_active(&self) -> bool {
        self.cycle.lock().is_some()
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
