use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

use serde::{Deserialize, Serialize};

/// 组件生命周期: Idle → Starting → Running → Stopping → Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LifecycleState::Idle,
            1 => LifecycleState::Starting,
            2 => LifecycleState::Running,
            3 => LifecycleState::Stopping,
            _ => LifecycleState::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            LifecycleState::Idle => 0,
            LifecycleState::Starting => 1,
            LifecycleState::Running => 2,
            LifecycleState::Stopping => 3,
            LifecycleState::Stopped => 4,
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LifecycleState::Idle => "idle",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// 无锁的生命周期状态机, Start/Stop 幂等
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(LifecycleState::Idle.as_u8()),
        }
    }

    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifecycleState::Running
    }

    fn transition(&self, from: LifecycleState, to: LifecycleState) -> bool {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// 只有 Idle 状态能开始启动, 返回 false 表示重复调用
    pub fn begin_start(&self) -> bool {
        self.transition(LifecycleState::Idle, LifecycleState::Starting)
    }

    pub fn finish_start(&self) -> bool {
        self.transition(LifecycleState::Starting, LifecycleState::Running)
    }

    /// 返回 true 时调用方负责执行停止流程并调用 `finish_stop`
    pub fn begin_stop(&self) -> bool {
        if self.transition(LifecycleState::Running, LifecycleState::Stopping)
            || self.transition(LifecycleState::Starting, LifecycleState::Stopping)
        {
            return true;
        }
        // 从未启动的组件直接进入终态
        self.transition(LifecycleState::Idle, LifecycleState::Stopped);
        false
    }

    pub fn finish_stop(&self) {
        self.state
            .store(LifecycleState::Stopped.as_u8(), Ordering::Release);
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
