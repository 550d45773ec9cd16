use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 任务标识
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // 日志里只显示前 8 位
        let s = self.0.simple().to_string();
        f.write_str(&s[..8])
    }
}

/// 协作任务的生命周期状态，只能单调前进
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskState {
    Idle,
    Running,
    Finished,
}

impl TaskState {
    /// 前进到下一个状态；不允许回退或跳过 Running
    pub fn advance(&mut self, next: TaskState) -> bool {
        let allowed = matches!(
            (*self, next),
            (TaskState::Idle, TaskState::Running) | (TaskState::Running, TaskState::Finished)
        );
        if allowed {
            *self = next;
        }
        allowed
    }
}

/// 重试包装任务的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryState {
    NotStarted,
    Fetching,
    WaitingToRetry,
    Retrying,
    Finished,
}

impl RetryState {
    /// 面向用户的状态文本
    pub fn label(&self) -> &'static str {
        match self {
            RetryState::NotStarted => "等待开始",
            RetryState::Fetching => "获取中",
            RetryState::WaitingToRetry => "等待重试",
            RetryState::Retrying => "重试中",
            RetryState::Finished => "已完成",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_is_monotonic() {
        let mut state = TaskState::Idle;
        assert!(!state.advance(TaskState::Finished));
        assert_eq!(state, TaskState::Idle);

        assert!(state.advance(TaskState::Running));
        assert!(!state.advance(TaskState::Idle));
        assert!(!state.advance(TaskState::Running));

        assert!(state.advance(TaskState::Finished));
        assert!(!state.advance(TaskState::Running));
        assert_eq!(state, TaskState::Finished);
    }

    #[test]
    fn test_task_id_display_is_short() {
        let id = TaskId::new();
        assert_eq!(id.to_string().len(), 8);
        assert_ne!(id, TaskId::new());
    }
}
