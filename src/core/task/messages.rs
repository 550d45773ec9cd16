use actix::Message;

use super::http::HttpOutcome;
use super::reachability::ReachabilityOutcome;
use super::state::TaskId;

/// 取消任务；可从任意线程发送，在任务自己的事件循环上生效
pub struct CancelTask;
impl Message for CancelTask { type Result = (); }

/// 某次传输尝试结束（重试包装任务内部使用）
pub struct AttemptFinished {
    pub task_id: TaskId,
    pub outcome: HttpOutcome,
}
impl Message for AttemptFinished { type Result = (); }

/// 可达性监视任务结束（重试包装任务内部使用）
pub struct ReachabilityFinished {
    pub task_id: TaskId,
    pub outcome: ReachabilityOutcome,
}
impl Message for ReachabilityFinished { type Result = (); }
