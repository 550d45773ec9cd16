//! Core: 协作任务、任务管理器与错误类型

pub mod error;
pub mod manager;
pub mod task;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{TaskError, TransportError, TransportErrorKind};
pub use manager::{ManagerBuilder, QueueClass, TaskManager};
