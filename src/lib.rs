pub mod cli;
pub mod config;
pub mod core;
pub mod gallery;
pub mod ui;
pub mod utils;

pub use crate::core::{QueueClass, TaskError, TaskManager};

/// 构建时间，由 build.rs 生成
pub const BUILD_TIMESTAMP: &str = env!("VERGEN_BUILD_TIMESTAMP");
