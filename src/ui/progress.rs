use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};

use crate::core::task::retrying::RetryStatus;
use crate::core::task::state::RetryState;

/// 重试状态对应的显示文字
pub fn status_label(status: &RetryStatus) -> &'static str {
    match status.state {
        RetryState::NotStarted => "排队中",
        RetryState::Fetching if status.has_had_retryable_failure => "重试中",
        RetryState::Fetching => "获取中",
        RetryState::WaitingToRetry => "等待重试",
        RetryState::Retrying => "重试中",
        RetryState::Finished => "结束",
    }
}

// 结构体：ProgressManager
// 每个传输一个旋转指示器，顶部一行显示网络是否繁忙
pub struct ProgressManager {
    multi: MultiProgress,
    network: ProgressBar,
    progress_bars: Arc<Mutex<Vec<ProgressBar>>>,
}

impl ProgressManager {
    pub fn new() -> Self {
        let multi = MultiProgress::new();
        let network = multi.add(ProgressBar::new_spinner());
        network.set_message("网络空闲");
        ProgressManager {
            multi,
            network,
            progress_bars: Arc::new(Mutex::new(Vec::new())),
        }
    }

    fn spinner_style() -> ProgressStyle {
        ProgressStyle::with_template("{spinner} {prefix} {wide_msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
    }

    /// 添加一个传输指示器，返回索引
    pub async fn add_transfer(&self, label: &str) -> usize {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(Self::spinner_style());
        pb.set_prefix(label.to_string());
        pb.set_message(status_label(&RetryStatus::default()));
        pb.enable_steady_tick(Duration::from_millis(120));
        let mut bars = self.progress_bars.lock().await;
        bars.push(pb);
        bars.len() - 1
    }

    pub async fn update_status(&self, index: usize, status: RetryStatus) {
        if let Some(pb) = self.progress_bars.lock().await.get(index) {
            pb.set_message(status_label(&status));
        }
    }

    pub async fn finish_transfer(&self, index: usize, message: String) {
        if let Some(pb) = self.progress_bars.lock().await.get(index) {
            pb.finish_with_message(message);
        }
    }

    pub async fn message(&self, index: usize) -> Option<String> {
        self.progress_bars.lock().await.get(index).map(|pb| pb.message())
    }

    pub fn set_network_in_use(&self, busy: bool) {
        if busy {
            self.network.enable_steady_tick(Duration::from_millis(120));
            self.network.set_message("网络使用中");
        } else {
            self.network.disable_steady_tick();
            self.network.set_message("网络空闲");
        }
    }

    pub fn finish(&self) {
        self.network.finish_and_clear();
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}
