use log::debug;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// 进程内的“某主机刚刚成功完成一次请求”广播
///
/// 重试包装任务在等待期间订阅，任何同主机的成功都会提前唤醒它。
#[derive(Debug, Clone)]
pub struct SuccessNotifier {
    tx: broadcast::Sender<String>,
}

impl SuccessNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, host: &str) {
        // 没有订阅者时发送失败，忽略即可
        let receivers = self.tx.send(host.to_ascii_lowercase()).unwrap_or(0);
        debug!("主机 {} 请求成功，通知 {} 个订阅者", host, receivers);
    }

    pub fn subscribe(&self) -> BroadcastStream<String> {
        BroadcastStream::new(self.tx.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for SuccessNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_subscribers_receive_hosts() {
        let notifier = SuccessNotifier::default();
        let mut stream = notifier.subscribe();
        assert_eq!(notifier.subscriber_count(), 1);

        notifier.publish("Photos.Example.com");
        let host = stream.next().await.unwrap().unwrap();
        assert_eq!(host, "photos.example.com");

        drop(stream);
        assert_eq!(notifier.subscriber_count(), 0);
        notifier.publish("example.com");
    }

    #[test]
    fn test_stream_pending_until_publish() {
        let notifier = SuccessNotifier::default();
        let mut stream = tokio_test::task::spawn(notifier.subscribe());
        tokio_test::assert_pending!(stream.poll_next());

        notifier.publish("example.com");
        assert!(stream.is_woken());
        let host = tokio_test::assert_ready!(stream.poll_next());
        assert_eq!(host.unwrap().unwrap(), "example.com");
    }
}
