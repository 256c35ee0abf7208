use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use hca_domain::{Delivery, Message, MessageQueue, QueueDepth, ReceiptHandle};
use hca_errors::{PipelineError, PipelineResult};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, warn};
use uuid::Uuid;

/// 内存消息队列实现
///
/// 语义与云端队列一致：至少一次投递，接收后的消息在可见性超时内对其他
/// 消费者隐藏，超时未确认则重新可见。适用于嵌入式部署和测试。
#[derive(Debug)]
pub struct InMemoryMessageQueue {
    queues: Mutex<HashMap<String, QueueState>>,
    visibility_timeout: Duration,
    notify: Notify,
}

#[derive(Debug, Default)]
struct QueueState {
    visible: VecDeque<StoredMessage>,
    in_flight: HashMap<String, InFlight>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    message: StoredMessage,
    visible_at: Instant,
}

impl QueueState {
    /// 把可见性超时已过的消息放回可见队列
    fn requeue_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(entry) = self.in_flight.remove(&receipt) {
                debug!("消息可见性超时，重新入队 (receipt: {})", receipt);
                self.visible.push_back(entry.message);
            }
        }
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|entry| entry.visible_at).min()
    }
}

impl InMemoryMessageQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout,
            notify: Notify::new(),
        }
    }

    /// 直接写入原始消息体，用于模拟无法解码的消息
    pub async fn enqueue_raw(&self, queue: &str, body: Vec<u8>) {
        let mut queues = self.queues.lock().await;
        queues
            .entry(queue.to_string())
            .or_default()
            .visible
            .push_back(StoredMessage {
                body,
                receive_count: 0,
            });
        drop(queues);
        self.notify.notify_waiters();
    }

    /// 取出一条可见消息并标记为处理中；无法解码的消息直接丢弃
    async fn try_take(&self, queue: &str) -> Option<Delivery> {
        let now = Instant::now();
        let mut queues = self.queues.lock().await;
        let state = queues.entry(queue.to_string()).or_default();
        state.requeue_expired(now);

        while let Some(mut stored) = state.visible.pop_front() {
            stored.receive_count += 1;
            let message = match Message::deserialize(&stored.body) {
                Ok(message) => message,
                Err(e) => {
                    error!("队列 {} 中的消息无法解码，已丢弃: {}", queue, e);
                    continue;
                }
            };

            let receipt = Uuid::new_v4().to_string();
            let receive_count = stored.receive_count;
            state.in_flight.insert(
                receipt.clone(),
                InFlight {
                    message: stored,
                    visible_at: now + self.visibility_timeout,
                },
            );
            return Some(Delivery {
                message,
                receipt: ReceiptHandle::new(receipt),
                receive_count,
            });
        }
        None
    }
}

#[async_trait]
impl MessageQueue for InMemoryMessageQueue {
    async fn enqueue(&self, queue: &str, message: &Message) -> PipelineResult<()> {
        let body = message.serialize()?;
        self.enqueue_raw(queue, body).await;
        debug!("消息 {} 已发布到队列: {}", message.id, queue);
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> PipelineResult<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take(queue).await {
                return Ok(Some(delivery));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = {
                let queues = self.queues.lock().await;
                queues
                    .get(queue)
                    .and_then(QueueState::next_expiry)
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn acknowledge(&self, queue: &str, receipt: &ReceiptHandle) -> PipelineResult<()> {
        let mut queues = self.queues.lock().await;
        let removed = queues
            .get_mut(queue)
            .and_then(|state| state.in_flight.remove(receipt.as_str()));
        if removed.is_none() {
            // 可见性超时后消息已重新投递，旧回执失效
            warn!("队列 {} 中找不到回执 {}，确认被忽略", queue, receipt);
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> PipelineResult<()> {
        let mut queues = self.queues.lock().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| PipelineError::queue_error(format!("队列 {queue} 不存在")))?;

        if timeout.is_zero() {
            let entry = state.in_flight.remove(receipt.as_str()).ok_or_else(|| {
                PipelineError::queue_error(format!("无效的回执句柄: {receipt}"))
            })?;
            state.visible.push_back(entry.message);
            drop(queues);
            self.notify.notify_waiters();
            debug!("消息已归还到队列 {}", queue);
            return Ok(());
        }

        let entry = state
            .in_flight
            .get_mut(receipt.as_str())
            .ok_or_else(|| PipelineError::queue_error(format!("无效的回执句柄: {receipt}")))?;
        entry.visible_at = Instant::now() + timeout;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> PipelineResult<QueueDepth> {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(queue) else {
            return Ok(QueueDepth::default());
        };
        state.requeue_expired(Instant::now());
        Ok(QueueDepth {
            visible: state.visible.len() as u64,
            in_flight: state.in_flight.len() as u64,
        })
    }
}
