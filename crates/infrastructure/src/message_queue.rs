use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hca_config::MessageQueueConfig;
use hca_domain::{Delivery, Message, MessageQueue, QueueDepth, ReceiptHandle};
use hca_errors::{PipelineError, PipelineResult};
use lapin::{
    options::*, types::FieldTable, BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// RabbitMQ消息队列实现
///
/// 使用 `basic_get` 轮询拉取消息且不自动确认：消息在确认或归还之前
/// 由本连接持有，连接断开后由 broker 重新投递。AMQP 没有逐条消息的
/// 可见性超时，`change_visibility` 以延迟的 `basic_nack(requeue)` 实现。
pub struct RabbitMQMessageQueue {
    connection: Connection,
    channel: Mutex<Channel>,
    poll_interval: Duration,
    declared: Mutex<HashSet<String>>,
    in_flight: Arc<Mutex<HashMap<String, HashSet<u64>>>>,
}

impl RabbitMQMessageQueue {
    /// 创建新的RabbitMQ消息队列实例并声明配置中的队列
    pub async fn new(config: &MessageQueueConfig) -> PipelineResult<Self> {
        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(
            Duration::from_secs(config.connection_timeout_seconds),
            connect,
        )
        .await
        .map_err(|_| PipelineError::Timeout(format!("连接RabbitMQ超时: {}", config.url)))?
        .map_err(|e| PipelineError::queue_error(format!("连接RabbitMQ失败: {e}")))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| PipelineError::queue_error(format!("创建通道失败: {e}")))?;

        info!("成功连接到RabbitMQ: {}", config.url);

        let queue = Self {
            connection,
            channel: Mutex::new(channel),
            poll_interval: config.poll_interval(),
            declared: Mutex::new(HashSet::new()),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        };

        queue.ensure_queue(&config.dispatch_queue).await?;
        queue.ensure_queue(&config.consolidation_queue).await?;
        info!("所有队列初始化完成");

        Ok(queue)
    }

    /// 声明持久化队列（每个队列只声明一次）
    async fn ensure_queue(&self, queue_name: &str) -> PipelineResult<()> {
        let mut declared = self.declared.lock().await;
        if declared.contains(queue_name) {
            return Ok(());
        }

        let channel = self.channel.lock().await;
        channel
            .queue_declare(
                queue_name,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| PipelineError::queue_error(format!("声明队列 {queue_name} 失败: {e}")))?;

        declared.insert(queue_name.to_string());
        debug!("队列 {} 声明成功", queue_name);
        Ok(())
    }

    fn delivery_tag(receipt: &ReceiptHandle) -> PipelineResult<u64> {
        receipt
            .as_str()
            .parse::<u64>()
            .map_err(|_| PipelineError::queue_error(format!("无效的回执句柄: {receipt}")))
    }

    async fn ack_tag(&self, tag: u64) -> PipelineResult<()> {
        let channel = self.channel.lock().await;
        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| PipelineError::queue_error(format!("确认消息失败: {e}")))
    }

    /// 从持有集合中移除；已被归还（或从未持有）时返回 `false`
    async fn release(
        in_flight: &Mutex<HashMap<String, HashSet<u64>>>,
        queue: &str,
        tag: u64,
    ) -> bool {
        in_flight
            .lock()
            .await
            .get_mut(queue)
            .is_some_and(|tags| tags.remove(&tag))
    }

    async fn nack_requeue(channel: &Channel, tag: u64) -> PipelineResult<()> {
        channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: true,
                },
            )
            .await
            .map_err(|e| PipelineError::queue_error(format!("归还消息失败: {e}")))
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> PipelineResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| PipelineError::queue_error(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

#[async_trait]
impl MessageQueue for RabbitMQMessageQueue {
    async fn enqueue(&self, queue: &str, message: &Message) -> PipelineResult<()> {
        self.ensure_queue(queue).await?;
        let payload = message.serialize()?;

        let channel = self.channel.lock().await;
        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_delivery_mode(2), // 2 = persistent
            )
            .await
            .map_err(|e| PipelineError::queue_error(format!("发布消息到队列 {queue} 失败: {e}")))?;

        confirm
            .await
            .map_err(|e| PipelineError::queue_error(format!("消息发布确认失败: {e}")))?;

        debug!("消息 {} 已发布到队列: {}", message.id, queue);
        Ok(())
    }

    async fn receive(&self, queue: &str, wait: Duration) -> PipelineResult<Option<Delivery>> {
        self.ensure_queue(queue).await?;
        let deadline = Instant::now() + wait;

        loop {
            let fetched = {
                let channel = self.channel.lock().await;
                channel
                    .basic_get(queue, BasicGetOptions { no_ack: false })
                    .await
                    .map_err(|e| {
                        PipelineError::queue_error(format!("从队列 {queue} 获取消息失败: {e}"))
                    })?
            };

            match fetched {
                Some(delivery) => {
                    let tag = delivery.delivery_tag;
                    match Message::deserialize(&delivery.data) {
                        Ok(message) => {
                            self.in_flight
                                .lock()
                                .await
                                .entry(queue.to_string())
                                .or_default()
                                .insert(tag);
                            return Ok(Some(Delivery {
                                message,
                                receipt: ReceiptHandle::new(tag.to_string()),
                                receive_count: if delivery.redelivered { 2 } else { 1 },
                            }));
                        }
                        Err(e) => {
                            error!("队列 {} 中的消息无法解码，已丢弃: {}", queue, e);
                            self.ack_tag(tag).await?;
                        }
                    }
                }
                None => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
                }
            }
        }
    }

    async fn acknowledge(&self, queue: &str, receipt: &ReceiptHandle) -> PipelineResult<()> {
        let tag = Self::delivery_tag(receipt)?;
        if !Self::release(&self.in_flight, queue, tag).await {
            return Err(PipelineError::queue_error(format!(
                "消息 {tag} 已归还到队列 {queue}，无法确认"
            )));
        }
        self.ack_tag(tag).await?;
        debug!("已确认队列 {} 的消息 {}", queue, tag);
        Ok(())
    }

    async fn change_visibility(
        &self,
        queue: &str,
        receipt: &ReceiptHandle,
        timeout: Duration,
    ) -> PipelineResult<()> {
        let tag = Self::delivery_tag(receipt)?;
        if timeout.is_zero() {
            if !Self::release(&self.in_flight, queue, tag).await {
                return Err(PipelineError::queue_error(format!("无效的回执句柄: {receipt}")));
            }
            let channel = self.channel.lock().await;
            Self::nack_requeue(&channel, tag).await?;
            debug!("消息 {} 已归还到队列 {}", tag, queue);
            return Ok(());
        }

        // 到期前消息仍由本连接持有；期间被确认则不再归还
        let channel = self.channel.lock().await.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let queue = queue.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if !Self::release(&in_flight, &queue, tag).await {
                return;
            }
            match Self::nack_requeue(&channel, tag).await {
                Ok(()) => debug!("消息 {} 延迟 {:?} 后已归还到队列 {}", tag, timeout, queue),
                Err(e) => warn!("延迟归还消息 {} 失败，等待连接关闭后重新投递: {}", tag, e),
            }
        });
        Ok(())
    }

    async fn depth(&self, queue: &str) -> PipelineResult<QueueDepth> {
        let visible = {
            let channel = self.channel.lock().await;
            let info = channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| PipelineError::queue_error(format!("获取队列 {queue} 信息失败: {e}")))?;
            info.message_count() as u64
        };
        let in_flight = self
            .in_flight
            .lock()
            .await
            .get(queue)
            .map_or(0, |tags| tags.len() as u64);
        Ok(QueueDepth { visible, in_flight })
    }
}
