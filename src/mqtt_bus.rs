//! # MQTT总线 (MQTT Bus)
//!
//! 通过MQTT代理收发CAN帧的网络传输。
//!
//! ## 主题约定
//!
//! - 入站：订阅 `<topic>/+`，最后一段是十进制帧标识符
//! - 出站：发布到 `<topic>/s/<标识符>`
//! - 报文体为 `wire_codec` 定义的二进制布局
//!
//! ## 接收路径
//!
//! 事件循环任务收到报文后直接调用 `on_message_received()`：
//! 解析主题 → 解码 → 时间戳映射到主机时间线 → 非阻塞认领队列槽位 → 原地写入 → 发布。
//! 任何一步失败都只计数，不向上传播，也不等待消费方。
//!
//! ## 连接生命周期
//!
//! 事件循环出错或代理拒绝连接时释放客户端并退出，调用方可以再次 `start()`。
//! `stop()` 等待DISCONNECT真正发出后再结束事件循环。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rand::distributions::Alphanumeric;
use rand::{Rng, thread_rng};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{CaptureError, Result};
use crate::frame::CanFrame;
use crate::frame_queue::FrameQueue;
use crate::performance::{DECODE_ERRORS, FRAMES_RECEIVED, FRAMES_SENT};
use crate::time_basis::host_micros;
use crate::transport::{
    CanTransport, ClockBasis, ConnectionState, ConnectionStatus, StatusChannel, TransportCounters,
    TransportStats,
};
use crate::wire_codec::{WireMessage, encode_frame};

/// `stop()` 等待DISCONNECT发出的时限
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// MQTT总线配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttBusConfig {
    /// 代理地址
    pub host: String,
    /// 代理端口
    pub port: u16,
    /// 总线主题前缀
    pub topic: String,
    pub user: String,
    pub password: String,
    /// 该传输的总线序号
    pub bus: u8,
    /// 交接队列容量
    pub queue_capacity: usize,
    /// 心跳间隔（秒）
    pub keep_alive_secs: u64,
    /// 等待连接确认的超时（秒）
    pub connect_timeout_secs: u64,
    /// 随机客户端ID长度
    pub client_id_len: usize,
    /// 客户端请求通道容量
    pub request_capacity: usize,
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            host: "api.savvycan.com".to_string(),
            port: 8333,
            topic: "can0".to_string(),
            user: "Anonymous".to_string(),
            password: String::new(),
            bus: 0,
            queue_capacity: 4000,
            keep_alive_secs: 30,
            connect_timeout_secs: 10,
            client_id_len: 12,
            request_capacity: 64,
        }
    }
}

/// 生成随机客户端ID
///
/// 同一代理上的两个客户端ID不能相同，不需要跨运行稳定。
pub fn random_client_id(len: usize) -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len.max(1))
        .map(char::from)
        .collect()
}

/// 从入站主题的最后一段解析帧标识符
pub fn parse_topic_id(topic: &str) -> Result<u32> {
    topic
        .rsplit('/')
        .next()
        .and_then(|segment| segment.trim().parse::<u32>().ok())
        .ok_or_else(|| CaptureError::InvalidTopic(topic.to_string()))
}

/// 出站主题
pub fn outbound_topic(topic: &str, id: u32) -> String {
    format!("{}/s/{}", topic, id)
}

struct MqttInner {
    config: MqttBusConfig,
    client_id: String,
    client: Mutex<Option<AsyncClient>>,
    event_task: Mutex<Option<JoinHandle<()>>>,
    queue: Arc<FrameQueue>,
    suspended: AtomicBool,
    status: StatusChannel,
    clock: ClockBasis,
    counters: TransportCounters,
}

impl MqttInner {
    fn client(&self) -> Option<AsyncClient> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn take_client(&self) -> Option<AsyncClient> {
        self.client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn take_event_task(&self) -> Option<JoinHandle<()>> {
        self.event_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn abort_event_task(&self) {
        if let Some(task) = self.take_event_task() {
            task.abort();
        }
    }

    /// 连接结束：先释放客户端再广播状态，观察到 `Disconnected` 时即可重新启动
    fn connection_lost(&self, diagnostic: String) {
        self.take_client();
        self.status.set(ConnectionState::Disconnected, Some(diagnostic));
    }

    fn count_decode_error(&self) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
        counter!(DECODE_ERRORS).increment(1);
    }

    fn handle_message(&self, topic: &str, payload: &[u8]) {
        if self.suspended.load(Ordering::Acquire) {
            self.counters.suspended_drops.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let id = match parse_topic_id(topic) {
            Ok(id) => id,
            Err(e) => {
                debug!("丢弃报文: {}", e);
                self.count_decode_error();
                return;
            }
        };
        let message = match WireMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("丢弃报文 {}: {}", topic, e);
                self.count_decode_error();
                return;
            }
        };

        let timestamp = self.clock.to_host(message.timestamp, host_micros());

        // 队列满时由队列自身计数
        let Some(mut claim) = self.queue.try_claim() else {
            trace!("交接队列已满，丢弃帧 0x{:X}", id);
            return;
        };
        {
            let mut slot = claim.frame_mut();
            if let Err(e) = message.write_frame(id, self.config.bus, &mut slot) {
                debug!("帧写入失败 0x{:X}: {}", id, e);
                self.count_decode_error();
                return;
            }
            slot.timestamp = timestamp;
        }
        if claim.publish() {
            self.counters.frames_received.fetch_add(1, Ordering::Relaxed);
            counter!(FRAMES_RECEIVED).increment(1);
        }
    }
}

/// 事件循环：处理连接确认和入站报文，出错或发出DISCONNECT后退出
async fn run_event_loop(inner: Arc<MqttInner>, mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    let state = if inner.suspended.load(Ordering::Acquire) {
                        ConnectionState::Suspended
                    } else {
                        ConnectionState::Connected
                    };
                    inner.status.set(state, None);
                } else {
                    inner.connection_lost(format!("代理拒绝连接: {:?}", ack.code));
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                inner.handle_message(&publish.topic, &publish.payload);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("DISCONNECT已发出");
                break;
            }
            Ok(notification) => {
                trace!("MQTT事件: {:?}", notification);
            }
            Err(e) => {
                error!("MQTT连接错误: {:?}", e);
                inner.connection_lost(e.to_string());
                break;
            }
        }
    }
}

/// MQTT总线传输
#[derive(Clone)]
pub struct MqttBus {
    inner: Arc<MqttInner>,
}

impl MqttBus {
    pub fn new(config: MqttBusConfig) -> Self {
        let client_id = random_client_id(config.client_id_len);
        let queue = Arc::new(FrameQueue::new(config.queue_capacity));
        debug!("创建MQTT总线: 主题={}, 客户端ID={}", config.topic, client_id);

        Self {
            inner: Arc::new(MqttInner {
                config,
                client_id,
                client: Mutex::new(None),
                event_task: Mutex::new(None),
                queue,
                suspended: AtomicBool::new(false),
                status: StatusChannel::new(1),
                clock: ClockBasis::new(),
                counters: TransportCounters::default(),
            }),
        }
    }

    pub fn config(&self) -> &MqttBusConfig {
        &self.inner.config
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    /// 当前状态（含诊断信息）
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.current()
    }

    fn options(&self) -> MqttOptions {
        let config = &self.inner.config;
        let mut options = MqttOptions::new(&self.inner.client_id, &config.host, config.port);
        if !config.user.is_empty() {
            options.set_credentials(&config.user, &config.password);
        }
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);
        options
    }
}

#[async_trait]
impl CanTransport for MqttBus {
    fn name(&self) -> &str {
        &self.inner.config.topic
    }

    async fn start(&self) -> Result<()> {
        if self.inner.client().is_some() {
            debug!("MQTT总线已启动");
            return Ok(());
        }
        let config = &self.inner.config;
        info!("🚀 连接MQTT代理 {}:{} (主题 {})", config.host, config.port, config.topic);

        self.inner.clock.reset();
        self.inner.status.set(ConnectionState::Connecting, None);

        let (client, eventloop) = AsyncClient::new(self.options(), config.request_capacity.max(1));
        // 订阅请求先入队，连接建立后由事件循环发出
        if let Err(e) = client
            .subscribe(format!("{}/+", config.topic), QoS::AtMostOnce)
            .await
        {
            self.inner
                .status
                .set(ConnectionState::Disconnected, Some(e.to_string()));
            return Err(e.into());
        }

        // 上一次连接的事件循环已退出，这里只回收句柄
        self.inner.abort_event_task();
        let mut status_rx = self.inner.status.subscribe();
        *self
            .inner
            .client
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(client);
        let task = tokio::spawn(run_event_loop(Arc::clone(&self.inner), eventloop));
        *self
            .inner
            .event_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(task);

        let timeout = Duration::from_secs(config.connect_timeout_secs.max(1));
        let outcome = tokio::time::timeout(
            timeout,
            status_rx.wait_for(|status| status.state != ConnectionState::Connecting),
        )
        .await;

        let status = match outcome {
            Ok(Ok(status)) => status.clone(),
            Ok(Err(_)) => ConnectionStatus::default(),
            Err(_) => ConnectionStatus {
                diagnostic: Some(format!("{}秒内未收到连接确认", timeout.as_secs())),
                ..ConnectionStatus::default()
            },
        };

        match status.state {
            ConnectionState::Connected | ConnectionState::Suspended => {
                info!("✅ MQTT已连接, 客户端ID: {}", self.inner.client_id);
                Ok(())
            }
            _ => {
                self.inner.abort_event_task();
                self.inner.take_client();
                let reason = status
                    .diagnostic
                    .unwrap_or_else(|| "连接中断".to_string());
                self.inner
                    .status
                    .set(ConnectionState::Disconnected, Some(reason.clone()));
                Err(CaptureError::ConnectionFailed(reason))
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        let task = self.inner.take_event_task();
        if let Some(client) = self.inner.take_client() {
            if let Err(e) = client.disconnect().await {
                warn!("断开MQTT连接时出错: {:?}", e);
            }
        }
        if let Some(mut task) = task {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
                warn!("等待DISCONNECT发出超时，强制结束事件循环");
                task.abort();
            }
        }
        let flushed = self.inner.queue.flush();
        self.inner.status.set(ConnectionState::Disconnected, None);
        info!("🛑 MQTT总线已停止, 清空 {} 帧", flushed);
        Ok(())
    }

    fn suspend(&self, suspended: bool) {
        let was = self.inner.suspended.swap(suspended, Ordering::AcqRel);
        if suspended {
            let flushed = self.inner.queue.flush();
            debug!("暂停接收, 清空 {} 帧", flushed);
        }
        if was == suspended {
            return;
        }
        match (self.inner.status.state(), suspended) {
            (ConnectionState::Connected, true) => {
                self.inner.status.set(ConnectionState::Suspended, None)
            }
            (ConnectionState::Suspended, false) => {
                self.inner.status.set(ConnectionState::Connected, None)
            }
            _ => {}
        }
    }

    async fn send_frame(&self, frame: &CanFrame) -> Result<bool> {
        if frame.is_error() {
            self.inner
                .counters
                .error_frames_skipped
                .fetch_add(1, Ordering::Relaxed);
            return Ok(true);
        }
        let client = self.inner.client().ok_or(CaptureError::NotConnected)?;
        let topic = outbound_topic(&self.inner.config.topic, frame.frame_id());
        let payload = encode_frame(frame, host_micros());
        client.publish(topic, QoS::AtMostOnce, false, payload).await?;

        self.inner.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
        counter!(FRAMES_SENT).increment(1);
        Ok(true)
    }

    fn on_message_received(&self, topic: &str, payload: &[u8]) {
        self.inner.handle_message(topic, payload);
    }

    fn state(&self) -> ConnectionState {
        self.inner.status.state()
    }

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    fn queue(&self) -> Arc<FrameQueue> {
        Arc::clone(&self.inner.queue)
    }

    fn clock_offset(&self) -> Option<i64> {
        self.inner.clock.offset()
    }

    fn stats(&self) -> TransportStats {
        TransportStats::from_counters(&self.inner.counters, self.inner.queue.stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{Direction, ERROR_FRAME_FLAG};
    use crate::wire_codec::{FLAG_ERROR, FLAG_EXTENDED};

    fn bus(capacity: usize) -> MqttBus {
        MqttBus::new(MqttBusConfig {
            queue_capacity: capacity,
            bus: 2,
            ..MqttBusConfig::default()
        })
    }

    fn message(timestamp: u64, flags: u8, payload: &[u8]) -> Vec<u8> {
        WireMessage {
            timestamp,
            flags,
            payload,
        }
        .to_vec()
    }

    #[test]
    fn test_random_client_id() {
        let a = random_client_id(12);
        let b = random_client_id(12);
        assert_eq!(a.len(), 12);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(a, b);
    }

    #[test]
    fn test_parse_topic_id() {
        assert_eq!(parse_topic_id("can0/385").unwrap(), 385);
        assert_eq!(parse_topic_id("site/can0/1793").unwrap(), 1793);
        assert!(matches!(
            parse_topic_id("can0/abc"),
            Err(CaptureError::InvalidTopic(_))
        ));
        assert!(parse_topic_id("can0/").is_err());
        assert_eq!(outbound_topic("can0", 385), "can0/s/385");
    }

    #[test]
    fn test_receive_path_publishes_frame() {
        let bus = bus(8);
        bus.on_message_received("can0/385", &message(1_000, FLAG_EXTENDED, &[1, 2, 3]));

        let mut out = Vec::new();
        assert_eq!(bus.queue().drain_into(&mut out), 1);
        let frame = out[0];
        assert_eq!(frame.id, 385);
        assert!(frame.extended);
        assert_eq!(frame.bus, 2);
        assert_eq!(frame.direction, Direction::Received);
        assert_eq!(frame.payload(), &[1, 2, 3]);
        assert_eq!(bus.stats().frames_received, 1);

        // 设备时间戳按锁存的偏移映射到主机时间线
        let offset = bus.clock_offset().unwrap();
        assert_eq!(frame.timestamp, 1_000u64.saturating_add_signed(offset));
    }

    #[test]
    fn test_receive_path_keeps_device_spacing() {
        let bus = bus(8);
        bus.on_message_received("can0/1", &message(50_000_000, 0, &[]));
        bus.on_message_received("can0/1", &message(50_000_250, 0, &[]));
        let mut out = Vec::new();
        bus.queue().drain_into(&mut out);
        assert_eq!(out[1].timestamp - out[0].timestamp, 250);
    }

    #[test]
    fn test_error_flag_marks_identifier() {
        let bus = bus(4);
        bus.on_message_received("can0/16", &message(0, FLAG_ERROR, &[]));
        let mut out = Vec::new();
        bus.queue().drain_into(&mut out);
        assert_eq!(out[0].id, 16 | ERROR_FRAME_FLAG);
        assert!(out[0].is_error());
    }

    #[test]
    fn test_malformed_input_is_counted() {
        let bus = bus(4);
        bus.on_message_received("can0/1", &[0u8; 5]);
        bus.on_message_received("can0/xyz", &message(0, 0, &[]));
        bus.on_message_received("can0/1", &message(0, 0, &[0u8; 65]));
        assert_eq!(bus.stats().decode_errors, 3);
        assert!(bus.queue().is_empty());
        assert_eq!(bus.clock_offset(), None);
    }

    #[test]
    fn test_queue_exhaustion_drops_without_blocking() {
        let bus = bus(2);
        for i in 0..10u64 {
            bus.on_message_received("can0/1", &message(i, 0, &[i as u8]));
        }
        let stats = bus.stats();
        assert_eq!(stats.frames_received, 2);
        assert_eq!(stats.queue.dropped, 8);
    }

    #[test]
    fn test_suspend_drops_and_flushes() {
        let bus = bus(8);
        bus.on_message_received("can0/1", &message(0, 0, &[]));
        bus.suspend(true);
        assert!(bus.queue().is_empty());
        bus.on_message_received("can0/1", &message(1, 0, &[]));
        assert!(bus.queue().is_empty());
        assert_eq!(bus.stats().suspended_drops, 1);

        bus.suspend(false);
        bus.on_message_received("can0/1", &message(2, 0, &[]));
        assert_eq!(bus.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let bus = bus(4);
        let frame = CanFrame::new(0x181, &[1]).unwrap();
        assert!(matches!(
            bus.send_frame(&frame).await,
            Err(CaptureError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_error_frames_are_never_sent() {
        let bus = bus(4);
        let mut frame = CanFrame::new(0x10, &[]).unwrap();
        frame.id |= ERROR_FRAME_FLAG;
        assert!(bus.send_frame(&frame).await.unwrap());
        let stats = bus.stats();
        assert_eq!(stats.error_frames_skipped, 1);
        assert_eq!(stats.frames_sent, 0);
    }

    #[tokio::test]
    async fn test_stop_without_start() {
        let bus = bus(4);
        bus.on_message_received("can0/1", &message(0, 0, &[]));
        bus.stop().await.unwrap();
        assert!(bus.queue().is_empty());
        assert_eq!(bus.state(), ConnectionState::Disconnected);
    }
}
