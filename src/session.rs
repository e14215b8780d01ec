//! # 捕获会话 (Capture Session)
//!
//! 把一个传输、它的交接队列和一个帧存储连接起来。
//!
//! ## 设计理念
//!
//! - **每会话一个存储**：没有全局单例，存储以 `Arc` 句柄交给生产方和消费方
//! - **定时泵送**：后台任务按固定间隔把队列中的帧一次性取出并入库，
//!   每次泵送只取一次存储锁
//! - **时钟映射在传输层**：传输按连接锁存偏移并逐帧映射到主机时间线，
//!   泵送只搬运帧，重连不会改写已入库帧的显示时间

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::CaptureConfig;
use crate::error::Result;
use crate::frame::CanFrame;
use crate::frame_queue::FrameQueue;
use crate::frame_store::{FrameStore, StoreStats};
use crate::label::{CanOpenLabels, DbcLabelResolver, FunctionLabelResolver};
use crate::mqtt_bus::MqttBus;
use crate::performance::record_pump_duration;
use crate::transport::{CanTransport, TransportStats};

/// 会话统计快照
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub transport: TransportStats,
    pub store: StoreStats,
    pub pumps: u64,
}

impl SessionStats {
    pub fn print_summary(&self) {
        info!("📊 捕获会话统计 (泵送 {} 次)", self.pumps);
        self.transport.print_summary();
        self.store.print_summary();
    }
}

struct Pump {
    queue: Arc<FrameQueue>,
    buffer: Vec<CanFrame>,
    pumps: u64,
}

impl Pump {
    fn run_once(&mut self, store: &FrameStore) -> usize {
        let started = Instant::now();
        self.buffer.clear();
        let drained = self.queue.drain_into(&mut self.buffer);

        if drained > 0 {
            trace!("泵送 {} 帧", drained);
            store.add_frames(&self.buffer);
        }
        self.pumps += 1;
        record_pump_duration(started.elapsed());
        drained
    }
}

/// 捕获会话
pub struct CaptureSession {
    store: Arc<FrameStore>,
    transport: Arc<dyn CanTransport>,
    pump: Arc<Mutex<Pump>>,
    pump_interval: Duration,
    shutdown: watch::Sender<bool>,
    pump_task: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureSession {
    pub fn new(
        store: Arc<FrameStore>,
        transport: Arc<dyn CanTransport>,
        pump_interval: Duration,
    ) -> Self {
        let queue = transport.queue();
        let capacity = queue.capacity();
        let (shutdown, _) = watch::channel(false);
        Self {
            store,
            transport,
            pump: Arc::new(Mutex::new(Pump {
                queue,
                buffer: Vec::with_capacity(capacity),
                pumps: 0,
            })),
            pump_interval: pump_interval.max(Duration::from_millis(1)),
            shutdown,
            pump_task: Mutex::new(None),
        }
    }

    /// 按配置组装MQTT会话：选择标签解析器，合并启动过滤文件
    pub fn from_config(config: &CaptureConfig) -> Result<Self> {
        config.validate()?;

        let resolver: Arc<dyn FunctionLabelResolver> = match &config.dbc_file {
            Some(path) => Arc::new(DbcLabelResolver::from_file(path)?),
            None => Arc::new(CanOpenLabels),
        };
        let store = Arc::new(FrameStore::new(config.store.clone()).with_resolver(resolver));
        if let Some(path) = &config.filter_file {
            load_startup_filters(&store, path)?;
        }

        let transport: Arc<dyn CanTransport> = Arc::new(MqttBus::new(config.mqtt.clone()));
        Ok(Self::new(
            store,
            transport,
            Duration::from_millis(config.pump_interval_ms),
        ))
    }

    pub fn store(&self) -> &Arc<FrameStore> {
        &self.store
    }

    pub fn transport(&self) -> &Arc<dyn CanTransport> {
        &self.transport
    }

    /// 启动传输并开始后台泵送
    pub async fn start(&self) -> Result<()> {
        self.transport.start().await?;
        self.spawn_pump();
        info!("🚀 捕获会话已启动: {}", self.transport.name());
        Ok(())
    }

    /// 只启动后台泵送（传输由调用方单独驱动）
    pub fn spawn_pump(&self) {
        let mut slot = self
            .pump_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_some() {
            return;
        }
        self.shutdown.send_replace(false);

        let pump = Arc::clone(&self.pump);
        let store = Arc::clone(&self.store);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.pump_interval;

        *slot = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        pump.lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .run_once(&store);
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("泵送任务退出");
        }));
    }

    /// 立即泵送一次，返回入库帧数
    pub fn pump_once(&self) -> usize {
        self.pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .run_once(&self.store)
    }

    /// 停止泵送，取走剩余帧后断开传输
    pub async fn stop(&self) -> Result<()> {
        self.shutdown.send_replace(true);
        let task = self
            .pump_task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("泵送任务异常结束: {}", e);
            }
        }
        self.pump_once();
        self.transport.stop().await?;
        info!("🛑 捕获会话已停止");
        Ok(())
    }

    /// 暂停/恢复接收
    pub fn suspend(&self, suspended: bool) {
        self.transport.suspend(suspended);
    }

    /// 清空队列和存储，开始新的捕获
    pub fn clear(&self) {
        self.transport.queue().flush();
        self.store.clear();
    }

    pub fn stats(&self) -> SessionStats {
        let pumps = self
            .pump
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pumps;
        SessionStats {
            transport: self.transport.stats(),
            store: self.store.stats(),
            pumps,
        }
    }
}

fn load_startup_filters(store: &FrameStore, path: &Path) -> Result<()> {
    let report = store.load_filter_file(path)?;
    if report.skipped > 0 {
        warn!("过滤文件中有 {} 行无法解析: {:?}", report.skipped, path);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_store::StoreConfig;
    use crate::mqtt_bus::MqttBusConfig;
    use crate::wire_codec::WireMessage;

    fn session() -> CaptureSession {
        let store = Arc::new(FrameStore::new(StoreConfig::default()));
        let transport: Arc<dyn CanTransport> = Arc::new(MqttBus::new(MqttBusConfig {
            queue_capacity: 16,
            ..MqttBusConfig::default()
        }));
        CaptureSession::new(store, transport, Duration::from_millis(5))
    }

    fn deliver(session: &CaptureSession, id: u32, timestamp: u64) {
        let bytes = WireMessage {
            timestamp,
            flags: 0,
            payload: &[0xAA],
        }
        .to_vec();
        session
            .transport()
            .on_message_received(&format!("can0/{}", id), &bytes);
    }

    #[test]
    fn test_pump_moves_frames_into_store() {
        let session = session();
        deliver(&session, 0x181, 1_000);
        deliver(&session, 0x182, 1_250);
        assert_eq!(session.pump_once(), 2);
        assert_eq!(session.store().total_frame_count(), 2);
        assert!(session.transport().queue().is_empty());

        let store = session.store();
        let frames = store.frames().to_vec();
        assert_eq!(store.display_timestamp(&frames[0]), 0);
        assert_eq!(store.display_timestamp(&frames[1]), 250);

        // 入库值已在传输层映射到主机时间线
        let offset = session.transport().clock_offset().unwrap();
        assert_eq!(frames[0].timestamp, 1_000u64.saturating_add_signed(offset));
        assert_eq!(store.time_basis().device_to_host_offset(), 0);
    }

    #[test]
    fn test_clear_flushes_queue_and_store() {
        let session = session();
        deliver(&session, 0x1, 0);
        session.pump_once();
        deliver(&session, 0x2, 1);
        session.clear();
        assert_eq!(session.pump_once(), 0);
        assert_eq!(session.store().total_frame_count(), 0);
    }

    #[tokio::test]
    async fn test_background_pump() {
        let session = session();
        session.spawn_pump();
        deliver(&session, 0x181, 10);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.store().total_frame_count(), 1);

        session.stop().await.unwrap();
        let stats = session.stats();
        assert!(stats.pumps >= 2);
        assert_eq!(stats.transport.frames_received, 1);
    }
}
