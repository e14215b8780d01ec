//! # 传输接口 (Transport Interface)
//!
//! 捕获引擎只依赖 `CanTransport` 这一能力接口，不依赖具体的总线类型。
//!
//! ## 状态机
//!
//! ```text
//! Disconnected → Connecting → Connected ⇄ Suspended
//!       ↑                          │
//!       └──────────────────────────┘
//! ```
//!
//! 连接失败以状态变化（`Disconnected` + 诊断信息）的形式上报，不做自动重连。
//! 状态通过 `tokio::sync::watch` 通道广播，订阅方总能读到最新状态。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::frame::CanFrame;
use crate::frame_queue::{FrameQueue, QueueStats};

/// 连接状态
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Suspended,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Suspended => "Suspended",
        };
        f.write_str(name)
    }
}

/// 对外上报的连接状态
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,
    /// 失败原因等诊断信息
    pub diagnostic: Option<String>,
    /// 传输提供的总线数
    pub buses: usize,
}

/// 状态广播通道
#[derive(Debug)]
pub struct StatusChannel {
    sender: watch::Sender<ConnectionStatus>,
}

impl StatusChannel {
    pub fn new(buses: usize) -> Self {
        let (sender, _) = watch::channel(ConnectionStatus {
            buses,
            ..ConnectionStatus::default()
        });
        Self { sender }
    }

    /// 切换状态；状态未变化且无诊断信息时不通知订阅方
    pub fn set(&self, state: ConnectionState, diagnostic: Option<String>) {
        let changed = self.sender.send_if_modified(|status| {
            if status.state == state && diagnostic.is_none() {
                return false;
            }
            status.state = state;
            status.diagnostic = diagnostic.clone();
            true
        });
        if changed {
            match &diagnostic {
                Some(reason) => warn!("🔌 连接状态: {} ({})", state, reason),
                None => info!("🔌 连接状态: {}", state),
            }
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.sender.borrow().state
    }

    pub fn current(&self) -> ConnectionStatus {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.sender.subscribe()
    }
}

/// 未锁存标记
const UNLATCHED: i64 = i64::MIN;

/// 设备时钟基准
///
/// 固定偏移模型：每次连接的首个解码帧到达时锁存 `主机时间 - 设备时间`，
/// 该连接上的设备时间戳在接收路径上逐帧加上偏移，映射到主机时间线。
/// 重连后重新锁存，已入库的帧不受影响。
#[derive(Debug)]
pub struct ClockBasis {
    offset: AtomicI64,
}

impl Default for ClockBasis {
    fn default() -> Self {
        Self {
            offset: AtomicI64::new(UNLATCHED),
        }
    }
}

impl ClockBasis {
    pub fn new() -> Self {
        Self::default()
    }

    /// 锁存偏移，只有第一次调用生效，返回本次是否锁存
    pub fn latch(&self, device_micros: u64, host_micros: u64) -> bool {
        if self.offset.load(Ordering::Acquire) != UNLATCHED {
            return false;
        }
        let offset = (host_micros as i64).wrapping_sub(device_micros as i64);
        let offset = if offset == UNLATCHED { offset + 1 } else { offset };
        if self
            .offset
            .compare_exchange(UNLATCHED, offset, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        debug!("时钟基准锁存: 偏移 {} µs", offset);
        true
    }

    /// 锁存（如需要）并把设备时间戳映射到主机时间线
    pub fn to_host(&self, device_micros: u64, host_micros: u64) -> u64 {
        self.latch(device_micros, host_micros);
        match self.offset() {
            Some(offset) => device_micros.saturating_add_signed(offset),
            None => device_micros,
        }
    }

    /// 已锁存的偏移
    pub fn offset(&self) -> Option<i64> {
        match self.offset.load(Ordering::Acquire) {
            UNLATCHED => None,
            offset => Some(offset),
        }
    }

    /// 重新连接时清除
    pub fn reset(&self) {
        self.offset.store(UNLATCHED, Ordering::Release);
    }
}

/// 传输层计数器
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub frames_received: AtomicU64,
    pub frames_sent: AtomicU64,
    pub decode_errors: AtomicU64,
    pub suspended_drops: AtomicU64,
    pub error_frames_skipped: AtomicU64,
}

/// 传输统计快照
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_received: u64,
    pub frames_sent: u64,
    pub decode_errors: u64,
    pub suspended_drops: u64,
    pub error_frames_skipped: u64,
    pub queue: QueueStats,
}

impl TransportStats {
    pub fn from_counters(counters: &TransportCounters, queue: QueueStats) -> Self {
        Self {
            frames_received: counters.frames_received.load(Ordering::Relaxed),
            frames_sent: counters.frames_sent.load(Ordering::Relaxed),
            decode_errors: counters.decode_errors.load(Ordering::Relaxed),
            suspended_drops: counters.suspended_drops.load(Ordering::Relaxed),
            error_frames_skipped: counters.error_frames_skipped.load(Ordering::Relaxed),
            queue,
        }
    }

    /// 打印统计信息
    pub fn print_summary(&self) {
        info!("📡 传输统计:");
        info!("  📥 接收帧数: {}", self.frames_received);
        info!("  📤 发送帧数: {}", self.frames_sent);
        info!("  ❌ 解码失败: {}", self.decode_errors);
        info!("  ⏸️ 暂停期间丢弃: {}", self.suspended_drops);
        info!("  🚫 跳过的错误帧: {}", self.error_frames_skipped);
        self.queue.print_summary();
    }
}

/// 总线传输能力接口
#[async_trait]
pub trait CanTransport: Send + Sync {
    /// 传输名称（用于日志）
    fn name(&self) -> &str;

    /// 建立连接并订阅入站帧
    async fn start(&self) -> Result<()>;

    /// 断开连接并清空交接队列
    async fn stop(&self) -> Result<()>;

    /// 暂停/恢复接收；暂停时立即清空交接队列
    fn suspend(&self, suspended: bool);

    /// 发送一帧，返回是否被接受
    ///
    /// 错误帧只在本地显示，直接返回成功而不发送。
    async fn send_frame(&self, frame: &CanFrame) -> Result<bool>;

    /// 入站报文处理，不阻塞网络IO路径
    fn on_message_received(&self, topic: &str, payload: &[u8]);

    fn state(&self) -> ConnectionState;

    fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus>;

    /// 接收路径写入的交接队列
    fn queue(&self) -> Arc<FrameQueue>;

    /// 设备到主机的时钟偏移（尚未锁存时为 `None`）
    fn clock_offset(&self) -> Option<i64>;

    fn stats(&self) -> TransportStats;
}
