//! # 时间基准 (Time Basis)
//!
//! 协调设备相对时间戳、主机墙钟时间戳和显示起点。
//!
//! - 设备时钟模式：入库值 = 入站时间戳 + 设备偏移，偏移只作用于设置之后入库的帧；
//!   显示值 = 入库值 - 捕获起点，会话的第一帧显示为0
//! - 主机时钟模式：入库时用主机墙钟微秒替换原始时间戳，显示值即为该墙钟值
//! - 秒模式只影响展示，内部始终以微秒计算
//!
//! 显示值带符号：早于捕获起点的帧显示为负数，不截断为0。
//! 入库值从不改写，`rebase()` 只移动捕获起点。

use chrono::{TimeZone, Utc};

use crate::frame::CanFrame;

/// 当前主机墙钟（Unix纪元起的微秒）
pub fn host_micros() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

#[derive(Debug, Clone, Default)]
pub struct TimeBasis {
    capture_epoch: Option<u64>,
    use_host_clock: bool,
    device_to_host_offset: i64,
    seconds_mode: bool,
}

impl TimeBasis {
    pub fn new(use_host_clock: bool) -> Self {
        Self {
            use_host_clock,
            ..Self::default()
        }
    }

    #[inline]
    pub fn use_host_clock(&self) -> bool {
        self.use_host_clock
    }

    /// 切换时钟模式，调用方随后应执行 `rebase()`
    pub fn set_use_host_clock(&mut self, enabled: bool) {
        self.use_host_clock = enabled;
    }

    #[inline]
    pub fn seconds_mode(&self) -> bool {
        self.seconds_mode
    }

    pub fn set_seconds_mode(&mut self, enabled: bool) {
        self.seconds_mode = enabled;
    }

    #[inline]
    pub fn capture_epoch(&self) -> Option<u64> {
        self.capture_epoch
    }

    #[inline]
    pub fn device_to_host_offset(&self) -> i64 {
        self.device_to_host_offset
    }

    /// 设置设备到主机的固定偏移，作用于之后入库的帧
    pub fn set_device_to_host_offset(&mut self, offset: i64) {
        self.device_to_host_offset = offset;
    }

    /// 入库时确定要存储的时间戳，并在会话首帧锁存捕获起点
    pub fn capture(&mut self, raw: u64, host_now: u64) -> u64 {
        let stored = if self.use_host_clock {
            host_now
        } else {
            raw.saturating_add_signed(self.device_to_host_offset)
        };
        if self.capture_epoch.is_none() {
            self.capture_epoch = Some(stored);
        }
        stored
    }

    /// 显示用时间戳（微秒）
    pub fn normalize(&self, stored: u64) -> i64 {
        if self.use_host_clock {
            return stored as i64;
        }
        stored.wrapping_sub(self.capture_epoch.unwrap_or(0)) as i64
    }

    /// 以当前持有帧中最早的时间戳重新计算捕获起点
    pub fn rebase<'a, I>(&mut self, frames: I)
    where
        I: IntoIterator<Item = &'a CanFrame>,
    {
        let epoch = frames
            .into_iter()
            .map(|frame| frame.timestamp)
            .min();
        self.capture_epoch = epoch;
    }

    /// 会话重置
    pub fn reset(&mut self) {
        self.capture_epoch = None;
    }

    /// 秒模式下的展示值
    pub fn display_seconds(micros: i64) -> f64 {
        micros as f64 / 1_000_000.0
    }

    /// 按当前模式格式化显示时间戳
    pub fn format(&self, stored: u64) -> String {
        let micros = self.normalize(stored);
        if self.use_host_clock {
            return Utc
                .timestamp_micros(micros)
                .single()
                .map(|t| t.format("%H:%M:%S%.6f").to_string())
                .unwrap_or_else(|| micros.to_string());
        }
        if self.seconds_mode {
            format!("{:.6}", Self::display_seconds(micros))
        } else {
            micros.to_string()
        }
    }
}
