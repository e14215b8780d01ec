//! # 帧存储 (Frame Store)
//!
//! 捕获引擎的核心：接收帧、按需去重、维护过滤视图并提供查询。
//!
//! ## 设计理念
//!
//! - **单锁**：所有变更入口（入库、清空、过滤/模式设置）串行化在同一把 `RwLock` 上，
//!   读访问器可以并发，但不与变更重叠
//! - **只读视图**：`frames()` / `filtered_frames()` 返回持有读锁的 `FrameView`，
//!   在其存活期间存储不会被修改
//! - **覆盖模式**：每个标识符只保留最新一帧，`all` 退化为按标识符索引的映射
//! - **增量视图**：视图未失效时新帧直接追加到过滤视图，
//!   过滤条件变化后视图标记为失效，等待 `recompute_filtered_view()` 整体重建
//!
//! 存储本身不返回错误，只有过滤文件的读写涉及IO。

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::error::Result;
use crate::filter::{FilterCategory, FilterEngine, FilterLoadReport};
use crate::frame::CanFrame;
use crate::label::FunctionLabelResolver;
use crate::performance::{STORE_FILTERED_FRAMES, STORE_FRAMES};
use crate::sort::{Column, sort_frames};
use crate::time_basis::{TimeBasis, host_micros};

/// 帧存储配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// 每个标识符只保留最新一帧
    pub overwrite_mode: bool,
    /// 使用主机墙钟作为时间戳
    pub use_host_clock: bool,
    /// 以秒显示时间戳
    pub seconds_mode: bool,
    /// 预分配的帧容量
    pub prealloc_frames: usize,
    /// 事件通道容量
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            overwrite_mode: false,
            use_host_clock: false,
            seconds_mode: false,
            prealloc_frames: 100_000,
            event_capacity: 64,
        }
    }
}

/// 存储对外通知
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreEvent {
    /// 标识符启用表发生变化（出现新标识符或加载了过滤文件）
    FiltersUpdated,
    /// 过滤视图已重建
    ViewRefreshed,
    /// 存储已清空
    Cleared,
}

/// 存储统计快照
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StoreStats {
    pub total_frames: usize,
    pub filtered_frames: usize,
    pub distinct_ids: usize,
    pub ingested: u64,
    pub replaced: u64,
    pub batches: u64,
    pub overwrite_mode: bool,
}

impl StoreStats {
    /// 打印统计信息
    pub fn print_summary(&self) {
        info!("🗂️ 帧存储统计:");
        info!("  🎲 当前帧数: {}", self.total_frames);
        info!("  🔍 过滤后帧数: {}", self.filtered_frames);
        info!("  🆔 标识符数: {}", self.distinct_ids);
        info!("  📥 累计入库: {}", self.ingested);
        info!("  ♻️ 覆盖替换: {}", self.replaced);
        info!("  📦 批量导入次数: {}", self.batches);
    }
}

#[derive(Debug)]
struct StoreInner {
    all: Vec<CanFrame>,
    filtered: Vec<CanFrame>,
    /// 覆盖模式下 标识符 -> `all` 中的位置
    positions: HashMap<u32, usize>,
    filters: FilterEngine,
    time: TimeBasis,
    overwrite_mode: bool,
    needs_filter_refresh: bool,
    view_stale: bool,
}

impl StoreInner {
    fn ingest(&mut self, frame: CanFrame, incremental: bool, counters: &StoreCounters) {
        let mut frame = frame;
        let host_now = if self.time.use_host_clock() { host_micros() } else { 0 };
        frame.timestamp = self.time.capture(frame.timestamp, host_now);

        if self.filters.register(frame.id) {
            self.needs_filter_refresh = true;
        }

        if self.overwrite_mode {
            match self.positions.get(&frame.id) {
                Some(&index) => {
                    self.all[index] = frame;
                    counters.replaced.fetch_add(1, Ordering::Relaxed);
                }
                None => {
                    self.positions.insert(frame.id, self.all.len());
                    self.all.push(frame);
                }
            }
        } else {
            self.all.push(frame);
        }
        counters.ingested.fetch_add(1, Ordering::Relaxed);

        if !incremental || self.view_stale {
            return;
        }
        let visible = self.filters.passes(&frame);
        if self.overwrite_mode {
            match self.filtered.iter().position(|f| f.id == frame.id) {
                Some(index) if visible => self.filtered[index] = frame,
                Some(index) => {
                    self.filtered.remove(index);
                }
                None if visible => self.filtered.push(frame),
                None => {}
            }
        } else if visible {
            self.filtered.push(frame);
        }
    }

    fn recompute(&mut self) {
        if self.filters.any_filter_configured() {
            let filters = &self.filters;
            self.filtered = self.all.iter().filter(|f| filters.passes(f)).copied().collect();
        } else {
            self.filtered.clear();
            self.filtered.extend_from_slice(&self.all);
        }
        self.needs_filter_refresh = false;
        self.view_stale = false;
        gauge!(STORE_FILTERED_FRAMES).set(self.filtered.len() as f64);
    }

    fn collapse_duplicates(&mut self) {
        let mut positions = HashMap::with_capacity(self.positions.capacity());
        let mut collapsed: Vec<CanFrame> = Vec::with_capacity(self.all.len());
        for frame in self.all.drain(..) {
            match positions.get(&frame.id) {
                Some(&index) => collapsed[index] = frame,
                None => {
                    positions.insert(frame.id, collapsed.len());
                    collapsed.push(frame);
                }
            }
        }
        self.all = collapsed;
        self.positions = positions;
    }

    fn mark_stale(&mut self) {
        self.view_stale = true;
        self.needs_filter_refresh = true;
    }
}

#[derive(Debug, Default)]
struct StoreCounters {
    ingested: AtomicU64,
    replaced: AtomicU64,
    batches: AtomicU64,
}

/// 只读帧视图，存活期间持有读锁
///
/// 持有视图时不要在同一线程上调用存储的其他方法。
pub struct FrameView<'a> {
    guard: RwLockReadGuard<'a, StoreInner>,
    filtered: bool,
}

impl Deref for FrameView<'_> {
    type Target = [CanFrame];

    fn deref(&self) -> &[CanFrame] {
        if self.filtered {
            &self.guard.filtered
        } else {
            &self.guard.all
        }
    }
}

/// 帧存储
pub struct FrameStore {
    inner: RwLock<StoreInner>,
    events: broadcast::Sender<StoreEvent>,
    resolver: Option<Arc<dyn FunctionLabelResolver>>,
    counters: StoreCounters,
}

impl FrameStore {
    /// 创建新的帧存储
    pub fn new(config: StoreConfig) -> Self {
        let mut time = TimeBasis::new(config.use_host_clock);
        time.set_seconds_mode(config.seconds_mode);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));

        debug!(
            "初始化帧存储: 覆盖模式={}, 主机时钟={}",
            config.overwrite_mode, config.use_host_clock
        );

        Self {
            inner: RwLock::new(StoreInner {
                all: Vec::with_capacity(config.prealloc_frames),
                filtered: Vec::with_capacity(config.prealloc_frames),
                positions: HashMap::new(),
                filters: FilterEngine::new(),
                time,
                overwrite_mode: config.overwrite_mode,
                needs_filter_refresh: false,
                view_stale: false,
            }),
            events,
            resolver: None,
            counters: StoreCounters::default(),
        }
    }

    /// 挂接标签解析器
    pub fn with_resolver(mut self, resolver: Arc<dyn FunctionLabelResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// 订阅存储通知
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self, event: StoreEvent) {
        // 没有订阅者时发送失败，忽略即可
        let _ = self.events.send(event);
    }

    // ------------------------------------------------------------------
    // 入库
    // ------------------------------------------------------------------

    /// 入库单帧
    pub fn ingest(&self, frame: CanFrame) {
        self.add_frames(std::slice::from_ref(&frame));
    }

    /// 实时入库一组帧：只取一次锁，逐帧增量维护过滤视图
    pub fn add_frames(&self, frames: &[CanFrame]) -> usize {
        if frames.is_empty() {
            return 0;
        }
        let new_ids = {
            let mut inner = self.write();
            let known_before = inner.filters.filters().len();
            for frame in frames {
                inner.ingest(*frame, true, &self.counters);
            }
            inner.filters.filters().len() > known_before
        };
        if new_ids {
            self.notify(StoreEvent::FiltersUpdated);
        }
        frames.len()
    }

    /// 批量导入：只在最后重建一次过滤视图，并重新计算捕获起点
    ///
    /// 返回接收的帧数（没有拒绝，只有覆盖模式下的去重）。
    pub fn ingest_batch<I>(&self, frames: I) -> usize
    where
        I: IntoIterator<Item = CanFrame>,
    {
        let count = {
            let mut inner = self.write();
            let mut count = 0;
            for frame in frames {
                inner.ingest(frame, false, &self.counters);
                count += 1;
            }
            let StoreInner { all, time, .. } = &mut *inner;
            time.rebase(all.iter());
            inner.recompute();
            count
        };
        self.counters.batches.fetch_add(1, Ordering::Relaxed);
        info!("📦 批量导入完成: {} 帧", count);
        self.notify(StoreEvent::FiltersUpdated);
        self.notify(StoreEvent::ViewRefreshed);
        count
    }

    /// 清空所有帧、标识符启用表和捕获起点
    pub fn clear(&self) {
        {
            let mut inner = self.write();
            inner.all.clear();
            inner.filtered.clear();
            inner.positions.clear();
            inner.filters.reset_ids();
            inner.time.reset();
            inner.needs_filter_refresh = false;
            inner.view_stale = false;
        }
        info!("🧹 帧存储已清空");
        self.notify(StoreEvent::Cleared);
    }

    // ------------------------------------------------------------------
    // 过滤
    // ------------------------------------------------------------------

    /// 从全部帧重建过滤视图
    pub fn recompute_filtered_view(&self) {
        self.write().recompute();
        self.notify(StoreEvent::ViewRefreshed);
    }

    /// 仅在视图失效或启用表变化时重建，返回是否执行了重建
    pub fn refresh_if_needed(&self) -> bool {
        {
            let inner = self.read();
            if !inner.needs_filter_refresh && !inner.view_stale {
                return false;
            }
        }
        self.recompute_filtered_view();
        true
    }

    /// 标识符启用表是否有待同步的变化
    pub fn needs_filter_refresh(&self) -> bool {
        self.read().needs_filter_refresh
    }

    /// 过滤视图是否已失效
    pub fn is_view_stale(&self) -> bool {
        self.read().view_stale
    }

    pub fn set_filter_state(&self, id: u32, enabled: bool) {
        let mut inner = self.write();
        inner.filters.set_filter_state(id, enabled);
        inner.mark_stale();
    }

    pub fn set_all_filters(&self, enabled: bool) {
        let mut inner = self.write();
        inner.filters.set_all_filters(enabled);
        inner.mark_stale();
    }

    pub fn set_category_switch(&self, category: FilterCategory, enabled: bool) {
        let mut inner = self.write();
        inner.filters.set_category_switch(category, enabled);
        inner.mark_stale();
    }

    pub fn category_switch(&self, category: FilterCategory) -> bool {
        self.read().filters.category_switch(category)
    }

    /// 判断一帧在当前过滤条件下是否可见
    pub fn passes(&self, frame: &CanFrame) -> bool {
        self.read().filters.passes(frame)
    }

    pub fn any_filter_configured(&self) -> bool {
        self.read().filters.any_filter_configured()
    }

    /// 标识符启用表快照
    pub fn filters_snapshot(&self) -> BTreeMap<u32, bool> {
        self.read().filters.filters().clone()
    }

    /// 合并过滤文件，随后强制重建视图
    pub fn load_filter_file<P: AsRef<Path>>(&self, path: P) -> Result<FilterLoadReport> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let report = self.load_filters_from_str(&content);
        info!(
            "📋 过滤文件已加载: {:?}, 生效 {} 条, 跳过 {} 行",
            path.as_ref(),
            report.applied,
            report.skipped
        );
        Ok(report)
    }

    /// 合并过滤文本
    pub fn load_filters_from_str(&self, content: &str) -> FilterLoadReport {
        let report = {
            let mut inner = self.write();
            let report = inner.filters.load_str(content);
            inner.recompute();
            report
        };
        self.notify(StoreEvent::FiltersUpdated);
        self.notify(StoreEvent::ViewRefreshed);
        report
    }

    /// 写出完整的标识符启用表
    pub fn save_filter_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = self.read().filters.to_file_string();
        std::fs::write(path.as_ref(), content)?;
        debug!("过滤文件已保存: {:?}", path.as_ref());
        Ok(())
    }

    // ------------------------------------------------------------------
    // 模式
    // ------------------------------------------------------------------

    /// 切换覆盖模式；打开时把现有记录折叠为每个标识符一帧
    pub fn set_overwrite_mode(&self, enabled: bool) {
        let mut inner = self.write();
        if inner.overwrite_mode == enabled {
            return;
        }
        inner.overwrite_mode = enabled;
        if enabled {
            inner.collapse_duplicates();
        } else {
            inner.positions.clear();
        }
        inner.mark_stale();
        debug!("覆盖模式: {}", enabled);
    }

    pub fn overwrite_mode(&self) -> bool {
        self.read().overwrite_mode
    }

    /// 切换主机时钟模式并重新计算捕获起点
    pub fn set_use_host_clock(&self, enabled: bool) {
        let mut inner = self.write();
        let StoreInner { all, time, .. } = &mut *inner;
        time.set_use_host_clock(enabled);
        time.rebase(all.iter());
    }

    pub fn set_seconds_mode(&self, enabled: bool) {
        self.write().time.set_seconds_mode(enabled);
    }

    /// 设置设备时钟偏移，只作用于之后入库的帧
    ///
    /// 传输层接收的帧已经按连接映射到主机时间线，这里用于导入其他来源的设备时间戳。
    pub fn set_device_to_host_offset(&self, offset: i64) {
        self.write().time.set_device_to_host_offset(offset);
    }

    /// 以当前最早的帧重新计算捕获起点
    pub fn rebase(&self) {
        let mut inner = self.write();
        let StoreInner { all, time, .. } = &mut *inner;
        time.rebase(all.iter());
    }

    /// 时间基准快照
    pub fn time_basis(&self) -> TimeBasis {
        self.read().time.clone()
    }

    // ------------------------------------------------------------------
    // 查询
    // ------------------------------------------------------------------

    /// 全部帧的只读视图
    pub fn frames(&self) -> FrameView<'_> {
        FrameView {
            guard: self.read(),
            filtered: false,
        }
    }

    /// 过滤后帧的只读视图
    pub fn filtered_frames(&self) -> FrameView<'_> {
        FrameView {
            guard: self.read(),
            filtered: true,
        }
    }

    /// 过滤视图的拷贝
    pub fn snapshot_filtered(&self) -> Vec<CanFrame> {
        self.read().filtered.clone()
    }

    pub fn total_frame_count(&self) -> usize {
        self.read().all.len()
    }

    pub fn filtered_frame_count(&self) -> usize {
        self.read().filtered.len()
    }

    /// 在过滤视图中查找指定标识符、时间戳不晚于 `timestamp` 的最近一帧
    ///
    /// `timestamp` 为显示时间戳（微秒）。
    pub fn find_index_by_id_and_timestamp(&self, id: u32, timestamp: i64) -> Option<usize> {
        let inner = self.read();
        let mut best: Option<(usize, i64)> = None;
        for (index, frame) in inner.filtered.iter().enumerate() {
            if frame.id != id {
                continue;
            }
            let display = inner.time.normalize(frame.timestamp);
            if display > timestamp {
                continue;
            }
            match best {
                Some((_, best_ts)) if best_ts >= display => {}
                _ => best = Some((index, display)),
            }
        }
        best.map(|(index, _)| index)
    }

    /// 对过滤视图按列原地排序
    pub fn sort_by_column(&self, column: Column, ascending: bool) {
        let mut inner = self.write();
        sort_frames(&mut inner.filtered, column, ascending);
    }

    /// 显示用时间戳（微秒），早于捕获起点的帧为负数
    pub fn display_timestamp(&self, frame: &CanFrame) -> i64 {
        self.read().time.normalize(frame.timestamp)
    }

    /// 按当前时间模式格式化时间戳
    pub fn format_timestamp(&self, frame: &CanFrame) -> String {
        self.read().time.format(frame.timestamp)
    }

    /// 通过挂接的解析器取标签；没有解析器时返回 `None`
    pub fn function_label(&self, frame: &CanFrame) -> Option<String> {
        self.resolver
            .as_ref()
            .and_then(|resolver| resolver.resolve_function_label(frame.frame_id()))
    }

    /// 统计快照
    pub fn stats(&self) -> StoreStats {
        let inner = self.read();
        let stats = StoreStats {
            total_frames: inner.all.len(),
            filtered_frames: inner.filtered.len(),
            distinct_ids: inner.filters.filters().len(),
            ingested: self.counters.ingested.load(Ordering::Relaxed),
            replaced: self.counters.replaced.load(Ordering::Relaxed),
            batches: self.counters.batches.load(Ordering::Relaxed),
            overwrite_mode: inner.overwrite_mode,
        };
        gauge!(STORE_FRAMES).set(stats.total_frames as f64);
        stats
    }
}

impl Default for FrameStore {
    fn default() -> Self {
        Self::new(StoreConfig::default())
    }
}
