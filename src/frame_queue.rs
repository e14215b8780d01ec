//! # 帧交接队列 (Frame Handoff Queue)
//!
//! 传输层接收路径与帧存储之间的定长、预分配槽位池。
//!
//! ## 设计理念
//!
//! - **预分配**：构造时一次性分配全部槽位，热路径上没有堆分配
//! - **非阻塞**：`try_claim()` 在槽位耗尽时立即返回 `None` 并计数，从不等待
//! - **认领/发布**：生产者先认领槽位、写入帧、再发布；未发布的认领在Drop时归还
//! - **刷新**：`flush()` 丢弃所有待消费帧以及尚未发布的认领
//!
//! ## 核心组件
//!
//! - `FrameQueue`：槽位池本身，空闲索引和就绪索引各用一个 `ArrayQueue`
//! - `SlotClaim`：被认领的槽位句柄
//!
//! 刷新通过代数（generation）实现：每次刷新代数加一，旧代的认领在发布时被丢弃，
//! 旧代的就绪项在消费时被丢弃。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crossbeam::queue::ArrayQueue;
use metrics::counter;
use tracing::{debug, info};

use crate::frame::CanFrame;
use crate::performance::{QUEUE_DROPPED, QUEUE_FLUSHED};

/// 队列统计快照
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// 队列容量
    pub capacity: usize,
    /// 成功认领次数
    pub claimed: u64,
    /// 成功发布次数
    pub published: u64,
    /// 已被消费的帧数
    pub consumed: u64,
    /// 槽位耗尽导致的丢帧数
    pub dropped: u64,
    /// 刷新丢弃的帧数（含未发布的认领）
    pub flushed: u64,
}

impl QueueStats {
    /// 打印统计信息
    pub fn print_summary(&self) {
        info!("📦 交接队列统计:");
        info!("  🧱 容量: {}", self.capacity);
        info!("  📥 已发布: {}", self.published);
        info!("  📤 已消费: {}", self.consumed);
        info!("  ❌ 丢帧(队列满): {}", self.dropped);
        info!("  🧹 刷新丢弃: {}", self.flushed);
    }
}

#[derive(Debug, Default)]
struct QueueCounters {
    claimed: AtomicU64,
    published: AtomicU64,
    consumed: AtomicU64,
    dropped: AtomicU64,
    flushed: AtomicU64,
}

/// 定长帧交接队列
pub struct FrameQueue {
    slots: Box<[Mutex<CanFrame>]>,
    free: ArrayQueue<usize>,
    ready: ArrayQueue<(usize, u64)>,
    generation: AtomicU64,
    counters: QueueCounters,
}

impl FrameQueue {
    /// 创建容量为 `capacity` 的队列（至少1个槽位）
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let slots: Box<[Mutex<CanFrame>]> =
            (0..capacity).map(|_| Mutex::new(CanFrame::empty())).collect();
        let free = ArrayQueue::new(capacity);
        for index in 0..capacity {
            // 容量与槽位数相同，不会失败
            let _ = free.push(index);
        }

        debug!("初始化帧交接队列，容量: {}", capacity);

        Self {
            slots,
            free,
            ready: ArrayQueue::new(capacity),
            generation: AtomicU64::new(0),
            counters: QueueCounters::default(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// 待消费帧数
    #[inline]
    pub fn len(&self) -> usize {
        self.ready.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.ready.is_empty()
    }

    /// 非阻塞认领一个槽位
    ///
    /// 槽位耗尽时返回 `None`，丢帧计数加一。
    pub fn try_claim(&self) -> Option<SlotClaim<'_>> {
        match self.free.pop() {
            Some(index) => {
                self.counters.claimed.fetch_add(1, Ordering::Relaxed);
                Some(SlotClaim {
                    queue: self,
                    index,
                    generation: self.generation.load(Ordering::Acquire),
                    published: false,
                })
            }
            None => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                counter!(QUEUE_DROPPED).increment(1);
                None
            }
        }
    }

    /// 便捷方法：认领、写入并发布一帧
    ///
    /// 返回 `false` 表示队列已满、帧被丢弃。
    pub fn push(&self, frame: CanFrame) -> bool {
        match self.try_claim() {
            Some(mut claim) => {
                claim.write(frame);
                claim.publish()
            }
            None => false,
        }
    }

    /// 取出所有已发布的帧，追加到 `out`，返回取出的数量
    pub fn drain_into(&self, out: &mut Vec<CanFrame>) -> usize {
        let mut taken = 0;
        while let Some((index, generation)) = self.ready.pop() {
            if generation != self.generation.load(Ordering::Acquire) {
                // 刷新与发布交错时遗留的旧代项
                self.release(index);
                self.counters.flushed.fetch_add(1, Ordering::Relaxed);
                continue;
            }
            out.push(*lock_slot(&self.slots[index]));
            self.release(index);
            taken += 1;
        }
        if taken > 0 {
            self.counters
                .consumed
                .fetch_add(taken as u64, Ordering::Relaxed);
        }
        taken
    }

    /// 丢弃所有待消费帧，并使所有尚未发布的认领失效
    pub fn flush(&self) -> usize {
        self.generation.fetch_add(1, Ordering::AcqRel);
        let mut discarded = 0;
        while let Some((index, _)) = self.ready.pop() {
            self.release(index);
            discarded += 1;
        }
        if discarded > 0 {
            self.counters
                .flushed
                .fetch_add(discarded as u64, Ordering::Relaxed);
            counter!(QUEUE_FLUSHED).increment(discarded as u64);
        }
        debug!("🧹 交接队列已刷新，丢弃 {} 帧", discarded);
        discarded
    }

    /// 统计快照
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            capacity: self.capacity(),
            claimed: self.counters.claimed.load(Ordering::Relaxed),
            published: self.counters.published.load(Ordering::Relaxed),
            consumed: self.counters.consumed.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            flushed: self.counters.flushed.load(Ordering::Relaxed),
        }
    }

    #[inline]
    fn release(&self, index: usize) {
        let _ = self.free.push(index);
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("capacity", &self.capacity())
            .field("pending", &self.len())
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock_slot(slot: &Mutex<CanFrame>) -> MutexGuard<'_, CanFrame> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// 已认领的槽位
///
/// 写入帧后调用 `publish()`；未发布就被Drop时槽位直接归还。
pub struct SlotClaim<'a> {
    queue: &'a FrameQueue,
    index: usize,
    generation: u64,
    published: bool,
}

impl<'a> SlotClaim<'a> {
    /// 槽位内帧的可变引用（覆盖写入即可，无需清空）
    ///
    /// 守卫借用认领句柄，`publish()` 之前必须释放：
    ///
    /// ```compile_fail
    /// use cancap::FrameQueue;
    ///
    /// let queue = FrameQueue::new(1);
    /// let mut claim = queue.try_claim().unwrap();
    /// let slot = claim.frame_mut();
    /// claim.publish();
    /// drop(slot);
    /// ```
    pub fn frame_mut(&mut self) -> MutexGuard<'_, CanFrame> {
        lock_slot(&self.queue.slots[self.index])
    }

    /// 写入整帧
    pub fn write(&mut self, frame: CanFrame) {
        *self.frame_mut() = frame;
    }

    /// 发布槽位，返回是否真正进入了队列
    ///
    /// 认领之后发生过 `flush()` 的，槽位被丢弃并返回 `false`。
    pub fn publish(mut self) -> bool {
        self.published = true;
        let queue = self.queue;
        if self.generation != queue.generation.load(Ordering::Acquire) {
            queue.release(self.index);
            queue.counters.flushed.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        // 就绪队列容量与槽位数一致
        let _ = queue.ready.push((self.index, self.generation));
        queue.counters.published.fetch_add(1, Ordering::Relaxed);
        true
    }
}

impl Drop for SlotClaim<'_> {
    fn drop(&mut self) {
        if !self.published {
            self.queue.release(self.index);
        }
    }
}
