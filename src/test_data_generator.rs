//! # 测试数据生成器
//!
//! 生成CANopen形态的合成总线流量，供测试和基准使用：
//! 1. NMT / SYNC / TIME 广播帧
//! 2. 各节点的 EMCY、TPDO1-4、RPDO、SDO、心跳
//! 3. LSS 请求/应答
//! 4. 少量扩展帧（不属于CANopen预定义连接集）
//!
//! 使用固定种子时输出可复现。

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::filter::FilterCategory;
use crate::frame::{CanFrame, CanOpenFunction};
use crate::mqtt_bus::outbound_topic;
use crate::wire_codec::encode_frame;

/// 测试数据生成器配置
#[derive(Debug, Clone)]
pub struct TestDataConfig {
    /// 节点数（节点号从1开始）
    pub node_count: u8,
    /// 随机种子
    pub seed: u64,
    /// 第一帧的设备时间戳（微秒）
    pub start_timestamp: u64,
    /// 相邻帧的平均间隔（微秒）
    pub mean_interval_us: u64,
    /// 扩展帧比例（0-1）
    pub extended_ratio: f64,
    /// 总线序号
    pub bus: u8,
}

impl Default for TestDataConfig {
    fn default() -> Self {
        Self {
            node_count: 8,
            seed: 0x5EED,
            start_timestamp: 1_000_000,
            mean_interval_us: 250,
            extended_ratio: 0.05,
            bus: 0,
        }
    }
}

/// CANopen流量生成器
pub struct TestDataGenerator {
    config: TestDataConfig,
    rng: StdRng,
    timestamp: u64,
    sync_counter: u8,
}

impl TestDataGenerator {
    pub fn new(config: TestDataConfig) -> Self {
        let rng = StdRng::seed_from_u64(config.seed);
        let timestamp = config.start_timestamp;
        Self {
            config,
            rng,
            timestamp,
            sync_counter: 0,
        }
    }

    /// 生成下一帧
    pub fn next_frame(&mut self) -> CanFrame {
        let jitter = self.rng.gen_range(0..=self.config.mean_interval_us.max(1) * 2);
        self.timestamp += jitter;

        let mut frame = if self.rng.gen_bool(self.config.extended_ratio.clamp(0.0, 1.0)) {
            self.extended_frame()
        } else {
            self.canopen_frame()
        };
        frame.timestamp = self.timestamp;
        frame.bus = self.config.bus;
        frame
    }

    /// 批量生成
    pub fn generate(&mut self, count: usize) -> Vec<CanFrame> {
        let frames: Vec<CanFrame> = (0..count).map(|_| self.next_frame()).collect();
        debug!("生成 {} 帧测试数据", frames.len());
        frames
    }

    /// 生成MQTT入站报文（主题, 报文体），主题形如 `<topic>/<标识符>`
    pub fn generate_wire_messages(&mut self, topic: &str, count: usize) -> Vec<(String, Vec<u8>)> {
        (0..count)
            .map(|_| {
                let frame = self.next_frame();
                let topic = format!("{}/{}", topic, frame.frame_id());
                (topic, encode_frame(&frame, frame.timestamp))
            })
            .collect()
    }

    /// 生成出站报文，主题形如 `<topic>/s/<标识符>`
    pub fn generate_outbound_messages(&mut self, topic: &str, count: usize) -> Vec<(String, Vec<u8>)> {
        (0..count)
            .map(|_| {
                let frame = self.next_frame();
                (
                    outbound_topic(topic, frame.frame_id()),
                    encode_frame(&frame, frame.timestamp),
                )
            })
            .collect()
    }

    fn node(&mut self) -> u32 {
        self.rng.gen_range(1..=self.config.node_count.clamp(1, 127)) as u32
    }

    fn payload(&mut self, len: usize) -> [u8; 8] {
        let mut data = [0u8; 8];
        self.rng.fill(&mut data[..len.min(8)]);
        data
    }

    fn canopen_frame(&mut self) -> CanFrame {
        let roll = self.rng.gen_range(0..100u32);
        let (id, data, len): (u32, [u8; 8], usize) = match roll {
            // 过程数据占大多数
            0..=39 => {
                let pdo = self.rng.gen_range(0..4u32);
                let node = self.node();
                (0x180 + pdo * 0x100 + node, self.payload(8), 8)
            }
            40..=49 => {
                let pdo = self.rng.gen_range(0..4u32);
                let node = self.node();
                (0x200 + pdo * 0x100 + node, self.payload(8), 8)
            }
            50..=64 => {
                let node = self.node();
                let state = [0x05, 0x7F, 0x04][self.rng.gen_range(0..3)];
                (0x700 + node, [state, 0, 0, 0, 0, 0, 0, 0], 1)
            }
            65..=74 => {
                self.sync_counter = self.sync_counter.wrapping_add(1);
                (0x080, [self.sync_counter, 0, 0, 0, 0, 0, 0, 0], 1)
            }
            75..=79 => {
                let node = self.node();
                let mut data = self.payload(8);
                data[0] = 0x10;
                data[1] = 0x81;
                (0x080 + node, data, 8)
            }
            80..=89 => {
                let node = self.node();
                let index = 0x1000u16 + self.rng.gen_range(0..0x20u16);
                let [lo, hi] = index.to_le_bytes();
                let (base, command) = if self.rng.gen_bool(0.5) {
                    (0x600, 0x40)
                } else {
                    (0x580, 0x43)
                };
                (base + node, [command, lo, hi, 0, 0, 0, 0, 0], 8)
            }
            90..=93 => {
                let node = self.node() as u8;
                (0x000, [0x01, node, 0, 0, 0, 0, 0, 0], 2)
            }
            94..=96 => (0x100, self.payload(6), 6),
            _ => {
                let id = if self.rng.gen_bool(0.5) { 0x7E5 } else { 0x7E4 };
                (id, [0x04, 0x01, 0, 0, 0, 0, 0, 0], 8)
            }
        };
        let mut frame = CanFrame::empty();
        frame.id = id;
        // 长度不超过8，不会失败
        let _ = frame.set_payload(&data[..len]);
        frame
    }

    fn extended_frame(&mut self) -> CanFrame {
        let ids = [0x18FF_1234u32, 0x18FF_5678, 0x18FF_9ABC, 0x18FF_DEF0];
        let id = ids[self.rng.gen_range(0..ids.len())];
        let len = self.rng.gen_range(0..=8usize);
        let data = self.payload(len);
        let mut frame = CanFrame::empty().with_extended(true);
        frame.id = id;
        let _ = frame.set_payload(&data[..len]);
        frame
    }
}

/// 生成数据的类别分布
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TestDataStats {
    pub total: usize,
    pub per_category: [usize; 7],
    pub uncategorized: usize,
    pub extended: usize,
}

impl TestDataStats {
    pub fn analyze(frames: &[CanFrame]) -> Self {
        let mut stats = Self {
            total: frames.len(),
            ..Self::default()
        };
        for frame in frames {
            if frame.extended {
                stats.extended += 1;
            }
            match frame.canopen_function().and_then(FilterCategory::of) {
                Some(category) => {
                    if let Some(slot) = FilterCategory::ALL.iter().position(|c| *c == category) {
                        stats.per_category[slot] += 1;
                    }
                }
                None => stats.uncategorized += 1,
            }
        }
        stats
    }

    pub fn count(&self, category: FilterCategory) -> usize {
        FilterCategory::ALL
            .iter()
            .position(|c| *c == category)
            .map(|slot| self.per_category[slot])
            .unwrap_or(0)
    }

    pub fn print_summary(&self) {
        info!("📊 测试数据统计:");
        info!("  🎲 总帧数: {}", self.total);
        for category in FilterCategory::ALL {
            info!("  {}: {}", category, self.count(category));
        }
        info!("  ❔ 其他: {}", self.uncategorized);
        info!("  🧩 扩展帧: {}", self.extended);
    }
}

/// 判断标识符是否落在CANopen预定义连接集内
pub fn is_canopen_id(id: u32) -> bool {
    id <= 0x7FF && CanOpenFunction::classify(id) != CanOpenFunction::Unknown
}
