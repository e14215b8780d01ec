//! # 过滤引擎 (Filter Engine)
//!
//! 按标识符的启用表加上七个CANopen类别开关，决定一帧是否可见。
//!
//! ## 可见性规则
//!
//! 1. 标识符在启用表中为 `false` 时不可见；未登记的标识符默认可见
//! 2. 标准帧按功能码落入 NMT/SYNC/EMCY/HEARTBEAT/TIME/TPDO/LSS 之一时，
//!    对应开关必须打开
//! 3. 不属于这七类的帧只受规则1约束
//!
//! ## 过滤文件
//!
//! 纯文本，每行一个 `标识符=启用`，例如 `0x181=true`。
//! 加载是合并语义，无法解析的行被跳过并计数。

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};

use crate::frame::{CanFrame, CanOpenFunction};

/// 七个CANopen报文类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilterCategory {
    Nmt,
    Sync,
    Emcy,
    Heartbeat,
    Time,
    Tpdo,
    Lss,
}

impl FilterCategory {
    pub const ALL: [FilterCategory; 7] = [
        FilterCategory::Nmt,
        FilterCategory::Sync,
        FilterCategory::Emcy,
        FilterCategory::Heartbeat,
        FilterCategory::Time,
        FilterCategory::Tpdo,
        FilterCategory::Lss,
    ];

    #[inline]
    fn slot(self) -> usize {
        self as usize
    }

    /// 功能分类对应的过滤类别
    pub fn of(function: CanOpenFunction) -> Option<Self> {
        match function {
            CanOpenFunction::Nmt => Some(FilterCategory::Nmt),
            CanOpenFunction::Sync => Some(FilterCategory::Sync),
            CanOpenFunction::Emcy => Some(FilterCategory::Emcy),
            CanOpenFunction::Heartbeat => Some(FilterCategory::Heartbeat),
            CanOpenFunction::Time => Some(FilterCategory::Time),
            CanOpenFunction::Tpdo(_) => Some(FilterCategory::Tpdo),
            CanOpenFunction::Lss => Some(FilterCategory::Lss),
            _ => None,
        }
    }
}

impl fmt::Display for FilterCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterCategory::Nmt => "NMT",
            FilterCategory::Sync => "SYNC",
            FilterCategory::Emcy => "EMCY",
            FilterCategory::Heartbeat => "HEARTBEAT",
            FilterCategory::Time => "TIME",
            FilterCategory::Tpdo => "TPDO",
            FilterCategory::Lss => "LSS",
        };
        f.write_str(name)
    }
}

/// 过滤文件加载结果
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct FilterLoadReport {
    /// 成功合并的条目数
    pub applied: usize,
    /// 无法解析而跳过的行数
    pub skipped: usize,
}

/// 过滤引擎
#[derive(Debug, Clone)]
pub struct FilterEngine {
    id_enabled: BTreeMap<u32, bool>,
    categories: [bool; 7],
}

impl Default for FilterEngine {
    fn default() -> Self {
        Self {
            id_enabled: BTreeMap::new(),
            categories: [true; 7],
        }
    }
}

impl FilterEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// 设置单个标识符的启用状态
    pub fn set_filter_state(&mut self, id: u32, enabled: bool) {
        self.id_enabled.insert(id, enabled);
    }

    /// 把所有已知标识符设为同一状态
    pub fn set_all_filters(&mut self, enabled: bool) {
        for state in self.id_enabled.values_mut() {
            *state = enabled;
        }
    }

    /// 切换某个CANopen类别开关
    pub fn set_category_switch(&mut self, category: FilterCategory, enabled: bool) {
        self.categories[category.slot()] = enabled;
    }

    pub fn category_switch(&self, category: FilterCategory) -> bool {
        self.categories[category.slot()]
    }

    /// 登记新标识符（默认启用），返回是否为首次出现
    pub fn register(&mut self, id: u32) -> bool {
        use std::collections::btree_map::Entry;
        match self.id_enabled.entry(id) {
            Entry::Vacant(slot) => {
                slot.insert(true);
                true
            }
            Entry::Occupied(_) => false,
        }
    }

    pub fn is_known(&self, id: u32) -> bool {
        self.id_enabled.contains_key(&id)
    }

    /// 标识符的启用状态，未登记返回 `None`
    pub fn filter_state(&self, id: u32) -> Option<bool> {
        self.id_enabled.get(&id).copied()
    }

    /// 只读的标识符启用表
    pub fn filters(&self) -> &BTreeMap<u32, bool> {
        &self.id_enabled
    }

    /// 清空标识符启用表，类别开关保持不变
    pub fn reset_ids(&mut self) {
        self.id_enabled.clear();
    }

    /// 判断帧是否可见
    pub fn passes(&self, frame: &CanFrame) -> bool {
        if !self.id_enabled.get(&frame.id).copied().unwrap_or(true) {
            return false;
        }
        self.passes_category(frame)
    }

    /// 只做类别判断
    pub fn passes_category(&self, frame: &CanFrame) -> bool {
        match frame.canopen_function().and_then(FilterCategory::of) {
            Some(category) => self.category_switch(category),
            None => true,
        }
    }

    /// 是否有任何过滤条件生效（无则可以跳过过滤）
    pub fn any_filter_configured(&self) -> bool {
        self.id_enabled.values().any(|enabled| !enabled)
            || self.categories.iter().any(|enabled| !enabled)
    }

    /// 合并过滤文件内容
    pub fn load_str(&mut self, content: &str) -> FilterLoadReport {
        let mut report = FilterLoadReport::default();
        for (line_no, raw) in content.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some((id, enabled)) => {
                    self.id_enabled.insert(id, enabled);
                    report.applied += 1;
                }
                None => {
                    warn!("跳过无法解析的过滤行 {}: {:?}", line_no + 1, line);
                    report.skipped += 1;
                }
            }
        }
        debug!(
            "过滤文件合并完成: {} 条生效, {} 行跳过",
            report.applied, report.skipped
        );
        report
    }

    /// 序列化完整的标识符启用表
    pub fn to_file_string(&self) -> String {
        let mut out = String::with_capacity(self.id_enabled.len() * 16);
        for (id, enabled) in &self.id_enabled {
            out.push_str(&format!("0x{:X}={}\n", id, enabled));
        }
        out
    }
}

fn parse_line(line: &str) -> Option<(u32, bool)> {
    let (key, value) = line.split_once('=').or_else(|| line.split_once(','))?;
    let id = parse_id(key.trim())?;
    let enabled = match value.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "1" | "on" => true,
        "false" | "f" | "0" | "off" => false,
        _ => return None,
    };
    Some((id, enabled))
}

fn parse_id(text: &str) -> Option<u32> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}
