//! # 排序引擎 (Sort Engine)
//!
//! 按任意列对帧序列原地排序，升序降序都保持相等键的原始相对顺序。
//!
//! 降序不是"升序再反转"：反转会把相等键的顺序也颠倒。
//! 这里对每个元素只提取一次键，降序时包一层 `Reverse`，
//! 再交给稳定排序处理。

use std::cmp::Reverse;

use crate::frame::CanFrame;

/// 帧表格的列
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    TimeStamp,
    FrameId,
    CanOpenNode,
    CanOpenFunction,
    Data,
    Remote,
    Direction,
    Bus,
    Extended,
    Length,
    Ascii,
}

impl Column {
    pub const ALL: [Column; 11] = [
        Column::TimeStamp,
        Column::FrameId,
        Column::CanOpenNode,
        Column::CanOpenFunction,
        Column::Data,
        Column::Remote,
        Column::Direction,
        Column::Bus,
        Column::Extended,
        Column::Length,
        Column::Ascii,
    ];

    /// 按表格列序号取列
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    pub fn header(self) -> &'static str {
        match self {
            Column::TimeStamp => "Timestamp",
            Column::FrameId => "ID",
            Column::CanOpenNode => "Node",
            Column::CanOpenFunction => "Function",
            Column::Data => "Data",
            Column::Remote => "RTR",
            Column::Direction => "Dir",
            Column::Bus => "Bus",
            Column::Extended => "Ext",
            Column::Length => "Len",
            Column::Ascii => "ASCII",
        }
    }

    /// 提取排序键
    pub fn key(self, frame: &CanFrame) -> SortKey {
        match self {
            Column::TimeStamp => SortKey::Number(frame.timestamp),
            Column::FrameId => SortKey::Number(frame.id as u64),
            Column::CanOpenNode => SortKey::Number(frame.canopen_node() as u64),
            Column::CanOpenFunction => SortKey::Number(frame.canopen_function_code() as u64),
            Column::Data => SortKey::Bytes(frame.payload().to_vec()),
            Column::Remote => SortKey::Number(frame.remote as u64),
            Column::Direction => SortKey::Text(frame.direction.label().to_string()),
            Column::Bus => SortKey::Number(frame.bus as u64),
            Column::Extended => SortKey::Number(frame.extended as u64),
            Column::Length => SortKey::Number(frame.display_len() as u64),
            Column::Ascii => SortKey::Text(frame.ascii()),
        }
    }
}

/// 排序键：数值列按数值比较，文本列按字典序比较
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey {
    Number(u64),
    Bytes(Vec<u8>),
    Text(String),
}

/// 原地稳定排序
pub fn sort_frames(frames: &mut [CanFrame], column: Column, ascending: bool) {
    if ascending {
        frames.sort_by_cached_key(|frame| column.key(frame));
    } else {
        frames.sort_by_cached_key(|frame| Reverse(column.key(frame)));
    }
}
