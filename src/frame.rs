//! # CAN帧数据单元 (Frame)
//!
//! 解码后的CAN帧及其捕获元数据，纯值类型。
//!
//! ## 设计要点
//!
//! - 负载存放在定长数组中，长度字段独立于缓冲区容量，
//!   这样帧可以放进预分配的槽位里，热路径上不做堆分配
//! - 标识符的第29位（`ERROR_FRAME_FLAG`）用作错误帧标记
//! - 远程帧的显示长度恒为0，即使缓冲区里带有字节

use std::fmt;

use crate::error::{CaptureError, Result};

/// 经典CAN负载上限
pub const CLASSIC_PAYLOAD: usize = 8;
/// 扩展负载（CAN FD）上限
pub const MAX_PAYLOAD: usize = 64;
/// 标识符中的错误帧标记位
pub const ERROR_FRAME_FLAG: u32 = 0x2000_0000;
/// 29位扩展标识符掩码
pub const EXTENDED_ID_MASK: u32 = 0x1FFF_FFFF;
/// 11位标准标识符掩码
pub const STANDARD_ID_MASK: u32 = 0x7FF;

/// 帧方向
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Direction {
    #[default]
    Received,
    Transmitted,
}

impl Direction {
    /// 表格中显示的方向标签
    pub fn label(self) -> &'static str {
        match self {
            Direction::Received => "Rx",
            Direction::Transmitted => "Tx",
        }
    }
}

/// 单个CAN帧
#[derive(Clone, Copy)]
pub struct CanFrame {
    /// 原始标识符（可能带错误帧标记位）
    pub id: u32,
    /// 是否使用29位寻址
    pub extended: bool,
    /// 远程请求帧
    pub remote: bool,
    /// 灵活数据速率（CAN FD）
    pub fd: bool,
    /// 来源总线编号
    pub bus: u8,
    /// 收发方向
    pub direction: Direction,
    /// 时间戳（微秒），含义取决于时钟模式
    pub timestamp: u64,
    len: u8,
    data: [u8; MAX_PAYLOAD],
}

impl CanFrame {
    /// 创建数据帧，负载超过64字节时报错
    pub fn new(id: u32, payload: &[u8]) -> Result<Self> {
        let mut frame = Self::empty();
        frame.id = id;
        frame.extended = id & EXTENDED_ID_MASK > STANDARD_ID_MASK;
        frame.set_payload(payload)?;
        Ok(frame)
    }

    /// 空帧，用作队列槽位的初始值
    pub const fn empty() -> Self {
        Self {
            id: 0,
            extended: false,
            remote: false,
            fd: false,
            bus: 0,
            direction: Direction::Received,
            timestamp: 0,
            len: 0,
            data: [0; MAX_PAYLOAD],
        }
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_bus(mut self, bus: u8) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    pub fn with_extended(mut self, extended: bool) -> Self {
        self.extended = extended;
        self
    }

    pub fn with_remote(mut self, remote: bool) -> Self {
        self.remote = remote;
        self
    }

    /// 替换负载，未使用的尾部字节清零
    pub fn set_payload(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_PAYLOAD {
            return Err(CaptureError::PayloadTooLong {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }
        self.data[..payload.len()].copy_from_slice(payload);
        self.data[payload.len()..].fill(0);
        self.len = payload.len() as u8;
        Ok(())
    }

    /// 实际负载字节
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// 声明的负载长度
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// 显示用长度：远程帧恒为0
    #[inline]
    pub fn display_len(&self) -> usize {
        if self.remote { 0 } else { self.len as usize }
    }

    /// 是否为错误帧（仅本地显示用，不会被转发）
    #[inline]
    pub fn is_error(&self) -> bool {
        self.id & ERROR_FRAME_FLAG != 0
    }

    /// 去掉错误标记后的标识符
    #[inline]
    pub fn frame_id(&self) -> u32 {
        self.id & EXTENDED_ID_MASK
    }

    /// CANopen节点号（低7位）
    #[inline]
    pub fn canopen_node(&self) -> u8 {
        (self.id & 0x7F) as u8
    }

    /// CANopen功能码（高4位）
    #[inline]
    pub fn canopen_function_code(&self) -> u16 {
        (self.id & 0x780) as u16
    }

    /// CANopen功能分类，扩展帧不参与
    pub fn canopen_function(&self) -> Option<CanOpenFunction> {
        if self.extended {
            return None;
        }
        Some(CanOpenFunction::classify(self.id))
    }

    /// 负载的ASCII表示，不可打印字节显示为'.'
    pub fn ascii(&self) -> String {
        self.payload()
            .iter()
            .map(|&b| if (0x20..0x7F).contains(&b) { b as char } else { '.' })
            .collect()
    }

    /// 十六进制负载，空格分隔
    pub fn hex_payload(&self) -> String {
        self.payload()
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Default for CanFrame {
    fn default() -> Self {
        Self::empty()
    }
}

impl PartialEq for CanFrame {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.extended == other.extended
            && self.remote == other.remote
            && self.fd == other.fd
            && self.bus == other.bus
            && self.direction == other.direction
            && self.timestamp == other.timestamp
            && self.payload() == other.payload()
    }
}

impl Eq for CanFrame {}

impl fmt::Debug for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CanFrame")
            .field("id", &format_args!("0x{:X}", self.id))
            .field("extended", &self.extended)
            .field("remote", &self.remote)
            .field("fd", &self.fd)
            .field("bus", &self.bus)
            .field("direction", &self.direction)
            .field("timestamp", &self.timestamp)
            .field("payload", &self.payload())
            .finish()
    }
}

/// CANopen预定义连接集中的功能分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanOpenFunction {
    Nmt,
    Sync,
    Emcy,
    Time,
    /// 发送PDO，参数为1..=4
    Tpdo(u8),
    /// 接收PDO，参数为1..=4
    Rpdo(u8),
    /// 服务端SDO（节点应答）
    Tsdo,
    /// 客户端SDO（节点请求）
    Rsdo,
    Heartbeat,
    Lss,
    Unknown,
}

impl CanOpenFunction {
    /// 按功能码对11位标识符分类
    pub fn classify(id: u32) -> Self {
        let id = id & STANDARD_ID_MASK;
        match id {
            0x000 => return CanOpenFunction::Nmt,
            0x080 => return CanOpenFunction::Sync,
            0x100 => return CanOpenFunction::Time,
            0x7E4 | 0x7E5 => return CanOpenFunction::Lss,
            _ => {}
        }
        match id & 0x780 {
            0x080 => CanOpenFunction::Emcy,
            0x180 => CanOpenFunction::Tpdo(1),
            0x200 => CanOpenFunction::Rpdo(1),
            0x280 => CanOpenFunction::Tpdo(2),
            0x300 => CanOpenFunction::Rpdo(2),
            0x380 => CanOpenFunction::Tpdo(3),
            0x400 => CanOpenFunction::Rpdo(3),
            0x480 => CanOpenFunction::Tpdo(4),
            0x500 => CanOpenFunction::Rpdo(4),
            0x580 => CanOpenFunction::Tsdo,
            0x600 => CanOpenFunction::Rsdo,
            0x700 => CanOpenFunction::Heartbeat,
            _ => CanOpenFunction::Unknown,
        }
    }

    pub fn is_sdo(self) -> bool {
        matches!(self, CanOpenFunction::Tsdo | CanOpenFunction::Rsdo)
    }
}

impl fmt::Display for CanOpenFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CanOpenFunction::Nmt => write!(f, "NMT"),
            CanOpenFunction::Sync => write!(f, "SYNC"),
            CanOpenFunction::Emcy => write!(f, "EMCY"),
            CanOpenFunction::Time => write!(f, "TIME"),
            CanOpenFunction::Tpdo(n) => write!(f, "TPDO{}", n),
            CanOpenFunction::Rpdo(n) => write!(f, "RPDO{}", n),
            CanOpenFunction::Tsdo => write!(f, "TSDO"),
            CanOpenFunction::Rsdo => write!(f, "RSDO"),
            CanOpenFunction::Heartbeat => write!(f, "HEARTBEAT"),
            CanOpenFunction::Lss => write!(f, "LSS"),
            CanOpenFunction::Unknown => write!(f, "-"),
        }
    }
}

/// SDO报文的简要描述：命令字、索引和子索引
///
/// 负载不足4字节时返回 `None`。
pub fn describe_sdo(payload: &[u8]) -> Option<String> {
    if payload.len() < 4 {
        return None;
    }
    let command = payload[0] >> 5;
    let index = u16::from_le_bytes([payload[1], payload[2]]);
    let sub_index = payload[3];
    let action = match command {
        0 => "DOWNLOAD_SEG",
        1 => "DOWNLOAD",
        2 => "UPLOAD",
        3 => "UPLOAD_SEG",
        4 => "ABORT",
        5 => "BLOCK_UPLOAD",
        6 => "BLOCK_DOWNLOAD",
        _ => "UNKNOWN",
    };
    let mut text = format!("{} 0x{:04X}:{:02X}", action, index, sub_index);
    if command == 4 && payload.len() >= 8 {
        let code = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
        text.push_str(&format!(" code=0x{:08X}", code));
    }
    Some(text)
}
