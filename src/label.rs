//! # 标签解析 (Label Resolution)
//!
//! 帧存储只通过 `FunctionLabelResolver` 查询标识符的显示标签，
//! 数据库格式本身不在引擎关心的范围内。没有解析器时标签直接省略。
//!
//! 提供两个实现：
//!
//! - `CanOpenLabels`：按CANopen预定义连接集生成 "TPDO1 #5" 这类标签
//! - `DbcLabelResolver`：基于can-dbc库，使用DBC中的报文名

use std::collections::HashMap;
use std::path::Path;

use can_dbc::{DBC, Error as DbcError, MessageId};
use tracing::info;

use crate::error::{CaptureError, Result};
use crate::frame::{CanOpenFunction, EXTENDED_ID_MASK, STANDARD_ID_MASK};

/// 标识符到显示标签的查询能力
pub trait FunctionLabelResolver: Send + Sync {
    fn resolve_function_label(&self, id: u32) -> Option<String>;
}

/// CANopen功能码标签
#[derive(Debug, Default, Clone, Copy)]
pub struct CanOpenLabels;

impl FunctionLabelResolver for CanOpenLabels {
    fn resolve_function_label(&self, id: u32) -> Option<String> {
        if id > STANDARD_ID_MASK {
            return None;
        }
        let function = CanOpenFunction::classify(id);
        let node = id & 0x7F;
        match function {
            CanOpenFunction::Unknown => None,
            CanOpenFunction::Nmt
            | CanOpenFunction::Sync
            | CanOpenFunction::Time
            | CanOpenFunction::Lss => Some(function.to_string()),
            _ => Some(format!("{} #{}", function, node)),
        }
    }
}

/// 基于DBC报文名的标签
#[derive(Debug, Clone, Default)]
pub struct DbcLabelResolver {
    names: HashMap<u32, String>,
}

impl DbcLabelResolver {
    /// 从DBC文件加载
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let resolver = Self::from_content(&content)?;
        info!("📋 DBC标签加载完成: {:?}, {} 条报文", path, resolver.len());
        Ok(resolver)
    }

    /// 从DBC文本内容加载
    pub fn from_content(content: &str) -> Result<Self> {
        let dbc = match DBC::try_from(content) {
            Ok(dbc) => dbc,
            Err(e) => {
                let message = match e {
                    DbcError::Nom(nom_err) => format!("解析错误: {:?}", nom_err),
                    DbcError::Incomplete(_dbc, remaining) => {
                        format!("部分解析成功，剩余未解析数据长度: {}", remaining.len())
                    }
                    DbcError::MultipleMultiplexors => "多个多路复用器定义".to_string(),
                };
                return Err(CaptureError::Dbc(message));
            }
        };

        let names = dbc
            .messages()
            .iter()
            .map(|message| (frame_id_of(message.message_id()), message.message_name().clone()))
            .collect();
        Ok(Self { names })
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// DBC报文ID转为帧标识符（扩展帧去掉DBC的bit31标记）
fn frame_id_of(id: &MessageId) -> u32 {
    match id {
        MessageId::Standard(id) => u32::from(*id),
        MessageId::Extended(id) => *id & EXTENDED_ID_MASK,
    }
}

impl FunctionLabelResolver for DbcLabelResolver {
    fn resolve_function_label(&self, id: u32) -> Option<String> {
        self.names.get(&id).cloned()
    }
}
