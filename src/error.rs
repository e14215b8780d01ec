//! # 错误类型 (Error Types)
//!
//! 捕获引擎对外暴露的统一错误类型。
//!
//! 注意：帧存储本身不返回错误，解码失败和队列耗尽只计数、不向上传播。
//! 这里的错误只用于配置加载、传输控制和编解码的显式调用。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("报文过短：需要至少{expected}字节，实际{actual}字节")]
    Truncated { expected: usize, actual: usize },

    #[error("负载过长：最多{max}字节，实际{len}字节")]
    PayloadTooLong { len: usize, max: usize },

    #[error("无效的主题: {0}")]
    InvalidTopic(String),

    #[error("传输未连接")]
    NotConnected,

    #[error("连接失败: {0}")]
    ConnectionFailed(String),

    #[error("MQTT客户端错误: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON错误: {0}")]
    Json(#[from] serde_json::Error),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("DBC解析失败: {0}")]
    Dbc(String),
}

pub type Result<T> = std::result::Result<T, CaptureError>;
