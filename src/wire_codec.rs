//! # 线路编解码 (Wire Codec)
//!
//! 网络传输使用的单帧二进制布局：
//!
//! ```text
//! 偏移 0..7  : 时间戳，8字节，微秒，小端序（低字节在前）
//! 偏移 8     : 标志字节 bit0 扩展帧 / bit1 远程帧 / bit2 FD / bit3 错误帧
//! 偏移 9..N  : 负载，0..64字节，长度 = 报文总长 - 9
//! ```
//!
//! 标识符不在报文体内，由传输层的寻址（例如主题后缀）携带。

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{CaptureError, Result};
use crate::frame::{CanFrame, Direction, ERROR_FRAME_FLAG, MAX_PAYLOAD};

/// 报文头长度：时间戳 + 标志字节
pub const HEADER_LEN: usize = 9;

pub const FLAG_EXTENDED: u8 = 0x01;
pub const FLAG_REMOTE: u8 = 0x02;
pub const FLAG_FD: u8 = 0x04;
pub const FLAG_ERROR: u8 = 0x08;

/// 解码后的报文视图（借用输入缓冲区）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireMessage<'a> {
    pub timestamp: u64,
    pub flags: u8,
    pub payload: &'a [u8],
}

impl<'a> WireMessage<'a> {
    /// 从字节数据解析报文
    pub fn decode(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(CaptureError::Truncated {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let payload = &data[HEADER_LEN..];
        if payload.len() > MAX_PAYLOAD {
            return Err(CaptureError::PayloadTooLong {
                len: payload.len(),
                max: MAX_PAYLOAD,
            });
        }

        let mut cursor = data;
        let timestamp = cursor.get_u64_le();
        let flags = cursor.get_u8();

        Ok(Self {
            timestamp,
            flags,
            payload,
        })
    }

    /// 报文编码后的长度
    #[inline]
    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// 追加编码到缓冲区
    pub fn encode(&self, out: &mut BytesMut) {
        out.reserve(self.encoded_len());
        out.put_u64_le(self.timestamp);
        out.put_u8(self.flags);
        out.put_slice(self.payload);
    }

    /// 编码为新的 `Vec<u8>`
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut out);
        out.to_vec()
    }

    /// 转换为帧，写入调用方提供的槽位（不分配）
    ///
    /// 错误帧标志映射为标识符上的错误标记位，其余未定义标志位被忽略。
    pub fn write_frame(&self, id: u32, bus: u8, frame: &mut CanFrame) -> Result<()> {
        frame.set_payload(self.payload)?;
        frame.id = if self.flags & FLAG_ERROR != 0 {
            id | ERROR_FRAME_FLAG
        } else {
            id
        };
        frame.extended = self.flags & FLAG_EXTENDED != 0;
        frame.remote = self.flags & FLAG_REMOTE != 0;
        frame.fd = self.flags & FLAG_FD != 0;
        frame.bus = bus;
        frame.direction = Direction::Received;
        frame.timestamp = self.timestamp;
        Ok(())
    }
}

/// 帧对应的标志字节
pub fn frame_flags(frame: &CanFrame) -> u8 {
    let mut flags = 0;
    if frame.extended {
        flags |= FLAG_EXTENDED;
    }
    if frame.remote {
        flags |= FLAG_REMOTE;
    }
    if frame.fd {
        flags |= FLAG_FD;
    }
    if frame.is_error() {
        flags |= FLAG_ERROR;
    }
    flags
}

/// 编码帧，时间戳由调用方给出（发送时通常为主机时间）
pub fn encode_frame(frame: &CanFrame, timestamp: u64) -> Vec<u8> {
    WireMessage {
        timestamp,
        flags: frame_flags(frame),
        payload: frame.payload(),
    }
    .to_vec()
}

/// 解码一帧，标识符来自传输层寻址
pub fn decode_frame(id: u32, bus: u8, data: &[u8]) -> Result<CanFrame> {
    let message = WireMessage::decode(data)?;
    let mut frame = CanFrame::empty();
    message.write_frame(id, bus, &mut frame)?;
    Ok(frame)
}
