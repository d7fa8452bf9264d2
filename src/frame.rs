//! QUIC 帧编解码
//!
//! 参考 RFC 9000 Section 19: Frame Types and Formats
//!
//! 帧以 VarInt 类型开头。静态帧表声明每种类型的属性
//! (是否无帧体、是否可跨包分片、解析时是否直接跳过)，
//! 解析产出 [`Frame`] 变体，连接层再施加副作用，
//! 这样编解码本身保持无副作用、可单测。

use crate::codec::{Reader, Writer};
use crate::error::{QuicError, Result};
use bytes::Bytes;

pub const FRAME_TYPE_PADDING: u64 = 0x00;
pub const FRAME_TYPE_PING: u64 = 0x01;
pub const FRAME_TYPE_ACK: u64 = 0x02;
pub const FRAME_TYPE_ACK_ECN: u64 = 0x03;
pub const FRAME_TYPE_RESET_STREAM: u64 = 0x04;
pub const FRAME_TYPE_STOP_SENDING: u64 = 0x05;
pub const FRAME_TYPE_CRYPTO: u64 = 0x06;
pub const FRAME_TYPE_NEW_TOKEN: u64 = 0x07;
pub const FRAME_TYPE_STREAM: u64 = 0x08;
pub const FRAME_TYPE_MAX_STREAM_DATA: u64 = 0x11;
pub const FRAME_TYPE_STREAM_DATA_BLOCKED: u64 = 0x15;
pub const FRAME_TYPE_NEW_CONNECTION_ID: u64 = 0x18;
pub const FRAME_TYPE_CONNECTION_CLOSE: u64 = 0x1c;
pub const FRAME_TYPE_CONNECTION_CLOSE_APP: u64 = 0x1d;
pub const FRAME_TYPE_HANDSHAKE_DONE: u64 = 0x1e;
/// 已知帧类型的上界，≥ 此值的类型是致命错误
pub const FRAME_TYPE_MAX: u64 = 0x1f;

/// STREAM 帧类型低三位: OFF / LEN / FIN
pub const STREAM_BIT_OFF: u64 = 0x04;
pub const STREAM_BIT_LEN: u64 = 0x02;
pub const STREAM_BIT_FIN: u64 = 0x01;

pub const FRAME_FLAGS_NO_BODY: u8 = 0x01;
pub const FRAME_FLAGS_SPLIT_ENABLE: u8 = 0x02;
pub const FRAME_FLAGS_SKIP: u8 = 0x04;

/// 帧表条目
#[derive(Debug, Clone, Copy)]
pub struct FrameDef {
    pub ty: u64,
    pub flags: u8,
}

/// 静态帧表：本实现处理的全部帧类型
const FRAME_TABLE: &[FrameDef] = &[
    FrameDef {
        ty: FRAME_TYPE_PADDING,
        flags: FRAME_FLAGS_NO_BODY | FRAME_FLAGS_SKIP,
    },
    FrameDef {
        ty: FRAME_TYPE_PING,
        flags: FRAME_FLAGS_NO_BODY,
    },
    FrameDef {
        ty: FRAME_TYPE_ACK,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_ACK_ECN,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_RESET_STREAM,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_STOP_SENDING,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_CRYPTO,
        flags: FRAME_FLAGS_SPLIT_ENABLE,
    },
    FrameDef {
        ty: FRAME_TYPE_NEW_TOKEN,
        flags: 0,
    },
    // STREAM 的 8 个变体共享一个条目语义
    FrameDef {
        ty: FRAME_TYPE_STREAM,
        flags: FRAME_FLAGS_SPLIT_ENABLE,
    },
    FrameDef {
        ty: FRAME_TYPE_MAX_STREAM_DATA,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_STREAM_DATA_BLOCKED,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_NEW_CONNECTION_ID,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_CONNECTION_CLOSE,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_CONNECTION_CLOSE_APP,
        flags: 0,
    },
    FrameDef {
        ty: FRAME_TYPE_HANDSHAKE_DONE,
        flags: FRAME_FLAGS_NO_BODY,
    },
];

/// 查帧表；STREAM 的 8 个变体归一到 0x08
pub fn frame_def(ty: u64) -> Option<&'static FrameDef> {
    let lookup = if (FRAME_TYPE_STREAM..FRAME_TYPE_STREAM + 8).contains(&ty) {
        FRAME_TYPE_STREAM
    } else {
        ty
    };
    FRAME_TABLE.iter().find(|d| d.ty == lookup)
}

/// 解析出的帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Padding {
        len: usize,
    },
    Ping,
    Ack {
        largest_acked: u64,
        ack_delay: u64,
        first_ack_range: u64,
        /// (gap, length) 对；本实现记录但不维护完整范围集
        ranges: Vec<(u64, u64)>,
        /// ECN counts (类型 0x03)
        ecn: Option<[u64; 3]>,
    },
    ResetStream {
        stream_id: u64,
        app_error_code: u64,
        final_size: u64,
    },
    StopSending {
        stream_id: u64,
        app_error_code: u64,
    },
    Crypto {
        offset: u64,
        data: Bytes,
    },
    NewToken {
        token: Bytes,
    },
    Stream {
        stream_id: u64,
        offset: u64,
        fin: bool,
        data: Bytes,
    },
    MaxStreamData {
        stream_id: u64,
        max_stream_data: u64,
    },
    StreamDataBlocked {
        stream_id: u64,
        limit: u64,
    },
    NewConnectionId {
        seq: u64,
        retire_prior_to: u64,
        cid: Bytes,
        reset_token: [u8; 16],
    },
    ConnectionClose {
        error_code: u64,
        /// 0x1c 携带引发错误的帧类型；0x1d (应用层) 没有
        frame_type: Option<u64>,
        reason: Bytes,
    },
    HandshakeDone,
}

impl Frame {
    /// 解析一个帧，游标停在帧尾
    ///
    /// 未知类型是致命的 `ProtocolViolation`；编码错误向上传播，
    /// 中止整个数据包的处理（此前帧的副作用保留）。
    pub fn parse(r: &mut Reader<'_>) -> Result<Frame> {
        let ty = r.get_varint()?;

        if ty >= FRAME_TYPE_MAX {
            return Err(QuicError::ProtocolViolation(format!(
                "Unknown frame type {:#x}",
                ty
            )));
        }

        if frame_def(ty).is_none() {
            return Err(QuicError::ProtocolViolation(format!(
                "No parser for frame type {:#x}",
                ty
            )));
        }

        match ty {
            FRAME_TYPE_PADDING => {
                // 吸收连续的 PADDING 字节
                let mut len = 1;
                while let Ok(0x00) = r.peek_u8() {
                    r.skip(1)?;
                    len += 1;
                }
                Ok(Frame::Padding { len })
            }
            FRAME_TYPE_PING => Ok(Frame::Ping),
            FRAME_TYPE_ACK | FRAME_TYPE_ACK_ECN => {
                let largest_acked = r.get_varint()?;
                let ack_delay = r.get_varint()?;
                let range_count = r.get_varint()?;
                let first_ack_range = r.get_varint()?;

                let mut ranges = Vec::new();
                for _ in 0..range_count {
                    let gap = r.get_varint()?;
                    let len = r.get_varint()?;
                    ranges.push((gap, len));
                }

                let ecn = if ty == FRAME_TYPE_ACK_ECN {
                    Some([r.get_varint()?, r.get_varint()?, r.get_varint()?])
                } else {
                    None
                };

                Ok(Frame::Ack {
                    largest_acked,
                    ack_delay,
                    first_ack_range,
                    ranges,
                    ecn,
                })
            }
            FRAME_TYPE_RESET_STREAM => Ok(Frame::ResetStream {
                stream_id: r.get_varint()?,
                app_error_code: r.get_varint()?,
                final_size: r.get_varint()?,
            }),
            FRAME_TYPE_STOP_SENDING => Ok(Frame::StopSending {
                stream_id: r.get_varint()?,
                app_error_code: r.get_varint()?,
            }),
            FRAME_TYPE_CRYPTO => {
                let offset = r.get_varint()?;
                let len = r.get_varint()? as usize;
                let data = Bytes::copy_from_slice(r.get_bytes(len)?);
                Ok(Frame::Crypto { offset, data })
            }
            FRAME_TYPE_NEW_TOKEN => {
                let len = r.get_varint()? as usize;
                if len == 0 {
                    return Err(QuicError::Malformed("Empty NEW_TOKEN".into()));
                }
                let token = Bytes::copy_from_slice(r.get_bytes(len)?);
                Ok(Frame::NewToken { token })
            }
            _ if (FRAME_TYPE_STREAM..FRAME_TYPE_STREAM + 8).contains(&ty) => {
                let stream_id = r.get_varint()?;

                let offset = if ty & STREAM_BIT_OFF != 0 {
                    r.get_varint()?
                } else {
                    0
                };

                let data = if ty & STREAM_BIT_LEN != 0 {
                    let len = r.get_varint()? as usize;
                    Bytes::copy_from_slice(r.get_bytes(len)?)
                } else {
                    // 没有 LEN：帧延伸到数据包末尾
                    let rest = r.rest();
                    let data = Bytes::copy_from_slice(rest);
                    r.skip(rest.len())?;
                    data
                };

                Ok(Frame::Stream {
                    stream_id,
                    offset,
                    fin: ty & STREAM_BIT_FIN != 0,
                    data,
                })
            }
            FRAME_TYPE_MAX_STREAM_DATA => Ok(Frame::MaxStreamData {
                stream_id: r.get_varint()?,
                max_stream_data: r.get_varint()?,
            }),
            FRAME_TYPE_STREAM_DATA_BLOCKED => Ok(Frame::StreamDataBlocked {
                stream_id: r.get_varint()?,
                limit: r.get_varint()?,
            }),
            FRAME_TYPE_NEW_CONNECTION_ID => {
                let seq = r.get_varint()?;
                let retire_prior_to = r.get_varint()?;
                let len = r.get_varint()? as usize;
                if len == 0 || len > 20 {
                    return Err(QuicError::Malformed(format!(
                        "NEW_CONNECTION_ID length {}",
                        len
                    )));
                }
                let cid = Bytes::copy_from_slice(r.get_bytes(len)?);
                let mut reset_token = [0u8; 16];
                r.copy_bytes(&mut reset_token)?;
                Ok(Frame::NewConnectionId {
                    seq,
                    retire_prior_to,
                    cid,
                    reset_token,
                })
            }
            FRAME_TYPE_CONNECTION_CLOSE | FRAME_TYPE_CONNECTION_CLOSE_APP => {
                let error_code = r.get_varint()?;
                let frame_type = if ty == FRAME_TYPE_CONNECTION_CLOSE {
                    Some(r.get_varint()?)
                } else {
                    None
                };
                let len = r.get_varint()? as usize;
                let reason = Bytes::copy_from_slice(r.get_bytes(len)?);
                Ok(Frame::ConnectionClose {
                    error_code,
                    frame_type,
                    reason,
                })
            }
            FRAME_TYPE_HANDSHAKE_DONE => Ok(Frame::HandshakeDone),
            _ => Err(QuicError::ProtocolViolation(format!(
                "No parser for frame type {:#x}",
                ty
            ))),
        }
    }

    /// 数据包包含 PADDING / ACK / CONNECTION_CLOSE 之外的任何帧即需要回 ACK
    pub fn is_ack_eliciting(&self) -> bool {
        !matches!(
            self,
            Frame::Padding { .. } | Frame::Ack { .. } | Frame::ConnectionClose { .. }
        )
    }
}

/// 构造 CRYPTO 帧（带显式长度）
pub fn build_crypto_frame(w: &mut Writer, offset: u64, data: &[u8]) {
    w.put_varint(FRAME_TYPE_CRYPTO);
    w.put_varint(offset);
    w.put_varint(data.len() as u64);
    w.put_bytes(data);
}

/// 构造 STREAM 帧
///
/// `with_len = false` 时省略 LEN 位，帧体延伸到数据包尾
/// （分片时每个分片都是其所在包的最后一个帧）。
pub fn build_stream_frame(
    w: &mut Writer,
    stream_id: u64,
    offset: u64,
    fin: bool,
    with_len: bool,
    data: &[u8],
) {
    let mut ty = FRAME_TYPE_STREAM;
    if offset > 0 {
        ty |= STREAM_BIT_OFF;
    }
    if with_len {
        ty |= STREAM_BIT_LEN;
    }
    if fin {
        ty |= STREAM_BIT_FIN;
    }

    w.put_varint(ty);
    w.put_varint(stream_id);
    if offset > 0 {
        w.put_varint(offset);
    }
    if with_len {
        w.put_varint(data.len() as u64);
    }
    w.put_bytes(data);
}

/// 构造单范围 ACK 帧（range_count = 0 的占位 ACK 生成器）
pub fn build_ack_frame(w: &mut Writer, largest_acked: u64, ack_delay: u64, first_ack_range: u64) {
    w.put_varint(FRAME_TYPE_ACK);
    w.put_varint(largest_acked);
    w.put_varint(ack_delay);
    w.put_varint(0); // range count
    w.put_varint(first_ack_range);
}

pub fn build_handshake_done_frame(w: &mut Writer) {
    w.put_varint(FRAME_TYPE_HANDSHAKE_DONE);
}

pub fn build_ping_frame(w: &mut Writer) {
    w.put_varint(FRAME_TYPE_PING);
}

pub fn build_connection_close_frame(w: &mut Writer, error_code: u64, frame_type: u64, reason: &str) {
    w.put_varint(FRAME_TYPE_CONNECTION_CLOSE);
    w.put_varint(error_code);
    w.put_varint(frame_type);
    w.put_varint(reason.len() as u64);
    w.put_bytes(reason.as_bytes());
}
