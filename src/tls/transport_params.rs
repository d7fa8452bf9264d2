//! quic_transport_parameters 扩展 (codepoint 0x39)
//!
//! 参考 RFC 9000 Section 18: Transport Parameter Encoding
//!
//! 扩展体是一串 VarInt-TLV。参数表声明每个已识别 codepoint 的
//! 取值访问器；未知参数跳过，重复参数是 ProtocolViolation。

use crate::codec::{Reader, Writer};
use crate::error::{QuicError, Result};
use bytes::Bytes;

pub const QTP_ORIGINAL_DESTINATION_CONNECTION_ID: u64 = 0x00;
pub const QTP_MAX_IDLE_TIMEOUT: u64 = 0x01;
pub const QTP_MAX_UDP_PAYLOAD_SIZE: u64 = 0x03;
pub const QTP_INITIAL_MAX_DATA: u64 = 0x04;
pub const QTP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL: u64 = 0x05;
pub const QTP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE: u64 = 0x06;
pub const QTP_INITIAL_MAX_STREAM_DATA_UNI: u64 = 0x07;
pub const QTP_INITIAL_MAX_STREAMS_BIDI: u64 = 0x08;
pub const QTP_INITIAL_MAX_STREAMS_UNI: u64 = 0x09;
pub const QTP_INITIAL_SOURCE_CONNECTION_ID: u64 = 0x0f;
pub const QTP_MAX_DATAGRAM_FRAME_SIZE: u64 = 0x20;

/// 本实现识别的传输参数集合
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportParams {
    /// 仅服务端发送；回显客户端的 initial DCID
    pub original_destination_connection_id: Option<Bytes>,
    /// 毫秒；0 表示禁用
    pub max_idle_timeout: u64,
    pub max_udp_payload_size: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data_bidi_local: u64,
    pub initial_max_stream_data_bidi_remote: u64,
    pub initial_max_stream_data_uni: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub initial_source_connection_id: Option<Bytes>,
    pub max_datagram_frame_size: u64,
}

enum QtpKind {
    Integer {
        get: fn(&TransportParams) -> u64,
        set: fn(&mut TransportParams, u64),
        /// 取值约束，违反按 ProtocolViolation 处理
        check: Option<fn(u64) -> bool>,
    },
    ConnId {
        get: fn(&TransportParams) -> Option<&Bytes>,
        set: fn(&mut TransportParams, Bytes),
    },
}

struct QtpDef {
    ty: u64,
    kind: QtpKind,
}

/// 参数表：每个已识别的 codepoint 一个条目
static QTP_TABLE: &[QtpDef] = &[
    QtpDef {
        ty: QTP_ORIGINAL_DESTINATION_CONNECTION_ID,
        kind: QtpKind::ConnId {
            get: |p| p.original_destination_connection_id.as_ref(),
            set: |p, v| p.original_destination_connection_id = Some(v),
        },
    },
    QtpDef {
        ty: QTP_MAX_IDLE_TIMEOUT,
        kind: QtpKind::Integer {
            get: |p| p.max_idle_timeout,
            set: |p, v| p.max_idle_timeout = v,
            check: None,
        },
    },
    QtpDef {
        ty: QTP_MAX_UDP_PAYLOAD_SIZE,
        kind: QtpKind::Integer {
            get: |p| p.max_udp_payload_size,
            set: |p, v| p.max_udp_payload_size = v,
            check: Some(|v| v >= 1200),
        },
    },
    QtpDef {
        ty: QTP_INITIAL_MAX_DATA,
        kind: QtpKind::Integer {
            get: |p| p.initial_max_data,
            set: |p, v| p.initial_max_data = v,
            check: None,
        },
    },
    QtpDef {
        ty: QTP_INITIAL_MAX_STREAM_DATA_BIDI_LOCAL,
        kind: QtpKind::Integer {
            get: |p| p.initial_max_stream_data_bidi_local,
            set: |p, v| p.initial_max_stream_data_bidi_local = v,
            check: None,
        },
    },
    QtpDef {
        ty: QTP_INITIAL_MAX_STREAM_DATA_BIDI_REMOTE,
        kind: QtpKind::Integer {
            get: |p| p.initial_max_stream_data_bidi_remote,
            set: |p, v| p.initial_max_stream_data_bidi_remote = v,
            check: None,
        },
    },
    QtpDef {
        ty: QTP_INITIAL_MAX_STREAM_DATA_UNI,
        kind: QtpKind::Integer {
            get: |p| p.initial_max_stream_data_uni,
            set: |p, v| p.initial_max_stream_data_uni = v,
            check: None,
        },
    },
    QtpDef {
        ty: QTP_INITIAL_MAX_STREAMS_BIDI,
        kind: QtpKind::Integer {
            get: |p| p.initial_max_streams_bidi,
            set: |p, v| p.initial_max_streams_bidi = v,
            check: None,
        },
    },
    QtpDef {
        ty: QTP_INITIAL_MAX_STREAMS_UNI,
        kind: QtpKind::Integer {
            get: |p| p.initial_max_streams_uni,
            set: |p, v| p.initial_max_streams_uni = v,
            check: None,
        },
    },
    QtpDef {
        ty: QTP_INITIAL_SOURCE_CONNECTION_ID,
        kind: QtpKind::ConnId {
            get: |p| p.initial_source_connection_id.as_ref(),
            set: |p, v| p.initial_source_connection_id = Some(v),
        },
    },
    QtpDef {
        ty: QTP_MAX_DATAGRAM_FRAME_SIZE,
        kind: QtpKind::Integer {
            get: |p| p.max_datagram_frame_size,
            set: |p, v| p.max_datagram_frame_size = v,
            check: None,
        },
    },
];

fn qtp_def(ty: u64) -> Option<&'static QtpDef> {
    QTP_TABLE.iter().find(|d| d.ty == ty)
}

/// 解析扩展体
///
/// 未知参数跳过；同一参数出现两次是 ProtocolViolation。
pub fn parse_transport_params(out: &mut TransportParams, r: &mut Reader<'_>) -> Result<()> {
    let mut seen: Vec<u64> = Vec::new();

    while !r.is_empty() {
        let ty = r.get_varint()?;
        let len = r.get_varint()? as usize;
        let mut body = r.sub(len)?;

        if seen.contains(&ty) {
            return Err(QuicError::ProtocolViolation(format!(
                "Duplicate transport parameter {:#x}",
                ty
            )));
        }
        seen.push(ty);

        let def = match qtp_def(ty) {
            Some(def) => def,
            // 未知参数忽略
            None => continue,
        };

        match &def.kind {
            QtpKind::Integer { set, check, .. } => {
                let value = body.get_varint()?;
                if !body.is_empty() {
                    return Err(QuicError::Malformed(format!(
                        "Trailing bytes in transport parameter {:#x}",
                        ty
                    )));
                }
                if let Some(check) = check {
                    if !check(value) {
                        return Err(QuicError::ProtocolViolation(format!(
                            "Transport parameter {:#x} value {} out of range",
                            ty, value
                        )));
                    }
                }
                set(out, value);
            }
            QtpKind::ConnId { set, .. } => {
                let cid = Bytes::copy_from_slice(body.rest());
                if cid.len() > 20 {
                    return Err(QuicError::ProtocolViolation(format!(
                        "Transport parameter {:#x} CID too long",
                        ty
                    )));
                }
                set(out, cid);
            }
        }
    }

    Ok(())
}

/// 构造扩展体
///
/// 整数参数仅在非零时发出；CID 参数在已设置时发出。
pub fn construct_transport_params(params: &TransportParams, w: &mut Writer) -> Result<()> {
    for def in QTP_TABLE {
        match &def.kind {
            QtpKind::Integer { get, .. } => {
                let value = get(params);
                if value == 0 {
                    continue;
                }
                w.put_varint(def.ty);
                w.sub_varint(|w| {
                    w.put_varint(value);
                    Ok(())
                })?;
            }
            QtpKind::ConnId { get, .. } => {
                let Some(cid) = get(params) else { continue };
                w.put_varint(def.ty);
                w.put_varint(cid.len() as u64);
                w.put_bytes(cid);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TransportParams {
        TransportParams {
            original_destination_connection_id: Some(Bytes::from_static(&[0x83, 0x94])),
            max_idle_timeout: 30_000,
            max_udp_payload_size: 1472,
            initial_max_data: 1 << 20,
            initial_max_stream_data_bidi_local: 65536,
            initial_max_stream_data_bidi_remote: 65536,
            initial_max_stream_data_uni: 65536,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            initial_source_connection_id: Some(Bytes::from_static(&[0x01, 0x02, 0x03, 0x04])),
            max_datagram_frame_size: 0,
        }
    }

    #[test]
    fn test_round_trip() {
        let params = sample();
        let mut w = Writer::new();
        construct_transport_params(&params, &mut w).unwrap();

        let mut parsed = TransportParams::default();
        parse_transport_params(&mut parsed, &mut Reader::new(w.as_slice())).unwrap();
        assert_eq!(parsed, params);
    }

    #[test]
    fn test_unknown_parameter_ignored() {
        let mut w = Writer::new();
        // 未知参数 0x7f: 3 字节任意内容
        w.put_varint(0x7f);
        w.put_varint(3);
        w.put_bytes(&[1, 2, 3]);
        // 随后一个可识别的参数
        w.put_varint(QTP_MAX_IDLE_TIMEOUT);
        w.put_varint(2);
        w.put_varint(5000);

        let mut parsed = TransportParams::default();
        parse_transport_params(&mut parsed, &mut Reader::new(w.as_slice())).unwrap();
        assert_eq!(parsed.max_idle_timeout, 5000);
    }

    #[test]
    fn test_duplicate_parameter_is_violation() {
        let mut w = Writer::new();
        for _ in 0..2 {
            w.put_varint(QTP_INITIAL_MAX_DATA);
            w.put_varint(1);
            w.put_varint(7);
        }

        let mut parsed = TransportParams::default();
        let err = parse_transport_params(&mut parsed, &mut Reader::new(w.as_slice()));
        assert!(matches!(err, Err(QuicError::ProtocolViolation(_))));
    }

    #[test]
    fn test_udp_payload_size_floor() {
        let mut w = Writer::new();
        w.put_varint(QTP_MAX_UDP_PAYLOAD_SIZE);
        w.put_varint(2);
        w.put_varint(1199);

        let mut parsed = TransportParams::default();
        let err = parse_transport_params(&mut parsed, &mut Reader::new(w.as_slice()));
        assert!(matches!(err, Err(QuicError::ProtocolViolation(_))));
    }
}
