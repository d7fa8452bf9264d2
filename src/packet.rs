//! QUIC 数据包编解码
//!
//! 参考 RFC 9000 Section 17: Packet Formats
//! 参考 RFC 9001 Section 5.4: Header Protection
//! 参考 RFC 9000 Section 17.1 / Appendix A: Packet Number Encoding and Decoding
//!
//! 长头 (Initial / Handshake) 和短头 (1-RTT) 的解析与构造、
//! 包号截断与恢复、头部保护的加解除、AEAD 包保护。
//! AAD 是从 first byte 到 packet number 为止的完整未保护头部。

use crate::codec::{varint_len, Reader, Writer};
use crate::crypto::aead::{make_nonce, SAMPLE_LEN, TAG_LEN};
use crate::error::{QuicError, Result};
use crate::keys::{DirectionKeys, Level};
use bytes::Bytes;
use tracing::trace;

/// 连接 ID 的最大长度
pub const MAX_CID_LEN: usize = 20;

/// 数据包类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Initial,
    ZeroRtt,
    Handshake,
    Retry,
    Short,
}

impl PacketType {
    /// 长头 first byte 的 type bits (bits 5-4)
    fn long_type_bits(&self) -> u8 {
        match self {
            PacketType::Initial => 0b00,
            PacketType::ZeroRtt => 0b01,
            PacketType::Handshake => 0b10,
            PacketType::Retry => 0b11,
            PacketType::Short => unreachable!(),
        }
    }

    fn from_long_type_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0b00 => PacketType::Initial,
            0b01 => PacketType::ZeroRtt,
            0b10 => PacketType::Handshake,
            _ => PacketType::Retry,
        }
    }

    /// 该类型数据包所属的加密级别
    pub fn level(&self) -> Option<Level> {
        match self {
            PacketType::Initial => Some(Level::Initial),
            PacketType::Handshake => Some(Level::Handshake),
            PacketType::Short => Some(Level::Application),
            // 0-RTT 和 Retry 不在支持范围内
            PacketType::ZeroRtt | PacketType::Retry => None,
        }
    }
}

/// 解析出的数据包头部（保护尚未去除）
#[derive(Debug, Clone)]
pub struct Header {
    pub ty: PacketType,
    pub version: u32,
    pub dcid: Bytes,
    pub scid: Bytes,
    /// 仅 Initial 包携带
    pub token: Bytes,
    /// Packet Number 字段在数据包中的偏移
    pub pn_offset: usize,
    /// PN + 加密 payload 的总长（长头来自 Length 字段，短头为剩余全部）
    pub payload_len: usize,
}

impl Header {
    /// 本数据包在 datagram 中占用的总字节数
    pub fn span(&self) -> usize {
        self.pn_offset + self.payload_len
    }
}

/// 解析数据包头部（不去保护）
///
/// 一个 UDP datagram 可能携带多个合并的长头数据包，
/// 调用者按 [`Header::span`] 逐个切分。
///
/// # 参数
/// - `packet`: 从当前数据包起点开始的字节
/// - `short_dcid_len`: 短头没有 DCID 长度字段，由连接提供本端 CID 长度
pub fn parse_header(packet: &[u8], short_dcid_len: usize) -> Result<Header> {
    let mut r = Reader::new(packet);
    let first = r.get_u8()?;

    // Short Header: bit 7 = 0
    if first & 0x80 == 0 {
        let dcid = Bytes::copy_from_slice(r.get_bytes(short_dcid_len)?);
        let pn_offset = 1 + short_dcid_len;
        return Ok(Header {
            ty: PacketType::Short,
            version: 0,
            dcid,
            scid: Bytes::new(),
            token: Bytes::new(),
            pn_offset,
            payload_len: packet.len() - pn_offset,
        });
    }

    let ty = PacketType::from_long_type_bits((first & 0x30) >> 4);
    let version = r.get_u32()?;

    let dcil = r.get_u8()? as usize;
    if dcil > MAX_CID_LEN {
        return Err(QuicError::Malformed(format!("DCID length {} > 20", dcil)));
    }
    let dcid = Bytes::copy_from_slice(r.get_bytes(dcil)?);

    let scil = r.get_u8()? as usize;
    if scil > MAX_CID_LEN {
        return Err(QuicError::Malformed(format!("SCID length {} > 20", scil)));
    }
    let scid = Bytes::copy_from_slice(r.get_bytes(scil)?);

    let token = if ty == PacketType::Initial {
        let token_len = r.get_varint()? as usize;
        Bytes::copy_from_slice(r.get_bytes(token_len)?)
    } else {
        Bytes::new()
    };

    // Retry 没有 Length/PN 字段，余下全是 token + tag
    if ty == PacketType::Retry {
        let pn_offset = r.consumed();
        return Ok(Header {
            ty,
            version,
            dcid,
            scid,
            token,
            pn_offset,
            payload_len: packet.len() - pn_offset,
        });
    }

    let payload_len = r.get_varint()? as usize;
    let pn_offset = r.consumed();

    if packet.len() < pn_offset + payload_len {
        return Err(QuicError::Truncated {
            expected: pn_offset + payload_len,
            actual: packet.len(),
        });
    }

    trace!(
        "Long header: type={:?} version={:#x} dcid_len={} pn_offset={}",
        ty,
        version,
        dcid.len(),
        pn_offset
    );

    Ok(Header {
        ty,
        version,
        dcid,
        scid,
        token,
        pn_offset,
        payload_len,
    })
}

/// 选择包号的截断编码
///
/// RFC 9000 Appendix A.2: 编码长度必须能覆盖
/// 未被确认的包号区间的两倍，即 pn − largest_acked < 2^(8·len − 1)。
///
/// # 返回
/// - (truncated_value, pn_len)
pub fn encode_packet_number(pn: u64, largest_acked: Option<u64>) -> (u64, usize) {
    let num_unacked = match largest_acked {
        Some(acked) => pn.saturating_sub(acked),
        None => pn + 1,
    };

    let pn_len = if num_unacked < 1 << 7 {
        1
    } else if num_unacked < 1 << 15 {
        2
    } else if num_unacked < 1 << 23 {
        3
    } else {
        4
    };

    let mask = if pn_len == 8 {
        u64::MAX
    } else {
        (1u64 << (8 * pn_len)) - 1
    };

    (pn & mask, pn_len)
}

/// 从截断值恢复完整包号
///
/// RFC 9000 Appendix A.3。expected_pn 是 largest + 1。
pub fn decode_packet_number(truncated: u64, pn_len: usize, largest: Option<u64>) -> u64 {
    let expected = match largest {
        Some(l) => l + 1,
        None => 0,
    };

    let pn_win = 1u64 << (8 * pn_len);
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;

    if expected > pn_hwin
        && candidate <= expected - pn_hwin
        && candidate < (1u64 << 62) - pn_win
    {
        return candidate + pn_win;
    }

    if candidate > expected + pn_hwin && candidate >= pn_win {
        return candidate - pn_win;
    }

    candidate
}

/// 移除头部保护，in-place 修改 first byte 和 packet number 字节
///
/// RFC 9001 Section 5.4.2: 采样固定从 pn_offset + 4 开始取 16 字节，
/// 与实际 pn 长度无关。
///
/// # 返回
/// - (unprotected_first_byte, truncated_pn, pn_len)
pub fn remove_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    keys: &DirectionKeys,
) -> Result<(u8, u64, usize)> {
    let sample_start = pn_offset + 4;
    let sample_end = sample_start + SAMPLE_LEN;

    if packet.len() < sample_end {
        return Err(QuicError::Truncated {
            expected: sample_end,
            actual: packet.len(),
        });
    }

    let mask = keys.hp.mask(&packet[sample_start..sample_end])?;

    // 长头 mask 低 4 bits，短头 mask 低 5 bits
    let first = packet[0];
    let unprotected_first = if first & 0x80 != 0 {
        first ^ (mask[0] & 0x0f)
    } else {
        first ^ (mask[0] & 0x1f)
    };

    let pn_len = ((unprotected_first & 0x03) + 1) as usize;

    let mut truncated: u64 = 0;
    for i in 0..pn_len {
        let b = packet[pn_offset + i] ^ mask[1 + i];
        packet[pn_offset + i] = b;
        truncated = (truncated << 8) | (b as u64);
    }

    packet[0] = unprotected_first;

    Ok((unprotected_first, truncated, pn_len))
}

/// 施加头部保护（构包的最后一步）
fn apply_header_protection(
    packet: &mut [u8],
    pn_offset: usize,
    pn_len: usize,
    keys: &DirectionKeys,
) -> Result<()> {
    let sample_start = pn_offset + 4;
    let sample = &packet[sample_start..sample_start + SAMPLE_LEN];
    let mask = keys.hp.mask(sample)?;

    if packet[0] & 0x80 != 0 {
        packet[0] ^= mask[0] & 0x0f;
    } else {
        packet[0] ^= mask[0] & 0x1f;
    }

    for i in 0..pn_len {
        packet[pn_offset + i] ^= mask[1 + i];
    }

    Ok(())
}

/// 去保护并解密一个数据包
///
/// # 返回
/// - (packet_number, 明文 payload)
pub fn unprotect_packet(
    packet: &mut [u8],
    header: &Header,
    keys: &DirectionKeys,
    largest_pn: Option<u64>,
) -> Result<(u64, Vec<u8>)> {
    let span = header.span();
    if packet.len() < span {
        return Err(QuicError::Truncated {
            expected: span,
            actual: packet.len(),
        });
    }

    let (_, truncated, pn_len) =
        remove_header_protection(&mut packet[..span], header.pn_offset, keys)?;

    if header.payload_len < pn_len + TAG_LEN {
        return Err(QuicError::DecryptFailed);
    }

    let pn = decode_packet_number(truncated, pn_len, largest_pn);

    let aad_end = header.pn_offset + pn_len;
    let (aad, rest) = packet[..span].split_at(aad_end);
    let ciphertext = &rest[..header.payload_len - pn_len];

    let nonce = make_nonce(&keys.iv, pn);
    let plaintext = keys.pp.open(&nonce, aad, ciphertext)?;

    trace!("Packet decrypted: pn={} plaintext_len={}", pn, plaintext.len());

    Ok((pn, plaintext))
}

/// 构造并保护一个数据包
///
/// # 参数
/// - `pn_len`: 包号的截断编码长度 (1-4)；通常由
///   [`encode_packet_number`] 根据对端已确认的最大包号算出
/// - `pad_to`: `Some(n)` 时在 payload 尾部补 PADDING，使整包恰好 n 字节
///   （客户端 Initial 需要凑满 1200 字节 datagram）
#[allow(clippy::too_many_arguments)]
pub fn build_packet(
    ty: PacketType,
    version: u32,
    dcid: &[u8],
    scid: &[u8],
    token: &[u8],
    pn: u64,
    pn_len: usize,
    payload: &[u8],
    keys: &DirectionKeys,
    pad_to: Option<usize>,
) -> Result<Vec<u8>> {
    if !(1..=4).contains(&pn_len) {
        return Err(QuicError::Internal(format!("Bad pn length {}", pn_len)));
    }
    let truncated = pn & ((1u64 << (8 * pn_len)) - 1);

    let mut payload = payload.to_vec();

    let mut w = Writer::with_capacity(64 + payload.len());

    match ty {
        PacketType::Short => {
            // 0b0100_0000 | pn_len-1 (spin/key-phase 置 0)
            w.put_u8(0x40 | (pn_len as u8 - 1));
            w.put_bytes(dcid);
        }
        PacketType::Initial | PacketType::Handshake => {
            w.put_u8(0xc0 | (ty.long_type_bits() << 4) | (pn_len as u8 - 1));
            w.put_u32(version);
            w.put_u8(dcid.len() as u8);
            w.put_bytes(dcid);
            w.put_u8(scid.len() as u8);
            w.put_bytes(scid);
            if ty == PacketType::Initial {
                w.put_varint(token.len() as u64);
                w.put_bytes(token);
            }

            if let Some(target) = pad_to {
                // Length 字段的 varint 宽度依赖补齐后的 payload 长度：
                // 对每种宽度解出 padding 量，取自洽的那个
                let base = w.len();
                for vl in [1usize, 2, 4, 8] {
                    if let Some(padded) = target.checked_sub(base + vl + pn_len + TAG_LEN) {
                        let length_field = pn_len + padded + TAG_LEN;
                        if varint_len(length_field as u64) == vl && padded >= payload.len() {
                            payload.resize(padded, 0);
                            break;
                        }
                    }
                }
            }

            w.put_varint((pn_len + payload.len() + TAG_LEN) as u64);
        }
        PacketType::ZeroRtt | PacketType::Retry => {
            return Err(QuicError::Internal(format!("Cannot build {:?} packet", ty)));
        }
    }

    let pn_offset = w.len();
    let pn_bytes = truncated.to_be_bytes();
    w.put_bytes(&pn_bytes[8 - pn_len..]);

    let mut out = w.into_vec();

    let nonce = make_nonce(&keys.iv, pn);
    let sealed = keys.pp.seal(&nonce, &out, &payload)?;
    out.extend_from_slice(&sealed);

    apply_header_protection(&mut out, pn_offset, pn_len, keys)?;

    Ok(out)
}
