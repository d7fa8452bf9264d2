//! 出站发送队列与 MSS 感知的帧分片
//!
//! 每个加密级别一个 FIFO，队列元素是"一个数据包的帧载荷"
//! (尚未封包/加密)。CRYPTO 和 STREAM 是可分片帧：
//! 单帧超出载荷预算时拆成多个连续数据包，每个分片
//! 重复帧头并调整 offset。驱动层 flush 时一包一个 datagram。

use crate::codec::Writer;
use crate::crypto::aead::TAG_LEN;
use crate::error::Result;
use crate::frame::{build_crypto_frame, build_stream_frame};
use crate::keys::Level;
use std::collections::VecDeque;

/// CRYPTO 帧头最大长度: type(1) + offset(≤8) + length(≤8)
pub const CRYPTO_HEADER_MAX_LEN: usize = 17;

/// STREAM 帧头最大长度: type(1) + id(≤8) + offset(≤8)（分片时省略 LEN）
pub const STREAM_HEADER_MAX_LEN: usize = 17;

/// 封包时为 Packet Number 预留的最大字节数
pub const PN_RESERVED: usize = 4;

/// 待封包的帧载荷
#[derive(Debug)]
pub struct PendingPacket {
    pub level: Level,
    pub payload: Vec<u8>,
}

/// 按加密级别分队列的出站 FIFO
#[derive(Debug, Default)]
pub struct SendQueue {
    initial: VecDeque<Vec<u8>>,
    handshake: VecDeque<Vec<u8>>,
    application: VecDeque<Vec<u8>>,
}

impl SendQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue_mut(&mut self, level: Level) -> &mut VecDeque<Vec<u8>> {
        match level {
            Level::Initial => &mut self.initial,
            Level::Handshake => &mut self.handshake,
            Level::Application => &mut self.application,
        }
    }

    pub fn push(&mut self, level: Level, payload: Vec<u8>) {
        debug_assert!(!payload.is_empty());
        self.queue_mut(level).push_back(payload);
    }

    /// 取下一个待发载荷，按 initial → handshake → application 顺序
    pub fn pop(&mut self) -> Option<PendingPacket> {
        for level in [Level::Initial, Level::Handshake, Level::Application] {
            if let Some(payload) = self.queue_mut(level).pop_front() {
                return Some(PendingPacket { level, payload });
            }
        }
        None
    }

    /// 发送被 WouldBlock 打断时放回队头，下次重试
    pub fn push_front(&mut self, pkt: PendingPacket) {
        self.queue_mut(pkt.level).push_front(pkt.payload);
    }

    pub fn is_empty(&self) -> bool {
        self.initial.is_empty() && self.handshake.is_empty() && self.application.is_empty()
    }

    pub fn len(&self) -> usize {
        self.initial.len() + self.handshake.len() + self.application.len()
    }
}

/// 一个出站数据包的帧载荷预算
///
/// `MSS − (header + PN 预留 + AEAD tag)`。长头按最坏情况
/// (Length 字段 2 字节 varint) 计。
pub fn payload_budget(
    mss: usize,
    level: Level,
    dcid_len: usize,
    scid_len: usize,
    token_len: usize,
) -> usize {
    let header = match level {
        Level::Initial => 1 + 4 + 1 + dcid_len + 1 + scid_len + 1 + token_len + 2,
        Level::Handshake => 1 + 4 + 1 + dcid_len + 1 + scid_len + 2,
        Level::Application => 1 + dcid_len,
    };

    mss.saturating_sub(header + PN_RESERVED + TAG_LEN)
}

/// 把一段 CRYPTO 流数据拆成若干数据包载荷入队
///
/// 不变式：产出的 (offset, data) 分片恰好无重叠地覆盖
/// `[start_offset, start_offset + data.len())`。
pub fn split_crypto(
    q: &mut SendQueue,
    level: Level,
    budget: usize,
    start_offset: u64,
    data: &[u8],
) -> Result<()> {
    debug_assert!(budget > CRYPTO_HEADER_MAX_LEN);

    let chunk_max = budget - CRYPTO_HEADER_MAX_LEN;
    let mut offset = 0usize;

    while offset < data.len() {
        let chunk = chunk_max.min(data.len() - offset);

        let mut w = Writer::with_capacity(CRYPTO_HEADER_MAX_LEN + chunk);
        build_crypto_frame(&mut w, start_offset + offset as u64, &data[offset..offset + chunk]);
        q.push(level, w.into_vec());

        offset += chunk;
    }

    Ok(())
}

/// 把一段 STREAM 数据拆成若干数据包载荷入队
///
/// - FIN 只落在最后一个分片上
/// - 每个分片都是其所在包的最后一个帧，因此一律省略 LEN 位
/// - `seed` 允许第一个包先携带别的帧（比如待发的 ACK）
/// - 空数据 + FIN 也会产出一个帧（仅靠 FIN 位收尾）
#[allow(clippy::too_many_arguments)]
pub fn split_stream(
    q: &mut SendQueue,
    level: Level,
    budget: usize,
    stream_id: u64,
    start_offset: u64,
    data: &[u8],
    fin: bool,
    seed: Vec<u8>,
) -> Result<()> {
    debug_assert!(budget > STREAM_HEADER_MAX_LEN);

    let mut offset = 0usize;
    let mut first = true;

    loop {
        let mut w = Writer::with_capacity(budget);
        if first {
            w.put_bytes(&seed);
            first = false;
        }

        let room = budget.saturating_sub(w.len() + STREAM_HEADER_MAX_LEN);
        let chunk = room.min(data.len() - offset);
        let last = offset + chunk == data.len();

        build_stream_frame(
            &mut w,
            stream_id,
            start_offset + offset as u64,
            fin && last,
            false,
            &data[offset..offset + chunk],
        );
        q.push(level, w.into_vec());

        offset += chunk;
        if last {
            break;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Reader;
    use crate::frame::Frame;

    fn drain_frames(q: &mut SendQueue) -> Vec<(Level, Vec<Frame>)> {
        let mut out = Vec::new();
        while let Some(pkt) = q.pop() {
            let mut frames = Vec::new();
            let mut r = Reader::new(&pkt.payload);
            while !r.is_empty() {
                frames.push(Frame::parse(&mut r).unwrap());
            }
            out.push((pkt.level, frames));
        }
        out
    }

    #[test]
    fn test_split_crypto_covers_exactly_once() {
        let mut q = SendQueue::new();
        let data: Vec<u8> = (0..5000).map(|i| (i % 251) as u8).collect();
        let budget = 1200;

        split_crypto(&mut q, Level::Handshake, budget, 0, &data).unwrap();

        let expected_packets = data.len().div_ceil(budget - CRYPTO_HEADER_MAX_LEN);
        assert_eq!(q.len(), expected_packets);

        // 重组分片，必须无缝覆盖 [0, 5000)
        let mut reassembled = vec![None::<u8>; data.len()];
        for (level, frames) in drain_frames(&mut q) {
            assert_eq!(level, Level::Handshake);
            for f in frames {
                match f {
                    Frame::Crypto { offset, data } => {
                        for (i, b) in data.iter().enumerate() {
                            let at = offset as usize + i;
                            assert!(reassembled[at].is_none(), "Overlap at {}", at);
                            reassembled[at] = Some(*b);
                        }
                    }
                    f => panic!("Unexpected frame {:?}", f),
                }
            }
        }

        let got: Vec<u8> = reassembled.into_iter().map(|b| b.unwrap()).collect();
        assert_eq!(got, data);
    }

    #[test]
    fn test_split_crypto_small_fits_single_packet() {
        let mut q = SendQueue::new();
        split_crypto(&mut q, Level::Initial, 1200, 300, b"tiny").unwrap();
        assert_eq!(q.len(), 1);

        let frames = drain_frames(&mut q);
        match &frames[0].1[0] {
            Frame::Crypto { offset, data } => {
                assert_eq!(*offset, 300);
                assert_eq!(data.as_ref(), b"tiny");
            }
            f => panic!("{:?}", f),
        }
    }

    #[test]
    fn test_split_stream_fin_on_last_only() {
        let mut q = SendQueue::new();
        let data = vec![0xabu8; 3000];
        let budget = 1200;

        split_stream(&mut q, Level::Application, budget, 6, 0, &data, true, Vec::new()).unwrap();

        let packets = drain_frames(&mut q);
        assert!(packets.len() >= data.len().div_ceil(budget - STREAM_HEADER_MAX_LEN));

        let mut total = 0usize;
        let mut next_offset = 0u64;
        for (i, (_, frames)) in packets.iter().enumerate() {
            assert_eq!(frames.len(), 1);
            match &frames[0] {
                Frame::Stream {
                    stream_id,
                    offset,
                    fin,
                    data,
                } => {
                    assert_eq!(*stream_id, 6);
                    // 分片按序连续
                    assert_eq!(*offset, next_offset);
                    next_offset += data.len() as u64;
                    total += data.len();
                    // FIN 只在最后一个分片
                    assert_eq!(*fin, i == packets.len() - 1);
                }
                f => panic!("{:?}", f),
            }
        }
        assert_eq!(total, data.len());
    }

    #[test]
    fn test_split_stream_with_seed_frame() {
        let mut q = SendQueue::new();
        let mut seed = Writer::new();
        crate::frame::build_ack_frame(&mut seed, 3, 50, 0);

        split_stream(
            &mut q,
            Level::Application,
            1200,
            2,
            0,
            b"payload",
            false,
            seed.into_vec(),
        )
        .unwrap();

        let packets = drain_frames(&mut q);
        assert_eq!(packets.len(), 1);
        // 第一个包先 ACK 后 STREAM
        assert!(matches!(packets[0].1[0], Frame::Ack { largest_acked: 3, .. }));
        assert!(matches!(packets[0].1[1], Frame::Stream { .. }));
    }

    #[test]
    fn test_split_stream_empty_fin() {
        let mut q = SendQueue::new();
        split_stream(&mut q, Level::Application, 1200, 10, 500, &[], true, Vec::new()).unwrap();

        let packets = drain_frames(&mut q);
        assert_eq!(packets.len(), 1);
        match &packets[0].1[0] {
            Frame::Stream {
                offset, fin, data, ..
            } => {
                assert_eq!(*offset, 500);
                assert!(*fin);
                assert!(data.is_empty());
            }
            f => panic!("{:?}", f),
        }
    }

    #[test]
    fn test_queue_level_order_and_requeue() {
        let mut q = SendQueue::new();
        q.push(Level::Application, vec![3]);
        q.push(Level::Initial, vec![1]);
        q.push(Level::Handshake, vec![2]);

        let p = q.pop().unwrap();
        assert_eq!(p.level, Level::Initial);

        // 发送失败放回队头
        q.push_front(p);
        assert_eq!(q.pop().unwrap().payload, vec![1]);
        assert_eq!(q.pop().unwrap().level, Level::Handshake);
        assert_eq!(q.pop().unwrap().level, Level::Application);
        assert!(q.pop().is_none());
    }

    #[test]
    fn test_payload_budget() {
        // initial: 1+4+1+8+1+8+1+0+2 = 26 头部 + 4 PN + 16 tag
        let b = payload_budget(1200, Level::Initial, 8, 8, 0);
        assert_eq!(b, 1200 - 26 - 4 - 16);

        let b = payload_budget(1200, Level::Application, 8, 0, 0);
        assert_eq!(b, 1200 - 9 - 4 - 16);
    }
}
