//! 流管理
//!
//! 参考 RFC 9000 Section 2/3: Streams, Stream States
//!
//! 流 ID 的低两位编码 {发起方, 方向}: `(index << 2) | uni | server`。
//! 管理器按协商出的 `initial_max_streams_*` 预分配一个密集数组，
//! 数组下标即流 ID。每条流的收/发两个状态机独立推进；
//! 收到的 STREAM 分片按 offset 落入重组缓冲，重复分片被吸收、
//! 相邻分片合并。首次有可读数据时向连接的消息队列投递一次通知
//! (notified 标志粘滞)。

use crate::error::{QuicError, Result};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, trace};

pub const STREAM_ID_MASK: u64 = 0x03;
pub const STREAM_ID_MASK_BITS: u64 = 2;
pub const STREAM_INITIATED_BY_SERVER: u64 = 0x01;
pub const STREAM_UNIDIRECTIONAL: u64 = 0x02;

/// 收/发状态机共用的状态集合
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Start,
    Ready,
    Send,
    Recv,
    SizeKnown,
    DataSent,
    ResetSent,
    DataRecvd,
    ResetRecvd,
    DataRead,
    ResetRead,
    Disabled,
}

/// 投递给连接驱动的流事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMsg {
    /// 流上首次有数据可读
    DataReceived(u64),
}

/// 对端是否是这条流的发起方
fn peer_opened(id: u64, server: bool) -> bool {
    let by_server = id & STREAM_INITIATED_BY_SERVER != 0;
    (server && !by_server) || (!server && by_server)
}

/// 一条流的实例状态
#[derive(Debug)]
pub struct StreamInstance {
    pub recv_state: StreamState,
    pub send_state: StreamState,
    /// 发送侧已写出的字节数（下一个 STREAM 帧的 offset）
    pub sent_bytes: u64,
    /// 对端宣告的 MAX_STREAM_DATA
    pub max_stream_data: u64,
    /// 重组缓冲: 起始 offset -> 连续字节（插入时合并）
    segments: BTreeMap<u64, Vec<u8>>,
    read_offset: u64,
    final_size: Option<u64>,
    notified: bool,
}

impl StreamInstance {
    fn new(id: u64, server: bool) -> Self {
        let uni = id & STREAM_UNIDIRECTIONAL != 0;
        let peer = peer_opened(id, server);

        // 本端发起的单向流没有接收侧；对端发起的单向流没有发送侧
        let recv_state = if !peer && uni {
            StreamState::Disabled
        } else {
            StreamState::Start
        };
        let send_state = if peer && uni {
            StreamState::Disabled
        } else {
            StreamState::Start
        };

        StreamInstance {
            recv_state,
            send_state,
            sent_bytes: 0,
            max_stream_data: 0,
            segments: BTreeMap::new(),
            read_offset: 0,
            final_size: None,
            notified: false,
        }
    }

    fn recv_open(&mut self) {
        if self.recv_state == StreamState::Start {
            self.recv_state = StreamState::Recv;
        }
    }

    /// 落位一个 (offset, data) 分片；重叠部分被吸收，相邻分片合并
    fn write_segment(&mut self, offset: u64, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut start = offset;
        let mut buf = data.to_vec();

        // 吸收所有与 [start, start+len) 重叠或相邻的已有分片
        loop {
            let end = start + buf.len() as u64;
            let candidate = self
                .segments
                .range(..=end)
                .rev()
                .find(|(s, seg)| *s + seg.len() as u64 >= start)
                .map(|(s, _)| *s);

            let Some(seg_start) = candidate else { break };
            let seg = self.segments.remove(&seg_start).unwrap();
            let seg_end = seg_start + seg.len() as u64;

            let new_start = start.min(seg_start);
            let new_end = end.max(seg_end);
            let mut merged = vec![0u8; (new_end - new_start) as usize];
            merged[(seg_start - new_start) as usize..(seg_end - new_start) as usize]
                .copy_from_slice(&seg);
            merged[(start - new_start) as usize..(end - new_start) as usize]
                .copy_from_slice(&buf);

            start = new_start;
            buf = merged;
        }

        self.segments.insert(start, buf);
    }

    /// read_offset 起连续可读的字节数
    pub fn available(&self) -> usize {
        match self.segments.range(..=self.read_offset).next_back() {
            Some((start, seg)) => {
                let end = start + seg.len() as u64;
                end.saturating_sub(self.read_offset) as usize
            }
            None => 0,
        }
    }

    /// 按序读出至多 buf.len() 字节
    fn read(&mut self, buf: &mut [u8]) -> usize {
        let Some((&start, _)) = self.segments.range(..=self.read_offset).next_back() else {
            return 0;
        };

        let seg = self.segments.get(&start).unwrap();
        let end = start + seg.len() as u64;
        if self.read_offset >= end {
            return 0;
        }

        let from = (self.read_offset - start) as usize;
        let n = buf.len().min(seg.len() - from);
        buf[..n].copy_from_slice(&seg[from..from + n]);
        self.read_offset += n as u64;

        if self.read_offset >= end {
            self.segments.remove(&start);
        }

        n
    }

    /// 收完且读完
    fn all_read(&self) -> bool {
        self.final_size == Some(self.read_offset)
    }
}

/// 每连接一个的流管理器
#[derive(Debug)]
pub struct StreamManager {
    streams: Vec<StreamInstance>,
    server: bool,
    max_bidi_stream_id: u64,
    max_uni_stream_id: u64,
    max_id_value: u64,
    bidi_id_alloced: u64,
    uni_id_alloced: u64,
    /// 已经打开过接收侧的最大流 ID
    max_id_opened: Option<u64>,
    msgs: VecDeque<StreamMsg>,
}

/// 由流数量上限折算出的最大流 ID
fn compute_max_id(count: u64, uni: bool) -> u64 {
    let mut base = count & STREAM_ID_MASK;
    let top = count & !STREAM_ID_MASK;

    if uni {
        base |= STREAM_UNIDIRECTIONAL;
    }

    (top << 1) | base | STREAM_INITIATED_BY_SERVER
}

impl StreamManager {
    /// 用协商结果初始化；密集数组一次分配
    pub fn new(max_streams_bidi: u64, max_streams_uni: u64, server: bool) -> Self {
        let max_bidi_stream_id = compute_max_id(max_streams_bidi, false);
        let max_uni_stream_id = compute_max_id(max_streams_uni, true);
        let max_id_value = max_bidi_stream_id.max(max_uni_stream_id);

        let streams = (0..max_id_value)
            .map(|id| StreamInstance::new(id, server))
            .collect();

        StreamManager {
            streams,
            server,
            max_bidi_stream_id,
            max_uni_stream_id,
            max_id_value,
            bidi_id_alloced: 0,
            uni_id_alloced: 0,
            max_id_opened: None,
            msgs: VecDeque::new(),
        }
    }

    fn check_id(&self, id: u64) -> Result<()> {
        let limit = if id & STREAM_UNIDIRECTIONAL != 0 {
            self.max_uni_stream_id
        } else {
            self.max_bidi_stream_id
        };

        if id >= limit || id >= self.max_id_value {
            return Err(QuicError::ProtocolViolation(format!(
                "Stream id {} beyond negotiated limit",
                id
            )));
        }

        Ok(())
    }

    /// 本端打开一条流
    pub fn open(&mut self, uni: bool) -> Result<u64> {
        let index = if uni {
            self.uni_id_alloced
        } else {
            self.bidi_id_alloced
        };

        let mut id = index << STREAM_ID_MASK_BITS;
        if uni {
            id |= STREAM_UNIDIRECTIONAL;
        }
        if self.server {
            id |= STREAM_INITIATED_BY_SERVER;
        }

        self.check_id(id)?;
        if uni {
            self.uni_id_alloced += 1;
        } else {
            self.bidi_id_alloced += 1;
        }

        let si = &mut self.streams[id as usize];
        debug_assert_eq!(si.send_state, StreamState::Start);
        si.send_state = StreamState::Ready;
        if !uni {
            si.recv_open();
        }

        debug!("Stream {} opened (uni={})", id, uni);
        Ok(id)
    }

    /// 取一条流；首次触达对端发起的流时顺带打开接收侧
    pub fn get(&mut self, id: u64) -> Result<&mut StreamInstance> {
        self.check_id(id)?;

        if !peer_opened(id, self.server)
            && self.streams[id as usize].send_state == StreamState::Start
        {
            return Err(QuicError::ProtocolViolation(format!(
                "Stream {} not opened locally",
                id
            )));
        }

        let from = match self.max_id_opened {
            Some(opened) if opened >= id => None,
            Some(opened) => Some(opened + 1),
            None => Some(0),
        };
        if let Some(from) = from {
            for i in from..=id {
                self.streams[i as usize].recv_open();
            }
            self.max_id_opened = Some(id);
        }

        Ok(&mut self.streams[id as usize])
    }

    /// 处理一个收到的 STREAM 帧
    pub fn on_stream_frame(&mut self, id: u64, offset: u64, data: &[u8], fin: bool) -> Result<()> {
        let notify = {
            let si = self.get(id)?;

            if si.recv_state == StreamState::Disabled {
                return Err(QuicError::ProtocolViolation(format!(
                    "STREAM on send-only stream {}",
                    id
                )));
            }

            if si.send_state == StreamState::Start {
                si.send_state = StreamState::Ready;
            }

            if si.recv_state == StreamState::Start {
                si.recv_state = StreamState::Recv;
            }

            if fin {
                trace!("Stream {} FIN at offset {}", id, offset + data.len() as u64);
                si.final_size = Some(offset + data.len() as u64);
                if si.recv_state == StreamState::Recv {
                    si.recv_state = StreamState::SizeKnown;
                }
            }

            if si.recv_state != StreamState::Recv && si.recv_state != StreamState::SizeKnown {
                // 已 reset/读尽的流：分片直接丢掉
                return Ok(());
            }

            si.write_segment(offset, data);

            if !si.notified && si.available() > 0 {
                si.notified = true;
                true
            } else {
                false
            }
        };

        if notify {
            self.msgs.push_back(StreamMsg::DataReceived(id));
        }

        Ok(())
    }

    /// RESET_STREAM: 接收侧进入 ResetRecvd
    pub fn on_reset_stream(&mut self, id: u64, final_size: u64) -> Result<()> {
        let si = self.get(id)?;

        if matches!(
            si.recv_state,
            StreamState::Recv | StreamState::SizeKnown | StreamState::DataRecvd
        ) {
            si.recv_state = StreamState::ResetRecvd;
            si.final_size = Some(final_size);
        }

        Ok(())
    }

    /// STOP_SENDING: 发送侧作废；接收侧若还在 Start 则打开
    pub fn on_stop_sending(&mut self, id: u64) -> Result<()> {
        let si = self.get(id)?;

        if si.send_state == StreamState::Start || si.send_state == StreamState::Disabled {
            return Err(QuicError::ProtocolViolation(format!(
                "STOP_SENDING on non-sending stream {}",
                id
            )));
        }

        si.send_state = StreamState::Disabled;
        si.recv_open();
        Ok(())
    }

    pub fn on_max_stream_data(&mut self, id: u64, limit: u64) -> Result<()> {
        let si = self.get(id)?;

        if si.recv_state == StreamState::Disabled || si.recv_state == StreamState::Start {
            return Err(QuicError::ProtocolViolation(format!(
                "MAX_STREAM_DATA on unopened stream {}",
                id
            )));
        }

        si.max_stream_data = limit;
        Ok(())
    }

    pub fn on_stream_data_blocked(&mut self, id: u64, _limit: u64) -> Result<()> {
        let si = self.get(id)?;

        if si.recv_state == StreamState::Disabled {
            return Err(QuicError::ProtocolViolation(format!(
                "STREAM_DATA_BLOCKED on send-only stream {}",
                id
            )));
        }

        si.recv_open();
        Ok(())
    }

    /// 发送侧记账：send() 构帧成功后调用
    pub fn mark_sent(&mut self, id: u64, len: usize, fin: bool) -> Result<()> {
        let si = self.get(id)?;

        if si.send_state == StreamState::Disabled {
            return Err(QuicError::ProtocolViolation(format!(
                "Send on receive-only stream {}",
                id
            )));
        }

        if len > 0 && si.send_state == StreamState::Ready {
            si.send_state = StreamState::Send;
        }
        si.sent_bytes += len as u64;

        if fin && si.send_state == StreamState::Send {
            si.send_state = StreamState::DataSent;
        }

        Ok(())
    }

    /// 按序读取；读完已知的全部数据后接收侧进入 DataRead
    pub fn read(&mut self, id: u64, buf: &mut [u8]) -> Result<usize> {
        let si = self.get(id)?;

        let n = si.read(buf);

        if si.all_read()
            && matches!(
                si.recv_state,
                StreamState::SizeKnown | StreamState::DataRecvd
            )
        {
            si.recv_state = StreamState::DataRead;
            debug!("Stream {} fully read", id);
        }

        Ok(n)
    }

    /// 取下一条流事件
    pub fn poll_msg(&mut self) -> Option<StreamMsg> {
        self.msgs.pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_layout() {
        let mut client = StreamManager::new(100, 100, false);

        // 客户端: bidi 0, 4, 8...; uni 2, 6...
        assert_eq!(client.open(false).unwrap(), 0);
        assert_eq!(client.open(false).unwrap(), 4);
        assert_eq!(client.open(true).unwrap(), 2);
        assert_eq!(client.open(true).unwrap(), 6);

        let mut server = StreamManager::new(100, 100, true);
        assert_eq!(server.open(false).unwrap(), 1);
        assert_eq!(server.open(true).unwrap(), 3);
        assert_eq!(server.open(true).unwrap(), 7);
    }

    #[test]
    fn test_peer_opened_uni_stream_states() {
        // 客户端视角：服务端打开的单向流 (id & 3 == 3)
        let mut client = StreamManager::new(100, 100, false);
        let si = client.get(3).unwrap();
        assert_eq!(si.send_state, StreamState::Disabled);
        // get() 顺带把接收侧从 Start 拉到 Recv
        assert_eq!(si.recv_state, StreamState::Recv);
    }

    #[test]
    fn test_local_send_progression() {
        // 本地打开 bidi 流: Ready -> Send -> DataSent
        let mut m = StreamManager::new(100, 100, false);
        let id = m.open(false).unwrap();
        assert_eq!(m.get(id).unwrap().send_state, StreamState::Ready);

        m.mark_sent(id, 10, false).unwrap();
        assert_eq!(m.get(id).unwrap().send_state, StreamState::Send);
        assert_eq!(m.get(id).unwrap().sent_bytes, 10);

        m.mark_sent(id, 5, true).unwrap();
        assert_eq!(m.get(id).unwrap().send_state, StreamState::DataSent);
        assert_eq!(m.get(id).unwrap().sent_bytes, 15);
    }

    #[test]
    fn test_recv_progression_with_fin() {
        // 服务端视角收客户端 uni 流 (id & 3 == 2)
        let mut m = StreamManager::new(100, 100, true);

        m.on_stream_frame(2, 0, b"hello", false).unwrap();
        assert_eq!(m.get(2).unwrap().recv_state, StreamState::Recv);

        m.on_stream_frame(2, 5, b" world", true).unwrap();
        assert_eq!(m.get(2).unwrap().recv_state, StreamState::SizeKnown);

        let mut buf = [0u8; 32];
        let n = m.read(2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello world");
        assert_eq!(m.get(2).unwrap().recv_state, StreamState::DataRead);
    }

    #[test]
    fn test_reassembly_out_of_order_with_duplicates() {
        // 源数据 "abcdefghi"，分片乱序到达、部分重叠、一片重复
        let mut m = StreamManager::new(100, 100, true);

        m.on_stream_frame(2, 6, b"ghi", false).unwrap();
        m.on_stream_frame(2, 0, b"abc", false).unwrap();
        m.on_stream_frame(2, 2, b"cdef", false).unwrap();
        m.on_stream_frame(2, 0, b"abc", false).unwrap();

        let si = m.get(2).unwrap();
        assert_eq!(si.available(), 9);

        let mut buf = [0u8; 16];
        let n = m.read(2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abcdefghi");
    }

    #[test]
    fn test_reset_stream() {
        let mut m = StreamManager::new(100, 100, true);
        m.on_stream_frame(2, 0, b"data", false).unwrap();
        m.on_reset_stream(2, 4).unwrap();
        assert_eq!(m.get(2).unwrap().recv_state, StreamState::ResetRecvd);

        // reset 后的分片被丢弃
        m.on_stream_frame(2, 4, b"late", false).unwrap();
    }

    #[test]
    fn test_stop_sending() {
        let mut m = StreamManager::new(100, 100, false);
        let id = m.open(false).unwrap();

        m.on_stop_sending(id).unwrap();
        assert_eq!(m.get(id).unwrap().send_state, StreamState::Disabled);

        // 已 Disabled 再收 STOP_SENDING 是错误
        assert!(m.on_stop_sending(id).is_err());
    }

    #[test]
    fn test_stream_frame_on_send_only_stream_rejected() {
        // 客户端视角：自己开的 uni 流收到 STREAM 帧
        let mut m = StreamManager::new(100, 100, false);
        let id = m.open(true).unwrap();
        assert!(m.on_stream_frame(id, 0, b"x", false).is_err());
    }

    #[test]
    fn test_notify_once() {
        let mut m = StreamManager::new(100, 100, true);
        m.on_stream_frame(2, 0, b"a", false).unwrap();
        m.on_stream_frame(2, 1, b"b", false).unwrap();

        assert_eq!(m.poll_msg(), Some(StreamMsg::DataReceived(2)));
        assert_eq!(m.poll_msg(), None);
    }

    #[test]
    fn test_id_beyond_limit() {
        let mut m = StreamManager::new(4, 4, false);
        // id 检查用原始的上限折算
        assert!(m.on_stream_frame(1 << 10, 0, b"x", false).is_err());
    }

    #[test]
    fn test_empty_fin_frame() {
        // 空帧体 + FIN 合法，仅靠 FIN 收尾
        let mut m = StreamManager::new(100, 100, true);
        m.on_stream_frame(2, 0, b"abc", false).unwrap();
        m.on_stream_frame(2, 3, b"", true).unwrap();

        let si = m.get(2).unwrap();
        assert_eq!(si.recv_state, StreamState::SizeKnown);

        let mut buf = [0u8; 8];
        let n = m.read(2, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        assert_eq!(m.get(2).unwrap().recv_state, StreamState::DataRead);
    }
}
