//! 连接驱动
//!
//! 顶层状态机：复用 TLS 推进、帧解析/发出、ACK 生成和经由
//! datagram port 的收发。单连接单线程协作式——唯一的挂起点是
//! port 的两个操作，`WouldBlock` 以 [`QuicError::WouldBlock`]
//! 透传给调用者，连接保留足够状态供下次进入时续跑。
//!
//! 每轮迭代：跑当前状态的前置工作 → 清空出站队列 → 读一个
//! datagram → 按头部形态分发到加密级别 → 解密 → 帧解析 →
//! 有 CRYPTO 则推进 TLS → 有 ack-eliciting 帧则生成 ACK →
//! 再清空出站队列。

use crate::codec::{Reader, Writer};
use crate::config::QuicConfig;
use crate::error::{QuicError, Result};
use crate::frame::{
    build_ack_frame, build_connection_close_frame, build_handshake_done_frame, Frame,
};
use crate::keys::{install_initial, Level, LevelSet, Role, QUIC_VERSION_1};
use crate::packet::{
    build_packet, encode_packet_number, parse_header, unprotect_packet, Header, PacketType,
};
use crate::sendq::{payload_budget, split_crypto, split_stream, SendQueue};
use crate::stream::{StreamManager, StreamMsg};
use crate::tls::{FlowReturn, TlsSession};
use bytes::Bytes;
use rand::RngCore;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// QUIC 传输层错误码（CONNECTION_CLOSE 用）
const TRANSPORT_ERROR_INTERNAL: u64 = 0x01;
const TRANSPORT_ERROR_PROTOCOL_VIOLATION: u64 = 0x0a;
const TRANSPORT_ERROR_CRYPTO: u64 = 0x0100;

/// stateless reset token 的长度
const STATELESS_RESET_TOKEN_LEN: usize = 16;

/// 读暂存的尺寸：一个最大 UDP payload
const READ_BUF_LEN: usize = 65535;

/// 底层 datagram port
///
/// 面向字节、保留报文边界：一次 `recv` 返回恰好一个 UDP payload。
/// 暂时无数据/无法写出时返回 [`QuicError::WouldBlock`]。
pub trait DatagramPort {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize>;
    fn send(&mut self, buf: &[u8]) -> Result<usize>;
}

/// 已连接 UDP socket 的 port 实现
pub struct UdpPort(pub std::net::UdpSocket);

impl DatagramPort for UdpPort {
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.0.recv(buf).map_err(map_io_err)
    }

    fn send(&mut self, buf: &[u8]) -> Result<usize> {
        self.0.send(buf).map_err(map_io_err)
    }
}

fn map_io_err(e: std::io::Error) -> QuicError {
    match e.kind() {
        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => QuicError::WouldBlock,
        _ => QuicError::Internal(format!("Socket: {}", e)),
    }
}

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Initial,
    Handshake,
    HandshakeDone,
    Closing,
    Draining,
    Closed,
}

/// 一条 QUIC 连接
pub struct Connection {
    role: Role,
    state: ConnState,
    ctx: Arc<QuicConfig>,
    version: u32,
    port: Box<dyn DatagramPort>,

    /// 本端 CID（对端发包时的 DCID）
    scid: Bytes,
    /// 对端 CID（本端发包时的 DCID）；
    /// 握手期间由对端第一个长头包定格，之后冻结
    dcid: Bytes,
    dcid_frozen: bool,
    /// initial 密钥绑定的 DCID（客户端随机选出 / 服务端收到）
    initial_dcid: Bytes,

    levels: LevelSet,
    tls: TlsSession,
    streams: Option<StreamManager>,
    sendq: SendQueue,

    read_buf: Vec<u8>,

    /// NEW_TOKEN 收存（客户端）
    token: Option<Bytes>,
    /// NEW_CONNECTION_ID 给出的备选 CID
    peer_cids: Vec<(u64, Bytes)>,
    /// 已知的 stateless reset token（NEW_CONNECTION_ID + 配置钩子）
    reset_tokens: Vec<[u8; 16]>,

    epoch: Instant,
}

fn random_cid() -> Bytes {
    let mut cid = vec![0u8; 8];
    rand::thread_rng().fill_bytes(&mut cid);
    Bytes::from(cid)
}

impl Connection {
    /// 创建客户端连接
    ///
    /// 随机选取 SCID 和 initial DCID，立即安装 initial 密钥。
    pub fn new_client(ctx: Arc<QuicConfig>, port: Box<dyn DatagramPort>) -> Result<Self> {
        let scid = random_cid();
        let initial_dcid = random_cid();

        let mut local_params = ctx.transport_params.clone();
        local_params.initial_source_connection_id = Some(scid.clone());

        let tls = TlsSession::new(Role::Client, ctx.clone(), local_params);

        let mut conn = Connection {
            role: Role::Client,
            state: ConnState::Initial,
            version: QUIC_VERSION_1,
            port,
            scid,
            dcid: initial_dcid.clone(),
            dcid_frozen: false,
            initial_dcid: initial_dcid.clone(),
            levels: LevelSet::new(),
            tls,
            streams: None,
            sendq: SendQueue::new(),
            read_buf: vec![0u8; READ_BUF_LEN],
            token: None,
            peer_cids: Vec::new(),
            reset_tokens: ctx.stateless_reset_tokens.clone(),
            epoch: Instant::now(),
            ctx,
        };

        install_initial(
            &mut conn.levels.initial,
            Role::Client,
            &conn.initial_dcid,
            conn.version,
        )?;

        info!(
            "Client connection created, scid={:02x?} dcid={:02x?}",
            conn.scid.as_ref(),
            conn.initial_dcid.as_ref()
        );
        Ok(conn)
    }

    /// 创建服务端连接
    ///
    /// initial 密钥等第一个客户端 Initial 包到达时从其 DCID 派生。
    pub fn new_server(ctx: Arc<QuicConfig>, port: Box<dyn DatagramPort>) -> Result<Self> {
        let scid = random_cid();

        let mut local_params = ctx.transport_params.clone();
        local_params.initial_source_connection_id = Some(scid.clone());

        let tls = TlsSession::new(Role::Server, ctx.clone(), local_params);

        Ok(Connection {
            role: Role::Server,
            state: ConnState::Initial,
            version: QUIC_VERSION_1,
            port,
            scid,
            dcid: Bytes::new(),
            dcid_frozen: false,
            initial_dcid: Bytes::new(),
            levels: LevelSet::new(),
            tls,
            streams: None,
            sendq: SendQueue::new(),
            read_buf: vec![0u8; READ_BUF_LEN],
            token: None,
            peer_cids: Vec::new(),
            reset_tokens: ctx.stateless_reset_tokens.clone(),
            epoch: Instant::now(),
            ctx,
        })
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == ConnState::HandshakeDone
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn scid(&self) -> &Bytes {
        &self.scid
    }

    pub fn dcid(&self) -> &Bytes {
        &self.dcid
    }

    /// 协商出的 ALPN 协议
    pub fn alpn(&self) -> Option<&[u8]> {
        self.tls.alpn_selected.as_deref()
    }

    /// 协商出的套件 id（如 0x1301 = TLS_AES_128_GCM_SHA256）
    pub fn cipher_suite(&self) -> Option<u16> {
        self.tls.suite.map(|s| s.id)
    }

    /// NEW_TOKEN 帧捕获的 token
    pub fn token(&self) -> Option<&Bytes> {
        self.token.as_ref()
    }

    /// 握手后收到的 session ticket（客户端）
    pub fn session_ticket(&self) -> Option<&crate::tls::ticket::SessionTicket> {
        self.tls.session_ticket.as_ref()
    }

    /// 对端的传输参数（EncryptedExtensions / ClientHello 之后可用）
    pub fn peer_transport_params(&self) -> Option<&crate::tls::transport_params::TransportParams> {
        self.tls.peer_params.as_ref()
    }

    fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// 驱动握手直到 HandshakeDone
    ///
    /// port 无数据时返回 `WouldBlock`，调用者稍后重入。
    pub fn do_handshake(&mut self) -> Result<()> {
        loop {
            self.pre_work()?;
            self.flush()?;

            match self.state {
                ConnState::HandshakeDone => return Ok(()),
                ConnState::Closing | ConnState::Draining | ConnState::Closed => {
                    return Err(QuicError::Internal("Connection is closed".into()));
                }
                _ => {}
            }

            let n = {
                let mut buf = std::mem::take(&mut self.read_buf);
                let r = self.port.recv(&mut buf);
                self.read_buf = buf;
                r?
            };

            let mut datagram = self.read_buf[..n].to_vec();
            if let Err(e) = self.process_datagram(&mut datagram) {
                self.fatal(&e);
                return Err(e);
            }

            if self.state == ConnState::Initial {
                self.state = ConnState::Handshake;
            }

            self.flush()?;
        }
    }

    /// 读空 port 里当前可读的 datagram 并处理
    ///
    /// 握手完成后的常规驱动入口；读到 WouldBlock 即返回 Ok。
    pub fn drive(&mut self) -> Result<()> {
        loop {
            let n = {
                let mut buf = std::mem::take(&mut self.read_buf);
                let r = self.port.recv(&mut buf);
                self.read_buf = buf;
                match r {
                    Ok(n) => n,
                    Err(QuicError::WouldBlock) => return Ok(()),
                    Err(e) => return Err(e),
                }
            };

            let mut datagram = self.read_buf[..n].to_vec();
            if let Err(e) = self.process_datagram(&mut datagram) {
                self.fatal(&e);
                return Err(e);
            }

            self.flush()?;
        }
    }

    /// 当前状态的前置工作
    fn pre_work(&mut self) -> Result<()> {
        if self.state == ConnState::Initial
            && self.role == Role::Client
            && self.levels.initial.crypto_sent == 0
            && self.sendq.is_empty()
        {
            // 客户端首轮：推 TLS 吐出 ClientHello
            self.tls_progress()?;
        }
        Ok(())
    }

    /// 处理一个 datagram；其中可能有多个合并的长头包
    fn process_datagram(&mut self, datagram: &mut [u8]) -> Result<()> {
        let total = datagram.len();
        let mut off = 0;

        while off < total {
            let header = match parse_header(&datagram[off..], self.scid.len()) {
                Ok(h) => h,
                Err(e) => {
                    // 头部都解不出来，放弃 datagram 余下部分
                    debug!("Header parse failed at offset {}: {}", off, e);
                    return Ok(());
                }
            };

            let span = header.span().min(total - off);
            match self.process_packet(&mut datagram[off..off + span], &header, off == 0, total) {
                Ok(()) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    trace!("Packet dropped: {}", e);
                    // 解密失败等只丢这个包，继续后面的合并包
                }
            }

            off += span;
        }

        Ok(())
    }

    /// 解出并处理单个数据包
    fn process_packet(
        &mut self,
        packet: &mut [u8],
        header: &Header,
        first_in_datagram: bool,
        datagram_len: usize,
    ) -> Result<()> {
        let Some(level) = header.ty.level() else {
            trace!("{:?} packet ignored", header.ty);
            return Ok(());
        };

        // 服务端第一个 Initial：用客户端选的 DCID 装 initial 密钥
        if self.role == Role::Server && level == Level::Initial {
            if self.initial_dcid.is_empty() {
                self.initial_dcid = header.dcid.clone();
                self.tls.local_params.original_destination_connection_id =
                    Some(header.dcid.clone());
            }
            install_initial(
                &mut self.levels.initial,
                Role::Server,
                &self.initial_dcid,
                self.version,
            )?;
        }

        let lvl = self.levels.get_mut(level);
        if lvl.decrypt.is_none() {
            trace!("No read keys at {:?} yet, packet dropped", level);
            return Ok(());
        }

        let largest = lvl.largest_pn;
        let result = {
            let keys = lvl.decrypt.as_ref().unwrap();
            unprotect_packet(packet, header, keys, largest)
        };

        let (pn, payload) = match result {
            Ok(ok) => ok,
            Err(QuicError::DecryptFailed) => {
                if level == Level::Application {
                    self.check_stateless_reset(datagram_len, first_in_datagram, packet);
                }
                return Err(QuicError::DecryptFailed);
            }
            Err(e) => return Err(e),
        };

        let now = self.now_us();
        self.levels.get_mut(level).on_packet_received(pn, now);

        // 对端第一个长头包定格 DCID，之后冻结
        if !self.dcid_frozen && header.ty != PacketType::Short {
            self.dcid = header.scid.clone();
            self.dcid_frozen = true;
            debug!("Peer CID fixed: {:02x?}", self.dcid.as_ref());
        }

        debug!("{:?} packet pn={} ({} bytes payload)", level, pn, payload.len());

        self.process_payload(level, &payload)
    }

    /// 应用级解密失败时比对 datagram 尾部 16 字节
    fn check_stateless_reset(&mut self, datagram_len: usize, first: bool, packet: &[u8]) {
        if !first || self.reset_tokens.is_empty() {
            return;
        }
        if datagram_len < STATELESS_RESET_TOKEN_LEN || packet.len() < STATELESS_RESET_TOKEN_LEN {
            return;
        }

        let tail = &packet[packet.len() - STATELESS_RESET_TOKEN_LEN..];
        if self.reset_tokens.iter().any(|t| t == tail) {
            warn!("Stateless reset received, draining");
            self.state = ConnState::Draining;
        }
    }

    /// 把一个明文 payload 喂给帧层
    ///
    /// 帧按 wire 顺序处理；`Truncated`/`Malformed` 只中止本包，
    /// 此前帧的副作用保留。
    fn process_payload(&mut self, level: Level, payload: &[u8]) -> Result<()> {
        let mut r = Reader::new(payload);
        let mut ack_eliciting = false;
        let mut crypto_found = false;

        while !r.is_empty() {
            let frame = Frame::parse(&mut r)?;

            ack_eliciting |= frame.is_ack_eliciting();
            if matches!(frame, Frame::Crypto { .. }) {
                crypto_found = true;
            }

            self.on_frame(level, frame)?;
        }

        if crypto_found {
            self.tls_progress()?;
        }

        if ack_eliciting {
            self.queue_ack(level)?;
        }

        Ok(())
    }

    /// 施加单个帧的副作用
    fn on_frame(&mut self, level: Level, frame: Frame) -> Result<()> {
        match frame {
            Frame::Padding { .. } | Frame::Ping => {}

            Frame::Ack { largest_acked, .. } => {
                self.levels.get_mut(level).on_ack_received(largest_acked);
            }

            Frame::Crypto { offset, data } => {
                self.levels
                    .get_mut(level)
                    .tls_in
                    .write_at(offset, &data)?;
            }

            Frame::NewToken { token } => {
                if self.role == Role::Server {
                    return Err(QuicError::ProtocolViolation(
                        "NEW_TOKEN from a client".into(),
                    ));
                }
                debug!("Token stored ({} bytes)", token.len());
                self.token = Some(token);
            }

            Frame::Stream {
                stream_id,
                offset,
                fin,
                data,
            } => {
                self.streams_mut()?
                    .on_stream_frame(stream_id, offset, &data, fin)?;
            }

            Frame::ResetStream {
                stream_id,
                final_size,
                ..
            } => {
                self.streams_mut()?.on_reset_stream(stream_id, final_size)?;
            }

            Frame::StopSending { stream_id, .. } => {
                self.streams_mut()?.on_stop_sending(stream_id)?;
            }

            Frame::MaxStreamData {
                stream_id,
                max_stream_data,
            } => {
                self.streams_mut()?
                    .on_max_stream_data(stream_id, max_stream_data)?;
            }

            Frame::StreamDataBlocked { stream_id, limit } => {
                self.streams_mut()?
                    .on_stream_data_blocked(stream_id, limit)?;
            }

            Frame::NewConnectionId {
                seq,
                cid,
                reset_token,
                ..
            } => {
                self.peer_cids.push((seq, cid));
                self.reset_tokens.push(reset_token);
            }

            Frame::HandshakeDone => {
                if self.role == Role::Server {
                    return Err(QuicError::ProtocolViolation(
                        "HANDSHAKE_DONE from a client".into(),
                    ));
                }
                info!("HANDSHAKE_DONE received, connection established");
                self.state = ConnState::HandshakeDone;
            }

            Frame::ConnectionClose {
                error_code, reason, ..
            } => {
                warn!(
                    "Peer closed connection: code={:#x} reason={:?}",
                    error_code,
                    String::from_utf8_lossy(&reason)
                );
                self.state = ConnState::Draining;
            }
        }

        Ok(())
    }

    /// 推进 TLS 状态机并封装其产出
    fn tls_progress(&mut self) -> Result<()> {
        if self.tls.is_done() {
            // 握手后到达的 application 级 CRYPTO（NewSessionTicket）
            self.tls.process_post_handshake(&mut self.levels)?;
            return Ok(());
        }

        loop {
            let ret = self.tls.advance(&mut self.levels)?;
            self.flush_tls_output()?;
            match ret {
                // 重传被丢弃后继续消化缓冲里的真消息
                FlowReturn::Drop => continue,
                _ => break,
            }
        }

        if self.tls.handshake_done_pending {
            self.tls.handshake_done_pending = false;
            let mut w = Writer::new();
            build_handshake_done_frame(&mut w);
            self.sendq.push(Level::Application, w.into_vec());
        }

        if self.tls.is_done() {
            self.ensure_streams()?;
            if self.role == Role::Server {
                self.state = ConnState::HandshakeDone;
            }
        }

        Ok(())
    }

    /// 把各级别攒下的 TLS 出站字节拆成 CRYPTO 帧入队
    fn flush_tls_output(&mut self) -> Result<()> {
        for level in [Level::Initial, Level::Handshake, Level::Application] {
            let lvl = self.levels.get_mut(level);
            if lvl.tls_out.is_empty() {
                continue;
            }

            let data = std::mem::take(&mut lvl.tls_out);
            let start = lvl.crypto_sent;
            lvl.crypto_sent += data.len() as u64;

            let budget = payload_budget(
                self.ctx.mss,
                level,
                self.dcid.len(),
                self.scid.len(),
                0,
            );

            trace!(
                "CRYPTO out at {:?}: {} bytes from offset {}",
                level,
                data.len(),
                start
            );
            split_crypto(&mut self.sendq, level, budget, start, &data)?;
        }
        Ok(())
    }

    /// 为某级别排一个 ACK 包
    fn queue_ack(&mut self, level: Level) -> Result<()> {
        let now = self.now_us();
        let lvl = self.levels.get_mut(level);

        if !lvl.ack_pending() {
            return Ok(());
        }

        let largest = lvl.largest_pn.unwrap();
        let delay = now.saturating_sub(lvl.arriv_time);

        let mut w = Writer::new();
        build_ack_frame(&mut w, largest, delay, lvl.first_ack_range);
        lvl.largest_acked = Some(largest);

        trace!("ACK queued at {:?}: largest={} delay={}us", level, largest, delay);
        self.sendq.push(level, w.into_vec());
        Ok(())
    }

    /// 出站队列按包封装、保护并写到 port
    ///
    /// 每包一个 datagram；WouldBlock 时把包放回队头并向上透传。
    fn flush(&mut self) -> Result<()> {
        while let Some(pkt) = self.sendq.pop() {
            let lvl = self.levels.get(pkt.level);

            let Some(keys) = lvl.encrypt.as_ref() else {
                // 该级别发送密钥尚未就绪
                self.sendq.push_front(pkt);
                return Ok(());
            };

            let (ty, pad_to) = match pkt.level {
                Level::Initial => {
                    // 客户端 Initial datagram 必须凑满 1200 字节
                    let pad = (self.role == Role::Client).then_some(1200);
                    (PacketType::Initial, pad)
                }
                Level::Handshake => (PacketType::Handshake, None),
                Level::Application => (PacketType::Short, None),
            };

            let pn = lvl.next_pn;
            let (_, pn_len) = encode_packet_number(pn, lvl.peer_acked);
            let packet = build_packet(
                ty,
                self.version,
                &self.dcid,
                &self.scid,
                &[],
                pn,
                pn_len,
                &pkt.payload,
                keys,
                pad_to,
            )?;

            match self.port.send(&packet) {
                Ok(_) => {
                    trace!("{:?} packet pn={} sent ({} bytes)", pkt.level, pn, packet.len());
                    self.levels.get_mut(pkt.level).next_pn += 1;
                }
                Err(QuicError::WouldBlock) => {
                    self.sendq.push_front(pkt);
                    return Err(QuicError::WouldBlock);
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    /// 致命错误：尽力发 CONNECTION_CLOSE 并进入 Closing
    fn fatal(&mut self, e: &QuicError) {
        if matches!(
            self.state,
            ConnState::Closing | ConnState::Draining | ConnState::Closed
        ) {
            return;
        }
        if !e.is_fatal() {
            return;
        }

        warn!("Fatal error, closing connection: {}", e);

        let code = match e {
            QuicError::ProtocolViolation(_) => TRANSPORT_ERROR_PROTOCOL_VIOLATION,
            QuicError::UnexpectedMessage(_)
            | QuicError::BadCertificate(_)
            | QuicError::MissingExtension(_) => TRANSPORT_ERROR_CRYPTO,
            _ => TRANSPORT_ERROR_INTERNAL,
        };

        // 在密钥最高的级别上发 CONNECTION_CLOSE
        let level = [Level::Application, Level::Handshake, Level::Initial]
            .into_iter()
            .find(|l| self.levels.get(*l).encrypt.is_some());

        if let Some(level) = level {
            let mut w = Writer::new();
            build_connection_close_frame(&mut w, code, 0, &e.to_string());
            self.sendq.push(level, w.into_vec());
            let _ = self.flush();
        }

        self.state = ConnState::Closing;
    }

    /// 主动关闭
    pub fn close(&mut self, error_code: u64, reason: &str) -> Result<()> {
        if self.state == ConnState::Closing || self.state == ConnState::Closed {
            return Ok(());
        }

        let level = [Level::Application, Level::Handshake, Level::Initial]
            .into_iter()
            .find(|l| self.levels.get(*l).encrypt.is_some());

        if let Some(level) = level {
            let mut w = Writer::new();
            build_connection_close_frame(&mut w, error_code, 0, reason);
            self.sendq.push(level, w.into_vec());
            self.flush()?;
        }

        self.state = ConnState::Closing;
        Ok(())
    }

    /// 流管理器在传输参数协商完成后初始化
    fn ensure_streams(&mut self) -> Result<()> {
        if self.streams.is_some() {
            return Ok(());
        }

        let params = self
            .tls
            .peer_params
            .as_ref()
            .unwrap_or(&self.ctx.transport_params);

        let max_bidi = params.initial_max_streams_bidi;
        let max_uni = params.initial_max_streams_uni;
        debug!(
            "Stream manager ready: max_bidi={} max_uni={}",
            max_bidi, max_uni
        );

        self.streams = Some(StreamManager::new(
            max_bidi,
            max_uni,
            self.role == Role::Server,
        ));
        Ok(())
    }

    fn streams_mut(&mut self) -> Result<&mut StreamManager> {
        self.ensure_streams()?;
        self.streams
            .as_mut()
            .ok_or_else(|| QuicError::Internal("Stream manager unavailable".into()))
    }

    /// 打开一条流（握手完成后）
    pub fn stream_open(&mut self, uni: bool) -> Result<u64> {
        if self.state != ConnState::HandshakeDone {
            return Err(QuicError::Internal("Handshake not complete".into()));
        }
        self.streams_mut()?.open(uni)
    }

    /// 在流上发送数据
    ///
    /// 超出单包载荷预算的数据被拆成多个包，FIN 落在最后一个分片。
    /// 如有待发的 ACK，第一个包顺带捎上。
    pub fn stream_send(&mut self, id: u64, data: &[u8], fin: bool) -> Result<usize> {
        if self.state != ConnState::HandshakeDone {
            return Err(QuicError::Internal("Handshake not complete".into()));
        }

        let offset = {
            let streams = self.streams_mut()?;
            let si = streams.get(id)?;
            if si.send_state == crate::stream::StreamState::Disabled {
                return Err(QuicError::ProtocolViolation(format!(
                    "Send on receive-only stream {}",
                    id
                )));
            }
            si.sent_bytes
        };

        // 捎带待发的 ACK
        let mut seed = Writer::new();
        {
            let now = self.now_us();
            let lvl = self.levels.get_mut(Level::Application);
            if lvl.ack_pending() {
                let largest = lvl.largest_pn.unwrap();
                let delay = now.saturating_sub(lvl.arriv_time);
                build_ack_frame(&mut seed, largest, delay, lvl.first_ack_range);
                lvl.largest_acked = Some(largest);
            }
        }

        let budget = payload_budget(self.ctx.mss, Level::Application, self.dcid.len(), 0, 0);
        split_stream(
            &mut self.sendq,
            Level::Application,
            budget,
            id,
            offset,
            data,
            fin,
            seed.into_vec(),
        )?;

        self.streams_mut()?.mark_sent(id, data.len(), fin)?;
        self.flush()?;

        Ok(data.len())
    }

    /// 从流上按序读取
    ///
    /// 没有现成数据时读 port；port 无数据则返回 `WouldBlock`。
    /// 流收尾且全部读完后返回 0。
    pub fn stream_recv(&mut self, id: u64, buf: &mut [u8]) -> Result<usize> {
        loop {
            {
                let streams = self.streams_mut()?;
                let si = streams.get(id)?;
                if matches!(
                    si.recv_state,
                    crate::stream::StreamState::ResetRecvd | crate::stream::StreamState::ResetRead
                ) {
                    return Err(QuicError::ProtocolViolation(format!(
                        "Stream {} was reset by peer",
                        id
                    )));
                }

                let n = streams.read(id, buf)?;
                if n > 0 {
                    return Ok(n);
                }

                if streams.get(id)?.recv_state == crate::stream::StreamState::DataRead {
                    return Ok(0);
                }
            }

            // 没有可读数据：等下一个 datagram
            let n = {
                let mut rb = std::mem::take(&mut self.read_buf);
                let r = self.port.recv(&mut rb);
                self.read_buf = rb;
                r?
            };

            let mut datagram = self.read_buf[..n].to_vec();
            if let Err(e) = self.process_datagram(&mut datagram) {
                self.fatal(&e);
                return Err(e);
            }
            self.flush()?;
        }
    }

    /// 取下一条流事件
    pub fn poll_stream_msg(&mut self) -> Option<StreamMsg> {
        self.streams.as_mut()?.poll_msg()
    }

    /// 流状态查询（调试/测试）
    pub fn stream_states(
        &mut self,
        id: u64,
    ) -> Result<(crate::stream::StreamState, crate::stream::StreamState)> {
        let si = self.streams_mut()?.get(id)?;
        Ok((si.recv_state, si.send_state))
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("scid", &self.scid)
            .field("dcid", &self.dcid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SigningKey;
    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::rc::Rc;

    type Wire = Rc<RefCell<VecDeque<Vec<u8>>>>;

    /// 内存回环 port：一对共享队列，一次 recv 一个 datagram
    struct MemoryPort {
        rx: Wire,
        tx: Wire,
        sent: Rc<RefCell<usize>>,
    }

    impl DatagramPort for MemoryPort {
        fn recv(&mut self, buf: &mut [u8]) -> Result<usize> {
            match self.rx.borrow_mut().pop_front() {
                Some(datagram) => {
                    buf[..datagram.len()].copy_from_slice(&datagram);
                    Ok(datagram.len())
                }
                None => Err(QuicError::WouldBlock),
            }
        }

        fn send(&mut self, buf: &[u8]) -> Result<usize> {
            *self.sent.borrow_mut() += 1;
            self.tx.borrow_mut().push_back(buf.to_vec());
            Ok(buf.len())
        }
    }

    fn port_pair() -> (MemoryPort, MemoryPort, Rc<RefCell<usize>>, Rc<RefCell<usize>>) {
        let a: Wire = Rc::new(RefCell::new(VecDeque::new()));
        let b: Wire = Rc::new(RefCell::new(VecDeque::new()));
        let client_sent = Rc::new(RefCell::new(0));
        let server_sent = Rc::new(RefCell::new(0));

        let client_port = MemoryPort {
            rx: a.clone(),
            tx: b.clone(),
            sent: client_sent.clone(),
        };
        let server_port = MemoryPort {
            rx: b,
            tx: a,
            sent: server_sent.clone(),
        };
        (client_port, server_port, client_sent, server_sent)
    }

    fn server_ctx() -> Arc<QuicConfig> {
        Arc::new(QuicConfig {
            alpn: vec![b"hq-interop".to_vec()],
            cert_chain: vec![vec![0x30, 0x82, 0x01, 0x00, 0xaa, 0xbb]],
            signing_key: Some(SigningKey::generate_p256().unwrap()),
            ..QuicConfig::default()
        })
    }

    fn client_ctx() -> Arc<QuicConfig> {
        Arc::new(QuicConfig {
            alpn: vec![b"hq-interop".to_vec()],
            server_name: Some("loopback.test".into()),
            ..QuicConfig::default()
        })
    }

    fn establish() -> (Connection, Connection, usize, usize) {
        let (cp, sp, c_sent, s_sent) = port_pair();

        let mut client = Connection::new_client(client_ctx(), Box::new(cp)).unwrap();
        let mut server = Connection::new_server(server_ctx(), Box::new(sp)).unwrap();

        for _ in 0..20 {
            if !client.is_established() {
                match client.do_handshake() {
                    Ok(()) | Err(QuicError::WouldBlock) => {}
                    Err(e) => panic!("Client handshake failed: {}", e),
                }
            }
            if !server.is_established() {
                match server.do_handshake() {
                    Ok(()) | Err(QuicError::WouldBlock) => {}
                    Err(e) => panic!("Server handshake failed: {}", e),
                }
            }
            if client.is_established() && server.is_established() {
                break;
            }
        }

        assert!(client.is_established(), "Client not established");
        assert!(server.is_established(), "Server not established");

        let c = *c_sent.borrow();
        let s = *s_sent.borrow();
        (client, server, c, s)
    }

    /// 回环全握手：双方 HandshakeDone，套件 0x1301，来回不超过 6 个 datagram
    #[test]
    fn test_loopback_handshake() {
        let (client, server, client_sent, server_sent) = establish();

        assert_eq!(client.cipher_suite(), Some(0x1301));
        assert_eq!(server.cipher_suite(), Some(0x1301));
        assert_eq!(client.alpn(), Some(&b"hq-interop"[..]));

        assert!(client_sent <= 6, "Client sent {} datagrams", client_sent);
        assert!(server_sent <= 6, "Server sent {} datagrams", server_sent);

        // DCID 已定格为对端的 SCID
        assert_eq!(client.dcid(), server.scid());
        assert_eq!(server.dcid(), client.scid());

        // 客户端握手后收到了 session ticket
        assert!(client.session_ticket().is_some());
    }

    /// ack-eliciting 帧之后，该级别下一个出站包携带 largest_pn 的 ACK
    #[test]
    fn test_ack_elicitation_after_stream_frame() {
        let (mut client, mut server, _, _) = establish();

        let id = client.stream_open(false).unwrap();
        client.stream_send(id, b"ping data", false).unwrap();

        // 服务端消化 STREAM 帧（ack-eliciting）并立即回 ACK
        server.drive().unwrap();
        let app = &server.levels.application;
        assert!(app.largest_pn.is_some());
        assert_eq!(app.largest_acked, app.largest_pn);

        // 客户端看到自己的包被确认
        client.drive().unwrap();
        assert!(client.levels.application.peer_acked.is_some());
    }

    /// 服务端收到 NEW_TOKEN 是协议违规，连接进入 Closing
    #[test]
    fn test_new_token_from_client_is_violation() {
        let (_, mut server, _, _) = establish();

        let mut w = Writer::new();
        w.put_varint(0x07);
        w.put_varint(5);
        w.put_bytes(b"token");

        let err = server
            .process_payload(Level::Application, w.as_slice())
            .unwrap_err();
        assert!(matches!(err, QuicError::ProtocolViolation(_)));

        server.fatal(&err);
        assert_eq!(server.state(), ConnState::Closing);
    }

    /// 客户端收到 NEW_TOKEN 则收存
    #[test]
    fn test_new_token_stored_on_client() {
        let (mut client, _, _, _) = establish();

        let mut w = Writer::new();
        w.put_varint(0x07);
        w.put_varint(4);
        w.put_bytes(b"tokn");

        client
            .process_payload(Level::Application, w.as_slice())
            .unwrap();
        assert_eq!(client.token().map(|t| t.as_ref()), Some(&b"tokn"[..]));
    }

    /// HANDSHAKE_DONE 只允许服务端发出
    #[test]
    fn test_handshake_done_from_client_is_violation() {
        let (_, mut server, _, _) = establish();

        let mut w = Writer::new();
        build_handshake_done_frame(&mut w);

        let err = server
            .process_payload(Level::Application, w.as_slice())
            .unwrap_err();
        assert!(matches!(err, QuicError::ProtocolViolation(_)));
    }

    /// 应用级解密失败默认只丢包；配了 reset token 才会进 Draining
    #[test]
    fn test_stateless_reset_hook() {
        // 默认：未知 datagram 被丢弃，连接不受影响
        let (mut client, _server, _, _) = establish();
        let garbage = vec![0x40u8; 64];
        let mut datagram = garbage.clone();
        client.process_datagram(&mut datagram).unwrap();
        assert!(client.is_established());

        // 配置 token 后，尾部匹配的失败 datagram 触发 Draining
        let token = [0x5au8; 16];
        let (cp, sp, _, _) = port_pair();
        let ctx = Arc::new(QuicConfig {
            alpn: vec![b"hq-interop".to_vec()],
            server_name: Some("loopback.test".into()),
            stateless_reset_tokens: vec![token],
            ..QuicConfig::default()
        });
        let mut client = Connection::new_client(ctx, Box::new(cp)).unwrap();
        let mut server = Connection::new_server(server_ctx(), Box::new(sp)).unwrap();
        for _ in 0..20 {
            let _ = client.do_handshake();
            let _ = server.do_handshake();
            if client.is_established() && server.is_established() {
                break;
            }
        }
        assert!(client.is_established());

        let mut datagram = vec![0x40u8; 64];
        let tail = datagram.len() - 16;
        datagram[tail..].copy_from_slice(&token);
        client.process_datagram(&mut datagram).unwrap();
        assert_eq!(client.state(), ConnState::Draining);
    }

    /// 双向流回显：客户端发、服务端读、再回写
    #[test]
    fn test_bidi_stream_round_trip() {
        let (mut client, mut server, _, _) = establish();

        let id = client.stream_open(false).unwrap();
        client.stream_send(id, b"hello server", true).unwrap();

        server.drive().unwrap();
        assert_eq!(server.poll_stream_msg(), Some(StreamMsg::DataReceived(id)));

        let mut buf = [0u8; 64];
        let n = server.stream_recv(id, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello server");

        server.stream_send(id, b"hello client", true).unwrap();
        client.drive().unwrap();

        let n = client.stream_recv(id, &mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello client");
    }
}
