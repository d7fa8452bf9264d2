//! 内嵌的 TLS 1.3 握手引擎
//!
//! 参考 RFC 8446, RFC 9001 Section 4: Carrying TLS Messages
//!
//! # 架构
//!
//! - [`client`] / [`server`]: 硬编码的角色流程表（状态 → 流向/消息
//!   类型/处理器/后置工作/跳过检查/下一状态/发出级别）
//! - [`extension`]: 按 (类型, 上下文) 建表的扩展解析与构造
//! - [`transport_params`]: quic_transport_parameters 扩展
//! - [`key_schedule`]: TLS 1.3 secret schedule 与 Finished MAC
//! - [`ticket`]: session ticket 密封/解封
//!
//! 消息封装是 `type(1) | length(3) | body`，按 wire 原样喂进
//! transcript hash。引擎不持有对连接的反向指针：密钥安装和
//! 握手字节的进出都通过显式传入的 [`LevelSet`] 完成。

pub mod client;
pub mod extension;
pub mod key_schedule;
pub mod server;
pub mod ticket;
pub mod transport_params;

use crate::codec::{Reader, Writer};
use crate::config::QuicConfig;
use crate::crypto::transcript::Transcript;
use crate::error::{QuicError, Result};
use crate::keys::{install_traffic_secret, Level, LevelSet, Role};
use crate::tls::key_schedule::{
    application_traffic_secrets, derive_handshake_secret, derive_master_secret, derive_secret,
    finished_key, finished_mac, handshake_traffic_secrets, CipherSuite,
};
use crate::tls::ticket::SessionTicket;
use crate::tls::transport_params::TransportParams;
use ring::agreement;
use ring::rand::SystemRandom;
use std::sync::Arc;
use tracing::{debug, trace};

pub const TLS_VERSION_1_2: u16 = 0x0303;
pub const TLS_VERSION_1_3: u16 = 0x0304;

/// TLS 握手消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HandshakeType {
    ClientHello = 1,
    ServerHello = 2,
    NewSessionTicket = 4,
    EncryptedExtensions = 8,
    Certificate = 11,
    CertificateRequest = 13,
    CertificateVerify = 15,
    Finished = 20,
}

impl HandshakeType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => HandshakeType::ClientHello,
            2 => HandshakeType::ServerHello,
            4 => HandshakeType::NewSessionTicket,
            8 => HandshakeType::EncryptedExtensions,
            11 => HandshakeType::Certificate,
            13 => HandshakeType::CertificateRequest,
            15 => HandshakeType::CertificateVerify,
            20 => HandshakeType::Finished,
            _ => return None,
        })
    }
}

/// 握手状态机状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsState {
    Start,
    // 客户端流程
    CwClientHello,
    CrServerHello,
    CrEncryptedExtensions,
    CrCertRequest,
    CrServerCertificate,
    CrCertVerify,
    CrFinished,
    CwCertificate,
    CwCertVerify,
    CwFinished,
    // 服务端流程
    SrClientHello,
    SwServerHello,
    SwEncryptedExtensions,
    SwCertRequest,
    SwServerCertificate,
    SwCertVerify,
    SwFinished,
    SrCertificate,
    SrCertVerify,
    SrFinished,
    SwNewSessionTicket,
    SwHandshakeDone,
    HandshakeDone,
}

/// 状态的流向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDir {
    Nothing,
    Reading,
    Writing,
    Finished,
}

/// 流程返回值
///
/// 错误路径不在枚举里，走 `Result` 的 Err 分支。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowReturn {
    /// 流程被调用者叫停
    Stop,
    /// 本状态完成，把控制权交回外层再推进
    Next,
    /// 输入耗尽，等下一个 CRYPTO 帧
    WantRead,
    /// 出站被阻塞
    WantWrite,
    /// 当前状态处理完毕，可继续推进
    Continue,
    /// 一条消息处理完成
    Finish,
    /// 重传消息被读掉并丢弃，状态未变
    Drop,
    /// 握手完成
    End,
}

type ReadHandler = fn(&mut TlsSession, &mut LevelSet, &mut Reader<'_>) -> Result<()>;
type WriteHandler = fn(&mut TlsSession, &mut LevelSet, &mut Writer) -> Result<()>;
type PostWork = fn(&mut TlsSession, &mut LevelSet) -> Result<()>;
type SkipCheck = fn(&TlsSession) -> bool;

/// 流程表条目
#[derive(Clone, Copy)]
pub struct FlowStep {
    pub dir: FlowDir,
    pub msg: Option<HandshakeType>,
    pub read: Option<ReadHandler>,
    pub write: Option<WriteHandler>,
    pub post_work: Option<PostWork>,
    /// 条件状态：返回 true 表示本状态可跳过
    pub skip_check: Option<SkipCheck>,
    pub next: TlsState,
    /// 消息发出/读入所在的加密级别
    pub level: Level,
}

impl FlowStep {
    pub(crate) const fn nothing(next: TlsState) -> Self {
        FlowStep {
            dir: FlowDir::Nothing,
            msg: None,
            read: None,
            write: None,
            post_work: None,
            skip_check: None,
            next,
            level: Level::Initial,
        }
    }

    pub(crate) const fn finished() -> Self {
        FlowStep {
            dir: FlowDir::Finished,
            msg: None,
            read: None,
            write: None,
            post_work: None,
            skip_check: None,
            next: TlsState::HandshakeDone,
            level: Level::Application,
        }
    }
}

/// TLS 1.3 命名组
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NamedGroup {
    Secp256r1 = 0x0017,
    Secp384r1 = 0x0018,
    X25519 = 0x001d,
}

impl NamedGroup {
    pub fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0x0017 => NamedGroup::Secp256r1,
            0x0018 => NamedGroup::Secp384r1,
            0x001d => NamedGroup::X25519,
            _ => return None,
        })
    }

    fn ring_alg(&self) -> &'static agreement::Algorithm {
        match self {
            NamedGroup::Secp256r1 => &agreement::ECDH_P256,
            NamedGroup::Secp384r1 => &agreement::ECDH_P384,
            NamedGroup::X25519 => &agreement::X25519,
        }
    }
}

/// 支持的命名组，顺序即偏好
pub const SUPPORTED_GROUPS: &[NamedGroup] = &[
    NamedGroup::X25519,
    NamedGroup::Secp256r1,
    NamedGroup::Secp384r1,
];

/// 生成一把临时密钥，返回 (私钥, 编码的公钥)
pub(crate) fn generate_key_share(group: NamedGroup) -> Result<(agreement::EphemeralPrivateKey, Vec<u8>)> {
    let rng = SystemRandom::new();
    let private = agreement::EphemeralPrivateKey::generate(group.ring_alg(), &rng)
        .map_err(|e| QuicError::Internal(format!("Key share generation: {:?}", e)))?;
    let public = private
        .compute_public_key()
        .map_err(|e| QuicError::Internal(format!("Public key: {:?}", e)))?
        .as_ref()
        .to_vec();
    Ok((private, public))
}

/// ECDH，私钥被消耗
pub(crate) fn agree(
    private: agreement::EphemeralPrivateKey,
    group: NamedGroup,
    peer_public: &[u8],
) -> Result<Vec<u8>> {
    let peer = agreement::UnparsedPublicKey::new(group.ring_alg(), peer_public);
    agreement::agree_ephemeral(private, &peer, |shared| shared.to_vec())
        .map_err(|_| QuicError::ProtocolViolation("Invalid peer key share".into()))
}

/// CertificateVerify 的被签名内容
///
/// RFC 8446 Section 4.4.3: 64 个 0x20 + 上下文串 + 0x00 + transcript hash
pub(crate) fn cert_verify_payload(server: bool, transcript_hash: &[u8]) -> Vec<u8> {
    let context: &[u8] = if server {
        b"TLS 1.3, server CertificateVerify"
    } else {
        b"TLS 1.3, client CertificateVerify"
    };

    let mut out = vec![0x20u8; 64];
    out.extend_from_slice(context);
    out.push(0x00);
    out.extend_from_slice(transcript_hash);
    out
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// TLS 会话状态
pub struct TlsSession {
    pub role: Role,
    pub state: TlsState,
    pub ctx: Arc<QuicConfig>,
    pub transcript: Transcript,

    /// 本端传输参数，CID 字段由连接在握手前填好
    pub local_params: TransportParams,

    pub suite: Option<&'static CipherSuite>,
    pub client_random: [u8; 32],
    pub server_random: [u8; 32],

    /// 本端临时私钥（agree 时被消耗）
    pub(crate) kexch: Option<agreement::EphemeralPrivateKey>,
    pub(crate) kexch_group: Option<NamedGroup>,
    /// 对端提供的 key share 列表 (group, pubkey)
    pub(crate) peer_shares: Vec<(u16, Vec<u8>)>,
    pub(crate) shared_secret: Option<Vec<u8>>,

    // 协商产物
    pub(crate) peer_cipher_ids: Vec<u16>,
    pub(crate) peer_supported_versions: bool,
    pub(crate) peer_groups: Vec<u16>,
    pub(crate) peer_sigalgs: Vec<u16>,
    pub(crate) peer_alpn: Vec<Vec<u8>>,
    pub alpn_selected: Option<Vec<u8>>,
    /// 服务端解析出的 SNI
    pub hostname: Option<String>,
    pub peer_params: Option<TransportParams>,
    pub peer_cert_chain: Vec<Vec<u8>>,

    // secret schedule 产物
    pub(crate) handshake_secret: Vec<u8>,
    pub(crate) master_secret: Vec<u8>,
    pub(crate) client_hs_secret: Vec<u8>,
    pub(crate) server_hs_secret: Vec<u8>,
    pub(crate) client_ap_secret: Vec<u8>,
    pub(crate) server_ap_secret: Vec<u8>,
    pub resumption_secret: Vec<u8>,
    /// server Finished 之后的 transcript 快照
    pub(crate) server_finished_hash: Vec<u8>,
    /// TakeMac: 在对端 Finished 进 transcript 前预计算的期望 MAC
    pub(crate) peer_finished_expect: Vec<u8>,
    /// 对端 CertificateVerify 之前的 transcript 快照
    pub(crate) cert_verify_transcript: Vec<u8>,

    /// 对端 ClientHello 里的 legacy session id（ServerHello 回显用）
    pub(crate) legacy_session_id: Vec<u8>,
    /// 客户端：服务端发过 CertificateRequest
    pub(crate) cert_requested: bool,
    /// 客户端收到的 session ticket
    pub session_ticket: Option<SessionTicket>,
    /// 服务端：需要发送 HANDSHAKE_DONE 帧
    pub handshake_done_pending: bool,
}

impl TlsSession {
    pub fn new(role: Role, ctx: Arc<QuicConfig>, local_params: TransportParams) -> Self {
        use rand::RngCore;

        let mut client_random = [0u8; 32];
        if role == Role::Client {
            rand::thread_rng().fill_bytes(&mut client_random);
        }

        TlsSession {
            role,
            state: TlsState::Start,
            ctx,
            transcript: Transcript::new(),
            local_params,
            suite: None,
            client_random,
            server_random: [0u8; 32],
            kexch: None,
            kexch_group: None,
            peer_shares: Vec::new(),
            shared_secret: None,
            peer_cipher_ids: Vec::new(),
            peer_supported_versions: false,
            peer_groups: Vec::new(),
            peer_sigalgs: Vec::new(),
            peer_alpn: Vec::new(),
            alpn_selected: None,
            hostname: None,
            peer_params: None,
            peer_cert_chain: Vec::new(),
            handshake_secret: Vec::new(),
            master_secret: Vec::new(),
            client_hs_secret: Vec::new(),
            server_hs_secret: Vec::new(),
            client_ap_secret: Vec::new(),
            server_ap_secret: Vec::new(),
            resumption_secret: Vec::new(),
            server_finished_hash: Vec::new(),
            peer_finished_expect: Vec::new(),
            cert_verify_transcript: Vec::new(),
            legacy_session_id: Vec::new(),
            cert_requested: false,
            session_ticket: None,
            handshake_done_pending: false,
        }
    }

    pub fn is_done(&self) -> bool {
        self.state == TlsState::HandshakeDone
    }

    pub(crate) fn suite(&self) -> Result<&'static CipherSuite> {
        self.suite
            .ok_or_else(|| QuicError::Internal("Cipher suite not negotiated".into()))
    }

    fn step(&self, state: TlsState) -> FlowStep {
        match self.role {
            Role::Client => client::client_step(state),
            Role::Server => server::server_step(state),
        }
    }

    fn flow_order(&self) -> &'static [TlsState] {
        match self.role {
            Role::Client => client::CLIENT_FLOW_ORDER,
            Role::Server => server::SERVER_FLOW_ORDER,
        }
    }

    /// 推进握手状态机
    ///
    /// 读状态从 `levels` 对应级别的 TLS 输入缓冲消费消息，
    /// 写状态把消息追加到对应级别的 `tls_out`。
    /// 返回 `WantRead`（要等更多 CRYPTO 数据）、`Drop`
    /// （丢弃了一条重传消息）或 `End`（握手完成）。
    pub fn advance(&mut self, levels: &mut LevelSet) -> Result<FlowReturn> {
        loop {
            if self.state == TlsState::HandshakeDone {
                return Ok(FlowReturn::End);
            }

            let step = self.step(self.state);

            // 写/空状态的条件跳过（读状态在消息类型不匹配时跳过）
            if step.dir != FlowDir::Reading {
                if let Some(skip) = step.skip_check {
                    if skip(self) {
                        trace!("Optional state {:?} skipped", self.state);
                        self.state = step.next;
                        continue;
                    }
                }
            }

            match step.dir {
                FlowDir::Nothing => {
                    if let Some(pw) = step.post_work {
                        pw(self, levels)?;
                    }
                    self.state = step.next;
                }
                FlowDir::Finished => return Ok(FlowReturn::End),
                FlowDir::Reading => match self.read_message(levels, step)? {
                    FlowReturn::WantRead => return Ok(FlowReturn::WantRead),
                    FlowReturn::Drop => return Ok(FlowReturn::Drop),
                    _ => {}
                },
                FlowDir::Writing => {
                    self.write_message(levels, step)?;
                }
            }
        }
    }

    /// 对端把已走过的读状态的消息重发了？
    fn is_retransmit(&self, msg_type: u8) -> bool {
        let order = self.flow_order();
        let current = order.iter().position(|s| *s == self.state);

        let Some(current) = current else { return false };

        for state in &order[..current] {
            let step = self.step(*state);
            if step.dir != FlowDir::Reading {
                continue;
            }
            if let Some(expected) = step.msg {
                if expected as u8 == msg_type {
                    return true;
                }
            }
        }
        false
    }

    /// 读取并处理一条握手消息
    fn read_message(&mut self, levels: &mut LevelSet, step: FlowStep) -> Result<FlowReturn> {
        let mut step = step;

        loop {
            let (msg_type, body_len, avail) = {
                let pending = levels.get(step.level).tls_in.pending();
                if pending.len() < 4 {
                    return Ok(FlowReturn::WantRead);
                }
                let body_len = ((pending[1] as usize) << 16)
                    | ((pending[2] as usize) << 8)
                    | (pending[3] as usize);
                (pending[0], body_len, pending.len())
            };

            let expected = step
                .msg
                .ok_or_else(|| QuicError::Internal("Reading state without msg type".into()))?;

            if msg_type != expected as u8 {
                // 条件读状态：类型不匹配时跳到下一状态再试
                if step.skip_check.map_or(false, |f| f(self)) {
                    trace!("Optional state {:?} skipped (got type {})", self.state, msg_type);
                    self.state = step.next;
                    let next = self.step(self.state);
                    if next.dir != FlowDir::Reading {
                        return Ok(FlowReturn::Continue);
                    }
                    step = next;
                    continue;
                }

                // 已处理过的消息被重传：读掉并丢弃，不碰 transcript 和状态
                if self.is_retransmit(msg_type) {
                    if avail < 4 + body_len {
                        return Ok(FlowReturn::WantRead);
                    }
                    levels.get_mut(step.level).tls_in.advance(4 + body_len);
                    debug!("Retransmitted message type {} dropped", msg_type);
                    return Ok(FlowReturn::Drop);
                }

                return Err(QuicError::UnexpectedMessage(format!(
                    "Message type {} in state {:?}",
                    msg_type, self.state
                )));
            }

            if avail < 4 + body_len {
                return Ok(FlowReturn::WantRead);
            }

            let msg = levels.get(step.level).tls_in.pending()[..4 + body_len].to_vec();
            levels.get_mut(step.level).tls_in.advance(4 + body_len);

            // Finished 的期望 MAC 必须在消息进 transcript 之前取出
            if expected == HandshakeType::Finished {
                self.take_expected_finished_mac()?;
            }

            // CertificateVerify 签的是不含它自身的 transcript，先留快照
            if expected == HandshakeType::CertificateVerify {
                self.cert_verify_transcript = self.transcript.current()?;
            }

            self.transcript.update(&msg);

            debug!("TLS read {:?} ({} bytes) in {:?}", expected, body_len, self.state);

            let prev = self.state;
            let handler = step
                .read
                .ok_or_else(|| QuicError::Internal("Reading state without handler".into()))?;

            let mut body = Reader::new(&msg[4..]);
            handler(self, levels, &mut body)?;

            // 处理器没有显式改状态时走默认的 next
            if self.state == prev {
                self.state = step.next;
            }

            if let Some(pw) = step.post_work {
                pw(self, levels)?;
            }

            return Ok(FlowReturn::Finish);
        }
    }

    /// 构造并发出一条握手消息
    fn write_message(&mut self, levels: &mut LevelSet, step: FlowStep) -> Result<()> {
        let msg_type = step
            .msg
            .ok_or_else(|| QuicError::Internal("Writing state without msg type".into()))?;
        let handler = step
            .write
            .ok_or_else(|| QuicError::Internal("Writing state without handler".into()))?;

        let prev = self.state;

        let mut w = Writer::new();
        w.put_u8(msg_type as u8);
        w.sub_u24(|w| handler(self, levels, w))?;

        self.transcript.update(w.as_slice());

        debug!(
            "TLS write {:?} ({} bytes) at {:?} level",
            msg_type,
            w.len(),
            step.level
        );

        levels.get_mut(step.level).tls_out.extend_from_slice(w.as_slice());

        if self.state == prev {
            self.state = step.next;
        }

        if let Some(pw) = step.post_work {
            pw(self, levels)?;
        }

        Ok(())
    }

    /// 预计算对端 Finished 的期望 verify_data (TakeMac)
    fn take_expected_finished_mac(&mut self) -> Result<()> {
        let suite = self.suite()?;
        let peer_secret = match self.role {
            Role::Client => &self.server_hs_secret,
            Role::Server => &self.client_hs_secret,
        };

        let key = finished_key(suite.hash, peer_secret)?;
        let th = self.transcript.current()?;
        self.peer_finished_expect = finished_mac(suite.hash, &key, &th);
        Ok(())
    }

    /// 本端 Finished 的 verify_data
    pub(crate) fn own_finished_mac(&self) -> Result<Vec<u8>> {
        let suite = self.suite()?;
        let own_secret = match self.role {
            Role::Client => &self.client_hs_secret,
            Role::Server => &self.server_hs_secret,
        };

        let key = finished_key(suite.hash, own_secret)?;
        let th = self.transcript.current()?;
        Ok(finished_mac(suite.hash, &key, &th))
    }

    fn keylog(&self, label: &str, secret: &[u8]) {
        if let Some(cb) = &self.ctx.keylog {
            cb(&format!(
                "{} {} {}",
                label,
                to_hex(&self.client_random),
                to_hex(secret)
            ));
        }
    }

    /// ECDHE 完成后派生 handshake secrets 并安装 handshake 级别密钥
    pub(crate) fn install_handshake_keys(&mut self, levels: &mut LevelSet) -> Result<()> {
        let suite = self.suite()?;
        let shared = self
            .shared_secret
            .as_ref()
            .ok_or(QuicError::MissingExtension(extension::EXT_KEY_SHARE))?;

        self.handshake_secret = derive_handshake_secret(suite.hash, shared)?;

        let th = self.transcript.current()?;
        let ts = handshake_traffic_secrets(suite.hash, &self.handshake_secret, &th)?;
        self.client_hs_secret = ts.client;
        self.server_hs_secret = ts.server;

        self.keylog("CLIENT_HANDSHAKE_TRAFFIC_SECRET", &self.client_hs_secret);
        self.keylog("SERVER_HANDSHAKE_TRAFFIC_SECRET", &self.server_hs_secret);

        let (enc, dec) = match self.role {
            Role::Client => (&self.client_hs_secret, &self.server_hs_secret),
            Role::Server => (&self.server_hs_secret, &self.client_hs_secret),
        };

        install_traffic_secret(&mut levels.handshake, suite.aead, suite.hash, enc, true)?;
        install_traffic_secret(&mut levels.handshake, suite.aead, suite.hash, dec, false)?;

        debug!("Handshake level keys installed");
        Ok(())
    }

    /// server Finished 进入 transcript 之后调用：
    /// 快照 transcript、派生 master/application secrets 并安装
    /// application 级别密钥，同时派生 resumption master secret。
    pub(crate) fn install_application_keys(&mut self, levels: &mut LevelSet) -> Result<()> {
        let suite = self.suite()?;

        self.server_finished_hash = self.transcript.current()?;
        self.master_secret = derive_master_secret(suite.hash, &self.handshake_secret)?;

        let ts = application_traffic_secrets(suite.hash, &self.master_secret, &self.server_finished_hash)?;
        self.client_ap_secret = ts.client;
        self.server_ap_secret = ts.server;

        self.keylog("CLIENT_TRAFFIC_SECRET_0", &self.client_ap_secret);
        self.keylog("SERVER_TRAFFIC_SECRET_0", &self.server_ap_secret);

        self.resumption_secret = derive_secret(
            suite.hash,
            &self.master_secret,
            b"res master",
            &self.server_finished_hash,
        )?;

        let (enc, dec) = match self.role {
            Role::Client => (&self.client_ap_secret, &self.server_ap_secret),
            Role::Server => (&self.server_ap_secret, &self.client_ap_secret),
        };

        install_traffic_secret(&mut levels.application, suite.aead, suite.hash, enc, true)?;
        install_traffic_secret(&mut levels.application, suite.aead, suite.hash, dec, false)?;

        debug!("Application level keys installed");
        Ok(())
    }

    /// 处理握手完成后到达的 application 级 CRYPTO 数据
    ///
    /// 目前只认 NewSessionTicket（客户端收存）。
    pub fn process_post_handshake(&mut self, levels: &mut LevelSet) -> Result<()> {
        loop {
            let (msg_type, body_len, avail) = {
                let pending = levels.get(Level::Application).tls_in.pending();
                if pending.len() < 4 {
                    return Ok(());
                }
                let body_len = ((pending[1] as usize) << 16)
                    | ((pending[2] as usize) << 8)
                    | (pending[3] as usize);
                (pending[0], body_len, pending.len())
            };

            if avail < 4 + body_len {
                return Ok(());
            }

            match HandshakeType::from_u8(msg_type) {
                Some(HandshakeType::NewSessionTicket) if self.role == Role::Client => {
                    let msg = levels.get(Level::Application).tls_in.pending()[..4 + body_len].to_vec();
                    levels.get_mut(Level::Application).tls_in.advance(4 + body_len);

                    let mut body = Reader::new(&msg[4..]);
                    let ticket = parse_new_session_ticket(&mut body)?;
                    debug!(
                        "Session ticket stored: lifetime={}s ticket_len={}",
                        ticket.lifetime,
                        ticket.ticket.len()
                    );
                    self.session_ticket = Some(ticket);
                }
                _ => {
                    return Err(QuicError::UnexpectedMessage(format!(
                        "Post-handshake message type {}",
                        msg_type
                    )));
                }
            }
        }
    }
}

impl std::fmt::Debug for TlsSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("suite", &self.suite.map(|s| s.id))
            .finish()
    }
}

/// 解析 NewSessionTicket 消息体
fn parse_new_session_ticket(r: &mut Reader<'_>) -> Result<SessionTicket> {
    let lifetime = r.get_u32()?;
    let age_add = r.get_u32()?;
    let nonce = r.get_u8_prefixed()?.rest().to_vec();
    let mut ticket_r = r.get_u16_prefixed()?;
    let ticket = ticket_r.rest().to_vec();
    // 扩展块整体跳过
    let _ = r.get_u16_prefixed()?;

    Ok(SessionTicket {
        lifetime,
        age_add,
        nonce,
        ticket,
    })
}

/// 本端 Finished 消息体：verify_data
pub(crate) fn finished_build(
    s: &mut TlsSession,
    _levels: &mut LevelSet,
    w: &mut Writer,
) -> Result<()> {
    let mac = s.own_finished_mac()?;
    w.put_bytes(&mac);
    Ok(())
}

/// Hello 消息头: legacy_version + random + legacy_session_id
///
/// 返回 session id（ServerHello 需要回显）。
pub(crate) fn parse_hello_head(r: &mut Reader<'_>, random: &mut [u8; 32]) -> Result<Vec<u8>> {
    let _legacy_version = r.get_u16()?;
    r.copy_bytes(random)?;
    let session_id = r.get_u8_prefixed()?.rest().to_vec();
    Ok(session_id)
}

/// Certificate 消息体: context(u8) + 证书链
///
/// 每个表项: cert_data(u24) + extensions(u16)。返回 DER 列表。
pub(crate) fn parse_certificate_msg(r: &mut Reader<'_>) -> Result<Vec<Vec<u8>>> {
    let context = r.get_u8_prefixed()?;
    if !context.is_empty() {
        return Err(QuicError::Malformed("Nonempty certificate context".into()));
    }

    let mut list = r.get_u24_prefixed()?;
    let mut chain = Vec::new();

    while !list.is_empty() {
        let cert = list.get_u24_prefixed()?.rest().to_vec();
        if cert.is_empty() {
            return Err(QuicError::Malformed("Empty certificate entry".into()));
        }
        // 逐证书扩展：跳过
        let _ = list.get_u16_prefixed()?;
        chain.push(cert);
    }

    Ok(chain)
}

/// 构造 Certificate 消息体
pub(crate) fn build_certificate_msg(w: &mut Writer, chain: &[Vec<u8>]) -> Result<()> {
    // certificate_request_context: 空
    w.put_u8(0);
    w.sub_u24(|w| {
        for cert in chain {
            w.sub_u24(|w| {
                w.put_bytes(cert);
                Ok(())
            })?;
            // 逐证书扩展: 空
            w.put_u16(0);
        }
        Ok(())
    })
}
