//! 密钥日程与加密级别状态
//!
//! 参考 RFC 9001 Section 5.2: Initial Secrets
//!
//! 每个连接有三个加密级别 (initial / handshake / application)，
//! 各自持有独立的包号空间、收发方向密钥和 ACK 簿记。
//! initial 密钥由客户端选择的 DCID 派生，双方各自可算；
//! handshake / application 密钥由 TLS 1.3 secret schedule 灌入
//! (见 `tls::key_schedule`)。

use crate::crypto::aead::{AeadAlg, HeaderProtector, PacketProtector};
use crate::crypto::hkdf::{hkdf_expand_label, hkdf_extract, Hash};
use crate::error::{QuicError, Result};

/// QUIC Version 1 Initial Salt
///
/// RFC 9001: https://www.rfc-editor.org/rfc/rfc9001.html#name-initial-secrets
pub const INITIAL_SALT_V1: &[u8] = &[
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

pub const QUIC_VERSION_1: u32 = 0x0000_0001;

/// 端点角色
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// 加密级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Initial,
    Handshake,
    Application,
}

/// 单方向的保护密钥组: HP 密钥 + AEAD 密钥 + 静态 IV
#[derive(Debug)]
pub struct DirectionKeys {
    pub hp: HeaderProtector,
    pub pp: PacketProtector,
    pub iv: [u8; 12],
}

impl DirectionKeys {
    /// 从 traffic secret 派生方向密钥
    ///
    /// RFC 9001 Section 5.1:
    /// - key = HKDF-Expand-Label(secret, "quic key", "", key_len)
    /// - iv  = HKDF-Expand-Label(secret, "quic iv", "", 12)
    /// - hp  = HKDF-Expand-Label(secret, "quic hp", "", key_len)
    pub fn derive(alg: AeadAlg, hash: Hash, secret: &[u8]) -> Result<Self> {
        let key = hkdf_expand_label(hash, secret, b"quic key", b"", alg.key_len())?;
        let iv_bytes = hkdf_expand_label(hash, secret, b"quic iv", b"", 12)?;
        let hp_key = hkdf_expand_label(hash, secret, b"quic hp", b"", alg.key_len())?;

        let mut iv = [0u8; 12];
        iv.copy_from_slice(&iv_bytes);

        Ok(DirectionKeys {
            hp: HeaderProtector::new(alg, &hp_key)?,
            pp: PacketProtector::new(alg, &key)?,
            iv,
        })
    }
}

/// CRYPTO 帧按 offset 重组出的 TLS 输入缓冲
///
/// 乱序/重复的分片直接按 offset 落位，`data_len` 是水位线
/// `max(data_len, offset + len)`；TLS 引擎从 `offset`（已消费位置）
/// 开始读取。
#[derive(Debug, Default)]
pub struct CryptoBuf {
    data: Vec<u8>,
    data_len: usize,
    consumed: usize,
}

impl CryptoBuf {
    pub fn new() -> Self {
        Self::default()
    }

    /// 落位一个 (offset, bytes) 分片，缓冲按需增长
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let offset = usize::try_from(offset)
            .map_err(|_| QuicError::Malformed("CRYPTO offset overflow".into()))?;
        let end = offset
            .checked_add(bytes.len())
            .ok_or_else(|| QuicError::Malformed("CRYPTO length overflow".into()))?;

        if end > self.data.len() {
            self.data.resize(end, 0);
        }

        self.data[offset..end].copy_from_slice(bytes);

        if end > self.data_len {
            self.data_len = end;
        }

        Ok(())
    }

    /// 当前可供 TLS 消费的连续字节
    pub fn pending(&self) -> &[u8] {
        &self.data[self.consumed..self.data_len]
    }

    /// TLS 消费掉 n 字节
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.consumed + n <= self.data_len);
        self.consumed += n;
    }

    pub fn data_len(&self) -> usize {
        self.data_len
    }

    #[cfg(test)]
    pub fn assembled(&self) -> &[u8] {
        &self.data[..self.data_len]
    }
}

/// 一个加密级别的全部可变状态
#[derive(Debug, Default)]
pub struct CryptoLevel {
    /// 发送方向密钥；`Some` 即 cipher_inited，二次安装是 no-op
    pub encrypt: Option<DirectionKeys>,
    /// 接收方向密钥
    pub decrypt: Option<DirectionKeys>,

    /// 下一个出站包号，从 0 单调递增
    pub next_pn: u64,
    /// 已接收并成功解密的最大包号
    pub largest_pn: Option<u64>,
    /// largest_pn 到达时刻（连接单调时钟，微秒）
    pub arriv_time: u64,
    /// 我们已经 ACK 过的最大包号
    pub largest_acked: Option<u64>,
    /// largest_pn 以下连续收到的包数（占位实现恒为 0，单范围 ACK）
    pub first_ack_range: u64,
    /// 对端 ACK 帧声明的最大已确认包号
    pub peer_acked: Option<u64>,

    /// CRYPTO 帧重组出的 TLS 输入
    pub tls_in: CryptoBuf,
    /// TLS 产出的待封装握手字节
    pub tls_out: Vec<u8>,
    /// 本级别 CRYPTO 流已发送到的 offset
    pub crypto_sent: u64,
}

impl CryptoLevel {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个解密成功的入站包
    pub fn on_packet_received(&mut self, pn: u64, now_us: u64) {
        match self.largest_pn {
            Some(largest) if pn <= largest => {}
            _ => {
                self.largest_pn = Some(pn);
                self.arriv_time = now_us;
            }
        }
    }

    /// 是否需要发送 ACK: largest_acked < largest_pn 且发送密钥可用
    pub fn ack_pending(&self) -> bool {
        if self.encrypt.is_none() {
            return false;
        }

        match (self.largest_pn, self.largest_acked) {
            (Some(pn), Some(acked)) => acked < pn,
            (Some(_), None) => true,
            _ => false,
        }
    }

    /// 对端 ACK 推进 peer_acked；后退的 largest_acked 被忽略
    pub fn on_ack_received(&mut self, largest_acked: u64) {
        match self.peer_acked {
            Some(prev) if largest_acked <= prev => {}
            _ => self.peer_acked = Some(largest_acked),
        }
    }
}

/// 三个加密级别的集合
#[derive(Debug, Default)]
pub struct LevelSet {
    pub initial: CryptoLevel,
    pub handshake: CryptoLevel,
    pub application: CryptoLevel,
}

impl LevelSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, level: Level) -> &CryptoLevel {
        match level {
            Level::Initial => &self.initial,
            Level::Handshake => &self.handshake,
            Level::Application => &self.application,
        }
    }

    pub fn get_mut(&mut self, level: Level) -> &mut CryptoLevel {
        match level {
            Level::Initial => &mut self.initial,
            Level::Handshake => &mut self.handshake,
            Level::Application => &mut self.application,
        }
    }
}

/// 从 DCID 派生 initial client/server traffic secrets
///
/// RFC 9001 Section 5.2:
/// 1. initial_secret = HKDF-Extract(salt_v1, dcid)
/// 2. client_initial = HKDF-Expand-Label(initial_secret, "client in", "", 32)
/// 3. server_initial = HKDF-Expand-Label(initial_secret, "server in", "", 32)
pub fn derive_initial_secrets(dcid: &[u8], version: u32) -> Result<(Vec<u8>, Vec<u8>)> {
    // 目前只支持 v1，未知版本按 v1 salt 处理（向后兼容）
    let salt = match version {
        QUIC_VERSION_1 => INITIAL_SALT_V1,
        _ => INITIAL_SALT_V1,
    };

    let initial_secret = hkdf_extract(Hash::Sha256, salt, dcid);

    let client = hkdf_expand_label(Hash::Sha256, &initial_secret, b"client in", b"", 32)?;
    let server = hkdf_expand_label(Hash::Sha256, &initial_secret, b"server in", b"", 32)?;

    Ok((client, server))
}

/// 安装 initial 级别的收发密钥
///
/// Initial 包固定使用 AEAD_AES_128_GCM + AES-128-ECB HP。
/// 幂等：密钥已装过时直接返回（包括携带不同 DCID 的重复调用，
/// 密钥绑定首个 DCID）。
pub fn install_initial(
    level: &mut CryptoLevel,
    role: Role,
    dcid: &[u8],
    version: u32,
) -> Result<()> {
    if level.encrypt.is_some() || level.decrypt.is_some() {
        return Ok(());
    }

    let (client_secret, server_secret) = derive_initial_secrets(dcid, version)?;

    let (enc_secret, dec_secret) = match role {
        Role::Client => (&client_secret, &server_secret),
        Role::Server => (&server_secret, &client_secret),
    };

    level.encrypt = Some(DirectionKeys::derive(
        AeadAlg::Aes128Gcm,
        Hash::Sha256,
        enc_secret,
    )?);
    level.decrypt = Some(DirectionKeys::derive(
        AeadAlg::Aes128Gcm,
        Hash::Sha256,
        dec_secret,
    )?);

    Ok(())
}

/// 安装 handshake/application 级别某个方向的 traffic 密钥
///
/// 同方向二次安装是 no-op（密钥恰好可读一次）。
pub fn install_traffic_secret(
    level: &mut CryptoLevel,
    alg: AeadAlg,
    hash: Hash,
    secret: &[u8],
    encrypt: bool,
) -> Result<()> {
    let slot = if encrypt {
        &mut level.encrypt
    } else {
        &mut level.decrypt
    };

    if slot.is_some() {
        return Ok(());
    }

    *slot = Some(DirectionKeys::derive(alg, hash, secret)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RFC_DCID: [u8; 8] = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];

    /// RFC 9001 Appendix A.1 测试向量
    #[test]
    fn test_initial_keys_rfc9001() {
        let mut level = CryptoLevel::new();
        install_initial(&mut level, Role::Client, &RFC_DCID, QUIC_VERSION_1).unwrap();

        // client 方向 (encrypt) 的 IV
        let enc = level.encrypt.as_ref().unwrap();
        assert_eq!(hex::encode(enc.iv), "fa044b2f42a3fd3b46fb255c");

        // server 方向 (decrypt) 的 IV
        let dec = level.decrypt.as_ref().unwrap();
        assert_eq!(hex::encode(dec.iv), "0ac1493ca1905853b0bba03e");
    }

    #[test]
    fn test_initial_key_material_vectors() {
        // 直接核对 key / hp 派生值 (RFC 9001 A.1)
        let (client_secret, server_secret) =
            derive_initial_secrets(&RFC_DCID, QUIC_VERSION_1).unwrap();

        let key = hkdf_expand_label(Hash::Sha256, &client_secret, b"quic key", b"", 16).unwrap();
        assert_eq!(hex::encode(&key), "1f369613dd76d5467730efcbe3b1a22d");

        let hp = hkdf_expand_label(Hash::Sha256, &client_secret, b"quic hp", b"", 16).unwrap();
        assert_eq!(hex::encode(&hp), "9f50449e04a0e810283a1e9933adedd2");

        let skey = hkdf_expand_label(Hash::Sha256, &server_secret, b"quic key", b"", 16).unwrap();
        assert_eq!(hex::encode(&skey), "cf3a5331653c364c88f0f379b6067e37");

        let shp = hkdf_expand_label(Hash::Sha256, &server_secret, b"quic hp", b"", 16).unwrap();
        assert_eq!(hex::encode(&shp), "c206b8d9b9f0f37644430b490eeaa314");
    }

    #[test]
    fn test_install_initial_idempotent() {
        let mut level = CryptoLevel::new();
        install_initial(&mut level, Role::Client, &RFC_DCID, QUIC_VERSION_1).unwrap();
        let iv_before = level.encrypt.as_ref().unwrap().iv;

        // 带不同 DCID 的二次安装被忽略，密钥仍绑定首个 DCID
        install_initial(&mut level, Role::Client, &[0xde, 0xad], QUIC_VERSION_1).unwrap();
        assert_eq!(level.encrypt.as_ref().unwrap().iv, iv_before);
    }

    #[test]
    fn test_roles_are_mirrored() {
        let mut client = CryptoLevel::new();
        let mut server = CryptoLevel::new();
        install_initial(&mut client, Role::Client, &RFC_DCID, QUIC_VERSION_1).unwrap();
        install_initial(&mut server, Role::Server, &RFC_DCID, QUIC_VERSION_1).unwrap();

        assert_eq!(
            client.encrypt.as_ref().unwrap().iv,
            server.decrypt.as_ref().unwrap().iv
        );
        assert_eq!(
            client.decrypt.as_ref().unwrap().iv,
            server.encrypt.as_ref().unwrap().iv
        );
    }

    #[test]
    fn test_crypto_buf_out_of_order() {
        let mut buf = CryptoBuf::new();
        buf.write_at(4, b"5678").unwrap();
        buf.write_at(0, b"1234").unwrap();
        // 重复分片被吸收
        buf.write_at(2, b"34").unwrap();

        assert_eq!(buf.data_len(), 8);
        assert_eq!(buf.pending(), b"12345678");

        buf.advance(3);
        assert_eq!(buf.pending(), b"45678");
    }

    #[test]
    fn test_crypto_buf_permuted_overlapping_segments() {
        // 源数据 [0, 997)，切成重叠分片后乱序落位、部分重复投递，
        // 重组结果必须与源一致，水位线等于总长
        let source: Vec<u8> = (0..997u32).map(|i| (i.wrapping_mul(31) % 256) as u8).collect();

        let mut segments = Vec::new();
        let mut at = 0usize;
        while at < source.len() {
            let len = 64.min(source.len() - at);
            // 相邻分片重叠 16 字节
            let start = at.saturating_sub(16);
            segments.push((start, source[start..at + len].to_vec()));
            at += len;
        }

        // 确定性的"乱序": 先偶数下标、再奇数下标倒序，末尾整体重发一轮
        let mut order: Vec<usize> = (0..segments.len()).step_by(2).collect();
        order.extend((0..segments.len()).skip(1).step_by(2).rev());
        order.extend(0..segments.len());

        let mut buf = CryptoBuf::new();
        for idx in order {
            let (offset, data) = &segments[idx];
            buf.write_at(*offset as u64, data).unwrap();
        }

        assert_eq!(buf.data_len(), source.len());
        assert_eq!(buf.pending(), &source[..]);
    }

    #[test]
    fn test_ack_pending_logic() {
        let mut level = CryptoLevel::new();
        install_initial(&mut level, Role::Server, &RFC_DCID, QUIC_VERSION_1).unwrap();

        // 还没收到包
        assert!(!level.ack_pending());

        level.on_packet_received(0, 10);
        assert!(level.ack_pending());

        level.largest_acked = Some(0);
        assert!(!level.ack_pending());

        level.on_packet_received(5, 20);
        assert!(level.ack_pending());
        assert_eq!(level.largest_pn, Some(5));
        assert_eq!(level.arriv_time, 20);

        // 乱序的旧包不回退 largest_pn / arriv_time
        level.on_packet_received(3, 30);
        assert_eq!(level.largest_pn, Some(5));
        assert_eq!(level.arriv_time, 20);
    }
}
