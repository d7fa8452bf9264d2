//! 端点配置
//!
//! [`QuicConfig`] 是跨连接共享的只读上下文（证书、签名私钥、
//! ALPN 列表、ticket key、传输参数默认值、keylog 回调），
//! 第一条连接建立后不得再修改。
//!
//! [`Config`] 是 demo 可执行程序的 toml 配置文件结构，
//! 通过 [`Config::build_quic_config`] 换算成 `QuicConfig`。

use crate::error::{QuicError, Result};
use crate::tls::transport_params::TransportParams;
use anyhow::Context as _;
use rand::RngCore;
use ring::rand::SystemRandom;
use ring::signature::{self, EcdsaKeyPair, RsaKeyPair};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// TLS 1.3 签名方案 codepoints
pub const SIG_ECDSA_SECP256R1_SHA256: u16 = 0x0403;
pub const SIG_ECDSA_SECP384R1_SHA384: u16 = 0x0503;
pub const SIG_RSA_PSS_RSAE_SHA256: u16 = 0x0804;

/// 本端支持的签名方案，顺序即偏好
pub const SUPPORTED_SIGALGS: &[u16] = &[
    SIG_ECDSA_SECP256R1_SHA256,
    SIG_RSA_PSS_RSAE_SHA256,
    SIG_ECDSA_SECP384R1_SHA384,
];

/// 对端证书验证模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    /// 不验证（原型/测试）
    #[default]
    None,
    /// 通过外部 [`CertVerifier`] 验证
    Peer,
}

/// 外部 PKI 原语接口
///
/// X.509 链验证和 CertificateVerify 签名验证都委托出去，
/// 核心不解析证书内容。
pub trait CertVerifier: Send + Sync {
    /// 验证对端证书链（DER 列表，叶子在前）
    fn verify_chain(&self, chain: &[Vec<u8>], server_name: Option<&str>) -> Result<()>;

    /// 用叶子证书的公钥验证 CertificateVerify 签名
    fn verify_signature(
        &self,
        end_entity: &[u8],
        scheme: u16,
        message: &[u8],
        signature: &[u8],
    ) -> Result<()>;
}

enum SigningKeyInner {
    EcdsaP256(EcdsaKeyPair),
    EcdsaP384(EcdsaKeyPair),
    RsaPss(RsaKeyPair),
}

/// CertificateVerify 用的签名私钥
pub struct SigningKey {
    inner: SigningKeyInner,
}

impl SigningKey {
    /// 从 PKCS#8 DER 加载，依次尝试 ECDSA P-256 / P-384 / RSA
    pub fn from_pkcs8(der: &[u8]) -> Result<Self> {
        let rng = SystemRandom::new();

        if let Ok(kp) =
            EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, der, &rng)
        {
            return Ok(Self {
                inner: SigningKeyInner::EcdsaP256(kp),
            });
        }

        if let Ok(kp) =
            EcdsaKeyPair::from_pkcs8(&signature::ECDSA_P384_SHA384_ASN1_SIGNING, der, &rng)
        {
            return Ok(Self {
                inner: SigningKeyInner::EcdsaP384(kp),
            });
        }

        if let Ok(kp) = RsaKeyPair::from_pkcs8(der) {
            return Ok(Self {
                inner: SigningKeyInner::RsaPss(kp),
            });
        }

        Err(QuicError::BadCertificate(
            "Unsupported private key format".into(),
        ))
    }

    /// 生成一把一次性的 ECDSA P-256 私钥（测试/demo 用）
    pub fn generate_p256() -> Result<Self> {
        let rng = SystemRandom::new();
        let doc = EcdsaKeyPair::generate_pkcs8(&signature::ECDSA_P256_SHA256_ASN1_SIGNING, &rng)
            .map_err(|e| QuicError::Internal(format!("Keygen: {:?}", e)))?;
        Self::from_pkcs8(doc.as_ref())
    }

    /// 本私钥对应的 TLS 签名方案
    pub fn scheme(&self) -> u16 {
        match self.inner {
            SigningKeyInner::EcdsaP256(_) => SIG_ECDSA_SECP256R1_SHA256,
            SigningKeyInner::EcdsaP384(_) => SIG_ECDSA_SECP384R1_SHA384,
            SigningKeyInner::RsaPss(_) => SIG_RSA_PSS_RSAE_SHA256,
        }
    }

    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let rng = SystemRandom::new();
        match &self.inner {
            SigningKeyInner::EcdsaP256(kp) | SigningKeyInner::EcdsaP384(kp) => kp
                .sign(&rng, message)
                .map(|s| s.as_ref().to_vec())
                .map_err(|e| QuicError::Internal(format!("Sign: {:?}", e))),
            SigningKeyInner::RsaPss(kp) => {
                let mut sig = vec![0u8; kp.public().modulus_len()];
                kp.sign(&signature::RSA_PSS_SHA256, &rng, message, &mut sig)
                    .map_err(|e| QuicError::Internal(format!("Sign: {:?}", e)))?;
                Ok(sig)
            }
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey(scheme={:#06x})", self.scheme())
    }
}

/// 服务端 session 缓存条目
#[derive(Debug, Clone)]
pub struct SessionEntry {
    pub suite_id: u16,
    pub psk: Vec<u8>,
}

/// 跨连接共享的端点上下文
///
/// 创建第一条连接之后视为只读；server 侧的 session 缓存是
/// 进程级共享状态，内部用 Mutex 保护。
pub struct QuicConfig {
    /// ALPN 协议列表，顺序即偏好；空表示不协商 ALPN
    pub alpn: Vec<Vec<u8>>,
    /// 客户端 SNI
    pub server_name: Option<String>,
    /// 证书链 (DER，叶子在前)
    pub cert_chain: Vec<Vec<u8>>,
    /// CertificateVerify 签名私钥（服务端必需）
    pub signing_key: Option<SigningKey>,
    /// session ticket 的密封密钥
    pub ticket_key: [u8; 16],
    /// 本端传输参数（CID 相关字段由连接填充）
    pub transport_params: TransportParams,
    pub verify_mode: VerifyMode,
    pub verifier: Option<Box<dyn CertVerifier>>,
    /// 服务端是否发 CertificateRequest
    pub request_client_cert: bool,
    /// NSS key log 格式回调
    pub keylog: Option<Box<dyn Fn(&str) + Send + Sync>>,
    /// 出站 datagram 的 MSS
    pub mss: usize,
    /// stateless reset token 钩子，默认为空（检查不生效）
    pub stateless_reset_tokens: Vec<[u8; 16]>,
    /// 服务端 session 缓存: ticket 字节 -> 会话
    pub session_cache: Mutex<HashMap<Vec<u8>, SessionEntry>>,
}

impl Default for QuicConfig {
    fn default() -> Self {
        let mut ticket_key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut ticket_key);

        Self {
            alpn: Vec::new(),
            server_name: None,
            cert_chain: Vec::new(),
            signing_key: None,
            ticket_key,
            transport_params: default_transport_params(),
            verify_mode: VerifyMode::None,
            verifier: None,
            request_client_cert: false,
            keylog: None,
            mss: 1200,
            stateless_reset_tokens: Vec::new(),
            session_cache: Mutex::new(HashMap::new()),
        }
    }
}

impl std::fmt::Debug for QuicConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuicConfig")
            .field("alpn", &self.alpn.len())
            .field("cert_chain", &self.cert_chain.len())
            .field("verify_mode", &self.verify_mode)
            .field("mss", &self.mss)
            .finish()
    }
}

fn default_transport_params() -> TransportParams {
    TransportParams {
        max_idle_timeout: 30_000,
        max_udp_payload_size: 65527,
        initial_max_data: 1 << 20,
        initial_max_stream_data_bidi_local: 256 * 1024,
        initial_max_stream_data_bidi_remote: 256 * 1024,
        initial_max_stream_data_uni: 256 * 1024,
        initial_max_streams_bidi: 100,
        initial_max_streams_uni: 100,
        ..TransportParams::default()
    }
}

// ---------------------------------------------------------------------------
// demo 可执行程序的配置文件
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub transport: TransportOverrides,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// 服务端监听地址 (例如 "0.0.0.0:4433")
    pub listen_addr: Option<SocketAddr>,
    /// 客户端对端地址
    pub peer_addr: Option<SocketAddr>,
    /// 日志级别: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TlsConfig {
    /// PEM 证书链文件
    pub cert_file: Option<String>,
    /// PEM 私钥文件 (PKCS#8)
    pub key_file: Option<String>,
    /// SNI / 期望的服务器名
    pub server_name: Option<String>,
    #[serde(default)]
    pub alpn: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TransportOverrides {
    pub max_idle_timeout: Option<u64>,
    pub initial_max_data: Option<u64>,
    pub initial_max_streams_bidi: Option<u64>,
    pub initial_max_streams_uni: Option<u64>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// 从文件加载配置
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path))?;

        Ok(config)
    }

    /// 换算成库层的共享上下文
    pub fn build_quic_config(&self) -> anyhow::Result<QuicConfig> {
        let mut qc = QuicConfig {
            server_name: self.tls.server_name.clone(),
            alpn: self.tls.alpn.iter().map(|s| s.as_bytes().to_vec()).collect(),
            ..QuicConfig::default()
        };

        if let Some(path) = &self.tls.cert_file {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read cert file: {}", path))?;
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                qc.cert_chain.push(cert?.to_vec());
            }
        }

        if let Some(path) = &self.tls.key_file {
            let pem = std::fs::read(path)
                .with_context(|| format!("Failed to read key file: {}", path))?;
            let key = rustls_pemfile::private_key(&mut pem.as_slice())?
                .context("No private key found in key file")?;
            qc.signing_key = Some(SigningKey::from_pkcs8(key.secret_der())?);
        }

        let t = &self.transport;
        if let Some(v) = t.max_idle_timeout {
            qc.transport_params.max_idle_timeout = v;
        }
        if let Some(v) = t.initial_max_data {
            qc.transport_params.initial_max_data = v;
        }
        if let Some(v) = t.initial_max_streams_bidi {
            qc.transport_params.initial_max_streams_bidi = v;
        }
        if let Some(v) = t.initial_max_streams_uni {
            qc.transport_params.initial_max_streams_uni = v;
        }

        Ok(qc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_parsing() {
        let toml_str = r#"
[endpoint]
listen_addr = "0.0.0.0:4433"
log_level = "debug"

[tls]
server_name = "example.org"
alpn = ["hq-interop", "h3"]

[transport]
max_idle_timeout = 10000
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.endpoint.listen_addr.unwrap().port(), 4433);
        assert_eq!(config.endpoint.log_level, "debug");
        assert_eq!(config.tls.alpn.len(), 2);
        assert_eq!(config.transport.max_idle_timeout, Some(10000));

        let qc = config.build_quic_config().unwrap();
        assert_eq!(qc.transport_params.max_idle_timeout, 10000);
        assert_eq!(qc.alpn[0], b"hq-interop".to_vec());
    }

    #[test]
    fn test_minimal_client_config() {
        let toml_str = r#"
[endpoint]
peer_addr = "127.0.0.1:4433"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.endpoint.listen_addr.is_none());
        assert_eq!(config.endpoint.log_level, "info");
        assert!(config.tls.cert_file.is_none());
    }

    #[test]
    fn test_signing_key_generate_and_sign() {
        let key = SigningKey::generate_p256().unwrap();
        assert_eq!(key.scheme(), SIG_ECDSA_SECP256R1_SHA256);

        let sig = key.sign(b"transcript digest").unwrap();
        assert!(!sig.is_empty());
    }

    #[test]
    fn test_default_transport_params() {
        let qc = QuicConfig::default();
        assert!(qc.transport_params.initial_max_streams_bidi > 0);
        assert!(qc.transport_params.max_udp_payload_size >= 1200);
        assert_eq!(qc.mss, 1200);
    }
}
