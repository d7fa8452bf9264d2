//! HKDF-Extract / HKDF-Expand-Label
//!
//! 参考 RFC 5869: HMAC-based Extract-and-Expand Key Derivation Function
//! 参考 RFC 8446 Section 7.1: Key Schedule

use crate::error::{QuicError, Result};
use hkdf::Hkdf;
use sha2::{Digest, Sha256, Sha384};

/// 协商出的摘要算法
///
/// TLS_AES_128_GCM_SHA256 / TLS_CHACHA20_POLY1305_SHA256 使用 SHA-256，
/// TLS_AES_256_GCM_SHA384 使用 SHA-384。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hash {
    Sha256,
    Sha384,
}

impl Hash {
    /// 摘要输出长度
    pub fn len(&self) -> usize {
        match self {
            Hash::Sha256 => 32,
            Hash::Sha384 => 48,
        }
    }

    /// 空输入的摘要值（Derive-Secret 的空 transcript）
    pub fn empty_hash(&self) -> Vec<u8> {
        match self {
            Hash::Sha256 => Sha256::digest(b"").to_vec(),
            Hash::Sha384 => Sha384::digest(b"").to_vec(),
        }
    }
}

/// HKDF-Extract
///
/// 返回 PRK 字节。salt 为空时等价于全零 salt (RFC 5869)。
pub fn hkdf_extract(hash: Hash, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    let salt = if salt.is_empty() { None } else { Some(salt) };
    match hash {
        Hash::Sha256 => Hkdf::<Sha256>::extract(salt, ikm).0.to_vec(),
        Hash::Sha384 => Hkdf::<Sha384>::extract(salt, ikm).0.to_vec(),
    }
}

/// HKDF-Expand
pub fn hkdf_expand(hash: Hash, prk: &[u8], info: &[u8], length: usize) -> Result<Vec<u8>> {
    let mut okm = vec![0u8; length];
    let expanded = match hash {
        Hash::Sha256 => Hkdf::<Sha256>::from_prk(prk)
            .map_err(|e| QuicError::Internal(format!("Invalid PRK: {}", e)))?
            .expand(info, &mut okm),
        Hash::Sha384 => Hkdf::<Sha384>::from_prk(prk)
            .map_err(|e| QuicError::Internal(format!("Invalid PRK: {}", e)))?
            .expand(info, &mut okm),
    };

    expanded.map_err(|e| QuicError::Internal(format!("HKDF-Expand: {}", e)))?;
    Ok(okm)
}

/// HKDF-Expand-Label
///
/// RFC 8446 Section 7.1:
/// ```text
/// HKDF-Expand-Label(Secret, Label, Context, Length) =
///     HKDF-Expand(Secret, HkdfLabel, Length)
///
/// struct {
///     uint16 length = Length;
///     opaque label<7..255> = "tls13 " + Label;
///     opaque context<0..255> = Context;
/// } HkdfLabel;
/// ```
///
/// QUIC 的 "quic key" / "quic iv" / "quic hp" 和 TLS 的
/// "c hs traffic" 等标签都走这同一条路径。
pub fn hkdf_expand_label(
    hash: Hash,
    secret: &[u8],
    label: &[u8],
    context: &[u8],
    length: usize,
) -> Result<Vec<u8>> {
    let info = hkdf_label(label, context, length);
    hkdf_expand(hash, secret, &info, length)
}

/// 序列化 HkdfLabel 结构
///
/// 格式: [Length (2)][Label Length (1)]["tls13 " + Label][Context Length (1)][Context]
fn hkdf_label(label: &[u8], context: &[u8], length: usize) -> Vec<u8> {
    const LABEL_PREFIX: &[u8] = b"tls13 ";

    let mut info = Vec::with_capacity(4 + LABEL_PREFIX.len() + label.len() + context.len());
    info.extend_from_slice(&(length as u16).to_be_bytes());
    info.push((LABEL_PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(LABEL_PREFIX);
    info.extend_from_slice(label);
    info.push(context.len() as u8);
    info.extend_from_slice(context);
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_label_serialization() {
        let info = hkdf_label(b"client in", b"", 32);

        // Length = 32 (0x0020)
        assert_eq!(info[0], 0x00);
        assert_eq!(info[1], 0x20);

        // Label length = "tls13 " (6) + "client in" (9) = 15
        assert_eq!(info[2], 15);
        assert_eq!(&info[3..18], b"tls13 client in");

        // Context length = 0
        assert_eq!(info[18], 0);
        assert_eq!(info.len(), 19);
    }

    #[test]
    fn test_extract_deterministic() {
        let a = hkdf_extract(Hash::Sha256, b"salt", b"ikm");
        let b = hkdf_extract(Hash::Sha256, b"salt", b"ikm");
        assert_eq!(a, b);
        assert_eq!(a.len(), 32);

        let c = hkdf_extract(Hash::Sha384, b"salt", b"ikm");
        assert_eq!(c.len(), 48);
    }

    #[test]
    fn test_expand_label_rfc9001_initial_secret() {
        // RFC 9001 Appendix A.1: DCID = 0x8394c8f03e515708 时
        // initial_secret = HKDF-Extract(initial_salt, cid)
        let salt = [
            0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8,
            0x0c, 0xad, 0xcc, 0xbb, 0x7f, 0x0a,
        ];
        let dcid = [0x83, 0x94, 0xc8, 0xf0, 0x3e, 0x51, 0x57, 0x08];

        let initial_secret = hkdf_extract(Hash::Sha256, &salt, &dcid);
        assert_eq!(
            hex::encode(&initial_secret),
            "7db5df06e7a69e432496adedb00851923595221596ae2ae9fb8115c1e9ed0a44"
        );

        let client_initial =
            hkdf_expand_label(Hash::Sha256, &initial_secret, b"client in", b"", 32).unwrap();
        assert_eq!(
            hex::encode(&client_initial),
            "c00cf151ca5be075ed0ebfb5c80323c42d6b7db67881289af4008f1f6c357aea"
        );

        let server_initial =
            hkdf_expand_label(Hash::Sha256, &initial_secret, b"server in", b"", 32).unwrap();
        assert_eq!(
            hex::encode(&server_initial),
            "3c199828fd139efd216c155ad844cc81fb82fa8d7446fa7d78be803acdda951b"
        );
    }
}
