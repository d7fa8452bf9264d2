//! 数据包保护 (AEAD) 与头部保护 (HP)
//!
//! 参考 RFC 9001 Section 5: Packet Protection
//!
//! AES-GCM 套件走 `aes-gcm` crate，ChaCha20-Poly1305 走 ring；
//! 头部保护的 mask 统一由 `ring::aead::quic` 生成
//! (AES-ECB 密钥流块 / ChaCha20 密钥流块)。

use crate::error::{QuicError, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use ring::aead as ring_aead;
use ring::aead::quic as ring_hp;

/// AEAD tag 长度，三个套件都是 16 字节
pub const TAG_LEN: usize = 16;

/// HP 采样长度 (RFC 9001 Section 5.4.2)
pub const SAMPLE_LEN: usize = 16;

/// 数据包保护算法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlg {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl AeadAlg {
    /// AEAD / HP 密钥长度
    pub fn key_len(&self) -> usize {
        match self {
            AeadAlg::Aes128Gcm => 16,
            AeadAlg::Aes256Gcm => 32,
            AeadAlg::Chacha20Poly1305 => 32,
        }
    }

    pub fn tag_len(&self) -> usize {
        TAG_LEN
    }

    pub fn nonce_len(&self) -> usize {
        12
    }

    fn ring_hp_alg(&self) -> &'static ring_hp::Algorithm {
        match self {
            AeadAlg::Aes128Gcm => &ring_hp::AES_128,
            AeadAlg::Aes256Gcm => &ring_hp::AES_256,
            AeadAlg::Chacha20Poly1305 => &ring_hp::CHACHA20,
        }
    }
}

enum AeadKey {
    Aes128(Box<Aes128Gcm>),
    Aes256(Box<Aes256Gcm>),
    Chacha(ring_aead::LessSafeKey),
}

/// 数据包保护密钥 (单方向)
pub struct PacketProtector {
    alg: AeadAlg,
    key: AeadKey,
}

impl PacketProtector {
    pub fn new(alg: AeadAlg, key: &[u8]) -> Result<Self> {
        if key.len() != alg.key_len() {
            return Err(QuicError::Internal(format!(
                "Bad AEAD key length: {} (expected {})",
                key.len(),
                alg.key_len()
            )));
        }

        let key = match alg {
            AeadAlg::Aes128Gcm => AeadKey::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|e| QuicError::Internal(format!("AES-128-GCM key: {}", e)))?,
            )),
            AeadAlg::Aes256Gcm => AeadKey::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|e| QuicError::Internal(format!("AES-256-GCM key: {}", e)))?,
            )),
            AeadAlg::Chacha20Poly1305 => {
                let unbound = ring_aead::UnboundKey::new(&ring_aead::CHACHA20_POLY1305, key)
                    .map_err(|e| QuicError::Internal(format!("ChaCha20 key: {:?}", e)))?;
                AeadKey::Chacha(ring_aead::LessSafeKey::new(unbound))
            }
        };

        Ok(Self { alg, key })
    }

    pub fn alg(&self) -> AeadAlg {
        self.alg
    }

    /// AEAD 加密，返回 ciphertext || tag
    pub fn seal(&self, nonce: &[u8; 12], aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        match &self.key {
            AeadKey::Aes128(cipher) => cipher
                .encrypt(
                    aes_gcm::Nonce::from_slice(nonce),
                    Payload {
                        msg: plaintext,
                        aad,
                    },
                )
                .map_err(|_| QuicError::Internal("AEAD seal failed".into())),
            AeadKey::Aes256(cipher) => cipher
                .encrypt(
                    aes_gcm::Nonce::from_slice(nonce),
                    Payload {
                        msg: plaintext,
                        aad,
                    },
                )
                .map_err(|_| QuicError::Internal("AEAD seal failed".into())),
            AeadKey::Chacha(key) => {
                let mut buf = plaintext.to_vec();
                key.seal_in_place_append_tag(
                    ring_aead::Nonce::assume_unique_for_key(*nonce),
                    ring_aead::Aad::from(aad),
                    &mut buf,
                )
                .map_err(|_| QuicError::Internal("AEAD seal failed".into()))?;
                Ok(buf)
            }
        }
    }

    /// AEAD 解密 ciphertext || tag
    ///
    /// 任何认证失败都归为 [`QuicError::DecryptFailed`]，
    /// 由调用者按加密级别决定是丢包还是做 stateless reset 检查。
    pub fn open(&self, nonce: &[u8; 12], aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        if ciphertext.len() < TAG_LEN {
            return Err(QuicError::DecryptFailed);
        }

        match &self.key {
            AeadKey::Aes128(cipher) => cipher
                .decrypt(
                    aes_gcm::Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad,
                    },
                )
                .map_err(|_| QuicError::DecryptFailed),
            AeadKey::Aes256(cipher) => cipher
                .decrypt(
                    aes_gcm::Nonce::from_slice(nonce),
                    Payload {
                        msg: ciphertext,
                        aad,
                    },
                )
                .map_err(|_| QuicError::DecryptFailed),
            AeadKey::Chacha(key) => {
                let mut buf = ciphertext.to_vec();
                let plain = key
                    .open_in_place(
                        ring_aead::Nonce::assume_unique_for_key(*nonce),
                        ring_aead::Aad::from(aad),
                        &mut buf,
                    )
                    .map_err(|_| QuicError::DecryptFailed)?;
                let n = plain.len();
                buf.truncate(n);
                Ok(buf)
            }
        }
    }
}

impl std::fmt::Debug for PacketProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketProtector")
            .field("alg", &self.alg)
            .finish()
    }
}

/// 头部保护密钥 (单方向)
pub struct HeaderProtector {
    key: ring_hp::HeaderProtectionKey,
}

impl HeaderProtector {
    pub fn new(alg: AeadAlg, hp_key: &[u8]) -> Result<Self> {
        let key = ring_hp::HeaderProtectionKey::new(alg.ring_hp_alg(), hp_key)
            .map_err(|e| QuicError::Internal(format!("HP key: {:?}", e)))?;
        Ok(Self { key })
    }

    /// 用 16 字节采样生成 5 字节 mask
    ///
    /// mask[0] 作用于 first byte 的低位，mask[1..] 作用于 packet number。
    pub fn mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        self.key
            .new_mask(sample)
            .map_err(|e| QuicError::Internal(format!("HP mask: {:?}", e)))
    }
}

impl std::fmt::Debug for HeaderProtector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HeaderProtector")
    }
}

/// 构造 AEAD nonce: IV XOR Packet Number
///
/// RFC 9001 Section 5.3: packet number 按 big-endian 左补零到 12 字节后
/// 与静态 IV 逐字节异或。
pub fn make_nonce(iv: &[u8; 12], packet_number: u64) -> [u8; 12] {
    let mut nonce = *iv;

    for (a, b) in nonce[4..].iter_mut().zip(packet_number.to_be_bytes().iter()) {
        *a ^= b;
    }

    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_make_nonce() {
        let iv = [0u8; 12];
        let nonce = make_nonce(&iv, 0x12345678);
        assert_eq!(&nonce[..4], &[0, 0, 0, 0]);
        assert_eq!(&nonce[4..], &[0, 0, 0, 0, 0x12, 0x34, 0x56, 0x78]);
    }

    #[test]
    fn test_make_nonce_pn_zero_is_iv() {
        let iv = [
            0x5b, 0x6c, 0x9f, 0x0e, 0x7e, 0x6a, 0x7b, 0xb4, 0x1d, 0xb6, 0x56, 0x34,
        ];
        assert_eq!(make_nonce(&iv, 0), iv);
    }

    #[test]
    fn test_seal_open_round_trip() {
        for alg in [
            AeadAlg::Aes128Gcm,
            AeadAlg::Aes256Gcm,
            AeadAlg::Chacha20Poly1305,
        ] {
            let key = vec![0x42u8; alg.key_len()];
            let pp = PacketProtector::new(alg, &key).unwrap();

            let iv = [0x11u8; 12];
            let nonce = make_nonce(&iv, 7);
            let aad = b"header bytes";
            let plaintext = b"hello quic";

            let sealed = pp.seal(&nonce, aad, plaintext).unwrap();
            assert_eq!(sealed.len(), plaintext.len() + TAG_LEN);

            let opened = pp.open(&nonce, aad, &sealed).unwrap();
            assert_eq!(opened, plaintext);
        }
    }

    #[test]
    fn test_open_rejects_tampering() {
        let pp = PacketProtector::new(AeadAlg::Aes128Gcm, &[7u8; 16]).unwrap();
        let nonce = make_nonce(&[0u8; 12], 1);
        let sealed = pp.seal(&nonce, b"aad", b"payload").unwrap();

        // 篡改密文
        let mut bad = sealed.clone();
        bad[0] ^= 0x01;
        assert!(matches!(
            pp.open(&nonce, b"aad", &bad),
            Err(QuicError::DecryptFailed)
        ));

        // 篡改 AAD
        assert!(matches!(
            pp.open(&nonce, b"aae", &sealed),
            Err(QuicError::DecryptFailed)
        ));

        // 篡改 nonce
        let bad_nonce = make_nonce(&[0u8; 12], 2);
        assert!(matches!(
            pp.open(&bad_nonce, b"aad", &sealed),
            Err(QuicError::DecryptFailed)
        ));

        // 短于 tag 的密文
        assert!(matches!(
            pp.open(&nonce, b"aad", &sealed[..8]),
            Err(QuicError::DecryptFailed)
        ));
    }

    #[test]
    fn test_hp_mask_rfc9001_sample() {
        // RFC 9001 Appendix A.2: client Initial 的 HP 采样与 mask
        let hp_key = hex::decode("9f50449e04a0e810283a1e9933adedd2").unwrap();
        let sample = hex::decode("d1b1c98dd7689fb8ec11d242b123dc9b").unwrap();

        let hp = HeaderProtector::new(AeadAlg::Aes128Gcm, &hp_key).unwrap();
        let mask = hp.mask(&sample).unwrap();
        assert_eq!(hex::encode(mask), "437b9aec36");
    }
}
