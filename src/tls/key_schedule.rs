//! TLS 1.3 secret schedule
//!
//! 参考 RFC 8446 Section 7.1: Key Schedule
//!
//! ```text
//!              0
//!              |
//!              v
//!    PSK ->  HKDF-Extract = Early Secret
//!              |
//!              +-> Derive-Secret(., "derived", "")
//!              |
//!              v
//! (EC)DHE -> HKDF-Extract = Handshake Secret
//!              |
//!              +-> Derive-Secret(., "c hs traffic", ClientHello..ServerHello)
//!              +-> Derive-Secret(., "s hs traffic", ClientHello..ServerHello)
//!              +-> Derive-Secret(., "derived", "")
//!              |
//!              v
//!    0 ->    HKDF-Extract = Master Secret
//!              |
//!              +-> Derive-Secret(., "c ap traffic", ClientHello..server Finished)
//!              +-> Derive-Secret(., "s ap traffic", ClientHello..server Finished)
//!              +-> Derive-Secret(., "res master", ClientHello..client Finished)
//! ```
//!
//! 本实现不做 PSK 握手，Early Secret 恒由全零 IKM 提取。

use crate::crypto::aead::AeadAlg;
use crate::crypto::hkdf::{hkdf_expand_label, hkdf_extract, Hash};
use crate::error::{QuicError, Result};
use ring::hmac;

/// 协商套件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub id: u16,
    pub aead: AeadAlg,
    pub hash: Hash,
}

pub const TLS_AES_128_GCM_SHA256: CipherSuite = CipherSuite {
    id: 0x1301,
    aead: AeadAlg::Aes128Gcm,
    hash: Hash::Sha256,
};

pub const TLS_AES_256_GCM_SHA384: CipherSuite = CipherSuite {
    id: 0x1302,
    aead: AeadAlg::Aes256Gcm,
    hash: Hash::Sha384,
};

pub const TLS_CHACHA20_POLY1305_SHA256: CipherSuite = CipherSuite {
    id: 0x1303,
    aead: AeadAlg::Chacha20Poly1305,
    hash: Hash::Sha256,
};

/// 支持的套件，顺序即偏好
pub const SUPPORTED_SUITES: &[CipherSuite] = &[
    TLS_AES_128_GCM_SHA256,
    TLS_AES_256_GCM_SHA384,
    TLS_CHACHA20_POLY1305_SHA256,
];

pub fn suite_by_id(id: u16) -> Option<&'static CipherSuite> {
    SUPPORTED_SUITES.iter().find(|s| s.id == id)
}

/// Derive-Secret(secret, label, transcript_hash)
pub fn derive_secret(
    hash: Hash,
    secret: &[u8],
    label: &[u8],
    transcript_hash: &[u8],
) -> Result<Vec<u8>> {
    hkdf_expand_label(hash, secret, label, transcript_hash, hash.len())
}

/// Early Secret -> Handshake Secret
///
/// handshake_secret = HKDF-Extract(Derive-Secret(early, "derived", ""), shared)
pub fn derive_handshake_secret(hash: Hash, shared_secret: &[u8]) -> Result<Vec<u8>> {
    let zeros = vec![0u8; hash.len()];
    let early = hkdf_extract(hash, &[], &zeros);
    let derived = derive_secret(hash, &early, b"derived", &hash.empty_hash())?;
    Ok(hkdf_extract(hash, &derived, shared_secret))
}

/// Handshake Secret -> Master Secret
pub fn derive_master_secret(hash: Hash, handshake_secret: &[u8]) -> Result<Vec<u8>> {
    let derived = derive_secret(hash, handshake_secret, b"derived", &hash.empty_hash())?;
    let zeros = vec![0u8; hash.len()];
    Ok(hkdf_extract(hash, &derived, &zeros))
}

/// finished_key = HKDF-Expand-Label(traffic_secret, "finished", "", Hash.len)
pub fn finished_key(hash: Hash, traffic_secret: &[u8]) -> Result<Vec<u8>> {
    hkdf_expand_label(hash, traffic_secret, b"finished", b"", hash.len())
}

/// verify_data = HMAC(finished_key, transcript_hash)
pub fn finished_mac(hash: Hash, key: &[u8], transcript_hash: &[u8]) -> Vec<u8> {
    let alg = match hash {
        Hash::Sha256 => hmac::HMAC_SHA256,
        Hash::Sha384 => hmac::HMAC_SHA384,
    };
    let key = hmac::Key::new(alg, key);
    hmac::sign(&key, transcript_hash).as_ref().to_vec()
}

/// 常量时间比较两个 MAC
pub fn mac_equal(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    ring::constant_time::verify_slices_are_equal(a, b).is_ok()
}

/// 从 resumption master secret 和 ticket nonce 派生 PSK
///
/// RFC 8446 Section 4.6.1:
/// PSK = HKDF-Expand-Label(resumption_master_secret, "resumption", ticket_nonce, Hash.len)
pub fn resumption_psk(hash: Hash, res_master: &[u8], ticket_nonce: &[u8]) -> Result<Vec<u8>> {
    hkdf_expand_label(hash, res_master, b"resumption", ticket_nonce, hash.len())
}

/// 两端各自派生的握手/应用 traffic secrets
pub struct TrafficSecrets {
    pub client: Vec<u8>,
    pub server: Vec<u8>,
}

/// c/s hs traffic: transcript 截至 ServerHello
pub fn handshake_traffic_secrets(
    hash: Hash,
    handshake_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<TrafficSecrets> {
    Ok(TrafficSecrets {
        client: derive_secret(hash, handshake_secret, b"c hs traffic", transcript_hash)?,
        server: derive_secret(hash, handshake_secret, b"s hs traffic", transcript_hash)?,
    })
}

/// c/s ap traffic: transcript 截至 server Finished
pub fn application_traffic_secrets(
    hash: Hash,
    master_secret: &[u8],
    transcript_hash: &[u8],
) -> Result<TrafficSecrets> {
    Ok(TrafficSecrets {
        client: derive_secret(hash, master_secret, b"c ap traffic", transcript_hash)?,
        server: derive_secret(hash, master_secret, b"s ap traffic", transcript_hash)?,
    })
}

/// 套件协商：取本端偏好列表中第一个对端也支持的
pub fn negotiate_suite(peer_ids: &[u16]) -> Result<&'static CipherSuite> {
    for suite in SUPPORTED_SUITES {
        if peer_ids.contains(&suite.id) {
            return Ok(suite);
        }
    }

    Err(QuicError::ProtocolViolation(
        "No common cipher suite".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_suite_lookup() {
        assert_eq!(suite_by_id(0x1301).unwrap().hash, Hash::Sha256);
        assert_eq!(suite_by_id(0x1302).unwrap().hash, Hash::Sha384);
        assert!(suite_by_id(0x1304).is_none());
    }

    #[test]
    fn test_negotiate_prefers_aes128() {
        let suite = negotiate_suite(&[0x1303, 0x1302, 0x1301]).unwrap();
        assert_eq!(suite.id, 0x1301);

        let suite = negotiate_suite(&[0x1303]).unwrap();
        assert_eq!(suite.id, 0x1303);

        assert!(negotiate_suite(&[0x1399]).is_err());
    }

    #[test]
    fn test_schedule_is_deterministic_and_role_symmetric() {
        // 双方拿同一个 shared secret 和 transcript，必须得到相同的密钥
        let shared = [0x42u8; 32];
        let th = Hash::Sha256.empty_hash();

        let hs_a = derive_handshake_secret(Hash::Sha256, &shared).unwrap();
        let hs_b = derive_handshake_secret(Hash::Sha256, &shared).unwrap();
        assert_eq!(hs_a, hs_b);

        let ts_a = handshake_traffic_secrets(Hash::Sha256, &hs_a, &th).unwrap();
        let ts_b = handshake_traffic_secrets(Hash::Sha256, &hs_b, &th).unwrap();
        assert_eq!(ts_a.client, ts_b.client);
        assert_eq!(ts_a.server, ts_b.server);
        assert_ne!(ts_a.client, ts_a.server);

        let master = derive_master_secret(Hash::Sha256, &hs_a).unwrap();
        assert_eq!(master.len(), 32);
    }

    #[test]
    fn test_finished_mac_round_trip() {
        let secret = [0x11u8; 32];
        let th = [0x22u8; 32];

        let key = finished_key(Hash::Sha256, &secret).unwrap();
        let mac1 = finished_mac(Hash::Sha256, &key, &th);
        let mac2 = finished_mac(Hash::Sha256, &key, &th);

        assert_eq!(mac1.len(), 32);
        assert!(mac_equal(&mac1, &mac2));

        let mut tampered = mac1.clone();
        tampered[0] ^= 1;
        assert!(!mac_equal(&mac1, &tampered));
        assert!(!mac_equal(&mac1, &mac1[..16]));
    }
}
