//! Session ticket 的密封与解封
//!
//! 参考 RFC 8446 Section 4.6.1: New Session Ticket Message
//!
//! ticket 对客户端是不透明字节；服务端用进程级 ticket key
//! (AES-128-GCM) 密封 {suite id, resumption PSK}，
//! 自己收到时可无状态解封。格式: nonce(12) || ciphertext || tag。

use crate::codec::{Reader, Writer};
use crate::crypto::aead::{AeadAlg, PacketProtector};
use crate::error::{QuicError, Result};
use rand::RngCore;

/// ticket 明文内容
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TicketPayload {
    pub suite_id: u16,
    pub psk: Vec<u8>,
}

/// 客户端收到的 NewSessionTicket
#[derive(Debug, Clone)]
pub struct SessionTicket {
    pub lifetime: u32,
    pub age_add: u32,
    pub nonce: Vec<u8>,
    pub ticket: Vec<u8>,
}

const TICKET_AAD: &[u8] = b"quic session ticket";

/// 密封 ticket
pub fn seal_ticket(ticket_key: &[u8; 16], payload: &TicketPayload) -> Result<Vec<u8>> {
    let mut plain = Writer::new();
    plain.put_u16(payload.suite_id);
    plain.put_u8(payload.psk.len() as u8);
    plain.put_bytes(&payload.psk);

    let mut nonce = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce);

    let pp = PacketProtector::new(AeadAlg::Aes128Gcm, ticket_key)?;
    let sealed = pp.seal(&nonce, TICKET_AAD, plain.as_slice())?;

    let mut out = nonce.to_vec();
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// 解封 ticket；密文不完整或认证失败都算 DecryptFailed
pub fn open_ticket(ticket_key: &[u8; 16], ticket: &[u8]) -> Result<TicketPayload> {
    if ticket.len() < 12 {
        return Err(QuicError::DecryptFailed);
    }

    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&ticket[..12]);

    let pp = PacketProtector::new(AeadAlg::Aes128Gcm, ticket_key)?;
    let plain = pp.open(&nonce, TICKET_AAD, &ticket[12..])?;

    let mut r = Reader::new(&plain);
    let suite_id = r.get_u16()?;
    let psk_len = r.get_u8()? as usize;
    let psk = r.get_bytes(psk_len)?.to_vec();

    Ok(TicketPayload { suite_id, psk })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_round_trip() {
        let key = [0x5au8; 16];
        let payload = TicketPayload {
            suite_id: 0x1301,
            psk: vec![0xaa; 32],
        };

        let sealed = seal_ticket(&key, &payload).unwrap();
        let opened = open_ticket(&key, &sealed).unwrap();
        assert_eq!(opened, payload);
    }

    #[test]
    fn test_wrong_key_rejected() {
        let payload = TicketPayload {
            suite_id: 0x1301,
            psk: vec![0xbb; 32],
        };
        let sealed = seal_ticket(&[0x01u8; 16], &payload).unwrap();

        assert!(matches!(
            open_ticket(&[0x02u8; 16], &sealed),
            Err(QuicError::DecryptFailed)
        ));
    }

    #[test]
    fn test_truncated_ticket_rejected() {
        assert!(matches!(
            open_ticket(&[0u8; 16], &[1, 2, 3]),
            Err(QuicError::DecryptFailed)
        ));
    }

    #[test]
    fn test_tickets_are_unique() {
        // nonce 随机，同一内容两次密封得到不同密文
        let key = [0x5au8; 16];
        let payload = TicketPayload {
            suite_id: 0x1302,
            psk: vec![0xcc; 48],
        };
        let a = seal_ticket(&key, &payload).unwrap();
        let b = seal_ticket(&key, &payload).unwrap();
        assert_ne!(a, b);
    }
}
