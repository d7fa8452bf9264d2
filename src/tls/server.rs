//! 服务端握手流程
//!
//! 流程表：
//! `Start → SR_ClientHello → SW_ServerHello → SW_EncryptedExtensions →
//!  (SW_CertRequest)? → SW_ServerCertificate → SW_CertVerify →
//!  SW_Finished → (SR_Certificate → SR_CertVerify)? → SR_Finished →
//!  SW_NewSessionTicket → SW_HandshakeDone → HandshakeDone`
//!
//! ServerHello 留在 initial 级别；EncryptedExtensions 起走
//! handshake 级别；NewSessionTicket 在 application 级别发出，
//! 之后置位 HANDSHAKE_DONE 帧的待发标记。

use crate::codec::{Reader, Writer};
use crate::config::{SessionEntry, SUPPORTED_SIGALGS, VerifyMode};
use crate::error::{QuicError, Result};
use crate::keys::{Level, LevelSet};
use crate::tls::extension::{
    construct_extensions, parse_extensions, CTX_CLIENT_HELLO, CTX_ENCRYPTED_EXT, CTX_SERVER_HELLO,
    EXT_KEY_SHARE, EXT_QUIC_TRANSPORT_PARAMETERS, EXT_SUPPORTED_VERSIONS, SERVER_EXTS,
};
use crate::tls::key_schedule::{mac_equal, negotiate_suite, resumption_psk};
use crate::tls::ticket::{seal_ticket, TicketPayload};
use crate::tls::{
    build_certificate_msg, cert_verify_payload, finished_build, parse_certificate_msg,
    parse_hello_head, FlowDir, FlowStep, HandshakeType, TlsSession, TlsState, TLS_VERSION_1_2,
};
use tracing::{debug, info};

/// session ticket 的生存期提示（秒）
const TICKET_LIFETIME_HINT: u32 = 7200;

/// 服务端流程中各状态的先后顺序（重传判定用）
pub(crate) static SERVER_FLOW_ORDER: &[TlsState] = &[
    TlsState::Start,
    TlsState::SrClientHello,
    TlsState::SwServerHello,
    TlsState::SwEncryptedExtensions,
    TlsState::SwCertRequest,
    TlsState::SwServerCertificate,
    TlsState::SwCertVerify,
    TlsState::SwFinished,
    TlsState::SrCertificate,
    TlsState::SrCertVerify,
    TlsState::SrFinished,
    TlsState::SwNewSessionTicket,
    TlsState::SwHandshakeDone,
    TlsState::HandshakeDone,
];

/// 服务端流程表
pub(crate) fn server_step(state: TlsState) -> FlowStep {
    match state {
        TlsState::Start => FlowStep::nothing(TlsState::SrClientHello),
        TlsState::SrClientHello => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::ClientHello),
            read: Some(client_hello_proc),
            write: None,
            post_work: None,
            skip_check: None,
            next: TlsState::SwServerHello,
            level: Level::Initial,
        },
        TlsState::SwServerHello => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::ServerHello),
            read: None,
            write: Some(server_hello_build),
            post_work: Some(|s, levels| s.install_handshake_keys(levels)),
            skip_check: None,
            next: TlsState::SwEncryptedExtensions,
            level: Level::Initial,
        },
        TlsState::SwEncryptedExtensions => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::EncryptedExtensions),
            read: None,
            write: Some(encrypted_ext_build),
            post_work: None,
            skip_check: None,
            next: TlsState::SwCertRequest,
            level: Level::Handshake,
        },
        TlsState::SwCertRequest => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::CertificateRequest),
            read: None,
            write: Some(cert_request_build),
            post_work: None,
            skip_check: Some(|s| !s.ctx.request_client_cert),
            next: TlsState::SwServerCertificate,
            level: Level::Handshake,
        },
        TlsState::SwServerCertificate => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::Certificate),
            read: None,
            write: Some(server_cert_build),
            post_work: None,
            skip_check: None,
            next: TlsState::SwCertVerify,
            level: Level::Handshake,
        },
        TlsState::SwCertVerify => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::CertificateVerify),
            read: None,
            write: Some(cert_verify_build),
            post_work: None,
            skip_check: None,
            next: TlsState::SwFinished,
            level: Level::Handshake,
        },
        TlsState::SwFinished => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::Finished),
            read: None,
            write: Some(finished_build),
            post_work: Some(|s, levels| s.install_application_keys(levels)),
            skip_check: None,
            next: TlsState::SrCertificate,
            level: Level::Handshake,
        },
        TlsState::SrCertificate => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::Certificate),
            read: Some(client_cert_proc),
            write: None,
            post_work: None,
            skip_check: Some(|s| !s.ctx.request_client_cert),
            next: TlsState::SrCertVerify,
            level: Level::Handshake,
        },
        TlsState::SrCertVerify => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::CertificateVerify),
            read: Some(client_cert_verify_proc),
            write: None,
            post_work: None,
            skip_check: Some(|s| !s.ctx.request_client_cert || s.peer_cert_chain.is_empty()),
            next: TlsState::SrFinished,
            level: Level::Handshake,
        },
        TlsState::SrFinished => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::Finished),
            read: Some(finished_proc),
            write: None,
            post_work: None,
            skip_check: None,
            next: TlsState::SwNewSessionTicket,
            level: Level::Handshake,
        },
        TlsState::SwNewSessionTicket => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::NewSessionTicket),
            read: None,
            write: Some(new_session_ticket_build),
            post_work: None,
            skip_check: None,
            next: TlsState::SwHandshakeDone,
            level: Level::Application,
        },
        TlsState::SwHandshakeDone => FlowStep {
            dir: FlowDir::Nothing,
            msg: None,
            read: None,
            write: None,
            post_work: Some(|s, _levels| {
                info!("Server handshake complete, HANDSHAKE_DONE pending");
                s.handshake_done_pending = true;
                Ok(())
            }),
            skip_check: None,
            next: TlsState::HandshakeDone,
            level: Level::Application,
        },
        TlsState::HandshakeDone => FlowStep::finished(),
        other => FlowStep {
            dir: FlowDir::Nothing,
            msg: None,
            read: None,
            write: None,
            post_work: None,
            skip_check: None,
            next: other,
            level: Level::Initial,
        },
    }
}

fn client_hello_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    let mut random = [0u8; 32];
    s.legacy_session_id = parse_hello_head(r, &mut random)?;
    s.client_random = random;

    let mut ciphers = r.get_u16_prefixed()?;
    while !ciphers.is_empty() {
        s.peer_cipher_ids.push(ciphers.get_u16()?);
    }

    let suite = negotiate_suite(&s.peer_cipher_ids)?;
    s.suite = Some(suite);
    s.transcript.set_hash(suite.hash)?;
    debug!("Cipher negotiated: {:#06x}", suite.id);

    // legacy compression 必须含 null
    let compressions = r.get_u8_prefixed()?.rest().to_vec();
    if !compressions.contains(&0) {
        return Err(QuicError::Malformed("No null compression offered".into()));
    }

    parse_extensions(s, r, SERVER_EXTS, CTX_CLIENT_HELLO)?;

    if !s.peer_supported_versions {
        return Err(QuicError::MissingExtension(EXT_SUPPORTED_VERSIONS));
    }
    if s.peer_shares.is_empty() {
        return Err(QuicError::MissingExtension(EXT_KEY_SHARE));
    }
    if s.peer_params.is_none() {
        return Err(QuicError::MissingExtension(EXT_QUIC_TRANSPORT_PARAMETERS));
    }

    // ALPN：取本端偏好列表中第一个客户端也提供的
    if !s.ctx.alpn.is_empty() && !s.peer_alpn.is_empty() {
        let selected = s
            .ctx
            .alpn
            .iter()
            .find(|p| s.peer_alpn.contains(p))
            .cloned();
        match selected {
            Some(proto) => {
                debug!("ALPN negotiated: {:?}", String::from_utf8_lossy(&proto));
                s.alpn_selected = Some(proto);
            }
            None => {
                return Err(QuicError::ProtocolViolation(
                    "No common ALPN protocol".into(),
                ));
            }
        }
    }

    Ok(())
}

fn server_hello_build(s: &mut TlsSession, _levels: &mut LevelSet, w: &mut Writer) -> Result<()> {
    use rand::RngCore;
    rand::thread_rng().fill_bytes(&mut s.server_random);

    w.put_u16(TLS_VERSION_1_2);
    w.put_bytes(&s.server_random);

    // 回显客户端的 legacy session id
    let session_id = s.legacy_session_id.clone();
    w.sub_u8(move |w| {
        w.put_bytes(&session_id);
        Ok(())
    })?;

    w.put_u16(s.suite()?.id);
    w.put_u8(0); // compression: null

    construct_extensions(s, w, SERVER_EXTS, CTX_SERVER_HELLO)
}

fn encrypted_ext_build(s: &mut TlsSession, _levels: &mut LevelSet, w: &mut Writer) -> Result<()> {
    construct_extensions(s, w, SERVER_EXTS, CTX_ENCRYPTED_EXT)
}

fn cert_request_build(_s: &mut TlsSession, _levels: &mut LevelSet, w: &mut Writer) -> Result<()> {
    // certificate_request_context: 空
    w.put_u8(0);
    w.sub_u16(|w| {
        w.put_u16(crate::tls::extension::EXT_SIGNATURE_ALGORITHMS);
        w.sub_u16(|w| {
            w.sub_u16(|w| {
                for alg in SUPPORTED_SIGALGS {
                    w.put_u16(*alg);
                }
                Ok(())
            })
        })
    })
}

fn server_cert_build(s: &mut TlsSession, _levels: &mut LevelSet, w: &mut Writer) -> Result<()> {
    if s.ctx.cert_chain.is_empty() {
        return Err(QuicError::BadCertificate(
            "No server certificate configured".into(),
        ));
    }
    build_certificate_msg(w, &s.ctx.cert_chain)
}

fn cert_verify_build(s: &mut TlsSession, _levels: &mut LevelSet, w: &mut Writer) -> Result<()> {
    let key = s
        .ctx
        .signing_key
        .as_ref()
        .ok_or_else(|| QuicError::BadCertificate("No server signing key configured".into()))?;

    let th = s.transcript.current()?;
    let payload = cert_verify_payload(true, &th);
    let signature = key.sign(&payload)?;

    w.put_u16(key.scheme());
    w.sub_u16(|w| {
        w.put_bytes(&signature);
        Ok(())
    })
}

fn client_cert_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    let chain = parse_certificate_msg(r)?;

    if chain.is_empty() {
        debug!("Client declined to send a certificate");
    } else if s.ctx.verify_mode == VerifyMode::Peer {
        let verifier = s
            .ctx
            .verifier
            .as_ref()
            .ok_or_else(|| QuicError::BadCertificate("No verifier configured".into()))?;
        verifier.verify_chain(&chain, None)?;
    }

    s.peer_cert_chain = chain;
    Ok(())
}

fn client_cert_verify_proc(
    s: &mut TlsSession,
    _levels: &mut LevelSet,
    r: &mut Reader<'_>,
) -> Result<()> {
    let scheme = r.get_u16()?;
    let signature = r.get_u16_prefixed()?.rest().to_vec();

    if s.ctx.verify_mode == VerifyMode::Peer && !s.peer_cert_chain.is_empty() {
        let verifier = s
            .ctx
            .verifier
            .as_ref()
            .ok_or_else(|| QuicError::BadCertificate("No verifier configured".into()))?;
        let payload = cert_verify_payload(false, &s.cert_verify_transcript);
        verifier.verify_signature(&s.peer_cert_chain[0], scheme, &payload, &signature)?;
    }

    Ok(())
}

fn finished_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    let mac = r.rest();

    if !mac_equal(mac, &s.peer_finished_expect) {
        return Err(QuicError::ProtocolViolation(
            "Client Finished MAC mismatch".into(),
        ));
    }

    debug!("Client Finished verified");
    Ok(())
}

fn new_session_ticket_build(
    s: &mut TlsSession,
    _levels: &mut LevelSet,
    w: &mut Writer,
) -> Result<()> {
    use rand::Rng;

    let suite = s.suite()?;
    let ticket_nonce = [0u8];
    let psk = resumption_psk(suite.hash, &s.resumption_secret, &ticket_nonce)?;

    let ticket = seal_ticket(
        &s.ctx.ticket_key,
        &TicketPayload {
            suite_id: suite.id,
            psk: psk.clone(),
        },
    )?;

    // 进程级 session 缓存登记
    if let Ok(mut cache) = s.ctx.session_cache.lock() {
        cache.insert(
            ticket.clone(),
            SessionEntry {
                suite_id: suite.id,
                psk,
            },
        );
    }

    w.put_u32(TICKET_LIFETIME_HINT);
    w.put_u32(rand::thread_rng().gen());
    w.sub_u8(|w| {
        w.put_bytes(&ticket_nonce);
        Ok(())
    })?;
    w.sub_u16(|w| {
        w.put_bytes(&ticket);
        Ok(())
    })?;
    // 扩展: 空
    w.put_u16(0);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_table_shape() {
        assert_eq!(server_step(TlsState::SrClientHello).level, Level::Initial);
        assert_eq!(server_step(TlsState::SwServerHello).level, Level::Initial);
        assert_eq!(
            server_step(TlsState::SwEncryptedExtensions).level,
            Level::Handshake
        );
        assert_eq!(
            server_step(TlsState::SwNewSessionTicket).level,
            Level::Application
        );

        // 条件状态
        assert!(server_step(TlsState::SwCertRequest).skip_check.is_some());
        assert!(server_step(TlsState::SrCertificate).skip_check.is_some());
        assert!(server_step(TlsState::SrCertVerify).skip_check.is_some());

        assert_eq!(server_step(TlsState::HandshakeDone).dir, FlowDir::Finished);
    }

    #[test]
    fn test_sw_finished_installs_app_keys() {
        assert!(server_step(TlsState::SwFinished).post_work.is_some());
        assert!(server_step(TlsState::SwServerHello).post_work.is_some());
    }
}
