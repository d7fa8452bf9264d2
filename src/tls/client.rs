//! 客户端握手流程
//!
//! 流程表：
//! `Start → CW_ClientHello → CR_ServerHello → CR_EncryptedExtensions →
//!  (CR_CertRequest)? → CR_ServerCertificate → CR_CertVerify →
//!  CR_Finished → (CW_Certificate → CW_CertVerify)? → CW_Finished →
//!  HandshakeDone`
//!
//! ClientHello 在 initial 级别发出，之后的出站消息都在
//! handshake 级别。连接层面的 1-RTT 切换由对端的
//! HANDSHAKE_DONE 帧驱动，不在本表内。

use crate::codec::{Reader, Writer};
use crate::config::VerifyMode;
use crate::error::{QuicError, Result};
use crate::keys::{Level, LevelSet};
use crate::tls::extension::{
    construct_extensions, parse_extensions, put_cipher_list, CLIENT_EXTS, CTX_CLIENT_HELLO,
    CTX_ENCRYPTED_EXT, CTX_SERVER_HELLO, EXT_KEY_SHARE, EXT_QUIC_TRANSPORT_PARAMETERS,
    EXT_SUPPORTED_VERSIONS,
};
use crate::tls::key_schedule::{mac_equal, suite_by_id};
use crate::tls::{
    build_certificate_msg, cert_verify_payload, finished_build, parse_certificate_msg,
    parse_hello_head, FlowDir, FlowStep, HandshakeType, TlsSession, TlsState, TLS_VERSION_1_2,
};
use tracing::debug;

/// 客户端流程中各状态的先后顺序（重传判定用）
pub(crate) static CLIENT_FLOW_ORDER: &[TlsState] = &[
    TlsState::Start,
    TlsState::CwClientHello,
    TlsState::CrServerHello,
    TlsState::CrEncryptedExtensions,
    TlsState::CrCertRequest,
    TlsState::CrServerCertificate,
    TlsState::CrCertVerify,
    TlsState::CrFinished,
    TlsState::CwCertificate,
    TlsState::CwCertVerify,
    TlsState::CwFinished,
    TlsState::HandshakeDone,
];

/// 客户端流程表
pub(crate) fn client_step(state: TlsState) -> FlowStep {
    match state {
        TlsState::Start => FlowStep::nothing(TlsState::CwClientHello),
        TlsState::CwClientHello => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::ClientHello),
            read: None,
            write: Some(client_hello_build),
            post_work: None,
            skip_check: None,
            next: TlsState::CrServerHello,
            level: Level::Initial,
        },
        TlsState::CrServerHello => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::ServerHello),
            read: Some(server_hello_proc),
            write: None,
            post_work: Some(|s, levels| s.install_handshake_keys(levels)),
            skip_check: None,
            next: TlsState::CrEncryptedExtensions,
            level: Level::Initial,
        },
        TlsState::CrEncryptedExtensions => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::EncryptedExtensions),
            read: Some(encrypted_ext_proc),
            write: None,
            post_work: None,
            skip_check: None,
            next: TlsState::CrCertRequest,
            level: Level::Handshake,
        },
        TlsState::CrCertRequest => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::CertificateRequest),
            read: Some(cert_request_proc),
            write: None,
            post_work: None,
            // 条件状态：服务端没发就跳到 Certificate
            skip_check: Some(|_| true),
            next: TlsState::CrServerCertificate,
            level: Level::Handshake,
        },
        TlsState::CrServerCertificate => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::Certificate),
            read: Some(server_cert_proc),
            write: None,
            post_work: None,
            skip_check: None,
            next: TlsState::CrCertVerify,
            level: Level::Handshake,
        },
        TlsState::CrCertVerify => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::CertificateVerify),
            read: Some(cert_verify_proc),
            write: None,
            post_work: None,
            skip_check: None,
            next: TlsState::CrFinished,
            level: Level::Handshake,
        },
        TlsState::CrFinished => FlowStep {
            dir: FlowDir::Reading,
            msg: Some(HandshakeType::Finished),
            read: Some(finished_proc),
            write: None,
            post_work: Some(|s, levels| s.install_application_keys(levels)),
            skip_check: None,
            next: TlsState::CwCertificate,
            level: Level::Handshake,
        },
        TlsState::CwCertificate => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::Certificate),
            read: None,
            write: Some(client_cert_build),
            post_work: None,
            skip_check: Some(|s| !s.cert_requested),
            next: TlsState::CwCertVerify,
            level: Level::Handshake,
        },
        TlsState::CwCertVerify => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::CertificateVerify),
            read: None,
            write: Some(client_cert_verify_build),
            post_work: None,
            skip_check: Some(|s| {
                !s.cert_requested
                    || s.ctx.signing_key.is_none()
                    || s.ctx.cert_chain.is_empty()
            }),
            next: TlsState::CwFinished,
            level: Level::Handshake,
        },
        TlsState::CwFinished => FlowStep {
            dir: FlowDir::Writing,
            msg: Some(HandshakeType::Finished),
            read: None,
            write: Some(finished_build),
            post_work: None,
            skip_check: None,
            next: TlsState::HandshakeDone,
            level: Level::Handshake,
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

fn client_hello_build(s: &mut TlsSession, _levels: &mut LevelSet, w: &mut Writer) -> Result<()> {
    w.put_u16(TLS_VERSION_1_2);
    w.put_bytes(&s.client_random);

    // legacy session id: 空
    w.put_u8(0);

    put_cipher_list(w)?;

    // legacy compression: 只有 null
    w.put_u8(1);
    w.put_u8(0);

    construct_extensions(s, w, CLIENT_EXTS, CTX_CLIENT_HELLO)
}

fn server_hello_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    let mut random = [0u8; 32];
    let _session_id = parse_hello_head(r, &mut random)?;
    s.server_random = random;

    let cipher_id = r.get_u16()?;
    let suite = suite_by_id(cipher_id).ok_or_else(|| {
        QuicError::ProtocolViolation(format!("Server selected unknown cipher {:#06x}", cipher_id))
    })?;
    s.suite = Some(suite);
    s.transcript.set_hash(suite.hash)?;
    debug!("Cipher negotiated: {:#06x}", suite.id);

    // legacy compression method
    if r.get_u8()? != 0 {
        return Err(QuicError::Malformed("Nonzero compression method".into()));
    }

    parse_extensions(s, r, CLIENT_EXTS, CTX_SERVER_HELLO)?;

    if !s.peer_supported_versions {
        return Err(QuicError::MissingExtension(EXT_SUPPORTED_VERSIONS));
    }
    if s.shared_secret.is_none() {
        return Err(QuicError::MissingExtension(EXT_KEY_SHARE));
    }

    Ok(())
}

fn encrypted_ext_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    parse_extensions(s, r, CLIENT_EXTS, CTX_ENCRYPTED_EXT)?;

    if s.peer_params.is_none() {
        return Err(QuicError::MissingExtension(EXT_QUIC_TRANSPORT_PARAMETERS));
    }

    Ok(())
}

fn cert_request_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    // certificate_request_context
    let _context = r.get_u8_prefixed()?;
    // 扩展块（signature_algorithms 等）整体跳过
    let _extensions = r.get_u16_prefixed()?;

    debug!("Server requested a client certificate");
    s.cert_requested = true;
    Ok(())
}

fn server_cert_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    let chain = parse_certificate_msg(r)?;
    if chain.is_empty() {
        return Err(QuicError::BadCertificate("Empty server certificate".into()));
    }

    if s.ctx.verify_mode == VerifyMode::Peer {
        let verifier = s
            .ctx
            .verifier
            .as_ref()
            .ok_or_else(|| QuicError::BadCertificate("No verifier configured".into()))?;
        verifier.verify_chain(&chain, s.ctx.server_name.as_deref())?;
    }

    s.peer_cert_chain = chain;
    Ok(())
}

fn cert_verify_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    let scheme = r.get_u16()?;
    let signature = r.get_u16_prefixed()?.rest().to_vec();

    if s.ctx.verify_mode == VerifyMode::Peer {
        let verifier = s
            .ctx
            .verifier
            .as_ref()
            .ok_or_else(|| QuicError::BadCertificate("No verifier configured".into()))?;
        let payload = cert_verify_payload(true, &s.cert_verify_transcript);
        verifier.verify_signature(&s.peer_cert_chain[0], scheme, &payload, &signature)?;
    }

    Ok(())
}

fn finished_proc(s: &mut TlsSession, _levels: &mut LevelSet, r: &mut Reader<'_>) -> Result<()> {
    let mac = r.rest();

    if !mac_equal(mac, &s.peer_finished_expect) {
        return Err(QuicError::ProtocolViolation(
            "Server Finished MAC mismatch".into(),
        ));
    }

    debug!("Server Finished verified");
    Ok(())
}

fn client_cert_build(s: &mut TlsSession, _levels: &mut LevelSet, w: &mut Writer) -> Result<()> {
    // 没配证书就发空链（服务端据此决定是否拒绝）
    build_certificate_msg(w, &s.ctx.cert_chain)
}

fn client_cert_verify_build(
    s: &mut TlsSession,
    _levels: &mut LevelSet,
    w: &mut Writer,
) -> Result<()> {
    let key = s
        .ctx
        .signing_key
        .as_ref()
        .ok_or_else(|| QuicError::Internal("No signing key for CertificateVerify".into()))?;

    let th = s.transcript.current()?;
    let payload = cert_verify_payload(false, &th);
    let signature = key.sign(&payload)?;

    w.put_u16(key.scheme());
    w.sub_u16(|w| {
        w.put_bytes(&signature);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flow_table_shape() {
        // 写在 initial，读 SH 在 initial，其余握手级
        assert_eq!(client_step(TlsState::CwClientHello).level, Level::Initial);
        assert_eq!(client_step(TlsState::CrServerHello).level, Level::Initial);
        assert_eq!(
            client_step(TlsState::CrEncryptedExtensions).level,
            Level::Handshake
        );
        assert_eq!(client_step(TlsState::CwFinished).level, Level::Handshake);

        // 条件状态带跳过检查
        assert!(client_step(TlsState::CrCertRequest).skip_check.is_some());
        assert!(client_step(TlsState::CwCertificate).skip_check.is_some());

        // 终态
        assert_eq!(client_step(TlsState::HandshakeDone).dir, FlowDir::Finished);
    }

    #[test]
    fn test_flow_order_contains_all_read_states() {
        for st in [
            TlsState::CrServerHello,
            TlsState::CrEncryptedExtensions,
            TlsState::CrCertRequest,
            TlsState::CrServerCertificate,
            TlsState::CrCertVerify,
            TlsState::CrFinished,
        ] {
            assert!(CLIENT_FLOW_ORDER.contains(&st));
        }
    }
}
