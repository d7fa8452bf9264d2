//! TLS 扩展的解析与构造
//!
//! 参考 RFC 8446 Section 4.2: Extensions
//!
//! 扩展表按 (扩展类型, 所在消息上下文) 建条目，每个条目声明
//! 可选的 check（不满足则不构造）、construct、parse。
//! 上下文有 ClientHello / ServerHello / EncryptedExtensions /
//! Certificate / NewSessionTicket。解析时未知扩展直接跳过；
//! 缺失的必需扩展由各消息处理器在解析后检查。

use crate::codec::{Reader, Writer};
use crate::config::SUPPORTED_SIGALGS;
use crate::error::{QuicError, Result};
use crate::tls::key_schedule::SUPPORTED_SUITES;
use crate::tls::transport_params::{
    construct_transport_params, parse_transport_params, TransportParams,
};
use crate::tls::{
    agree, generate_key_share, NamedGroup, TlsSession, SUPPORTED_GROUPS, TLS_VERSION_1_3,
};
use tracing::{debug, trace};

pub const EXT_SERVER_NAME: u16 = 0;
pub const EXT_SUPPORTED_GROUPS: u16 = 10;
pub const EXT_SIGNATURE_ALGORITHMS: u16 = 13;
pub const EXT_ALPN: u16 = 16;
pub const EXT_SUPPORTED_VERSIONS: u16 = 43;
pub const EXT_PSK_KEX_MODES: u16 = 45;
pub const EXT_KEY_SHARE: u16 = 51;
pub const EXT_QUIC_TRANSPORT_PARAMETERS: u16 = 0x39;

/// 扩展所在的消息上下文
pub const CTX_CLIENT_HELLO: u32 = 1 << 0;
pub const CTX_SERVER_HELLO: u32 = 1 << 1;
pub const CTX_ENCRYPTED_EXT: u32 = 1 << 2;
pub const CTX_CERTIFICATE: u32 = 1 << 3;
pub const CTX_NEW_SESSION_TICKET: u32 = 1 << 4;

const MAX_HOSTNAME_LEN: usize = 255;

type ExtCheck = fn(&TlsSession) -> bool;
type ExtConstruct = fn(&mut TlsSession, &mut Writer) -> Result<()>;
type ExtParse = fn(&mut TlsSession, &mut Reader<'_>) -> Result<()>;

/// 扩展表条目
pub struct ExtDef {
    pub ty: u16,
    pub context: u32,
    pub check: Option<ExtCheck>,
    pub construct: Option<ExtConstruct>,
    pub parse: Option<ExtParse>,
}

/// 客户端扩展表
///
/// construct 条目用于 ClientHello；parse 条目覆盖
/// ServerHello / EncryptedExtensions。
pub static CLIENT_EXTS: &[ExtDef] = &[
    ExtDef {
        ty: EXT_SERVER_NAME,
        context: CTX_CLIENT_HELLO,
        check: Some(|s| s.ctx.server_name.is_some()),
        construct: Some(construct_sni),
        parse: None,
    },
    ExtDef {
        ty: EXT_SUPPORTED_GROUPS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: Some(construct_supported_groups),
        parse: None,
    },
    ExtDef {
        ty: EXT_SIGNATURE_ALGORITHMS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: Some(construct_sigalgs),
        parse: None,
    },
    ExtDef {
        ty: EXT_ALPN,
        context: CTX_CLIENT_HELLO,
        check: Some(|s| !s.ctx.alpn.is_empty()),
        construct: Some(construct_alpn_offer),
        parse: None,
    },
    ExtDef {
        ty: EXT_SUPPORTED_VERSIONS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: Some(construct_versions_offer),
        parse: None,
    },
    ExtDef {
        ty: EXT_PSK_KEX_MODES,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: Some(construct_psk_modes),
        parse: None,
    },
    ExtDef {
        ty: EXT_KEY_SHARE,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: Some(construct_key_share_offer),
        parse: None,
    },
    ExtDef {
        ty: EXT_QUIC_TRANSPORT_PARAMETERS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: Some(construct_qtp),
        parse: None,
    },
    // ---- 解析侧 ----
    ExtDef {
        ty: EXT_SUPPORTED_VERSIONS,
        context: CTX_SERVER_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_versions_selected),
    },
    ExtDef {
        ty: EXT_KEY_SHARE,
        context: CTX_SERVER_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_key_share_answer),
    },
    ExtDef {
        ty: EXT_SERVER_NAME,
        context: CTX_ENCRYPTED_EXT,
        check: None,
        construct: None,
        parse: Some(parse_sni_ack),
    },
    ExtDef {
        ty: EXT_ALPN,
        context: CTX_ENCRYPTED_EXT,
        check: None,
        construct: None,
        parse: Some(parse_alpn_selected),
    },
    ExtDef {
        ty: EXT_QUIC_TRANSPORT_PARAMETERS,
        context: CTX_ENCRYPTED_EXT,
        check: None,
        construct: None,
        parse: Some(parse_qtp),
    },
];

/// 服务端扩展表
///
/// parse 条目用于 ClientHello；construct 条目覆盖
/// ServerHello / EncryptedExtensions。
pub static SERVER_EXTS: &[ExtDef] = &[
    ExtDef {
        ty: EXT_SERVER_NAME,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_sni),
    },
    ExtDef {
        ty: EXT_SUPPORTED_GROUPS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_supported_groups),
    },
    ExtDef {
        ty: EXT_SIGNATURE_ALGORITHMS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_sigalgs),
    },
    ExtDef {
        ty: EXT_ALPN,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_alpn_offer),
    },
    ExtDef {
        ty: EXT_SUPPORTED_VERSIONS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_versions_offer),
    },
    ExtDef {
        ty: EXT_PSK_KEX_MODES,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_psk_modes),
    },
    ExtDef {
        ty: EXT_KEY_SHARE,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_key_share_offer),
    },
    ExtDef {
        ty: EXT_QUIC_TRANSPORT_PARAMETERS,
        context: CTX_CLIENT_HELLO,
        check: None,
        construct: None,
        parse: Some(parse_qtp),
    },
    // ---- 构造侧 ----
    ExtDef {
        ty: EXT_SUPPORTED_VERSIONS,
        context: CTX_SERVER_HELLO,
        check: None,
        construct: Some(construct_versions_selected),
        parse: None,
    },
    ExtDef {
        ty: EXT_KEY_SHARE,
        context: CTX_SERVER_HELLO,
        check: Some(|s| !s.peer_shares.is_empty()),
        construct: Some(construct_key_share_answer),
        parse: None,
    },
    ExtDef {
        ty: EXT_SERVER_NAME,
        context: CTX_ENCRYPTED_EXT,
        check: Some(|s| s.hostname.is_some()),
        construct: Some(construct_sni_ack),
        parse: None,
    },
    ExtDef {
        ty: EXT_ALPN,
        context: CTX_ENCRYPTED_EXT,
        check: Some(|s| s.alpn_selected.is_some()),
        construct: Some(construct_alpn_selected),
        parse: None,
    },
    ExtDef {
        ty: EXT_QUIC_TRANSPORT_PARAMETERS,
        context: CTX_ENCRYPTED_EXT,
        check: None,
        construct: Some(construct_qtp),
        parse: None,
    },
];

/// 构造一个 u16 长度前缀的扩展块
pub fn construct_extensions(
    s: &mut TlsSession,
    w: &mut Writer,
    table: &[ExtDef],
    context: u32,
) -> Result<()> {
    w.sub_u16(|w| {
        for def in table {
            if def.context != context {
                continue;
            }
            let Some(construct) = def.construct else {
                continue;
            };
            if let Some(check) = def.check {
                if !check(s) {
                    trace!("Extension {:#06x} check failed, skipped", def.ty);
                    continue;
                }
            }
            w.put_u16(def.ty);
            w.sub_u16(|w| construct(s, w))?;
        }
        Ok(())
    })
}

/// 解析一个 u16 长度前缀的扩展块；未知扩展忽略
pub fn parse_extensions(
    s: &mut TlsSession,
    r: &mut Reader<'_>,
    table: &[ExtDef],
    context: u32,
) -> Result<()> {
    let mut block = r.get_u16_prefixed()?;

    while !block.is_empty() {
        let ty = block.get_u16()?;
        let mut body = block.get_u16_prefixed()?;

        let def = table
            .iter()
            .find(|d| d.ty == ty && d.context == context && d.parse.is_some());

        match def {
            Some(def) => {
                trace!("Parsing extension {:#06x}", ty);
                (def.parse.unwrap())(s, &mut body)?;
            }
            None => {
                trace!("Ignoring extension {:#06x}", ty);
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// server_name
// ---------------------------------------------------------------------------

fn construct_sni(s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    let name = s.ctx.server_name.clone().unwrap_or_default();
    w.sub_u16(|w| {
        w.put_u8(0); // host_name
        w.sub_u16(|w| {
            w.put_bytes(name.as_bytes());
            Ok(())
        })
    })
}

/// RFC 6066: 只有 host_name 一种类型，且每类型至多一个值
fn parse_sni(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut list = r.get_u16_prefixed()?;
    let name_type = list.get_u8()?;
    if name_type != 0 {
        return Err(QuicError::Malformed(format!("SNI name type {}", name_type)));
    }

    let hostname = list.get_u16_prefixed()?.rest().to_vec();
    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(QuicError::Malformed("Hostname too long".into()));
    }
    if hostname.contains(&0) {
        return Err(QuicError::Malformed("Hostname contains zero byte".into()));
    }

    let hostname = String::from_utf8(hostname)
        .map_err(|_| QuicError::Malformed("Hostname is not UTF-8".into()))?;
    debug!("SNI: {}", hostname);
    s.hostname = Some(hostname);
    Ok(())
}

/// EE 中的 server_name 回执是空体
fn construct_sni_ack(_s: &mut TlsSession, _w: &mut Writer) -> Result<()> {
    Ok(())
}

fn parse_sni_ack(_s: &mut TlsSession, _r: &mut Reader<'_>) -> Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// supported_groups / signature_algorithms
// ---------------------------------------------------------------------------

fn construct_supported_groups(_s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    w.sub_u16(|w| {
        for group in SUPPORTED_GROUPS {
            w.put_u16(*group as u16);
        }
        Ok(())
    })
}

fn parse_supported_groups(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut list = r.get_u16_prefixed()?;
    while !list.is_empty() {
        s.peer_groups.push(list.get_u16()?);
    }
    Ok(())
}

fn construct_sigalgs(_s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    w.sub_u16(|w| {
        for alg in SUPPORTED_SIGALGS {
            w.put_u16(*alg);
        }
        Ok(())
    })
}

fn parse_sigalgs(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut list = r.get_u16_prefixed()?;
    while !list.is_empty() {
        s.peer_sigalgs.push(list.get_u16()?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ALPN
// ---------------------------------------------------------------------------

fn construct_alpn_offer(s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    let alpn = s.ctx.alpn.clone();
    w.sub_u16(|w| {
        for proto in &alpn {
            w.sub_u8(|w| {
                w.put_bytes(proto);
                Ok(())
            })?;
        }
        Ok(())
    })
}

fn parse_alpn_offer(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut list = r.get_u16_prefixed()?;
    while !list.is_empty() {
        let proto = list.get_u8_prefixed()?.rest().to_vec();
        if proto.is_empty() {
            return Err(QuicError::Malformed("Empty ALPN protocol name".into()));
        }
        s.peer_alpn.push(proto);
    }
    Ok(())
}

fn construct_alpn_selected(s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    let selected = s
        .alpn_selected
        .clone()
        .ok_or_else(|| QuicError::Internal("No ALPN selected".into()))?;
    w.sub_u16(|w| {
        w.sub_u8(|w| {
            w.put_bytes(&selected);
            Ok(())
        })
    })
}

/// 客户端核对服务端选中的协议在自己 offer 过的列表里
fn parse_alpn_selected(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut list = r.get_u16_prefixed()?;
    let proto = list.get_u8_prefixed()?.rest().to_vec();

    if !list.is_empty() {
        return Err(QuicError::Malformed("Multiple ALPN entries selected".into()));
    }
    if !s.ctx.alpn.iter().any(|p| *p == proto) {
        return Err(QuicError::ProtocolViolation(
            "Server selected an ALPN we did not offer".into(),
        ));
    }

    debug!("ALPN negotiated: {:?}", String::from_utf8_lossy(&proto));
    s.alpn_selected = Some(proto);
    Ok(())
}

// ---------------------------------------------------------------------------
// supported_versions
// ---------------------------------------------------------------------------

fn construct_versions_offer(_s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    w.sub_u8(|w| {
        w.put_u16(TLS_VERSION_1_3);
        Ok(())
    })
}

fn parse_versions_offer(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut list = r.get_u8_prefixed()?;
    while !list.is_empty() {
        if list.get_u16()? == TLS_VERSION_1_3 {
            s.peer_supported_versions = true;
        }
    }
    Ok(())
}

/// SH 里是裸 u16
fn construct_versions_selected(_s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    w.put_u16(TLS_VERSION_1_3);
    Ok(())
}

fn parse_versions_selected(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let version = r.get_u16()?;
    if version != TLS_VERSION_1_3 {
        return Err(QuicError::ProtocolViolation(format!(
            "Server selected TLS version {:#06x}",
            version
        )));
    }
    s.peer_supported_versions = true;
    Ok(())
}

// ---------------------------------------------------------------------------
// psk_key_exchange_modes
// ---------------------------------------------------------------------------

fn construct_psk_modes(_s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    w.sub_u8(|w| {
        w.put_u8(1); // psk_dhe_ke
        Ok(())
    })
}

fn parse_psk_modes(_s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let _ = r.get_u8_prefixed()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// key_share
// ---------------------------------------------------------------------------

/// 客户端只为偏好组生成一个 share
fn construct_key_share_offer(s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    let group = SUPPORTED_GROUPS[0];
    let (private, public) = generate_key_share(group)?;
    s.kexch = Some(private);
    s.kexch_group = Some(group);

    w.sub_u16(|w| {
        w.put_u16(group as u16);
        w.sub_u16(|w| {
            w.put_bytes(&public);
            Ok(())
        })
    })
}

fn parse_key_share_offer(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut list = r.get_u16_prefixed()?;
    while !list.is_empty() {
        let group = list.get_u16()?;
        let key = list.get_u16_prefixed()?.rest().to_vec();
        s.peer_shares.push((group, key));
    }
    Ok(())
}

/// 服务端应答：选一个双方都有的组，生成自己的 share 并完成 ECDH
fn construct_key_share_answer(s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    let mut selected = None;
    for group in SUPPORTED_GROUPS {
        if let Some((_, peer_key)) = s
            .peer_shares
            .iter()
            .find(|(g, _)| *g == *group as u16)
        {
            selected = Some((*group, peer_key.clone()));
            break;
        }
    }

    let (group, peer_key) = selected.ok_or_else(|| {
        QuicError::ProtocolViolation("No common key share group".into())
    })?;

    let (private, public) = generate_key_share(group)?;
    s.shared_secret = Some(agree(private, group, &peer_key)?);
    s.kexch_group = Some(group);

    w.put_u16(group as u16);
    w.sub_u16(|w| {
        w.put_bytes(&public);
        Ok(())
    })
}

/// 客户端消化服务端的应答 share，完成 ECDH
fn parse_key_share_answer(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let group_id = r.get_u16()?;
    let key = r.get_u16_prefixed()?.rest().to_vec();

    let group = NamedGroup::from_u16(group_id).ok_or_else(|| {
        QuicError::ProtocolViolation(format!("Server selected unknown group {:#06x}", group_id))
    })?;

    if s.kexch_group != Some(group) {
        return Err(QuicError::ProtocolViolation(
            "Server key share group does not match our offer".into(),
        ));
    }

    let private = s
        .kexch
        .take()
        .ok_or_else(|| QuicError::Internal("Key exchange key already consumed".into()))?;
    s.shared_secret = Some(agree(private, group, &key)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// quic_transport_parameters
// ---------------------------------------------------------------------------

fn construct_qtp(s: &mut TlsSession, w: &mut Writer) -> Result<()> {
    construct_transport_params(&s.local_params, w)
}

fn parse_qtp(s: &mut TlsSession, r: &mut Reader<'_>) -> Result<()> {
    let mut params = TransportParams::default();
    parse_transport_params(&mut params, r)?;
    debug!(
        "Peer transport parameters: max_idle_timeout={} max_streams_bidi={} max_streams_uni={}",
        params.max_idle_timeout, params.initial_max_streams_bidi, params.initial_max_streams_uni
    );
    s.peer_params = Some(params);
    Ok(())
}

/// ClientHello 的 cipher suite 列表
pub(crate) fn put_cipher_list(w: &mut Writer) -> Result<()> {
    w.sub_u16(|w| {
        for suite in SUPPORTED_SUITES {
            w.put_u16(suite.id);
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QuicConfig;
    use crate::keys::Role;
    use std::sync::Arc;

    fn client_session() -> TlsSession {
        let ctx = QuicConfig {
            alpn: vec![b"hq-interop".to_vec()],
            server_name: Some("test.example".into()),
            ..QuicConfig::default()
        };
        TlsSession::new(Role::Client, Arc::new(ctx), TransportParams::default())
    }

    fn server_session() -> TlsSession {
        let ctx = QuicConfig {
            alpn: vec![b"hq-interop".to_vec(), b"h3".to_vec()],
            ..QuicConfig::default()
        };
        TlsSession::new(Role::Server, Arc::new(ctx), TransportParams::default())
    }

    #[test]
    fn test_client_hello_extensions_round_trip() {
        let mut client = client_session();
        let mut server = server_session();

        let mut w = Writer::new();
        construct_extensions(&mut client, &mut w, CLIENT_EXTS, CTX_CLIENT_HELLO).unwrap();

        // 客户端生成了 key share 私钥
        assert!(client.kexch.is_some());

        parse_extensions(
            &mut server,
            &mut Reader::new(w.as_slice()),
            SERVER_EXTS,
            CTX_CLIENT_HELLO,
        )
        .unwrap();

        assert_eq!(server.hostname.as_deref(), Some("test.example"));
        assert!(server.peer_supported_versions);
        assert_eq!(server.peer_alpn, vec![b"hq-interop".to_vec()]);
        assert_eq!(server.peer_shares.len(), 1);
        assert_eq!(server.peer_shares[0].0, NamedGroup::X25519 as u16);
        assert!(!server.peer_groups.is_empty());
        assert!(!server.peer_sigalgs.is_empty());
        assert!(server.peer_params.is_some());
    }

    #[test]
    fn test_key_share_answer_round_trip() {
        let mut client = client_session();
        let mut server = server_session();

        // CH: client offer
        let mut w = Writer::new();
        construct_extensions(&mut client, &mut w, CLIENT_EXTS, CTX_CLIENT_HELLO).unwrap();
        parse_extensions(
            &mut server,
            &mut Reader::new(w.as_slice()),
            SERVER_EXTS,
            CTX_CLIENT_HELLO,
        )
        .unwrap();

        // SH: server answer
        let mut w = Writer::new();
        construct_extensions(&mut server, &mut w, SERVER_EXTS, CTX_SERVER_HELLO).unwrap();
        parse_extensions(
            &mut client,
            &mut Reader::new(w.as_slice()),
            CLIENT_EXTS,
            CTX_SERVER_HELLO,
        )
        .unwrap();

        // 双方得到同一个 ECDHE shared secret
        assert_eq!(client.shared_secret, server.shared_secret);
        assert!(client.shared_secret.is_some());
    }

    #[test]
    fn test_unknown_extension_ignored() {
        let mut server = server_session();

        let mut w = Writer::new();
        w.sub_u16(|w| {
            // 未知扩展 0xfe0d
            w.put_u16(0xfe0d);
            w.sub_u16(|w| {
                w.put_bytes(&[1, 2, 3]);
                Ok(())
            })
        })
        .unwrap();

        parse_extensions(
            &mut server,
            &mut Reader::new(w.as_slice()),
            SERVER_EXTS,
            CTX_CLIENT_HELLO,
        )
        .unwrap();
    }

    #[test]
    fn test_alpn_selected_must_be_offered() {
        let mut client = client_session();

        let mut w = Writer::new();
        w.sub_u16(|w| {
            w.put_u16(EXT_ALPN);
            w.sub_u16(|w| {
                w.sub_u16(|w| {
                    w.sub_u8(|w| {
                        w.put_bytes(b"smtp");
                        Ok(())
                    })
                })
            })
        })
        .unwrap();

        let err = parse_extensions(
            &mut client,
            &mut Reader::new(w.as_slice()),
            CLIENT_EXTS,
            CTX_ENCRYPTED_EXT,
        );
        assert!(matches!(err, Err(QuicError::ProtocolViolation(_))));
    }

    #[test]
    fn test_version_mismatch_rejected() {
        let mut client = client_session();

        let mut w = Writer::new();
        w.sub_u16(|w| {
            w.put_u16(EXT_SUPPORTED_VERSIONS);
            w.sub_u16(|w| {
                w.put_u16(0x0303);
                Ok(())
            })
        })
        .unwrap();

        let err = parse_extensions(
            &mut client,
            &mut Reader::new(w.as_slice()),
            CLIENT_EXTS,
            CTX_SERVER_HELLO,
        );
        assert!(matches!(err, Err(QuicError::ProtocolViolation(_))));
    }
}
