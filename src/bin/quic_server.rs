//! demo 服务端
//!
//! 等待一条 QUIC 连接完成握手，然后在一条单向流上推送一段数据。
//! 协议逻辑全部在库里，这里只做 socket 和配置装配。

use anyhow::{Context, Result};
use quicstack_ng::config::SigningKey;
use quicstack_ng::{Config, Connection, StreamMsg, UdpPort};
use socket2::{Domain, Socket, Type};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));

    let formatting_layer = fmt::layer().with_target(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(formatting_layer)
        .init();
}

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "server.toml".to_string());
    let config = Config::load(&config_path)?;

    init_logging(&config.endpoint.log_level);
    info!("Starting quic-server...");

    let mut qc = config.build_quic_config()?;
    if qc.signing_key.is_none() {
        // 没配私钥时生成一把一次性的，方便裸跑 demo
        warn!("No key configured, generating an ephemeral ECDSA P-256 key");
        qc.signing_key = Some(SigningKey::generate_p256()?);
        if qc.cert_chain.is_empty() {
            qc.cert_chain = vec![b"quicstack-ng demo certificate".to_vec()];
        }
    }

    let listen_addr = config
        .endpoint
        .listen_addr
        .context("endpoint.listen_addr is required for the server")?;

    // socket2: 放大接收缓冲
    let socket = Socket::new(Domain::for_address(listen_addr), Type::DGRAM, None)?;
    socket.set_recv_buffer_size(1 << 20)?;
    socket.bind(&listen_addr.into())?;
    let socket: UdpSocket = socket.into();
    info!("UDP socket bound to {}", listen_addr);

    // 等第一个 datagram 确定对端，再 connect 成点对点
    let mut probe = [0u8; 16];
    let (_, peer) = socket.peek_from(&mut probe)?;
    socket.connect(peer)?;
    info!("Peer: {}", peer);

    socket.set_read_timeout(Some(Duration::from_secs(10)))?;

    let mut conn = Connection::new_server(Arc::new(qc), Box::new(UdpPort(socket)))?;
    loop {
        match conn.do_handshake() {
            Ok(()) => break,
            Err(quicstack_ng::QuicError::WouldBlock) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    info!(
        "Handshake complete, cipher={:#06x?} alpn={:?}",
        conn.cipher_suite(),
        conn.alpn().map(String::from_utf8_lossy)
    );

    // 单向流推一段数据
    let id = conn.stream_open(true)?;
    let payload = vec![0x51u8; 20 * 1024];
    conn.stream_send(id, &payload, true)?;
    info!("Sent {} bytes on stream {}", payload.len(), id);

    // 继续驱动：收 ACK、对端数据或 CONNECTION_CLOSE
    loop {
        match conn.drive() {
            Ok(()) => {}
            Err(quicstack_ng::QuicError::WouldBlock) => {}
            Err(e) => {
                warn!("Connection ended: {}", e);
                break;
            }
        }

        while let Some(StreamMsg::DataReceived(sid)) = conn.poll_stream_msg() {
            let mut buf = vec![0u8; 4096];
            let n = conn.stream_recv(sid, &mut buf)?;
            info!("Stream {}: {} bytes received", sid, n);
        }

        if !conn.is_established() {
            break;
        }
    }

    Ok(())
}
