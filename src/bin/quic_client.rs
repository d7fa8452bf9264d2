//! demo 客户端
//!
//! 对指定地址发起 QUIC 握手，读服务端推过来的单向流，
//! 全部读完后打印统计并关闭连接。

use anyhow::{Context, Result};
use quicstack_ng::{Config, Connection, QuicError, StreamMsg, UdpPort};
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
        .unwrap_or_else(|| "client.toml".to_string());
    let config = Config::load(&config_path)?;

    init_logging(&config.endpoint.log_level);
    info!("Starting quic-client...");

    let qc = config.build_quic_config()?;
    let peer_addr = config
        .endpoint
        .peer_addr
        .context("endpoint.peer_addr is required for the client")?;

    let bind_addr: std::net::SocketAddr = if peer_addr.is_ipv4() {
        "0.0.0.0:0".parse()?
    } else {
        "[::]:0".parse()?
    };

    let socket = Socket::new(Domain::for_address(peer_addr), Type::DGRAM, None)?;
    socket.set_recv_buffer_size(1 << 20)?;
    socket.bind(&bind_addr.into())?;
    let socket: UdpSocket = socket.into();
    socket.connect(peer_addr)?;
    socket.set_read_timeout(Some(Duration::from_secs(10)))?;
    info!("Connecting to {}", peer_addr);

    let mut conn = Connection::new_client(Arc::new(qc), Box::new(UdpPort(socket)))?;
    loop {
        match conn.do_handshake() {
            Ok(()) => break,
            Err(QuicError::WouldBlock) => continue,
            Err(e) => return Err(e.into()),
        }
    }
    info!(
        "Handshake complete, cipher={:#06x?} alpn={:?}",
        conn.cipher_suite(),
        conn.alpn().map(String::from_utf8_lossy)
    );

    if let Some(ticket) = conn.session_ticket() {
        info!(
            "Session ticket: lifetime={}s, {} bytes",
            ticket.lifetime,
            ticket.ticket.len()
        );
    }

    // 等服务端的单向流，读到收尾为止
    let mut total = 0usize;
    'outer: loop {
        match conn.drive() {
            Ok(()) => {}
            Err(QuicError::WouldBlock) => {}
            Err(e) => {
                warn!("Connection ended: {}", e);
                break;
            }
        }

        while let Some(StreamMsg::DataReceived(id)) = conn.poll_stream_msg() {
            info!("Stream {} has data", id);
            let mut buf = vec![0u8; 8192];
            loop {
                match conn.stream_recv(id, &mut buf) {
                    Ok(0) => {
                        info!("Stream {} finished, {} bytes total", id, total);
                        break 'outer;
                    }
                    Ok(n) => total += n,
                    Err(QuicError::WouldBlock) => continue,
                    Err(e) => {
                        warn!("Stream read failed: {}", e);
                        break 'outer;
                    }
                }
            }
        }
    }

    conn.close(0, "bye")?;
    Ok(())
}
