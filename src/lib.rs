//! quicstack-ng 库
//!
//! QUIC version 1 端点实现（客户端 + 服务端），内嵌 TLS 1.3 握手，
//! 运行在调用者提供的不可靠 datagram port 之上。
//!
//! # 分层
//!
//! - [`codec`]: VarInt 与字节读写游标
//! - [`crypto`]: HKDF / AEAD / 头部保护 / transcript hash
//! - [`keys`]: initial 密钥派生与各加密级别状态
//! - [`packet`]: 长短头编解码、包号、头部保护、AEAD 包保护
//! - [`frame`]: QUIC 帧编解码
//! - [`sendq`]: 出站队列与 MSS 感知的 CRYPTO/STREAM 分片
//! - [`tls`]: 内嵌 TLS 1.3 引擎（流程表、扩展、传输参数、ticket）
//! - [`stream`]: 流生命周期与重组
//! - [`conn`]: 连接驱动
//!
//! # 用法
//!
//! ```ignore
//! let ctx = Arc::new(QuicConfig::default());
//! let port = UdpPort(socket);
//! let mut conn = Connection::new_client(ctx, Box::new(port))?;
//! conn.do_handshake()?;
//! let id = conn.stream_open(false)?;
//! conn.stream_send(id, b"hello", true)?;
//! ```

pub mod codec;
pub mod config;
pub mod conn;
pub mod crypto;
pub mod error;
pub mod frame;
pub mod keys;
pub mod packet;
pub mod sendq;
pub mod stream;
pub mod tls;

// 重新导出常用类型
pub use config::{Config, QuicConfig};
pub use conn::{ConnState, Connection, DatagramPort, UdpPort};
pub use error::{QuicError, Result};
pub use keys::{Level, Role};
pub use stream::{StreamMsg, StreamState};
