//! QUIC 连接错误类型
use thiserror::Error;

/// QUIC 协议处理过程中可能出现的错误
///
/// 错误的传播规则:
/// - `WouldBlock` 来自底层 datagram port，向调用者透传（非阻塞重试）
/// - `DecryptFailed` 在 initial/handshake 级别被吸收（丢弃数据包）
/// - `ProtocolViolation` / `UnexpectedMessage` / `BadCertificate` /
///   `MissingExtension` 是致命错误，连接进入 Closing
/// - `Truncated` / `Malformed` 只中止当前数据包的解析
#[derive(Error, Debug)]
pub enum QuicError {
    /// 底层 I/O 暂时不可用，调用者应稍后重试
    #[error("Operation would block")]
    WouldBlock,

    /// 数据不足，无法解析出完整的结构
    #[error("Truncated input: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    /// 编码不符合规则
    #[error("Malformed encoding: {0}")]
    Malformed(String),

    /// 编码合法，但在当前上下文中不被允许
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// AEAD 解密失败
    #[error("Decryption failed")]
    DecryptFailed,

    /// 证书链或签名验证失败
    #[error("Bad certificate: {0}")]
    BadCertificate(String),

    /// 缺少必需的 TLS 扩展
    #[error("Missing mandatory extension: {0:#06x}")]
    MissingExtension(u16),

    /// 收到当前握手状态不期望的 TLS 消息
    #[error("Unexpected handshake message: {0}")]
    UnexpectedMessage(String),

    /// 内部错误
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, QuicError>;

impl QuicError {
    /// 致命错误会让整个连接进入 Closing 状态，
    /// 非致命错误只影响当前数据包/操作。
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QuicError::ProtocolViolation(_)
                | QuicError::UnexpectedMessage(_)
                | QuicError::BadCertificate(_)
                | QuicError::MissingExtension(_)
                | QuicError::Internal(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(QuicError::ProtocolViolation("x".into()).is_fatal());
        assert!(QuicError::MissingExtension(0x39).is_fatal());
        assert!(!QuicError::WouldBlock.is_fatal());
        assert!(!QuicError::DecryptFailed.is_fatal());
        assert!(!QuicError::Truncated { expected: 4, actual: 1 }.is_fatal());
    }
}
