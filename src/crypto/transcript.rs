//! TLS 握手 transcript hash
//!
//! 参考 RFC 8446 Section 4.4.1: The Transcript Hash
//!
//! 摘要算法要到 ServerHello 协商完成才能确定，之前的消息
//! (ClientHello) 先缓存原始字节，确定算法后一次性灌入。
//! 密钥派生和 Finished MAC 需要在多个时间点取快照，
//! 所以取当前值时克隆内部摘要上下文而不是消耗它。

use crate::crypto::hkdf::Hash;
use crate::error::{QuicError, Result};
use sha2::{Digest, Sha256, Sha384};

#[derive(Clone)]
enum HashCtx {
    Sha256(Sha256),
    Sha384(Sha384),
}

/// 握手消息的运行摘要
#[derive(Clone, Default)]
pub struct Transcript {
    ctx: Option<HashCtx>,
    /// 算法确定前缓存的消息字节
    cached: Vec<u8>,
}

impl Transcript {
    pub fn new() -> Self {
        Self {
            ctx: None,
            cached: Vec::new(),
        }
    }

    /// 喂入一条完整的握手消息 (type + length + body，按 wire 原样)
    pub fn update(&mut self, msg: &[u8]) {
        match &mut self.ctx {
            None => self.cached.extend_from_slice(msg),
            Some(HashCtx::Sha256(h)) => h.update(msg),
            Some(HashCtx::Sha384(h)) => h.update(msg),
        }
    }

    /// 协商出摘要算法后调用，缓存的消息立即被摘要
    ///
    /// 重复设置同一算法是 no-op。
    pub fn set_hash(&mut self, hash: Hash) -> Result<()> {
        if self.ctx.is_some() {
            return Ok(());
        }

        let mut ctx = match hash {
            Hash::Sha256 => HashCtx::Sha256(Sha256::new()),
            Hash::Sha384 => HashCtx::Sha384(Sha384::new()),
        };

        match &mut ctx {
            HashCtx::Sha256(h) => h.update(&self.cached),
            HashCtx::Sha384(h) => h.update(&self.cached),
        }

        self.cached.clear();
        self.ctx = Some(ctx);
        Ok(())
    }

    /// 当前 transcript hash 的快照，不影响后续 update
    pub fn current(&self) -> Result<Vec<u8>> {
        match &self.ctx {
            None => Err(QuicError::Internal(
                "Transcript hash not negotiated yet".into(),
            )),
            Some(HashCtx::Sha256(h)) => Ok(h.clone().finalize().to_vec()),
            Some(HashCtx::Sha384(h)) => Ok(h.clone().finalize().to_vec()),
        }
    }
}

impl std::fmt::Debug for Transcript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transcript")
            .field("negotiated", &self.ctx.is_some())
            .field("cached_len", &self.cached.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_then_negotiate() {
        // 缓存 + 设置算法后的结果必须和直接摘要一致
        let mut t = Transcript::new();
        t.update(b"client hello bytes");
        assert!(t.current().is_err());

        t.set_hash(Hash::Sha256).unwrap();
        t.update(b"server hello bytes");

        let direct = Sha256::new()
            .chain_update(b"client hello bytes")
            .chain_update(b"server hello bytes")
            .finalize();

        assert_eq!(t.current().unwrap(), direct.to_vec());
    }

    #[test]
    fn test_snapshot_does_not_consume() {
        let mut t = Transcript::new();
        t.set_hash(Hash::Sha256).unwrap();
        t.update(b"msg1");

        let snap1 = t.current().unwrap();
        let snap1_again = t.current().unwrap();
        assert_eq!(snap1, snap1_again);

        t.update(b"msg2");
        assert_ne!(t.current().unwrap(), snap1);
    }

    #[test]
    fn test_set_hash_idempotent() {
        let mut t = Transcript::new();
        t.update(b"abc");
        t.set_hash(Hash::Sha384).unwrap();
        let before = t.current().unwrap();
        assert_eq!(before.len(), 48);

        t.set_hash(Hash::Sha384).unwrap();
        assert_eq!(t.current().unwrap(), before);
    }
}
