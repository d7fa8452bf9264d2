//! 密码学原语
//!
//! 本模块把外部密码学库收拢到少数几个类型后面:
//!
//! - [`hkdf`]: HKDF-Extract 和 TLS 1.3 的 HKDF-Expand-Label
//! - [`aead`]: 数据包保护 (AEAD) 和头部保护 (HP) 的封装
//! - [`transcript`]: TLS 握手消息的 transcript hash
//!
//! 上层模块不直接接触 ring / aes-gcm / sha2 的类型。

pub mod aead;
pub mod hkdf;
pub mod transcript;

pub use aead::{AeadAlg, HeaderProtector, PacketProtector};
pub use hkdf::Hash;
pub use transcript::Transcript;
