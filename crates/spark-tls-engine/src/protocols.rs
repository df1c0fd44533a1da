//! 协议版本策略解析。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 调用方请求的协议集合、密码套件策略与加密策略三者之间存在互斥关系；
//!   若直接把请求集合交给 OpenSSL，握手会在对端才暴露出“无可用套件”之类的问题。
//! - 将解析过程收敛为纯函数，便于穷举测试，也让缓存键（有效协议集合）具备确定性。
//!
//! ## 逻辑（How）
//! 1. 平台不支持 TLS1.3 时，从显式集合中剔除 TLS1.3；
//! 2. 否则若集合“想要” TLS1.3 但策略与之冲突：默认集合收窄为 TLS1.0~1.2，显式集合直接报错；
//! 3. 若策略要求放弃 1.3 以下版本：集合未包含 1.3 即报错，否则收敛为仅 TLS1.3。
//!
//! ## 契约（What）
//! - 空集合表示“平台默认”，与 OpenSSL 的默认协商范围一致；
//! - 输出集合总是请求集合（或默认全集）的子集；
//! - 函数无副作用，相同输入得到相同输出。

use bitflags::bitflags;

use crate::error::TlsEngineError;
use crate::policy::{CipherSuitesPolicy, EncryptionPolicy};

bitflags! {
    /// TLS 协议版本位集合；空集合表示交由平台决定。
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct SslProtocols: u8 {
        const TLS10 = 0b0001;
        const TLS11 = 0b0010;
        const TLS12 = 0b0100;
        const TLS13 = 0b1000;
    }
}

impl SslProtocols {
    /// 平台默认集合在 TLS1.3 不可用或被策略排除时的回退值。
    pub const LEGACY: SslProtocols = SslProtocols::TLS10
        .union(SslProtocols::TLS11)
        .union(SslProtocols::TLS12);

    /// 是否为“平台默认”。
    pub fn is_default(self) -> bool {
        self.is_empty()
    }

    /// 集合是否会尝试协商 TLS1.3；默认集合同样视为想要。
    pub fn wants_tls13(self) -> bool {
        self.is_empty() || self.contains(SslProtocols::TLS13)
    }

    /// 集合是否恰好只包含 TLS1.3。
    pub fn is_only_tls13(self) -> bool {
        self == SslProtocols::TLS13
    }
}

/// 策略是否要求放弃 TLS1.3。
///
/// `NoEncryption` 在 TLS1.3 中没有对应套件；自定义策略若未给出任何 1.3 套件，同样无法协商。
pub fn should_opt_out_of_tls13(
    policy: Option<&CipherSuitesPolicy>,
    encryption: EncryptionPolicy,
) -> bool {
    if encryption == EncryptionPolicy::NoEncryption {
        return true;
    }
    policy.is_some_and(|policy| !policy.has_tls13_suites())
}

/// 策略是否要求放弃 TLS1.3 以下的全部版本。
pub fn should_opt_out_of_lower_than_tls13(policy: Option<&CipherSuitesPolicy>) -> bool {
    policy.is_some_and(|policy| !policy.has_legacy_suites())
}

/// 计算有效协议集合。
///
/// # 错误
/// - 显式请求 TLS1.3 但策略不兼容；
/// - 策略只允许 TLS1.3，而集合（或平台）无法提供 TLS1.3。
///
/// 两种情况均返回 [`TlsEngineError::PolicyIncompatible`]。
pub fn resolve_effective_protocols(
    requested: SslProtocols,
    cipher_policy: Option<&CipherSuitesPolicy>,
    encryption: EncryptionPolicy,
    tls13_supported: bool,
) -> Result<SslProtocols, TlsEngineError> {
    let mut protocols = requested;

    if !tls13_supported {
        if !protocols.is_default() && protocols.wants_tls13() {
            protocols.remove(SslProtocols::TLS13);
        }
    } else if protocols.wants_tls13() && should_opt_out_of_tls13(cipher_policy, encryption) {
        if protocols.is_default() {
            protocols = SslProtocols::LEGACY;
        } else {
            return Err(TlsEngineError::PolicyIncompatible {
                requested,
                encryption,
            });
        }
    }

    if should_opt_out_of_lower_than_tls13(cipher_policy) {
        if !tls13_supported || !protocols.wants_tls13() {
            return Err(TlsEngineError::PolicyIncompatible {
                requested,
                encryption,
            });
        }
        protocols = SslProtocols::TLS13;
    }

    Ok(protocols)
}
