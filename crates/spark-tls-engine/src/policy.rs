//! 加密策略与密码套件策略。
//!
//! `CipherSuitesPolicy` 负责把调用方给出的 OpenSSL 套件名拆分为两条互相独立的列表：
//! TLS1.3 套件（`SSL_CTX_set_ciphersuites`）与 TLS1.2 及以下的传统套件（`SSL_CTX_set_cipher_list`）。
//! 两条列表都以 NUL 结尾的字节串形式保存，空列表合法。

use std::ffi::{CStr, CString};

use serde::Deserialize;

use crate::error::TlsEngineError;
use crate::protocols::SslProtocols;

/// 调用方要求的加密强度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncryptionPolicy {
    /// 必须加密；OpenSSL 默认安全级别即可满足。
    #[default]
    RequireEncryption,
    /// 允许空加密套件，但仍优先协商加密套件。
    AllowNoEncryption,
    /// 仅允许空加密套件。
    NoEncryption,
}

/// OpenSSL 已知的 TLS1.3 套件名。
const TLS13_SUITES: &[&str] = &[
    "TLS_AES_128_GCM_SHA256",
    "TLS_AES_256_GCM_SHA384",
    "TLS_CHACHA20_POLY1305_SHA256",
    "TLS_AES_128_CCM_SHA256",
    "TLS_AES_128_CCM_8_SHA256",
];

/// 自定义密码套件策略。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CipherSuitesPolicy {
    legacy: CString,
    tls13: CString,
}

impl CipherSuitesPolicy {
    /// 根据 OpenSSL 套件名构造策略，名称顺序即偏好顺序。
    ///
    /// 名称中若含有 NUL 字节将被跳过。
    pub fn new<I, S>(suites: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut legacy = Vec::new();
        let mut tls13 = Vec::new();
        for suite in suites {
            let suite = suite.as_ref().trim();
            if suite.is_empty() || suite.contains('\0') {
                continue;
            }
            if TLS13_SUITES.contains(&suite) {
                tls13.push(suite.to_owned());
            } else {
                legacy.push(suite.to_owned());
            }
        }
        Self {
            legacy: join(&legacy),
            tls13: join(&tls13),
        }
    }

    /// 传统套件列表（TLS1.2 及以下）。
    pub fn legacy_suites(&self) -> &CStr {
        &self.legacy
    }

    /// TLS1.3 套件列表。
    pub fn tls13_suites(&self) -> &CStr {
        &self.tls13
    }

    pub fn has_legacy_suites(&self) -> bool {
        !self.legacy.as_bytes().is_empty()
    }

    pub fn has_tls13_suites(&self) -> bool {
        !self.tls13.as_bytes().is_empty()
    }
}

fn join(names: &[String]) -> CString {
    // 构造时已剔除 NUL，拼接结果不会失败。
    CString::new(names.join(":")).unwrap_or_default()
}

/// 计算传给 `SSL_CTX_set_cipher_list` 的传统套件列表；`None` 表示沿用 OpenSSL 默认值。
pub fn openssl_cipher_list(
    policy: Option<&CipherSuitesPolicy>,
    protocols: SslProtocols,
    encryption: EncryptionPolicy,
) -> Result<Option<CString>, TlsEngineError> {
    if protocols.is_only_tls13() {
        return Ok(None);
    }
    match policy {
        None => Ok(cipher_list_from_encryption(encryption)),
        Some(_) if encryption == EncryptionPolicy::NoEncryption => {
            Err(TlsEngineError::PolicyUnsupported { encryption })
        }
        Some(policy) => Ok(Some(policy.legacy.clone())),
    }
}

/// 计算传给 `SSL_CTX_set_ciphersuites` 的 TLS1.3 套件列表；`None` 表示沿用 OpenSSL 默认值。
pub fn openssl_cipher_suites(
    policy: Option<&CipherSuitesPolicy>,
    protocols: SslProtocols,
    encryption: EncryptionPolicy,
) -> Result<Option<CString>, TlsEngineError> {
    let Some(policy) = policy else {
        return Ok(None);
    };
    if !protocols.wants_tls13() {
        return Ok(None);
    }
    if encryption == EncryptionPolicy::NoEncryption {
        return Err(TlsEngineError::PolicyUnsupported { encryption });
    }
    Ok(Some(policy.tls13.clone()))
}

fn cipher_list_from_encryption(encryption: EncryptionPolicy) -> Option<CString> {
    let list: &CStr = match encryption {
        EncryptionPolicy::RequireEncryption => return None,
        EncryptionPolicy::AllowNoEncryption => c"ALL:eNULL",
        EncryptionPolicy::NoEncryption => c"eNULL",
    };
    Some(list.to_owned())
}
