//! 安全上下文构建。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - `SSL_CTX` 的构建代价高（证书解析、密钥校验、套件编译），且配置顺序决定失败语义；
//! - 构建完成后上下文即不可变，可在同一身份、同一有效协议集合的连接之间共享。
//!
//! ## 逻辑（How）
//! 1. 以“任意版本”方法创建上下文，再按有效协议集合关闭未启用的版本；
//! 2. 加密策略不是 `RequireEncryption` 时把安全级别降到 0 并回读确认；
//! 3. 分别应用 TLS1.2 及以下的套件列表与 TLS1.3 套件列表；
//! 4. 启用静默关闭（不交换 close_notify）；
//! 5. 服务端且存在候选协议时注册 ALPN 选择回调；
//! 6. 绑定证书与私钥并校验二者匹配，随后挂载中间证书。
//!
//! ## 契约（What）
//! - 每个失败点对应一个可区分的错误变体；
//! - 任一步失败时，半成品 `SslContextBuilder` 随作用域释放，不会泄露给调用方。

use std::fmt;
use std::os::raw::c_int;
use std::sync::Arc;

use foreign_types_shared::ForeignTypeRef;
use openssl::ssl::{SslContext, SslContextBuilder, SslContextRef, SslMethod, SslOptions};
use openssl_sys as sys;

use crate::alpn::{AlpnRegistry, ApplicationProtocolList};
use crate::connection::Role;
use crate::credentials::CertificateContext;
use crate::error::TlsEngineError;
use crate::policy::{self, CipherSuitesPolicy, EncryptionPolicy};
use crate::protocols::SslProtocols;

unsafe extern "C" {
    fn SSL_CTX_set_quiet_shutdown(ctx: *mut sys::SSL_CTX, mode: c_int);
    fn SSL_CTX_get_quiet_shutdown(ctx: *const sys::SSL_CTX) -> c_int;
    fn SSL_CTX_set_security_level(ctx: *mut sys::SSL_CTX, level: c_int);
    fn SSL_CTX_get_security_level(ctx: *const sys::SSL_CTX) -> c_int;
}

/// 构建一个安全上下文所需的全部输入。
#[derive(Debug, Clone, Copy)]
pub struct ContextConfig<'a> {
    pub role: Role,
    /// 已解析的有效协议集合。
    pub protocols: SslProtocols,
    pub encryption: EncryptionPolicy,
    pub cipher_policy: Option<&'a CipherSuitesPolicy>,
    pub application_protocols: Option<&'a ApplicationProtocolList>,
    pub identity: Option<&'a CertificateContext>,
}

/// 不可变的 `SSL_CTX` 封装。
pub struct SecurityContext {
    inner: SslContext,
    role: Role,
    protocols: SslProtocols,
    alpn: Option<Arc<AlpnRegistry>>,
}

impl SecurityContext {
    /// 按固定顺序构建上下文。
    pub fn build(config: &ContextConfig<'_>) -> Result<Self, TlsEngineError> {
        let mut builder = SslContextBuilder::new(SslMethod::tls())
            .map_err(TlsEngineError::ContextCreationFailed)?;

        restrict_protocols(&mut builder, config.protocols);
        apply_security_level(&mut builder, config.encryption)?;
        apply_ciphers(&mut builder, config)?;

        // 静默关闭：SSL_shutdown 只设置状态位，不发送 close_notify。
        unsafe { SSL_CTX_set_quiet_shutdown(builder.as_ptr(), 1) };

        let alpn = match (config.role, config.application_protocols) {
            (Role::Server, Some(protocols)) if !protocols.is_empty() => {
                let registry = Arc::new(AlpnRegistry::new());
                let callback_registry = Arc::clone(&registry);
                builder.set_alpn_select_callback(move |ssl, offered| {
                    callback_registry.negotiate(ssl, offered)
                });
                Some(registry)
            }
            _ => None,
        };

        if let Some(identity) = config.identity {
            bind_identity(&mut builder, identity)?;
        }

        tracing::debug!(
            role = ?config.role,
            protocols = ?config.protocols,
            encryption = ?config.encryption,
            custom_ciphers = config.cipher_policy.is_some(),
            alpn = alpn.is_some(),
            "built ssl context"
        );

        Ok(Self {
            inner: builder.build(),
            role: config.role,
            protocols: config.protocols,
            alpn,
        })
    }

    pub fn ssl_context(&self) -> &SslContextRef {
        &self.inner
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// 构建时使用的有效协议集合，也是缓存键。
    pub fn protocols(&self) -> SslProtocols {
        self.protocols
    }

    pub(crate) fn alpn_registry(&self) -> Option<&Arc<AlpnRegistry>> {
        self.alpn.as_ref()
    }

    /// 仍登记在 ALPN 回调表中的连接数。
    pub fn pending_alpn_registrations(&self) -> usize {
        self.alpn.as_ref().map_or(0, |registry| registry.len())
    }

    pub fn is_quiet_shutdown(&self) -> bool {
        unsafe { SSL_CTX_get_quiet_shutdown(self.inner.as_ptr()) == 1 }
    }
}

impl fmt::Debug for SecurityContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecurityContext")
            .field("role", &self.role)
            .field("protocols", &self.protocols)
            .field("alpn", &self.alpn.is_some())
            .finish_non_exhaustive()
    }
}

fn restrict_protocols(builder: &mut SslContextBuilder, protocols: SslProtocols) {
    if protocols.is_default() {
        return;
    }
    let mut options = SslOptions::NO_SSLV2 | SslOptions::NO_SSLV3;
    for (version, disable) in [
        (SslProtocols::TLS10, SslOptions::NO_TLSV1),
        (SslProtocols::TLS11, SslOptions::NO_TLSV1_1),
        (SslProtocols::TLS12, SslOptions::NO_TLSV1_2),
        (SslProtocols::TLS13, SslOptions::NO_TLSV1_3),
    ] {
        if !protocols.contains(version) {
            options |= disable;
        }
    }
    builder.set_options(options);
}

fn apply_security_level(
    builder: &mut SslContextBuilder,
    encryption: EncryptionPolicy,
) -> Result<(), TlsEngineError> {
    if encryption == EncryptionPolicy::RequireEncryption {
        return Ok(());
    }
    let ctx = builder.as_ptr();
    let level = unsafe {
        SSL_CTX_set_security_level(ctx, 0);
        SSL_CTX_get_security_level(ctx)
    };
    if level != 0 {
        return Err(TlsEngineError::PolicyUnsupported { encryption });
    }
    Ok(())
}

fn apply_ciphers(
    builder: &mut SslContextBuilder,
    config: &ContextConfig<'_>,
) -> Result<(), TlsEngineError> {
    let list = policy::openssl_cipher_list(config.cipher_policy, config.protocols, config.encryption)?;
    let suites =
        policy::openssl_cipher_suites(config.cipher_policy, config.protocols, config.encryption)?;

    if let Some(list) = list {
        builder
            .set_cipher_list(&list.to_string_lossy())
            .map_err(TlsEngineError::CipherConfigurationUnsupported)?;
    }
    if let Some(suites) = suites {
        builder
            .set_ciphersuites(&suites.to_string_lossy())
            .map_err(TlsEngineError::CipherConfigurationUnsupported)?;
    }
    Ok(())
}

fn bind_identity(
    builder: &mut SslContextBuilder,
    identity: &CertificateContext,
) -> Result<(), TlsEngineError> {
    builder
        .set_certificate(identity.certificate())
        .map_err(TlsEngineError::CertificateBindFailed)?;
    builder
        .set_private_key(identity.private_key())
        .map_err(TlsEngineError::PrivateKeyBindFailed)?;
    builder
        .check_private_key()
        .map_err(TlsEngineError::PrivateKeyMismatch)?;
    for intermediate in identity.intermediates() {
        builder
            .add_extra_chain_cert(intermediate.clone())
            .map_err(TlsEngineError::ChainAttachFailed)?;
    }
    Ok(())
}
