//! 引擎门面：解析协议 → 取用或构建上下文 → 分配连接。

use std::sync::Arc;

use crate::alpn::ApplicationProtocolList;
use crate::cache;
use crate::connection::{ConnectionOptions, Role, TlsConnection};
use crate::context::{ContextConfig, SecurityContext};
use crate::credentials::CertificateContext;
use crate::error::TlsEngineError;
use crate::policy::{CipherSuitesPolicy, EncryptionPolicy};
use crate::protocols::{self, SslProtocols};
use crate::settings::EngineSettings;

/// 一次认证（握手）请求的完整配置。
#[derive(Debug, Clone)]
pub struct AuthenticationOptions {
    pub role: Role,
    pub enabled_protocols: SslProtocols,
    pub encryption_policy: EncryptionPolicy,
    pub cipher_suites_policy: Option<CipherSuitesPolicy>,
    pub application_protocols: Option<Arc<ApplicationProtocolList>>,
    pub target_host: Option<String>,
    pub peer_certificate_required: bool,
    pub identity: Option<Arc<CertificateContext>>,
}

impl AuthenticationOptions {
    fn new(role: Role) -> Self {
        Self {
            role,
            enabled_protocols: SslProtocols::empty(),
            encryption_policy: EncryptionPolicy::RequireEncryption,
            cipher_suites_policy: None,
            application_protocols: None,
            target_host: None,
            peer_certificate_required: false,
            identity: None,
        }
    }

    /// 客户端配置，`target_host` 用于 SNI。
    pub fn client(target_host: impl Into<String>) -> Self {
        Self {
            target_host: Some(target_host.into()),
            ..Self::new(Role::Client)
        }
    }

    /// 服务端配置。
    pub fn server(identity: Arc<CertificateContext>) -> Self {
        Self {
            identity: Some(identity),
            ..Self::new(Role::Server)
        }
    }

    pub fn with_protocols(mut self, protocols: SslProtocols) -> Self {
        self.enabled_protocols = protocols;
        self
    }

    pub fn with_encryption_policy(mut self, policy: EncryptionPolicy) -> Self {
        self.encryption_policy = policy;
        self
    }

    pub fn with_cipher_suites_policy(mut self, policy: CipherSuitesPolicy) -> Self {
        self.cipher_suites_policy = Some(policy);
        self
    }

    pub fn with_application_protocols(mut self, protocols: ApplicationProtocolList) -> Self {
        self.application_protocols = Some(Arc::new(protocols));
        self
    }

    pub fn with_peer_certificate_required(mut self, required: bool) -> Self {
        self.peer_certificate_required = required;
        self
    }

    /// 客户端证书或替换服务端证书。
    pub fn with_identity(mut self, identity: Arc<CertificateContext>) -> Self {
        self.identity = Some(identity);
        self
    }
}

/// TLS 引擎。
#[derive(Debug, Clone, Default)]
pub struct TlsEngine {
    settings: EngineSettings,
}

impl TlsEngine {
    pub fn new(settings: EngineSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// 计算请求的有效协议集合。
    pub fn resolve_protocols(
        &self,
        options: &AuthenticationOptions,
    ) -> Result<SslProtocols, TlsEngineError> {
        protocols::resolve_effective_protocols(
            options.enabled_protocols,
            options.cipher_suites_policy.as_ref(),
            options.encryption_policy,
            self.settings.tls13_supported(),
        )
    }

    /// 该请求是否会复用身份缓存中的上下文。
    pub fn is_cacheable(&self, options: &AuthenticationOptions) -> bool {
        options.identity.is_some()
            && cache::is_cacheable(
                &self.settings,
                options.role,
                options.encryption_policy,
                options.cipher_suites_policy.as_ref(),
                options.application_protocols.as_deref(),
            )
    }

    /// 以已解析的协议集合构建新上下文，不经过缓存。
    pub fn build_context(
        &self,
        options: &AuthenticationOptions,
        protocols: SslProtocols,
    ) -> Result<SecurityContext, TlsEngineError> {
        SecurityContext::build(&ContextConfig {
            role: options.role,
            protocols,
            encryption: options.encryption_policy,
            cipher_policy: options.cipher_suites_policy.as_ref(),
            application_protocols: options.application_protocols.as_deref(),
            identity: options.identity.as_deref(),
        })
    }

    /// 取得请求对应的安全上下文：可缓存时复用身份缓存，否则总是新建。
    pub fn security_context(
        &self,
        options: &AuthenticationOptions,
    ) -> Result<Arc<SecurityContext>, TlsEngineError> {
        let protocols = self.resolve_protocols(options)?;
        match options.identity.as_deref() {
            Some(identity) if self.is_cacheable(options) => identity
                .contexts(options.role)
                .get_or_create(protocols, || self.build_context(options, protocols)),
            _ => self.build_context(options, protocols).map(Arc::new),
        }
    }

    /// 为请求分配连接。
    pub fn allocate(&self, options: &AuthenticationOptions) -> Result<TlsConnection, TlsEngineError> {
        let context = self.security_context(options)?;
        TlsConnection::open(
            context,
            ConnectionOptions {
                role: options.role,
                application_protocols: options.application_protocols.clone(),
                target_host: options.target_host.clone(),
                peer_certificate_required: options.peer_certificate_required,
                max_buffered_input: self.settings.max_buffered_input,
            },
        )
    }
}
