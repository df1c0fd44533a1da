//! 证书身份。
//!
//! 一个 [`CertificateContext`] 表示一份已解析的证书、私钥与中间证书链，同时拥有该身份的上下文缓存。
//! 信任校验不在这里进行，引擎只负责把材料装配进 `SSL_CTX`。

use std::fmt;

use openssl::error::ErrorStack;
use openssl::pkey::{PKey, PKeyRef, Private};
use openssl::x509::{X509, X509Ref};

use crate::cache::ContextCache;
use crate::connection::Role;
use crate::error::TlsEngineError;

/// 证书身份及其上下文缓存。
pub struct CertificateContext {
    certificate: X509,
    private_key: PKey<Private>,
    intermediates: Vec<X509>,
    client_contexts: ContextCache,
    server_contexts: ContextCache,
}

impl CertificateContext {
    pub fn new(certificate: X509, private_key: PKey<Private>, intermediates: Vec<X509>) -> Self {
        Self {
            certificate,
            private_key,
            intermediates,
            client_contexts: ContextCache::new(),
            server_contexts: ContextCache::new(),
        }
    }

    /// 从 PEM 解析：证书链中第一张为叶子证书，其余为中间证书。
    pub fn from_pem(chain_pem: &[u8], key_pem: &[u8]) -> Result<Self, TlsEngineError> {
        let mut chain = X509::stack_from_pem(chain_pem)
            .map_err(TlsEngineError::CertificateBindFailed)?
            .into_iter();
        let certificate = chain
            .next()
            .ok_or_else(|| TlsEngineError::CertificateBindFailed(ErrorStack::get()))?;
        let private_key = PKey::private_key_from_pem(key_pem)
            .map_err(TlsEngineError::PrivateKeyBindFailed)?;
        Ok(Self::new(certificate, private_key, chain.collect()))
    }

    /// 从 DER 解析叶子证书与 PKCS#8 私钥。
    pub fn from_der(certificate_der: &[u8], pkcs8_der: &[u8]) -> Result<Self, TlsEngineError> {
        let certificate =
            X509::from_der(certificate_der).map_err(TlsEngineError::CertificateBindFailed)?;
        let private_key = PKey::private_key_from_pkcs8(pkcs8_der)
            .map_err(TlsEngineError::PrivateKeyBindFailed)?;
        Ok(Self::new(certificate, private_key, Vec::new()))
    }

    /// 追加中间证书。
    pub fn with_intermediates(mut self, intermediates: impl IntoIterator<Item = X509>) -> Self {
        self.intermediates.extend(intermediates);
        self
    }

    pub fn certificate(&self) -> &X509Ref {
        &self.certificate
    }

    pub fn private_key(&self) -> &PKeyRef<Private> {
        &self.private_key
    }

    pub fn intermediates(&self) -> &[X509] {
        &self.intermediates
    }

    /// 指定角色的上下文缓存。
    ///
    /// 两种角色分开缓存：服务端上下文带有 ALPN 回调，客户端上下文没有。
    pub fn contexts(&self, role: Role) -> &ContextCache {
        match role {
            Role::Client => &self.client_contexts,
            Role::Server => &self.server_contexts,
        }
    }
}

impl fmt::Debug for CertificateContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateContext")
            .field("intermediates", &self.intermediates.len())
            .field("cached_client_contexts", &self.client_contexts.len())
            .field("cached_server_contexts", &self.server_contexts.len())
            .finish_non_exhaustive()
    }
}
