//! 错误翻译与错误类型。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - OpenSSL 通过“返回码 + 线程局部错误队列”两条通道报告失败；若不在失败调用之后立即取走队列，
//!   后续无关调用会把陈旧诊断误归因到自己身上。
//! - 为上层提供稳定错误码与分类，使自动化策略无需解析 OpenSSL 文案。
//!
//! ## 逻辑（How）
//! - [`classify`] 把 `openssl::ssl::Error` 拆解为 [`SslErrorCode`] 与可选的 [`Diagnostic`]；
//! - [`guarded`] 包裹直接调用的 FFI：调用前丢弃陈旧条目，调用后立刻捕获队列；
//! - [`TlsEngineError::code`]/[`TlsEngineError::class`] 给出稳定错误码与分类。
//!
//! ## 契约（What）
//! - `WantRead`/`ZeroReturn`/`WantRenegotiate` 属于正常控制流，只作为返回值出现，不会被包装为错误；
//! - 所有致命路径都会把诊断附着在错误上，错误队列在返回前已被清空。

use std::io;

use bytes::Bytes;
use openssl::error::ErrorStack;
use openssl::ssl;
use openssl_sys as sys;
use thiserror::Error;

use crate::policy::EncryptionPolicy;
use crate::protocols::SslProtocols;

/// 握手/记录层操作的结果码。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SslErrorCode {
    None,
    WantRead,
    WantWrite,
    ZeroReturn,
    /// 读取需要更多输入，且对端发起的重协商尚未完成。
    WantRenegotiate,
    SyscallError,
    ProtocolError,
}

impl SslErrorCode {
    /// 由 `SSL_get_error` 的原始值映射。
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            sys::SSL_ERROR_NONE => SslErrorCode::None,
            sys::SSL_ERROR_WANT_READ => SslErrorCode::WantRead,
            sys::SSL_ERROR_WANT_WRITE => SslErrorCode::WantWrite,
            sys::SSL_ERROR_ZERO_RETURN => SslErrorCode::ZeroReturn,
            sys::SSL_ERROR_SYSCALL => SslErrorCode::SyscallError,
            _ => SslErrorCode::ProtocolError,
        }
    }

    /// 是否属于调用方应自行重试或视为流结束的瞬时信号。
    pub fn is_transient(self) -> bool {
        matches!(
            self,
            SslErrorCode::WantRead | SslErrorCode::ZeroReturn | SslErrorCode::WantRenegotiate
        )
    }
}

/// 附着在致命错误上的底层诊断。
#[derive(Debug, Error)]
pub enum Diagnostic {
    #[error("crypto library reported: {0}")]
    Crypto(ErrorStack),
    #[error("peer closed the transport without a TLS close")]
    UnexpectedEndOfStream,
    #[error("transport I/O failure: {0}")]
    TransportIo(io::Error),
    #[error("no diagnostic available")]
    Unknown,
}

impl Diagnostic {
    /// 若队列非空则包装为 `Crypto`。
    pub(crate) fn from_stack(stack: ErrorStack) -> Option<Self> {
        if stack.errors().is_empty() {
            None
        } else {
            Some(Diagnostic::Crypto(stack))
        }
    }
}

/// 一次失败调用的翻译结果。
#[derive(Debug)]
pub struct Classified {
    pub code: SslErrorCode,
    pub diagnostic: Option<Diagnostic>,
}

/// 将 `openssl` 的 SSL 错误翻译为结果码与诊断。
///
/// - `SYSCALL`：见 [`syscall_diagnostic`]；
/// - `SSL`（协议错误）：总是包装错误队列内容，队列为空时为 `Unknown`；
/// - 其余结果码不附带诊断。
///
/// `openssl` 在构造 `ssl::Error` 时已取走错误队列；这里再做一次清空，保证后续调用看到的是干净队列。
pub fn classify(error: ssl::Error) -> Classified {
    let code = SslErrorCode::from_raw(error.code().as_raw());
    let diagnostic = match code {
        SslErrorCode::SyscallError => {
            let stack = error.ssl_error().cloned();
            Some(syscall_diagnostic(stack, error.into_io_error().ok()))
        }
        SslErrorCode::ProtocolError => Some(
            error
                .ssl_error()
                .cloned()
                .and_then(Diagnostic::from_stack)
                .or_else(|| Diagnostic::from_stack(ErrorStack::get()))
                .unwrap_or(Diagnostic::Unknown),
        ),
        _ => None,
    };
    drain_stale();
    Classified { code, diagnostic }
}

/// `SSL_ERROR_SYSCALL` 的诊断。
///
/// 错误队列非空 → `Crypto`；存在传输层 I/O 错误 → `TransportIo`（`UnexpectedEof` 归为
/// `UnexpectedEndOfStream`）；两者都没有时为 `Unknown`。
///
/// `openssl` 不公开失败调用的原始返回值，无法区分“读到 0”与“负值但无 errno”。
/// [`MemoryTransport`](crate::MemoryTransport) 在输入耗尽时报告 `WouldBlock` 而非 EOF，
/// 因此引擎自身不会产生 0 返回；只有传输层明确给出 `UnexpectedEof` 时才报告流意外结束。
fn syscall_diagnostic(stack: Option<ErrorStack>, io: Option<io::Error>) -> Diagnostic {
    if let Some(diagnostic) = stack.and_then(Diagnostic::from_stack) {
        return diagnostic;
    }
    match io {
        Some(io) if io.kind() == io::ErrorKind::UnexpectedEof => Diagnostic::UnexpectedEndOfStream,
        Some(io) => Diagnostic::TransportIo(io),
        None => Diagnostic::Unknown,
    }
}

/// 以“先清空、再调用、立即捕获”的顺序执行一次直接的 FFI 调用。
pub(crate) fn guarded<T>(call: impl FnOnce() -> T) -> (T, ErrorStack) {
    drain_stale();
    let value = call();
    (value, ErrorStack::get())
}

fn drain_stale() {
    let stale = ErrorStack::get();
    if !stale.errors().is_empty() {
        tracing::trace!(entries = stale.errors().len(), "discarded stale crypto diagnostics");
    }
}

/// 错误分类，对应上层的处理策略。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// 策略输入互相矛盾，快速失败，不应重试。
    Configuration,
    /// 证书、套件或证书链装配失败，上下文被丢弃。
    ContextBuild,
    /// 握手或记录层致命失败，连接必须丢弃。
    Handshake,
    /// 正常控制流信号，不会以错误形式出现，保留以便上层统一建模。
    TransientSignal,
    /// 底层传输失败，携带操作系统错误。
    Io,
    /// ALPN 协商失败，按致命握手失败处理。
    AlpnNegotiation,
}

/// TLS 引擎对外暴露的错误类型。
#[derive(Debug, Error)]
pub enum TlsEngineError {
    #[error("requested protocols {requested:?} are incompatible with encryption policy {encryption:?}")]
    PolicyIncompatible {
        requested: SslProtocols,
        encryption: EncryptionPolicy,
    },
    #[error("failed to allocate ssl context")]
    ContextCreationFailed(#[source] ErrorStack),
    #[error("encryption policy {encryption:?} is not supported by the crypto library")]
    PolicyUnsupported { encryption: EncryptionPolicy },
    #[error("cipher configuration was rejected by the crypto library")]
    CipherConfigurationUnsupported(#[source] ErrorStack),
    #[error("failed to bind certificate to ssl context")]
    CertificateBindFailed(#[source] ErrorStack),
    #[error("failed to bind private key to ssl context")]
    PrivateKeyBindFailed(#[source] ErrorStack),
    #[error("private key does not match certificate")]
    PrivateKeyMismatch(#[source] ErrorStack),
    #[error("failed to attach intermediate certificate")]
    ChainAttachFailed(#[source] ErrorStack),
    #[error("failed to create handshake object")]
    HandshakeObjectCreationFailed(#[source] ErrorStack),
    #[error("failed to configure application protocols")]
    AlpnConfigurationFailed(#[source] Option<ErrorStack>),
    #[error("input buffer accepted {accepted} of {requested} bytes")]
    BufferWriteFailed { requested: usize, accepted: usize },
    #[error("output buffer held {available} of {requested} pending bytes")]
    BufferReadFailed { requested: usize, available: usize },
    #[error("tls handshake failed ({code:?})")]
    HandshakeFailed {
        code: SslErrorCode,
        #[source]
        diagnostic: Option<Diagnostic>,
        /// 失败后排空的待发送字节（通常是告警）。
        pending_output: Bytes,
    },
    #[error("no application protocol in common with the client")]
    AlpnNegotiationFailed { pending_output: Bytes },
    #[error("tls encrypt failed ({code:?})")]
    EncryptFailed {
        code: SslErrorCode,
        #[source]
        diagnostic: Option<Diagnostic>,
    },
    #[error("tls decrypt failed ({code:?})")]
    DecryptFailed {
        code: SslErrorCode,
        #[source]
        diagnostic: Option<Diagnostic>,
    },
    #[error("channel binding material is unavailable")]
    ChannelBindingUnavailable,
    #[error("connection is unusable after a fatal handshake failure")]
    ConnectionFailed,
}

impl TlsEngineError {
    /// 稳定错误码，供日志检索与自动化策略使用。
    pub fn code(&self) -> &'static str {
        match self {
            TlsEngineError::PolicyIncompatible { .. } => "spark.tls.policy_incompatible",
            TlsEngineError::ContextCreationFailed(_) => "spark.tls.context_creation_failed",
            TlsEngineError::PolicyUnsupported { .. } => "spark.tls.policy_unsupported",
            TlsEngineError::CipherConfigurationUnsupported(_) => {
                "spark.tls.cipher_configuration_unsupported"
            }
            TlsEngineError::CertificateBindFailed(_) => "spark.tls.certificate_bind_failed",
            TlsEngineError::PrivateKeyBindFailed(_) => "spark.tls.private_key_bind_failed",
            TlsEngineError::PrivateKeyMismatch(_) => "spark.tls.private_key_mismatch",
            TlsEngineError::ChainAttachFailed(_) => "spark.tls.chain_attach_failed",
            TlsEngineError::HandshakeObjectCreationFailed(_) => {
                "spark.tls.handshake_object_creation_failed"
            }
            TlsEngineError::AlpnConfigurationFailed(_) => "spark.tls.alpn_configuration_failed",
            TlsEngineError::BufferWriteFailed { .. } => "spark.tls.buffer_write_failed",
            TlsEngineError::BufferReadFailed { .. } => "spark.tls.buffer_read_failed",
            TlsEngineError::HandshakeFailed { .. } => "spark.tls.handshake_failed",
            TlsEngineError::AlpnNegotiationFailed { .. } => "spark.tls.alpn_negotiation_failed",
            TlsEngineError::EncryptFailed { .. } => "spark.tls.encrypt_failed",
            TlsEngineError::DecryptFailed { .. } => "spark.tls.decrypt_failed",
            TlsEngineError::ChannelBindingUnavailable => "spark.tls.channel_binding_unavailable",
            TlsEngineError::ConnectionFailed => "spark.tls.connection_failed",
        }
    }

    /// 错误所属分类。
    pub fn class(&self) -> ErrorClass {
        match self {
            TlsEngineError::PolicyIncompatible { .. } | TlsEngineError::PolicyUnsupported { .. } => {
                ErrorClass::Configuration
            }
            TlsEngineError::ContextCreationFailed(_)
            | TlsEngineError::CipherConfigurationUnsupported(_)
            | TlsEngineError::CertificateBindFailed(_)
            | TlsEngineError::PrivateKeyBindFailed(_)
            | TlsEngineError::PrivateKeyMismatch(_)
            | TlsEngineError::ChainAttachFailed(_) => ErrorClass::ContextBuild,
            TlsEngineError::AlpnNegotiationFailed { .. } => ErrorClass::AlpnNegotiation,
            TlsEngineError::HandshakeFailed { diagnostic, .. }
            | TlsEngineError::EncryptFailed { diagnostic, .. }
            | TlsEngineError::DecryptFailed { diagnostic, .. } => match diagnostic {
                Some(Diagnostic::TransportIo(_)) => ErrorClass::Io,
                _ => ErrorClass::Handshake,
            },
            TlsEngineError::HandshakeObjectCreationFailed(_)
            | TlsEngineError::AlpnConfigurationFailed(_)
            | TlsEngineError::BufferWriteFailed { .. }
            | TlsEngineError::BufferReadFailed { .. }
            | TlsEngineError::ChannelBindingUnavailable
            | TlsEngineError::ConnectionFailed => ErrorClass::Handshake,
        }
    }

    /// 失败时仍需发送给对端的字节。
    pub fn pending_output(&self) -> Option<&Bytes> {
        match self {
            TlsEngineError::HandshakeFailed { pending_output, .. }
            | TlsEngineError::AlpnNegotiationFailed { pending_output } => Some(pending_output),
            _ => None,
        }
    }
}
