//! 握手驱动。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 非阻塞握手中“需要更多输入”属于正常状态，不应以错误形式打断调用方；
//! - 握手失败时 OpenSSL 往往已在输出缓冲里排入告警，必须先排空再报告失败。
//!
//! ## 逻辑（How）
//! 1. 写入入站字节，短写即致命；
//! 2. 推进一次 `SSL_do_handshake`，除 `WANT_READ` 之外的结果码都记为致命失败；
//! 3. 无论成功与否都排空输出缓冲；已有致命失败时忽略排空异常；
//! 4. 若记录了致命失败则此时返回错误，错误携带排空得到的字节；
//! 5. 否则检查握手是否完成；进入 `Established` 或 `Failed` 时释放 ALPN 登记。
//!
//! ## 契约（What）
//! - 状态只会沿 `NotStarted → InProgress → {Established | Failed}` 前进；
//! - `Failed` 之后的任何操作返回 [`TlsEngineError::ConnectionFailed`]。

use std::os::raw::c_int;

use bytes::Bytes;
use foreign_types_shared::ForeignTypeRef;
use openssl_sys as sys;

use crate::alpn;
use crate::connection::TlsConnection;
use crate::error::{self, Classified, Diagnostic, SslErrorCode, TlsEngineError};

unsafe extern "C" {
    fn SSL_renegotiate(ssl: *mut sys::SSL) -> c_int;
    fn SSL_renegotiate_pending(ssl: *const sys::SSL) -> c_int;
}

/// 握手状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    InProgress,
    Established,
    Failed,
}

/// 一次握手推进的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeStep {
    /// 需要发送给对端的字节，可能为空。
    pub output: Bytes,
    /// 本端握手是否已完成。
    pub complete: bool,
}

/// 重协商请求的结果。
#[derive(Debug)]
pub enum SecurityStatus {
    Ok,
    InternalError(Diagnostic),
}

impl SecurityStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SecurityStatus::Ok)
    }
}

impl TlsConnection {
    /// 推进握手一步。
    pub fn step(&mut self, inbound: &[u8]) -> Result<HandshakeStep, TlsEngineError> {
        if self.state == HandshakeState::Failed {
            return Err(TlsEngineError::ConnectionFailed);
        }
        if let Err(err) = self.feed(inbound) {
            self.finish(HandshakeState::Failed);
            return Err(err);
        }
        if self.state == HandshakeState::NotStarted {
            self.state = HandshakeState::InProgress;
        }

        let failure = match self.stream.do_handshake() {
            Ok(()) => None,
            Err(err) => {
                let classified = error::classify(err);
                (classified.code != SslErrorCode::WantRead).then_some(classified)
            }
        };

        let output = match self.drain_output() {
            Ok(output) => output,
            Err(_) if failure.is_some() => {
                self.stream.get_mut().clear_output();
                Bytes::new()
            }
            Err(err) => {
                self.finish(HandshakeState::Failed);
                return Err(err);
            }
        };

        if let Some(Classified { code, diagnostic }) = failure {
            self.finish(HandshakeState::Failed);
            if let Some(rejection) = alpn::rejection_of(self.ssl()) {
                tracing::debug!(connection = self.id().get(), ?rejection, "alpn negotiation failed");
                return Err(TlsEngineError::AlpnNegotiationFailed {
                    pending_output: output,
                });
            }
            tracing::debug!(
                connection = self.id().get(),
                role = ?self.role(),
                ?code,
                diagnostic = diagnostic.as_ref().map(tracing::field::display),
                "tls handshake failed"
            );
            return Err(TlsEngineError::HandshakeFailed {
                code,
                diagnostic,
                pending_output: output,
            });
        }

        let complete = self.ssl().is_init_finished();
        if complete {
            self.finish(HandshakeState::Established);
        }
        tracing::trace!(
            connection = self.id().get(),
            input = inbound.len(),
            output = output.len(),
            complete,
            "tls handshake step"
        );
        Ok(HandshakeStep { output, complete })
    }

    /// 进入终态并释放 ALPN 登记。
    fn finish(&mut self, state: HandshakeState) {
        self.state = state;
        self.release_alpn_registration();
    }

    /// 请求重协商；后续 `step`/`encrypt` 会把重协商消息排入输出。
    ///
    /// TLS1.3 不支持重协商，此时返回携带诊断的 `InternalError`。
    pub fn renegotiate(&mut self) -> SecurityStatus {
        let ssl = self.stream.ssl().as_ptr();
        let (result, stack) = error::guarded(|| unsafe { SSL_renegotiate(ssl) });
        if result == 1 {
            SecurityStatus::Ok
        } else {
            SecurityStatus::InternalError(
                Diagnostic::from_stack(stack).unwrap_or(Diagnostic::Unknown),
            )
        }
    }

    /// 是否存在尚未完成的重协商。
    pub fn is_renegotiation_pending(&self) -> bool {
        unsafe { SSL_renegotiate_pending(self.stream.ssl().as_ptr()) == 1 }
    }
}
