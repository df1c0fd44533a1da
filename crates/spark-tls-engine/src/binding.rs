//! 通道绑定。
//!
//! `tls-unique` 取握手 Finished 消息：服务端与会话复用两个条件异或为真时取对端的 Finished，
//! 否则取本端的 Finished。这样同一完整握手中，客户端与服务端得到的是同一份 Finished。

use bytes::Bytes;

use crate::connection::{Role, TlsConnection};
use crate::error::TlsEngineError;

/// Finished 消息的最大长度（`EVP_MAX_MD_SIZE`）。
const FINISHED_MAX_LEN: usize = 64;

/// 通道绑定类型。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelBindingKind {
    /// `tls-unique`，由本层计算。
    Unique,
    /// `tls-server-end-point`，由上层根据证书计算。
    Endpoint,
    Unknown,
}

/// 握手完成后计算出的通道绑定令牌。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBindingToken {
    kind: ChannelBindingKind,
    data: Bytes,
}

impl ChannelBindingToken {
    pub fn kind(&self) -> ChannelBindingKind {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl TlsConnection {
    /// 计算通道绑定令牌；本层不支持的类型返回 `None`。
    pub fn channel_binding(
        &self,
        kind: ChannelBindingKind,
    ) -> Result<Option<ChannelBindingToken>, TlsEngineError> {
        match kind {
            ChannelBindingKind::Unique => self.unique_binding().map(Some),
            ChannelBindingKind::Endpoint | ChannelBindingKind::Unknown => Ok(None),
        }
    }

    fn unique_binding(&self) -> Result<ChannelBindingToken, TlsEngineError> {
        let ssl = self.ssl();
        let mut finished = [0u8; FINISHED_MAX_LEN];
        let use_peer = (self.role() == Role::Server) ^ ssl.session_reused();
        let len = if use_peer {
            ssl.peer_finished(&mut finished)
        } else {
            ssl.finished(&mut finished)
        };
        if len == 0 {
            return Err(TlsEngineError::ChannelBindingUnavailable);
        }
        Ok(ChannelBindingToken {
            kind: ChannelBindingKind::Unique,
            data: Bytes::copy_from_slice(&finished[..len.min(FINISHED_MAX_LEN)]),
        })
    }
}
