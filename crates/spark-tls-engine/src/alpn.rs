//! ALPN 协商。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - OpenSSL 的 ALPN 选择回调挂在共享的 `SSL_CTX` 上，而候选列表属于单个连接；
//!   若在回调里持有裸指针，连接销毁后回调可能读到已释放的内存。
//!
//! ## 逻辑（How）
//! - 连接在 `SSL` 的 ex_data 中只存放 [`ConnectionId`]；
//! - 上下文持有 [`AlpnRegistry`]，以连接 ID 映射到候选列表的 `Weak` 引用；
//! - 回调通过 ID 查找登记项（不移除），再按服务端顺序选择协议；
//!   TLS1.3 的 HelloRetryRequest 会让同一连接的回调再触发一次，登记项必须仍然可见；
//! - 连接持有 [`AlpnRegistration`] 守卫，握手进入 `Established`/`Failed` 时释放，
//!   连接销毁时守卫析构同样注销。
//!
//! ## 契约（What）
//! - 无交集或解析异常时，登记项在回调返回前被清除，并返回致命告警，握手随之失败；
//! - 选择成功时登记项保留到握手结束。

use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use dashmap::DashMap;
use openssl::ex_data::Index;
use openssl::ssl::{AlpnError, Ssl, SslRef};

use crate::connection::ConnectionId;
use crate::error::TlsEngineError;

/// 单个应用层协议名（1..=255 字节）。
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ApplicationProtocol(Bytes);

impl ApplicationProtocol {
    pub const HTTP_11: ApplicationProtocol =
        ApplicationProtocol(Bytes::from_static(b"http/1.1"));
    pub const HTTP_2: ApplicationProtocol = ApplicationProtocol(Bytes::from_static(b"h2"));
    pub const HTTP_3: ApplicationProtocol = ApplicationProtocol(Bytes::from_static(b"h3"));

    pub fn new(name: impl Into<Bytes>) -> Result<Self, TlsEngineError> {
        let name = name.into();
        if name.is_empty() || name.len() > usize::from(u8::MAX) {
            return Err(TlsEngineError::AlpnConfigurationFailed(None));
        }
        Ok(Self(name))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for ApplicationProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

/// 有序的候选协议列表，顺序即偏好。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplicationProtocolList(Vec<ApplicationProtocol>);

impl ApplicationProtocolList {
    pub fn new(protocols: Vec<ApplicationProtocol>) -> Self {
        Self(protocols)
    }

    /// 由协议名构造，任一名称非法即返回错误。
    pub fn from_names<I, S>(names: I) -> Result<Self, TlsEngineError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        names
            .into_iter()
            .map(|name| ApplicationProtocol::new(Bytes::copy_from_slice(name.as_ref())))
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ApplicationProtocol> {
        self.0.iter()
    }

    /// 编码为 ALPN 扩展使用的“1 字节长度 + 名称”序列。
    pub fn to_wire(&self) -> Vec<u8> {
        let mut wire = Vec::with_capacity(self.0.iter().map(|p| p.0.len() + 1).sum());
        for protocol in &self.0 {
            // 构造时已保证长度不超过 255。
            wire.push(protocol.0.len() as u8);
            wire.extend_from_slice(&protocol.0);
        }
        wire
    }
}

/// 服务端拒绝客户端 ALPN 提议的原因。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlpnRejection {
    /// 双方候选集合没有交集。
    NoOverlap,
    /// 客户端提议的编码不合法。
    Malformed,
}

/// 按服务端顺序在客户端提议中挑选第一个匹配的协议。
///
/// 返回值借用自客户端提议缓冲区。
pub fn select_protocol<'a>(
    candidates: &ApplicationProtocolList,
    offered: &'a [u8],
) -> Result<&'a [u8], AlpnRejection> {
    let entries = parse_offer(offered)?;
    candidates
        .iter()
        .find_map(|candidate| {
            entries
                .iter()
                .copied()
                .find(|entry| *entry == candidate.as_bytes())
        })
        .ok_or(AlpnRejection::NoOverlap)
}

fn parse_offer(mut offered: &[u8]) -> Result<Vec<&[u8]>, AlpnRejection> {
    let mut entries = Vec::new();
    while let Some((&len, rest)) = offered.split_first() {
        let len = usize::from(len);
        if len == 0 || len > rest.len() {
            return Err(AlpnRejection::Malformed);
        }
        let (entry, tail) = rest.split_at(len);
        entries.push(entry);
        offered = tail;
    }
    Ok(entries)
}

/// 回调拒绝协商时写入 `SSL` ex_data 的标记。
#[derive(Debug, Clone, Copy)]
pub(crate) struct AlpnRejected(pub AlpnRejection);

pub(crate) fn connection_index() -> Result<Index<Ssl, ConnectionId>, openssl::error::ErrorStack> {
    static INDEX: OnceLock<Index<Ssl, ConnectionId>> = OnceLock::new();
    if let Some(index) = INDEX.get() {
        return Ok(*index);
    }
    let index = Ssl::new_ex_index()?;
    Ok(*INDEX.get_or_init(|| index))
}

pub(crate) fn rejection_index() -> Result<Index<Ssl, AlpnRejected>, openssl::error::ErrorStack> {
    static INDEX: OnceLock<Index<Ssl, AlpnRejected>> = OnceLock::new();
    if let Some(index) = INDEX.get() {
        return Ok(*index);
    }
    let index = Ssl::new_ex_index()?;
    Ok(*INDEX.get_or_init(|| index))
}

/// 回调是否曾拒绝该连接的 ALPN 提议。
pub(crate) fn rejection_of(ssl: &SslRef) -> Option<AlpnRejection> {
    let index = rejection_index().ok()?;
    ssl.ex_data(index).map(|marker| marker.0)
}

/// 服务端上下文共享的候选列表登记表。
#[derive(Debug, Default)]
pub struct AlpnRegistry {
    entries: DashMap<ConnectionId, Weak<ApplicationProtocolList>>,
}

impl AlpnRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前仍在等待协商的连接数。
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 登记连接的候选列表，返回的守卫析构时注销。
    pub(crate) fn register(
        self: &Arc<Self>,
        id: ConnectionId,
        protocols: &Arc<ApplicationProtocolList>,
    ) -> AlpnRegistration {
        self.entries.insert(id, Arc::downgrade(protocols));
        AlpnRegistration {
            registry: Arc::clone(self),
            id,
        }
    }

    fn lookup(&self, id: ConnectionId) -> Option<Arc<ApplicationProtocolList>> {
        self.entries
            .get(&id)
            .and_then(|protocols| protocols.value().upgrade())
    }

    fn unregister(&self, id: ConnectionId) {
        self.entries.remove(&id);
    }

    /// `SSL_CTX` 级 ALPN 选择回调的实现。
    pub(crate) fn negotiate<'a>(
        &self,
        ssl: &mut SslRef,
        offered: &'a [u8],
    ) -> Result<&'a [u8], AlpnError> {
        let id = connection_index()
            .ok()
            .and_then(|index| ssl.ex_data(index).copied());
        // 未登记的连接不参与协商，交由 OpenSSL 按“未选择”处理。
        let Some(id) = id else {
            return Err(AlpnError::NOACK);
        };
        let Some(candidates) = self.lookup(id) else {
            return Err(AlpnError::NOACK);
        };

        match select_protocol(&candidates, offered) {
            Ok(selected) => Ok(selected),
            Err(rejection) => {
                self.unregister(id);
                tracing::debug!(
                    connection = id.get(),
                    ?rejection,
                    candidates = candidates.len(),
                    "rejected client application protocols"
                );
                if let Ok(index) = rejection_index() {
                    ssl.set_ex_data(index, AlpnRejected(rejection));
                }
                Err(AlpnError::ALERT_FATAL)
            }
        }
    }
}

/// 连接持有的登记守卫。
#[derive(Debug)]
pub(crate) struct AlpnRegistration {
    registry: Arc<AlpnRegistry>,
    id: ConnectionId,
}

impl Drop for AlpnRegistration {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
