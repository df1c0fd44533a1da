//! 连接分配与连接级查询。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 每个逻辑 TLS 会话对应一个 [`TlsConnection`]：独占输入/输出缓冲，共享（而非拥有）安全上下文；
//! - 连接销毁不得影响共享上下文，也不得在 ALPN 回调表中留下悬挂登记。
//!
//! ## 逻辑（How）
//! 1. 以上下文创建 `SSL` 对象并设置握手方向；
//! 2. 存在候选协议时：服务端登记到上下文的 ALPN 表，客户端直接写入 ALPN 扩展；
//! 3. 客户端把目标主机的 IDNA ASCII 形式写入 SNI，失败只记录日志；
//! 4. 服务端要求对端证书时启用证书请求，校验交由上层完成；
//! 5. 以 [`MemoryTransport`] 包装为 `SslStream`。
//!
//! ## 契约（What）
//! - 连接的所有操作必须由调用方串行化，引擎内部不加锁；
//! - 任一步失败，已登记的 ALPN 数据随守卫析构被移除；握手结束（成功或失败）时同样移除。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use openssl::ssl::{Ssl, SslRef, SslStream, SslVerifyMode};
use openssl::x509::X509;
use serde::Deserialize;

use crate::alpn::{self, AlpnRegistration, ApplicationProtocolList};
use crate::context::SecurityContext;
use crate::error::TlsEngineError;
use crate::handshake::HandshakeState;
use crate::settings::DEFAULT_MAX_BUFFERED_INPUT;
use crate::transport::MemoryTransport;

/// 握手方向。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Server,
}

/// 进程内唯一的连接标识，ALPN 回调通过它查找候选列表。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// 打开连接时的参数。
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub role: Role,
    pub application_protocols: Option<Arc<ApplicationProtocolList>>,
    pub target_host: Option<String>,
    pub peer_certificate_required: bool,
    pub max_buffered_input: usize,
}

impl ConnectionOptions {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            application_protocols: None,
            target_host: None,
            peer_certificate_required: false,
            max_buffered_input: DEFAULT_MAX_BUFFERED_INPUT,
        }
    }
}

/// 单个 TLS 会话。
pub struct TlsConnection {
    pub(crate) stream: SslStream<MemoryTransport>,
    context: Arc<SecurityContext>,
    role: Role,
    id: ConnectionId,
    application_protocols: Option<Arc<ApplicationProtocolList>>,
    alpn_registration: Option<AlpnRegistration>,
    pub(crate) state: HandshakeState,
    pub(crate) closed: bool,
}

impl TlsConnection {
    /// 创建绑定到 `context` 的连接。
    pub fn open(
        context: Arc<SecurityContext>,
        options: ConnectionOptions,
    ) -> Result<Self, TlsEngineError> {
        let ConnectionOptions {
            role,
            application_protocols,
            target_host,
            peer_certificate_required,
            max_buffered_input,
        } = options;

        let mut ssl = Ssl::new(context.ssl_context())
            .map_err(TlsEngineError::HandshakeObjectCreationFailed)?;
        match role {
            Role::Client => ssl.set_connect_state(),
            Role::Server => ssl.set_accept_state(),
        }

        let id = ConnectionId::next();
        let application_protocols = application_protocols.filter(|list| !list.is_empty());
        let mut registration = None;
        if let Some(protocols) = &application_protocols {
            match role {
                Role::Server => {
                    let registry = context
                        .alpn_registry()
                        .ok_or(TlsEngineError::AlpnConfigurationFailed(None))?;
                    let index = alpn::connection_index()
                        .map_err(|err| TlsEngineError::AlpnConfigurationFailed(Some(err)))?;
                    ssl.set_ex_data(index, id);
                    registration = Some(registry.register(id, protocols));
                }
                Role::Client => {
                    ssl.set_alpn_protos(&protocols.to_wire())
                        .map_err(|err| TlsEngineError::AlpnConfigurationFailed(Some(err)))?;
                }
            }
        }

        match role {
            Role::Client => configure_sni(&mut ssl, target_host.as_deref().unwrap_or_default()),
            Role::Server if peer_certificate_required => {
                // 只请求证书，校验由上层在握手后完成。
                ssl.set_verify_callback(SslVerifyMode::PEER, |_, _| true);
            }
            Role::Server => {}
        }

        let stream = SslStream::new(ssl, MemoryTransport::new(max_buffered_input))
            .map_err(TlsEngineError::HandshakeObjectCreationFailed)?;

        Ok(Self {
            stream,
            context,
            role,
            id,
            application_protocols: application_protocols.filter(|_| role == Role::Server),
            alpn_registration: registration,
            state: HandshakeState::NotStarted,
            closed: false,
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn context(&self) -> &Arc<SecurityContext> {
        &self.context
    }

    pub fn ssl(&self) -> &SslRef {
        self.stream.ssl()
    }

    /// 服务端持有的候选协议列表。
    pub fn application_protocols(&self) -> Option<&ApplicationProtocolList> {
        self.application_protocols.as_deref()
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == HandshakeState::Established
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn negotiated_application_protocol(&self) -> Option<&[u8]> {
        self.ssl().selected_alpn_protocol()
    }

    pub fn protocol_version(&self) -> &'static str {
        self.ssl().version_str()
    }

    pub fn cipher_name(&self) -> Option<&'static str> {
        self.ssl().current_cipher().map(|cipher| cipher.name())
    }

    pub fn session_reused(&self) -> bool {
        self.ssl().session_reused()
    }

    pub fn peer_certificate(&self) -> Option<X509> {
        self.ssl().peer_certificate()
    }

    /// 对端发送的证书链（客户端视角包含叶子证书）。
    pub fn peer_certificate_chain(&self) -> Vec<X509> {
        self.ssl()
            .peer_cert_chain()
            .map(|chain| chain.iter().map(|cert| cert.to_owned()).collect())
            .unwrap_or_default()
    }

    /// 取出所有待发送字节，例如解密过程中产生的 KeyUpdate 响应。
    pub fn take_pending_output(&mut self) -> Bytes {
        let transport = self.stream.get_mut();
        let pending = transport.pending_output();
        transport.read_output(pending)
    }

    /// 静默断开：不发送 close_notify，也不产生任何待发送字节。
    pub fn disconnect(&mut self) {
        if self.closed {
            return;
        }
        if let Err(err) = self.stream.shutdown() {
            tracing::trace!(connection = self.id.0, error = %err, "quiet shutdown reported an error");
        }
        self.stream.get_mut().clear_output();
        self.closed = true;
    }

    /// 注销 ALPN 登记；握手结束后回调不会再为该连接触发。
    pub(crate) fn release_alpn_registration(&mut self) {
        self.alpn_registration = None;
    }

    /// 把对端字节写入输入缓冲；短写视为致命错误。
    pub(crate) fn feed(&mut self, inbound: &[u8]) -> Result<(), TlsEngineError> {
        if inbound.is_empty() {
            return Ok(());
        }
        let accepted = self.stream.get_mut().feed(inbound);
        if accepted != inbound.len() {
            return Err(TlsEngineError::BufferWriteFailed {
                requested: inbound.len(),
                accepted,
            });
        }
        Ok(())
    }

    /// 排空输出缓冲，读取数量与待发送数量不一致时报错。
    pub(crate) fn drain_output(&mut self) -> Result<Bytes, TlsEngineError> {
        let transport = self.stream.get_mut();
        let pending = transport.pending_output();
        let output = transport.read_output(pending);
        if output.len() != pending {
            return Err(TlsEngineError::BufferReadFailed {
                requested: pending,
                available: output.len(),
            });
        }
        Ok(output)
    }
}

impl fmt::Debug for TlsConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

fn configure_sni(ssl: &mut SslRef, target_host: &str) {
    if target_host.is_empty() {
        return;
    }
    let ascii = match idna::domain_to_ascii(target_host) {
        Ok(ascii) => ascii,
        Err(err) => {
            tracing::debug!(host = target_host, error = ?err, "skipping sni: idna conversion failed");
            return;
        }
    };
    if let Err(err) = ssl.set_hostname(&ascii) {
        tracing::debug!(host = %ascii, error = %err, "skipping sni: hostname rejected");
    }
}
