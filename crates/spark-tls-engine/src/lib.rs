#![doc = r#"
# spark-tls-engine

## 设计动机（Why）
- **调用方驱动**：引擎不接触套接字，调用方把收到的字节交给引擎、把引擎产出的字节发送出去，
  因而可以嵌入任意运行时或传输层；
- **可缓存**：`SSL_CTX` 构建代价高，同一身份、同一有效协议集合的连接共享一个不可变上下文；
- **可诊断**：OpenSSL 错误队列在每次失败后立即捕获并附着到错误上，不会串到无关调用。

## 核心契约（What）
- [`TlsEngine`]：解析协议策略、取用或构建 [`SecurityContext`]、分配 [`TlsConnection`]；
- [`TlsConnection::step`]：推进握手，返回待发送字节与完成标记，“需要更多输入”不是错误；
- [`TlsConnection::encrypt`]/[`TlsConnection::decrypt`]：记录层加解密，`WantRead`/`ZeroReturn`
  以 [`SslErrorCode`] 返回；
- [`TlsConnection::channel_binding`]：计算 `tls-unique` 通道绑定令牌；
- [`select_protocol`]：服务端优先的 ALPN 选择。

## 实现策略（How）
- 底层握手与加密委托给 `openssl`，[`MemoryTransport`] 充当内存 BIO；
- ALPN 回调通过连接 ID 查表取得候选列表，连接析构即注销；
- 上下文缓存基于 `DashMap`，锁外构建、原子插入、落败者丢弃。

## 风险与考量（Trade-offs）
- 静默关闭：引擎从不发送 close_notify，对端看到的是传输层关闭；
- 单连接不可重入，所有操作需由调用方串行化。
"#]

mod alpn;
mod binding;
mod cache;
mod connection;
mod context;
mod credentials;
mod engine;
mod error;
mod handshake;
mod policy;
mod protocols;
mod record;
mod settings;
mod transport;

pub use alpn::{
    AlpnRegistry, AlpnRejection, ApplicationProtocol, ApplicationProtocolList, select_protocol,
};
pub use binding::{ChannelBindingKind, ChannelBindingToken};
pub use cache::{ContextCache, is_cacheable};
pub use connection::{ConnectionId, ConnectionOptions, Role, TlsConnection};
pub use context::{ContextConfig, SecurityContext};
pub use credentials::CertificateContext;
pub use engine::{AuthenticationOptions, TlsEngine};
pub use error::{Classified, Diagnostic, ErrorClass, SslErrorCode, TlsEngineError, classify};
pub use handshake::{HandshakeState, HandshakeStep, SecurityStatus};
pub use policy::{CipherSuitesPolicy, EncryptionPolicy, openssl_cipher_list, openssl_cipher_suites};
pub use protocols::{
    SslProtocols, resolve_effective_protocols, should_opt_out_of_lower_than_tls13,
    should_opt_out_of_tls13,
};
pub use record::{DecryptOutcome, EncryptOutcome};
pub use settings::{DEFAULT_MAX_BUFFERED_INPUT, DISABLE_RESUME_ENV, EngineSettings};
pub use transport::MemoryTransport;
