//! 集成测试共享工具：证书生成与内存握手泵。
#![allow(dead_code)]

use std::sync::Arc;

use anyhow::{Result, bail};
use openssl::ssl::{Ssl, SslContext, SslMethod, SslStream};
use openssl::x509::X509;
use rcgen::{BasicConstraints, CertificateParams, IsCa, KeyPair};
use spark_tls_engine::{
    ApplicationProtocolList, AuthenticationOptions, CertificateContext, MemoryTransport,
    SslErrorCode, TlsConnection, TlsEngine,
};

const MAX_ROUNDS: usize = 16;

/// 生成自签名证书身份。
pub fn self_signed(name: &str) -> Result<Arc<CertificateContext>> {
    let key = KeyPair::generate()?;
    let cert = CertificateParams::new(vec![name.to_owned()])?.self_signed(&key)?;
    Ok(Arc::new(CertificateContext::from_der(
        cert.der(),
        &key.serialize_der(),
    )?))
}

/// 生成由临时 CA 签发的叶子证书，CA 证书作为中间证书挂载。
pub fn ca_signed(name: &str) -> Result<Arc<CertificateContext>> {
    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::new(Vec::<String>::new())?;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca = ca_params.self_signed(&ca_key)?;

    let leaf_key = KeyPair::generate()?;
    let leaf = CertificateParams::new(vec![name.to_owned()])?.signed_by(&leaf_key, &ca, &ca_key)?;
    let identity = CertificateContext::from_der(leaf.der(), &leaf_key.serialize_der())?
        .with_intermediates([X509::from_der(ca.der())?]);
    Ok(Arc::new(identity))
}

pub fn alpn(names: &[&str]) -> ApplicationProtocolList {
    ApplicationProtocolList::from_names(names.iter().map(|name| name.as_bytes()))
        .expect("valid protocol names")
}

/// 分配一对客户端/服务端连接。
pub fn pair(
    engine: &TlsEngine,
    client: &AuthenticationOptions,
    server: &AuthenticationOptions,
) -> Result<(TlsConnection, TlsConnection)> {
    Ok((engine.allocate(client)?, engine.allocate(server)?))
}

/// 在两端之间来回传递字节，直到双方握手完成。
pub fn handshake(client: &mut TlsConnection, server: &mut TlsConnection) -> Result<()> {
    let mut to_server = client.step(&[])?.output;
    for _ in 0..MAX_ROUNDS {
        let server_step = server.step(&to_server)?;
        let client_step = client.step(&server_step.output)?;
        to_server = client_step.output;
        if server_step.complete && client_step.complete && to_server.is_empty() {
            return Ok(());
        }
    }
    bail!("handshake did not converge within {MAX_ROUNDS} rounds")
}

/// 分配并完成握手。
pub fn connected(
    engine: &TlsEngine,
    client: &AuthenticationOptions,
    server: &AuthenticationOptions,
) -> Result<(TlsConnection, TlsConnection)> {
    let (mut client, mut server) = pair(engine, client, server)?;
    handshake(&mut client, &mut server)?;
    Ok((client, server))
}

/// 加密 `payload` 并在对端解密，返回解出的明文。
pub fn transfer(
    sender: &mut TlsConnection,
    receiver: &mut TlsConnection,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let encrypted = sender.encrypt(payload)?;
    if encrypted.code != SslErrorCode::None {
        bail!("encrypt returned {:?}", encrypted.code);
    }

    let mut plaintext = Vec::with_capacity(payload.len());
    let mut buffer = vec![0u8; 16 * 1024];
    let mut inbound: &[u8] = &encrypted.ciphertext;
    loop {
        let outcome = receiver.decrypt(inbound, &mut buffer)?;
        inbound = &[];
        plaintext.extend_from_slice(&buffer[..outcome.len]);
        if outcome.code != SslErrorCode::None {
            break;
        }
    }
    Ok(plaintext)
}

/// 不使用静默关闭的原生 OpenSSL 客户端，用于观察 close_notify。
pub struct RawClient {
    pub stream: SslStream<MemoryTransport>,
}

impl RawClient {
    pub fn new() -> Result<Self> {
        let context = SslContext::builder(SslMethod::tls())?.build();
        let mut ssl = Ssl::new(&context)?;
        ssl.set_connect_state();
        Ok(Self {
            stream: SslStream::new(ssl, MemoryTransport::new(1 << 20))?,
        })
    }

    /// 推进一次握手，返回待发送字节与是否完成。
    pub fn step(&mut self, inbound: &[u8]) -> Result<(Vec<u8>, bool)> {
        self.stream.get_mut().feed(inbound);
        let complete = match self.stream.do_handshake() {
            Ok(()) => true,
            Err(err) if err.code() == openssl::ssl::ErrorCode::WANT_READ => false,
            Err(err) => bail!("raw client handshake failed: {err}"),
        };
        Ok((self.take_output(), complete))
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        let transport = self.stream.get_mut();
        let pending = transport.pending_output();
        transport.read_output(pending).to_vec()
    }

    /// 与引擎服务端完成握手。
    pub fn connect(&mut self, server: &mut TlsConnection) -> Result<()> {
        let (mut to_server, _) = self.step(&[])?;
        for _ in 0..MAX_ROUNDS {
            let server_step = server.step(&to_server)?;
            let (output, complete) = self.step(&server_step.output)?;
            to_server = output;
            if server_step.complete && complete && to_server.is_empty() {
                return Ok(());
            }
        }
        bail!("raw handshake did not converge")
    }
}
