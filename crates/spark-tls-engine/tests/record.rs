//! 记录层加解密测试。

mod support;

use anyhow::Result;
use proptest::prelude::*;
use spark_tls_engine::{AuthenticationOptions, SslErrorCode, SslProtocols, TlsEngine};
use support::{RawClient, connected, self_signed, transfer};

fn connected_pair() -> Result<(
    spark_tls_engine::TlsConnection,
    spark_tls_engine::TlsConnection,
)> {
    let engine = TlsEngine::default();
    connected(
        &engine,
        &AuthenticationOptions::client("localhost"),
        &AuthenticationOptions::server(self_signed("localhost")?),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn plaintext_survives_both_directions(
        payload in prop::collection::vec(any::<u8>(), 0..=65536usize),
    ) {
        let (mut client, mut server) = connected_pair().expect("handshake");

        let received = transfer(&mut client, &mut server, &payload).expect("client to server");
        prop_assert_eq!(&received, &payload);

        let received = transfer(&mut server, &mut client, &payload).expect("server to client");
        prop_assert_eq!(&received, &payload);
    }
}

#[test]
fn maximum_sized_payload_round_trips() -> Result<()> {
    let (mut client, mut server) = connected_pair()?;
    let payload: Vec<u8> = (0..65536u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(transfer(&mut client, &mut server, &payload)?, payload);
    Ok(())
}

#[test]
fn decrypt_without_input_wants_read() -> Result<()> {
    let (_, mut server) = connected_pair()?;
    let mut buffer = [0u8; 64];
    let outcome = server.decrypt(&[], &mut buffer)?;
    assert_eq!(outcome.len, 0);
    assert_eq!(outcome.code, SslErrorCode::WantRead);
    Ok(())
}

#[test]
fn partial_record_wants_read_until_complete() -> Result<()> {
    let (mut client, mut server) = connected_pair()?;
    let ciphertext = client.encrypt(b"split across reads")?.ciphertext;
    let (head, tail) = ciphertext.split_at(ciphertext.len() / 2);

    let mut buffer = [0u8; 64];
    let outcome = server.decrypt(head, &mut buffer)?;
    assert_eq!(outcome.code, SslErrorCode::WantRead);

    let outcome = server.decrypt(tail, &mut buffer)?;
    assert_eq!(outcome.code, SslErrorCode::None);
    assert_eq!(&buffer[..outcome.len], b"split across reads");
    Ok(())
}

#[test]
fn decrypt_in_place_reuses_ciphertext_buffer() -> Result<()> {
    let (mut client, mut server) = connected_pair()?;
    let mut buffer = client.encrypt(b"in place")?.ciphertext.to_vec();
    let outcome = server.decrypt_in_place(&mut buffer)?;
    assert_eq!(outcome.code, SslErrorCode::None);
    assert_eq!(&buffer[..outcome.len], b"in place");
    Ok(())
}

#[test]
fn clean_peer_close_returns_zero_return() -> Result<()> {
    let engine = TlsEngine::default();
    let mut server = engine.allocate(&AuthenticationOptions::server(self_signed("localhost")?))?;
    let mut peer = RawClient::new()?;
    peer.connect(&mut server)?;

    peer.stream.shutdown()?;
    let close_notify = peer.take_output();
    assert!(!close_notify.is_empty());

    let mut buffer = [0u8; 64];
    let outcome = server.decrypt(&close_notify, &mut buffer)?;
    assert_eq!(outcome.len, 0);
    assert_eq!(outcome.code, SslErrorCode::ZeroReturn);

    let outcome = server.decrypt(&[], &mut buffer)?;
    assert_eq!(outcome.code, SslErrorCode::ZeroReturn);
    Ok(())
}

#[test]
fn disconnect_is_quiet() -> Result<()> {
    let (mut client, mut server) = connected_pair()?;
    client.disconnect();
    assert!(client.is_closed());
    assert!(client.take_pending_output().is_empty());

    let outcome = client.encrypt(b"after close")?;
    assert!(outcome.ciphertext.is_empty());
    assert_eq!(outcome.code, SslErrorCode::ZeroReturn);

    // 对端收不到 close_notify，只会继续等待输入。
    let mut buffer = [0u8; 64];
    assert_eq!(server.decrypt(&[], &mut buffer)?.code, SslErrorCode::WantRead);
    Ok(())
}

#[test]
fn empty_plaintext_produces_no_records() -> Result<()> {
    let (mut client, _) = connected_pair()?;
    let outcome = client.encrypt(&[])?;
    assert!(outcome.ciphertext.is_empty());
    assert_eq!(outcome.code, SslErrorCode::None);
    Ok(())
}

#[test]
fn empty_plaintext_buffer_wants_read() -> Result<()> {
    let (mut client, mut server) = connected_pair()?;
    let ciphertext = client.encrypt(b"kept for later")?.ciphertext;

    let outcome = server.decrypt(&ciphertext, &mut [])?;
    assert_eq!(outcome.len, 0);
    assert_eq!(outcome.code, SslErrorCode::WantRead);
    assert_eq!(server.decrypt_in_place(&mut [])?.code, SslErrorCode::WantRead);

    // 已写入的密文仍在输入缓冲中，提供空间后即可读出。
    let mut buffer = [0u8; 64];
    let outcome = server.decrypt(&[], &mut buffer)?;
    assert_eq!(outcome.code, SslErrorCode::None);
    assert_eq!(&buffer[..outcome.len], b"kept for later");
    Ok(())
}

#[test]
fn pending_renegotiation_relabels_want_read() -> Result<()> {
    let engine = TlsEngine::default();
    let (mut client, mut server) = connected(
        &engine,
        &AuthenticationOptions::client("localhost").with_protocols(SslProtocols::TLS12),
        &AuthenticationOptions::server(self_signed("localhost")?).with_protocols(SslProtocols::TLS12),
    )?;

    assert!(server.renegotiate().is_ok());
    let ciphertext = server.encrypt(b"x")?.ciphertext;

    let mut buffer = [0u8; 64];
    let outcome = client.decrypt(&ciphertext, &mut buffer)?;
    assert_eq!((outcome.len, outcome.code), (1, SslErrorCode::None));
    assert_eq!(&buffer[..1], b"x");

    let outcome = client.decrypt(&[], &mut buffer)?;
    assert_eq!(outcome.len, 0);
    assert_eq!(outcome.code, SslErrorCode::WantRenegotiate);
    assert!(client.is_renegotiation_pending());
    Ok(())
}
