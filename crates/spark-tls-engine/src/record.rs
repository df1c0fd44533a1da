//! 记录层加解密。
//!
//! 与握手共用同一套内存缓冲：加密把明文写入 TLS 记录层后排空输出缓冲，
//! 解密先把密文写入输入缓冲再读取明文。`ZeroReturn` 与 `WantRead` 作为返回值出现，不视为错误。

use bytes::Bytes;

use crate::connection::TlsConnection;
use crate::error::{self, SslErrorCode, TlsEngineError};
use crate::handshake::HandshakeState;

/// 加密结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptOutcome {
    pub ciphertext: Bytes,
    pub code: SslErrorCode,
}

/// 解密结果：`len` 字节明文已写入调用方缓冲。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecryptOutcome {
    pub len: usize,
    pub code: SslErrorCode,
}

impl TlsConnection {
    /// 加密一段明文。
    ///
    /// 记录层可能分多次消费明文，这里循环写入直至全部消费。
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptOutcome, TlsEngineError> {
        self.ensure_usable()?;
        if self.closed {
            return Ok(EncryptOutcome {
                ciphertext: Bytes::new(),
                code: SslErrorCode::ZeroReturn,
            });
        }

        let mut written = 0;
        while written < plaintext.len() {
            match self.stream.ssl_write(&plaintext[written..]) {
                Ok(count) => written += count,
                Err(err) => {
                    let classified = error::classify(err);
                    return match classified.code {
                        SslErrorCode::ZeroReturn | SslErrorCode::WantRead => Ok(EncryptOutcome {
                            ciphertext: Bytes::new(),
                            code: classified.code,
                        }),
                        code => Err(TlsEngineError::EncryptFailed {
                            code,
                            diagnostic: classified.diagnostic,
                        }),
                    };
                }
            }
        }

        Ok(EncryptOutcome {
            ciphertext: self.drain_output()?,
            code: SslErrorCode::None,
        })
    }

    /// 写入密文并解密到 `plaintext`。
    ///
    /// 一次调用至多返回一个记录的明文；`inbound` 为空时只消费此前积压的密文。
    /// `plaintext` 为空时密文照常写入，结果为 `(0, WantRead)`。
    pub fn decrypt(
        &mut self,
        inbound: &[u8],
        plaintext: &mut [u8],
    ) -> Result<DecryptOutcome, TlsEngineError> {
        self.ensure_usable()?;
        self.feed(inbound)?;
        self.read_plaintext(plaintext)
    }

    /// 原地解密：`buffer` 中的密文被整体写入输入缓冲，明文写回同一缓冲的开头。
    pub fn decrypt_in_place(&mut self, buffer: &mut [u8]) -> Result<DecryptOutcome, TlsEngineError> {
        self.ensure_usable()?;
        self.feed(buffer)?;
        self.read_plaintext(buffer)
    }

    fn read_plaintext(&mut self, plaintext: &mut [u8]) -> Result<DecryptOutcome, TlsEngineError> {
        if self.closed {
            return Ok(DecryptOutcome {
                len: 0,
                code: SslErrorCode::ZeroReturn,
            });
        }
        // `ssl_read` 对空缓冲直接返回 0 而不进入 OpenSSL；没有容纳明文的空间，按需要再次读取处理。
        if plaintext.is_empty() {
            return Ok(DecryptOutcome {
                len: 0,
                code: SslErrorCode::WantRead,
            });
        }
        match self.stream.ssl_read(plaintext) {
            Ok(len) => Ok(DecryptOutcome {
                len,
                code: SslErrorCode::None,
            }),
            Err(err) => {
                let classified = error::classify(err);
                let code = match classified.code {
                    SslErrorCode::ZeroReturn => SslErrorCode::ZeroReturn,
                    SslErrorCode::WantRead if self.is_renegotiation_pending() => {
                        SslErrorCode::WantRenegotiate
                    }
                    SslErrorCode::WantRead => SslErrorCode::WantRead,
                    code => {
                        return Err(TlsEngineError::DecryptFailed {
                            code,
                            diagnostic: classified.diagnostic,
                        });
                    }
                };
                Ok(DecryptOutcome { len: 0, code })
            }
        }
    }

    fn ensure_usable(&self) -> Result<(), TlsEngineError> {
        if self.state == HandshakeState::Failed {
            return Err(TlsEngineError::ConnectionFailed);
        }
        Ok(())
    }
}
