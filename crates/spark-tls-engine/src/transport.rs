//! 内存缓冲传输。
//!
//! # 教案级注释
//!
//! ## 意图（Why）
//! - 引擎不接触网络：调用方把收到的密文交给引擎，再把引擎产出的字节自行发送。
//! - OpenSSL 通过 `Read`/`Write` 看到的“套接字”因此只是两段内存队列。
//!
//! ## 逻辑（How）
//! - 入站队列为空时 `read` 返回 `WouldBlock`，OpenSSL 将其翻译为 `WANT_READ`；
//! - `write` 永远整段追加到出站队列，出站方向不会产生 `WANT_WRITE`；
//! - 入站队列设置上限，超出部分不被接收，由调用方把“短写”视为致命错误。
//!
//! ## 契约（What）
//! - 单连接独占，不做内部同步；
//! - `read_output` 只有在待发送字节不足时才会返回少于请求的数量。

use std::io::{self, Read, Write};

use bytes::{Buf, Bytes, BytesMut};

/// OpenSSL 看到的内存“套接字”。
#[derive(Debug)]
pub struct MemoryTransport {
    inbound: BytesMut,
    outbound: BytesMut,
    inbound_limit: usize,
}

impl MemoryTransport {
    pub fn new(inbound_limit: usize) -> Self {
        Self {
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
            inbound_limit,
        }
    }

    /// 写入对端发来的字节，返回实际接收的数量。
    pub fn feed(&mut self, bytes: &[u8]) -> usize {
        let room = self.inbound_limit.saturating_sub(self.inbound.len());
        let accepted = bytes.len().min(room);
        self.inbound.extend_from_slice(&bytes[..accepted]);
        accepted
    }

    /// 尚未被 TLS 层消费的入站字节数。
    pub fn pending_input(&self) -> usize {
        self.inbound.len()
    }

    /// 等待发送给对端的字节数。
    pub fn pending_output(&self) -> usize {
        self.outbound.len()
    }

    /// 取出至多 `count` 个待发送字节。
    pub fn read_output(&mut self, count: usize) -> Bytes {
        let count = count.min(self.outbound.len());
        self.outbound.split_to(count).freeze()
    }

    /// 丢弃所有待发送字节。
    pub fn clear_output(&mut self) {
        self.outbound.clear();
    }
}

impl Read for MemoryTransport {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.inbound.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let count = buf.len().min(self.inbound.len());
        buf[..count].copy_from_slice(&self.inbound[..count]);
        self.inbound.advance(count);
        Ok(count)
    }
}

impl Write for MemoryTransport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.outbound.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
