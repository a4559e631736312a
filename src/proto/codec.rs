//! 带长度前缀的分帧, 支持增量的非阻塞读写
//!
//! 格式: `u32` 数据块数量, 之后每个数据块为 `u32` 长度加内容, 全部大端序。

use std::io::{self, Read, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{GridError, Result};

const READ_CHUNK: usize = 64 * 1024;

pub fn encode_frame(blobs: &[Bytes]) -> Bytes {
    let size = 4 + blobs.iter().map(|b| 4 + b.len()).sum::<usize>();
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u32(blobs.len() as u32);
    for blob in blobs {
        buf.put_u32(blob.len() as u32);
        buf.extend_from_slice(blob);
    }
    buf.freeze()
}

/// 从任意切分的读取中重组消息
#[derive(Debug)]
pub struct MessageReader {
    max_blob_size: usize,
    buf: BytesMut,
    expected: Option<usize>,
    blob_len: Option<usize>,
    blobs: Vec<Bytes>,
    bytes_read: usize,
}

impl MessageReader {
    pub fn new(max_blob_size: usize) -> Self {
        Self {
            max_blob_size,
            buf: BytesMut::with_capacity(READ_CHUNK),
            expected: None,
            blob_len: None,
            blobs: Vec::new(),
            bytes_read: 0,
        }
    }

    /// 当前消息已消费的字节数
    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn is_idle(&self) -> bool {
        self.expected.is_none() && self.buf.is_empty()
    }

    /// 输入原始字节, 消息完整时返回; 多余的字节保留在缓冲区
    pub fn feed(&mut self, data: &[u8]) -> Result<Option<Vec<Bytes>>> {
        self.buf.extend_from_slice(data);
        self.bytes_read += data.len();
        self.parse()
    }

    /// 从非阻塞源读取, 直到消息完整或读取会阻塞
    pub fn read_from<R: Read>(&mut self, src: &mut R) -> Result<Option<Vec<Bytes>>> {
        if let Some(msg) = self.parse()? {
            return Ok(Some(msg));
        }
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match src.read(&mut chunk) {
                Ok(0) => {
                    return Err(GridError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )))
                }
                Ok(n) => {
                    if let Some(msg) = self.feed(&chunk[..n])? {
                        return Ok(Some(msg));
                    }
                }
                // 带读超时的阻塞 socket 两种错误都可能返回
                Err(e)
                    if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
                {
                    return Ok(None)
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// 阻塞读取一条完整消息
    pub fn read_blocking<R: Read>(&mut self, src: &mut R) -> Result<Vec<Bytes>> {
        loop {
            if let Some(msg) = self.read_from(src)? {
                return Ok(msg);
            }
        }
    }

    fn parse(&mut self) -> Result<Option<Vec<Bytes>>> {
        loop {
            let expected = match self.expected {
                Some(n) => n,
                None => {
                    if self.buf.len() < 4 {
                        return Ok(None);
                    }
                    let n = self.buf.get_u32() as usize;
                    self.expected = Some(n);
                    n
                }
            };
            if self.blobs.len() == expected {
                self.expected = None;
                self.bytes_read = self.buf.len();
                return Ok(Some(std::mem::take(&mut self.blobs)));
            }
            let len = match self.blob_len {
                Some(len) => len,
                None => {
                    if self.buf.len() < 4 {
                        return Ok(None);
                    }
                    let len = self.buf.get_u32() as usize;
                    if len > self.max_blob_size {
                        return Err(GridError::BlobTooLarge {
                            size: len,
                            limit: self.max_blob_size,
                        });
                    }
                    self.blob_len = Some(len);
                    len
                }
            };
            if self.buf.len() < len {
                return Ok(None);
            }
            self.blobs.push(self.buf.split_to(len).freeze());
            self.blob_len = None;
        }
    }
}

/// 写出一条已分帧的消息, 支持部分写
#[derive(Debug)]
pub struct MessageWriter {
    data: Bytes,
}

impl MessageWriter {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn remaining(&self) -> usize {
        self.data.len()
    }

    pub fn is_done(&self) -> bool {
        self.data.is_empty()
    }

    /// 返回本次写入的字节数以及消息是否已全部写出
    pub fn write_to<W: Write>(&mut self, dst: &mut W) -> Result<(usize, bool)> {
        let mut written = 0;
        while !self.data.is_empty() {
            match dst.write(&self.data) {
                Ok(0) => {
                    return Err(GridError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "connection refused more bytes",
                    )))
                }
                Ok(n) => {
                    self.data.advance(n);
                    written += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok((written, false)),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        dst.flush()?;
        Ok((written, true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_message_has_no_blobs() {
        let frame = encode_frame(&[]);
        let mut reader = MessageReader::new(16);
        assert_eq!(reader.feed(&frame).unwrap(), Some(Vec::new()));
        assert!(reader.is_idle());
    }

    #[test]
    fn oversized_blob_is_rejected_before_buffering() {
        let frame = encode_frame(&[Bytes::from(vec![0u8; 32])]);
        let mut reader = MessageReader::new(16);
        let err = reader.feed(&frame[..8]).unwrap_err();
        assert!(matches!(err, GridError::BlobTooLarge { size: 32, limit: 16 }));
    }

    #[test]
    fn back_to_back_messages() {
        let a = encode_frame(&[Bytes::from_static(b"a")]);
        let b = encode_frame(&[Bytes::from_static(b"bb"), Bytes::new()]);
        let mut joined = a.to_vec();
        joined.extend_from_slice(&b);
        let mut reader = MessageReader::new(1024);
        let first = reader.feed(&joined).unwrap().unwrap();
        assert_eq!(first, vec![Bytes::from_static(b"a")]);
        let second = reader.feed(&[]).unwrap().unwrap();
        assert_eq!(second, vec![Bytes::from_static(b"bb"), Bytes::new()]);
    }

    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
        block_next: bool,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
            if self.block_next {
                self.block_next = false;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            self.block_next = true;
            let n = self.step.min(self.data.len()).min(out.len());
            out[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    #[test]
    fn read_resumes_after_would_block() {
        let frame = encode_frame(&[Bytes::from_static(b"hello"), Bytes::from_static(b"grid")]);
        let mut src = Trickle {
            data: &frame,
            step: 3,
            block_next: false,
        };
        let mut reader = MessageReader::new(1024);
        let mut polls = 0;
        let msg = loop {
            polls += 1;
            if let Some(msg) = reader.read_from(&mut src).unwrap() {
                break msg;
            }
        };
        assert!(polls > 1);
        assert_eq!(msg[1], Bytes::from_static(b"grid"));
    }

    struct Choppy {
        out: Vec<u8>,
        budget: usize,
    }

    impl Write for Choppy {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                self.budget = 2;
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = self.budget.min(buf.len());
            self.budget -= n;
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn partial_writes_keep_the_remainder() {
        let frame = encode_frame(&[Bytes::from_static(b"payload")]);
        let mut writer = MessageWriter::new(frame.clone());
        let mut dst = Choppy {
            out: Vec::new(),
            budget: 2,
        };
        let mut rounds = 0;
        while !writer.write_to(&mut dst).unwrap().1 {
            rounds += 1;
        }
        assert!(rounds > 0);
        assert_eq!(dst.out, frame.to_vec());
    }
}
