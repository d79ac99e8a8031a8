//! 带超时容忍的按行读取
//!
//! 串口在没有数据时返回 `TimedOut`，此时已读到的半行必须保留到下一次调用。

use crate::DeviceError;
use std::io::{BufRead, BufReader, ErrorKind, Read};

pub(crate) struct LineReader<R: Read> {
    reader: BufReader<R>,
    pending: Vec<u8>,
}

impl<R: Read> LineReader<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            pending: Vec::with_capacity(128),
        }
    }

    /// 读取一行，去掉结尾的 `\r\n`
    ///
    /// - EOF → [`DeviceError::Closed`]
    /// - 读超时 → [`DeviceError::Timeout`]（半行保留在缓冲区）
    pub(crate) fn read_line(&mut self) -> Result<Vec<u8>, DeviceError> {
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => Err(DeviceError::Closed),
            Ok(_) => {
                if self.pending.last() != Some(&b'\n') {
                    // EOF 前的最后半行
                    return Err(DeviceError::Closed);
                }
                let mut line = std::mem::take(&mut self.pending);
                while matches!(line.last(), Some(b'\n' | b'\r')) {
                    line.pop();
                }
                Ok(line)
            },
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                Err(DeviceError::Timeout)
            },
            Err(e) => Err(DeviceError::Io(e)),
        }
    }
}
