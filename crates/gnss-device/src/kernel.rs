//! Linux 内核 GNSS 子系统后端
//!
//! 设备节点通常为 `/dev/gnssN`。内核在节点被打开时给模块上电，模块启动完成后
//! 会输出 `$GPTXT,DEFAULT LIV CONFIGURATION*..`，收到这条横幅之前不能发命令。

use crate::line_reader::LineReader;
use crate::{DeviceError, DeviceFaultKind, LineLink, Transport};
use gnss_nmea::stm;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// 等待启动横幅时最多读取的行数
const READY_MAX_LINES: usize = 100;

/// 内核 GNSS 字符设备
#[derive(Debug, Clone)]
pub struct KernelGnssTransport {
    path: PathBuf,
}

impl KernelGnssTransport {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Transport for KernelGnssTransport {
    type Link = KernelGnssLink;

    fn connect(&self) -> Result<Self::Link, DeviceError> {
        if !self.path.exists() {
            return Err(DeviceError::fault(
                DeviceFaultKind::NotFound,
                format!("GNSS device not found: {}", self.path.display()),
            ));
        }

        // 流式数据由内核持续推送，不需要轮询，直接使用阻塞读
        let device = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let writer = device.try_clone()?;
        let mut link = KernelGnssLink {
            reader: LineReader::new(device),
            writer,
        };

        wait_ready(&mut link)?;
        debug!("GNSS device ready: {}", self.path.display());
        Ok(link)
    }

    fn describe(&self) -> String {
        format!("kernel GNSS device {}", self.path.display())
    }
}

/// 等待启动横幅
///
/// 使用包含匹配，因为模块有时会在语句前插入 NUL 字节。
pub(crate) fn wait_ready(link: &mut impl LineLink) -> Result<(), DeviceError> {
    let banner = stm::boot_banner().to_string();

    for _ in 0..READY_MAX_LINES {
        let line = match link.read_line() {
            Ok(line) => line,
            Err(DeviceError::Timeout) => continue,
            Err(e) => return Err(e),
        };
        let line = String::from_utf8_lossy(&line);
        trace!("ready check: {}", line);
        if line.contains(&banner) {
            return Ok(());
        }
    }

    Err(DeviceError::fault(
        DeviceFaultKind::NotReady,
        format!("no boot banner within {} lines", READY_MAX_LINES),
    ))
}

/// 已打开的内核 GNSS 链路（drop 时关闭文件描述符）
pub struct KernelGnssLink {
    reader: LineReader<File>,
    writer: File,
}

impl LineLink for KernelGnssLink {
    fn read_line(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.reader.read_line()
    }

    fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        trace!("write: {}", line);
        let mut buf = Vec::with_capacity(line.len() + 2);
        buf.extend_from_slice(line.as_bytes());
        buf.extend_from_slice(b"\r\n");
        self.writer.write_all(&buf)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockTransport;

    #[test]
    fn test_missing_device_is_not_found() {
        let transport = KernelGnssTransport::new("/nonexistent/gnss99");
        match transport.connect() {
            Err(DeviceError::Device(fault)) => assert_eq!(fault.kind, DeviceFaultKind::NotFound),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connect should fail"),
        }
    }

    #[test]
    fn test_wait_ready_finds_banner_with_nul_prefix() {
        let banner = format!("\0{}", stm::boot_banner());
        let mock = MockTransport::new().with_stream(["$GPGGA,,,,*00", banner.as_str()]);
        let mut link = mock.connect().unwrap();
        assert!(wait_ready(&mut link).is_ok());
    }

    #[test]
    fn test_wait_ready_gives_up() {
        let lines: Vec<String> = (0..READY_MAX_LINES + 5)
            .map(|i| format!("$GPGSV,{}*00", i))
            .collect();
        let mock = MockTransport::new().with_stream(lines);
        let mut link = mock.connect().unwrap();
        match wait_ready(&mut link) {
            Err(DeviceError::Device(fault)) => assert_eq!(fault.kind, DeviceFaultKind::NotReady),
            other => panic!("unexpected result: {:?}", other.err()),
        }
    }
}
