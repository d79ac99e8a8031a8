//! 串口后端（`stm_serial` 驱动）
//!
//! 模块通过 UART 直连时没有启动横幅，打开即可用。

use crate::line_reader::LineReader;
use crate::{DeviceError, LineLink, Transport};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::Write;
use std::time::Duration;
use tracing::{debug, trace};

/// 默认波特率
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// 单次读取超时（决定取消/命令期限的检查粒度）
const READ_TIMEOUT: Duration = Duration::from_millis(200);

/// UART 串口
#[derive(Debug, Clone)]
pub struct SerialTransport {
    path: String,
    baud_rate: u32,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            path: path.into(),
            baud_rate,
        }
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
}

impl Transport for SerialTransport {
    type Link = SerialLink;

    fn connect(&self) -> Result<Self::Link, DeviceError> {
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open()?;
        let writer = port.try_clone()?;

        debug!("Opened serial port: {} at {} baud", self.path, self.baud_rate);
        Ok(SerialLink {
            reader: LineReader::new(port),
            writer,
        })
    }

    fn describe(&self) -> String {
        format!("serial GNSS device {} @ {} baud", self.path, self.baud_rate)
    }
}

/// 已打开的串口链路
pub struct SerialLink {
    reader: LineReader<Box<dyn SerialPort>>,
    writer: Box<dyn SerialPort>,
}

impl LineLink for SerialLink {
    fn read_line(&mut self) -> Result<Vec<u8>, DeviceError> {
        self.reader.read_line()
    }

    fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        trace!("write: {}", line);
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\r\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_port_fails_to_connect() {
        let transport = SerialTransport::new("/nonexistent/ttyGNSS", DEFAULT_BAUD_RATE);
        assert!(transport.connect().is_err());
        assert!(transport.describe().contains("9600"));
    }
}
