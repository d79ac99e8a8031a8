//! Mock 后端（无硬件依赖）
//!
//! - [`MockTransport`]：脚本化的行源 + 写入日志，可注入读错误
//! - [`MockStm`]：模拟 STM Teseo 的命令应答（回显、星历/历书导出与加载、CDB 参数）
//!
//! 读取顺序：先返回命令应答，再返回流式数据；两者都为空时返回
//! [`DeviceError::Timeout`]，与真实串口在无数据时的行为一致。

use crate::{DeviceError, LineLink, Transport};
use gnss_nmea::{Sentence, stm};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// 无数据时每次读取的等待时间
const IDLE_READ_DELAY: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct MockState {
    stream: VecDeque<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
    written: Vec<String>,
    connects: usize,
    /// 剩余多少行流式数据后注入读错误
    fail_after: Option<usize>,
    connect_error: bool,
    stm: Option<MockStm>,
}

/// Mock 传输层
///
/// `Clone` 共享同一份内部状态，测试可以保留一份句柄用于检查。
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加流式数据（如 NMEA 定位语句）
    pub fn with_stream<I, S>(self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.push_stream(lines);
        self
    }

    /// 挂载 STM 命令应答模拟
    pub fn with_stm(self, stm: MockStm) -> Self {
        self.state.lock().stm = Some(stm);
        self
    }

    /// 再输出 `lines` 行流式数据后，下一次读取返回 IO 错误
    pub fn with_read_error_after(self, lines: usize) -> Self {
        self.state.lock().fail_after = Some(lines);
        self
    }

    /// `connect()` 总是失败（模拟设备节点不可用）
    pub fn with_connect_error(self) -> Self {
        self.state.lock().connect_error = true;
        self
    }

    pub fn push_stream<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut state = self.state.lock();
        state
            .stream
            .extend(lines.into_iter().map(|l| l.as_ref().as_bytes().to_vec()));
    }

    /// 到目前为止写入设备的所有行（按顺序）
    pub fn written(&self) -> Vec<String> {
        self.state.lock().written.clone()
    }

    /// `connect()` 成功的次数
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// 当前 STM 模拟状态的快照
    pub fn stm(&self) -> Option<MockStm> {
        self.state.lock().stm.clone()
    }
}

impl Transport for MockTransport {
    type Link = MockLink;

    fn connect(&self) -> Result<Self::Link, DeviceError> {
        let mut state = self.state.lock();
        if state.connect_error {
            return Err(DeviceError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "mock device unavailable",
            )));
        }
        state.connects += 1;
        Ok(MockLink {
            state: Arc::clone(&self.state),
        })
    }

    fn describe(&self) -> String {
        "mock GNSS device".to_string()
    }
}

/// Mock 链路
pub struct MockLink {
    state: Arc<Mutex<MockState>>,
}

impl LineLink for MockLink {
    fn read_line(&mut self) -> Result<Vec<u8>, DeviceError> {
        {
            let mut state = self.state.lock();
            if let Some(line) = state.responses.pop_front() {
                return Ok(line);
            }
            if state.fail_after == Some(0) {
                state.fail_after = None;
                return Err(DeviceError::Io(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    "mock read failure",
                )));
            }
            if let Some(line) = state.stream.pop_front() {
                if let Some(remaining) = state.fail_after.as_mut() {
                    *remaining -= 1;
                }
                return Ok(line);
            }
        } // 释放锁后再等待

        thread::sleep(IDLE_READ_DELAY);
        Err(DeviceError::Timeout)
    }

    fn write_line(&mut self, line: &str) -> Result<(), DeviceError> {
        let mut state = self.state.lock();
        state.written.push(line.to_string());
        let replies = match state.stm.as_mut() {
            Some(stm) => stm.respond(line),
            None => Vec::new(),
        };
        state
            .responses
            .extend(replies.into_iter().map(String::into_bytes));
        Ok(())
    }
}

/// STM Teseo 命令应答模拟
///
/// 有应答的命令在输出结果后回显命令本身，表示命令完成。
#[derive(Debug, Clone, Default)]
pub struct MockStm {
    /// 模块内的星历（`$PSTMEPHEM,...` 行）
    pub ephemerides: Vec<String>,
    /// 模块内的历书（`$PSTMALMANAC,...` 行）
    pub almanac: Vec<String>,
    /// CDB 参数（以模块上报的原始文本保存）
    pub params: BTreeMap<u32, String>,
    /// 以此前缀开头的数据行会被拒绝
    pub reject_prefix: Option<String>,
    /// 为 true 时不回显任何命令（用于测试应答超时）
    pub silent: bool,
    /// GNSS 引擎是否处于暂停状态
    pub suspended: bool,
    /// 收到的系统复位次数
    pub resets: usize,
    /// 最后一次 INITTIME 设置的时间字段
    pub init_time: Option<Vec<String>>,
}

impl MockStm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ephemerides<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ephemerides.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn with_almanac<I, S>(mut self, lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.almanac.extend(lines.into_iter().map(Into::into));
        self
    }

    pub fn with_param(mut self, cdb_id: u32, raw_value: impl Into<String>) -> Self {
        self.params.insert(cdb_id, raw_value.into());
        self
    }

    pub fn rejecting(mut self, prefix: impl Into<String>) -> Self {
        self.reject_prefix = Some(prefix.into());
        self
    }

    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// 处理一条写入的命令，返回模块输出的行
    fn respond(&mut self, line: &str) -> Vec<String> {
        let Ok(sentence) = Sentence::parse(line) else {
            return Vec::new();
        };
        let echo = line.to_string();

        let mut out: Vec<String> = match sentence.kind.as_str() {
            stm::GPS_RESTART => {
                self.suspended = false;
                return Vec::new();
            },
            stm::SYSTEM_RESET => {
                self.resets += 1;
                self.suspended = false;
                return Vec::new();
            },
            stm::GPS_SUSPEND => {
                self.suspended = true;
                Vec::new()
            },
            stm::DUMP_EPHEMERIDES => {
                let mut out = vec![Sentence::new("GPGSV").with_field("1").to_string()];
                out.extend(self.ephemerides.iter().cloned());
                out
            },
            stm::DUMP_ALMANAC => self.almanac.clone(),
            "PSTMEPHEM" => self.accept_data(line, "PSTMEPHEM", true),
            "PSTMALMANAC" => self.accept_data(line, "PSTMALMANAC", false),
            stm::INIT_TIME => {
                self.init_time = Some(sentence.fields.clone());
                vec![Sentence::new(stm::INIT_TIME_OK).to_string()]
            },
            stm::GET_PARAM => {
                let value = sentence
                    .field(0)
                    .and_then(|f| f.parse::<u32>().ok())
                    .and_then(|id| self.params.get(&id).map(|v| (id, v.clone())));
                match value {
                    Some((id, raw)) => vec![
                        Sentence::new(stm::SET_PARAM)
                            .with_fields([id.to_string(), raw])
                            .to_string(),
                    ],
                    None => vec![Sentence::new(stm::GET_PARAM_ERROR).to_string()],
                }
            },
            stm::SET_PARAM => {
                let id = sentence
                    .field(0)
                    .and_then(|f| f.strip_prefix(&stm::CURRENT_CONFIG_BLOCK.to_string()))
                    .and_then(|f| f.parse::<u32>().ok());
                match (id, sentence.field(1)) {
                    (Some(id), Some(value)) => {
                        self.params.insert(id, value.to_string());
                        vec![Sentence::new("PSTMSETPAROK").to_string()]
                    },
                    _ => vec![Sentence::new(stm::SET_PARAM_ERROR).to_string()],
                }
            },
            stm::RESTORE_PARAMS => {
                self.params.clear();
                Vec::new()
            },
            _ => Vec::new(),
        };

        if self.silent {
            return Vec::new();
        }
        out.push(echo);
        out
    }

    fn accept_data(&mut self, line: &str, kind: &str, ephemeris: bool) -> Vec<String> {
        if let Some(prefix) = &self.reject_prefix
            && line.starts_with(prefix.as_str())
        {
            return vec![Sentence::new(format!("{}ERROR", kind)).to_string()];
        }
        if ephemeris {
            self.ephemerides.push(line.to_string());
        } else {
            self.almanac.push(line.to_string());
        }
        vec![Sentence::new(format!("{}OK", kind)).to_string()]
    }
}
