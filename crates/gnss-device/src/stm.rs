//! STM Teseo 驱动
//!
//! 命令/应答模型：写入一条 PSTM 语句；需要应答的命令在执行完成后由模块原样回显，
//! 回显之前收到的所有行就是命令的输出。
//!
//! 涉及模块内部状态的操作（导出、加载、参数读写）都要先暂停 GNSS 引擎
//! （`PSTMGPSSUSPEND`），完成后恢复（`PSTMGPSRESTART`）。

use crate::{CancelToken, DeviceError, DeviceFaultKind, GnssDriver, LineLink, LineSink, Transport};
use chrono::{Datelike, Timelike, Utc};
use gnss_nmea::{Sentence, stm};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// 星历文件名
pub const EPHEMERIS_FILE: &str = "ephemerides.txt";
/// 历书文件名
pub const ALMANAC_FILE: &str = "almanac.txt";

/// 默认命令应答期限
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// STM 模块维护操作（`stmctl` 使用）
pub trait StmControl: Send {
    /// 读取当前配置块中的 CDB 参数
    fn get_param(&mut self, cdb_id: u32) -> Result<u64, DeviceError>;

    /// 写入 CDB 参数，保存到 NVM 并复位模块
    fn set_param(&mut self, cdb_id: u32, value: u64) -> Result<(), DeviceError>;

    /// 恢复出厂参数并复位模块
    fn restore_defaults(&mut self) -> Result<(), DeviceError>;

    /// 软件复位模块
    fn reset(&mut self) -> Result<(), DeviceError>;
}

/// STM Teseo 驱动
///
/// 链路只在操作期间打开：`start` 在整个会话期间持有链路，
/// `load`/`save` 与参数操作各自打开、用完即关。
pub struct StmDriver<T: Transport> {
    transport: T,
    link: Option<T::Link>,
    command_timeout: Duration,
}

impl<T: Transport> StmDriver<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            link: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    /// 设置命令应答期限
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    /// 在已打开的链路上执行 `f`；如果链路是本次打开的，结束后关闭
    fn with_open<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, DeviceError>,
    ) -> Result<R, DeviceError> {
        let opened_here = self.link.is_none();
        self.open()?;
        let result = f(self);
        if opened_here {
            self.link = None;
        }
        result
    }

    /// 发送一条命令
    ///
    /// `acked` 为 true 时收集输出直到模块回显命令；期限在每个行边界检查。
    fn send_command(&mut self, cmd: &str, acked: bool) -> Result<Vec<String>, DeviceError> {
        let link = self.link.as_mut().ok_or(DeviceError::NotOpen)?;
        link.write_line(cmd)?;
        if !acked {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.command_timeout;
        let mut out = Vec::new();
        loop {
            if Instant::now() >= deadline {
                return Err(DeviceError::CommandTimeout {
                    command: cmd.to_string(),
                    waited: self.command_timeout,
                });
            }
            let line = match link.read_line() {
                Ok(line) => String::from_utf8_lossy(&line).into_owned(),
                Err(DeviceError::Timeout) => continue,
                Err(e) => return Err(e),
            };
            trace!("read: {}", line);
            // 模块可能在回显前插入 NUL，所以用包含匹配
            if line.contains(cmd) {
                return Ok(out);
            }
            out.push(line);
        }
    }

    fn send(&mut self, sentence: &Sentence, acked: bool) -> Result<Vec<String>, DeviceError> {
        self.send_command(&sentence.to_string(), acked)
    }

    fn pause(&mut self) -> Result<(), DeviceError> {
        self.send(&stm::command(stm::GPS_SUSPEND), true)?;
        Ok(())
    }

    fn resume(&mut self) -> Result<(), DeviceError> {
        self.send(&stm::command(stm::GPS_RESTART), false)?;
        Ok(())
    }

    /// 失败路径上的恢复：只记录恢复本身的错误，保留原始错误
    fn resume_after_failure(&mut self) {
        if let Err(e) = self.resume() {
            warn!("Failed to resume GNSS engine: {}", e);
        }
    }

    /// 在暂停状态下执行 `f`，无论成功与否都恢复引擎
    fn paused<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<R, DeviceError>,
    ) -> Result<R, DeviceError> {
        self.pause()?;
        let result = f(self);
        match result {
            Ok(value) => {
                self.resume()?;
                Ok(value)
            },
            Err(e) => {
                self.resume_after_failure();
                Err(e)
            },
        }
    }

    /// 导出一类 AGPS 数据，只保留带 `prefix` 的行
    fn dump_to_file(&mut self, kind: &str, prefix: &str, path: &Path) -> Result<(), DeviceError> {
        info!("Storing {} to {}", kind, path.display());

        let out = self.paused(|driver| driver.send(&stm::command(kind), true))?;

        let mut writer = BufWriter::new(File::create(path)?);
        let mut count = 0usize;
        for line in &out {
            let line = line.trim_start_matches('\0');
            if line.starts_with(prefix) {
                writeln!(writer, "{}", line)?;
                count += 1;
            }
        }
        writer.flush()?;

        debug!("Wrote {} lines to {}", count, path.display());
        Ok(())
    }

    /// 把时间同步到模块（UTC），返回模块是否确认
    fn set_time(&mut self) -> Result<bool, DeviceError> {
        let now = Utc::now();
        let cmd = stm::init_time(
            now.day(),
            now.month(),
            now.year(),
            now.hour(),
            now.minute(),
            now.second(),
        );
        let out = self.send(&cmd, true)?;
        Ok(out.iter().any(|l| l.contains(stm::INIT_TIME_OK)))
    }

    /// 逐行回放 AGPS 数据；任何一行被拒绝都终止加载
    fn replay(&mut self, lines: &[String]) -> Result<(), DeviceError> {
        for line in lines {
            let out = self.send_command(line, true)?;
            if out.iter().any(|l| stm::is_rejection(l)) {
                return Err(DeviceError::fault(
                    DeviceFaultKind::Rejected,
                    format!("module rejected {}", line),
                ));
            }
        }
        Ok(())
    }
}

/// 读取 AGPS 文件中的非空行
fn read_agps_lines(path: &Path) -> Result<Vec<String>, DeviceError> {
    Ok(fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

impl<T: Transport> GnssDriver for StmDriver<T> {
    fn open(&mut self) -> Result<(), DeviceError> {
        if self.link.is_none() {
            self.link = Some(self.transport.connect()?);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), DeviceError> {
        // drop 即关闭
        self.link = None;
        Ok(())
    }

    fn start(&mut self, sink: &dyn LineSink, cancel: &CancelToken) -> Result<(), DeviceError> {
        self.open()?;
        info!("Streaming from {}", self.transport.describe());

        let result = match self.link.as_mut() {
            Some(link) => stream(link, sink, cancel),
            None => Err(DeviceError::NotOpen),
        };

        self.close()?;
        debug!("Streaming stopped");
        result
    }

    fn load(&mut self, dir: &Path) -> Result<(), DeviceError> {
        let ephemeris_path = dir.join(EPHEMERIS_FILE);
        let almanac_path = dir.join(ALMANAC_FILE);
        if !ephemeris_path.is_file() || !almanac_path.is_file() {
            warn!("No AGPS data in {}, skipping load", dir.display());
            return Ok(());
        }

        let ephemerides = read_agps_lines(&ephemeris_path)?;
        let almanac = read_agps_lines(&almanac_path)?;

        self.with_open(|driver| {
            match driver.set_time() {
                Ok(true) => debug!("Module time set"),
                Ok(false) => warn!("Module did not confirm time, continuing"),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => warn!("Failed to set module time: {}", e),
            }

            driver.paused(|driver| {
                info!(
                    "Loading {} ephemeris lines from {}",
                    ephemerides.len(),
                    ephemeris_path.display()
                );
                driver.replay(&ephemerides)?;
                info!(
                    "Loading {} almanac lines from {}",
                    almanac.len(),
                    almanac_path.display()
                );
                driver.replay(&almanac)
            })
        })
    }

    fn save(&mut self, dir: &Path) -> Result<(), DeviceError> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)?;

        self.with_open(|driver| {
            driver.dump_to_file(
                stm::DUMP_EPHEMERIDES,
                stm::EPHEMERIS_PREFIX,
                &dir.join(EPHEMERIS_FILE),
            )?;
            driver.dump_to_file(
                stm::DUMP_ALMANAC,
                stm::ALMANAC_PREFIX,
                &dir.join(ALMANAC_FILE),
            )
        })
    }

    fn describe(&self) -> String {
        format!("STM Teseo on {}", self.transport.describe())
    }
}

/// 流式读取循环：每个行边界检查一次取消
fn stream(
    link: &mut impl LineLink,
    sink: &dyn LineSink,
    cancel: &CancelToken,
) -> Result<(), DeviceError> {
    while !cancel.is_cancelled() {
        match link.read_line() {
            Ok(line) => {
                if cancel.is_cancelled() {
                    break;
                }
                sink.send_line(&line);
            },
            Err(DeviceError::Timeout) => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

impl<T: Transport> StmControl for StmDriver<T> {
    fn get_param(&mut self, cdb_id: u32) -> Result<u64, DeviceError> {
        self.with_open(|driver| {
            let out = driver.paused(|driver| driver.send(&stm::get_param(cdb_id), true))?;
            parse_get_param_reply(cdb_id, &out)
        })
    }

    fn set_param(&mut self, cdb_id: u32, value: u64) -> Result<(), DeviceError> {
        self.with_open(|driver| {
            driver.pause()?;
            // 成功时模块会复位，只在失败路径上恢复

            let out = match driver.send(&stm::set_param(cdb_id, value), true) {
                Ok(out) => out,
                Err(e) => {
                    driver.resume_after_failure();
                    return Err(e);
                },
            };
            if out.iter().any(|l| l.contains(stm::SET_PARAM_ERROR)) {
                driver.resume_after_failure();
                return Err(DeviceError::fault(
                    DeviceFaultKind::Rejected,
                    format!("setting CDB {} to {:#x} rejected", cdb_id, value),
                ));
            }

            if let Err(e) = driver.send(&stm::command(stm::SAVE_PARAMS), true) {
                driver.resume_after_failure();
                return Err(e);
            }
            driver.send(&stm::command(stm::SYSTEM_RESET), false)?;
            Ok(())
        })
    }

    fn restore_defaults(&mut self) -> Result<(), DeviceError> {
        self.with_open(|driver| {
            driver.pause()?;
            if let Err(e) = driver.send(&stm::command(stm::RESTORE_PARAMS), true) {
                driver.resume_after_failure();
                return Err(e);
            }
            driver.send(&stm::command(stm::SYSTEM_RESET), false)?;
            Ok(())
        })
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        self.with_open(|driver| {
            driver.pause()?;
            driver.send(&stm::command(stm::SYSTEM_RESET), false)?;
            Ok(())
        })
    }
}

impl<C: StmControl + ?Sized> StmControl for Box<C> {
    fn get_param(&mut self, cdb_id: u32) -> Result<u64, DeviceError> {
        (**self).get_param(cdb_id)
    }

    fn set_param(&mut self, cdb_id: u32, value: u64) -> Result<(), DeviceError> {
        (**self).set_param(cdb_id, value)
    }

    fn restore_defaults(&mut self) -> Result<(), DeviceError> {
        (**self).restore_defaults()
    }

    fn reset(&mut self) -> Result<(), DeviceError> {
        (**self).reset()
    }
}

/// 从 GETPAR 的输出中取出参数值
///
/// 匹配 `PSTMSETPAR,<cdb>` 行，取第 3 个字段。
pub fn parse_get_param_reply(cdb_id: u32, lines: &[String]) -> Result<u64, DeviceError> {
    let marker = stm::get_param_reply_marker(cdb_id);
    for line in lines {
        if line.contains(stm::GET_PARAM_ERROR) {
            return Err(DeviceError::fault(
                DeviceFaultKind::Rejected,
                format!("module rejected reading CDB {}", cdb_id),
            ));
        }
        if !line.contains(&marker) {
            continue;
        }

        let body = line.split('*').next().unwrap_or_default();
        let fields: Vec<&str> = body.split(',').collect();
        if fields.len() < 3 {
            return Err(DeviceError::fault(
                DeviceFaultKind::InvalidResponse,
                format!("not enough fields in {:?}", line),
            ));
        }
        return parse_param_value(fields[2]).ok_or_else(|| {
            DeviceError::fault(
                DeviceFaultKind::InvalidResponse,
                format!("unable to parse value {:?}", fields[2]),
            )
        });
    }

    Err(DeviceError::fault(
        DeviceFaultKind::InvalidResponse,
        format!("no response for CDB {}", cdb_id),
    ))
}

/// 解析模块上报的参数值（十进制、科学计数法、`0x` 十六进制、`0b` 二进制）
pub fn parse_param_value(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Ok(v) = raw.parse::<u64>() {
        return Some(v);
    }
    if let Ok(v) = raw.parse::<f64>()
        && v.is_finite()
    {
        // 负数饱和到 0
        return Some(v as u64);
    }
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    if let Some(bin) = raw.strip_prefix("0b").or_else(|| raw.strip_prefix("0B")) {
        return u64::from_str_radix(bin, 2).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockStm, MockTransport};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::thread;

    fn ephemeris(prn: u32) -> String {
        Sentence::new("PSTMEPHEM")
            .with_fields([prn.to_string(), "64".to_string(), format!("{:08x}", prn * 7)])
            .to_string()
    }

    fn almanac(prn: u32) -> String {
        Sentence::new("PSTMALMANAC")
            .with_fields([prn.to_string(), "40".to_string(), format!("{:08x}", prn * 3)])
            .to_string()
    }

    fn driver_with(stm: MockStm) -> (StmDriver<MockTransport>, MockTransport) {
        let mock = MockTransport::new().with_stm(stm);
        let driver =
            StmDriver::new(mock.clone()).with_command_timeout(Duration::from_millis(500));
        (driver, mock)
    }

    #[derive(Default)]
    struct RecordingSink {
        lines: Mutex<Vec<Vec<u8>>>,
    }

    impl LineSink for RecordingSink {
        fn send_line(&self, line: &[u8]) {
            self.lines.lock().push(line.to_vec());
        }
    }

    #[test]
    fn test_save_keeps_only_agps_lines() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("agps");
        let (mut driver, mock) = driver_with(
            MockStm::new()
                .with_ephemerides([ephemeris(1), ephemeris(2)])
                .with_almanac([almanac(1)]),
        );

        driver.save(&target).unwrap();

        let saved = fs::read_to_string(target.join(EPHEMERIS_FILE)).unwrap();
        assert_eq!(saved, format!("{}\n{}\n", ephemeris(1), ephemeris(2)));
        let saved = fs::read_to_string(target.join(ALMANAC_FILE)).unwrap();
        assert_eq!(saved, format!("{}\n", almanac(1)));

        // 每次导出都包在暂停/恢复之间，结束后链路关闭
        let written = mock.written();
        let restarts = written.iter().filter(|l| l.contains(stm::GPS_RESTART)).count();
        assert_eq!(restarts, 2);
        assert!(!mock.stm().unwrap().suspended);
        assert!(!driver.is_open());
    }

    #[test]
    fn test_save_then_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let eph = vec![ephemeris(3), ephemeris(9), ephemeris(17)];
        let alm = vec![almanac(3), almanac(9)];

        let (mut source, _) =
            driver_with(MockStm::new().with_ephemerides(eph.clone()).with_almanac(alm.clone()));
        source.save(dir.path()).unwrap();

        let (mut target, mock) = driver_with(MockStm::new());
        target.load(dir.path()).unwrap();

        let state = mock.stm().unwrap();
        assert_eq!(state.ephemerides, eph);
        assert_eq!(state.almanac, alm);
        assert!(!state.suspended);
        assert_eq!(state.init_time.map(|f| f.len()), Some(6));
    }

    #[test]
    fn test_load_without_files_skips_device() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(EPHEMERIS_FILE), ephemeris(1)).unwrap();

        let (mut driver, mock) = driver_with(MockStm::new());
        driver.load(dir.path()).unwrap();
        assert_eq!(mock.connects(), 0);
        assert!(mock.written().is_empty());
    }

    #[test]
    fn test_load_aborts_on_rejected_line() {
        let dir = tempfile::tempdir().unwrap();
        let eph = [ephemeris(1), ephemeris(2), ephemeris(3)].join("\n");
        fs::write(dir.path().join(EPHEMERIS_FILE), eph).unwrap();
        fs::write(dir.path().join(ALMANAC_FILE), almanac(1)).unwrap();

        let rejected = ephemeris(2);
        let (mut driver, mock) = driver_with(MockStm::new().rejecting(rejected.clone()));

        match driver.load(dir.path()) {
            Err(DeviceError::Device(fault)) => assert_eq!(fault.kind, DeviceFaultKind::Rejected),
            other => panic!("unexpected result: {:?}", other),
        }

        let written = mock.written();
        assert!(written.contains(&rejected));
        assert!(!written.contains(&ephemeris(3)));
        assert!(!written.contains(&almanac(1)));
        assert_eq!(written.last().map(String::as_str), Some(stm::command(stm::GPS_RESTART).to_string().as_str()));
        assert!(!mock.stm().unwrap().suspended);
    }

    #[test]
    fn test_unacknowledged_command_times_out() {
        let mock = MockTransport::new().with_stm(MockStm::new().silent());
        let mut driver =
            StmDriver::new(mock.clone()).with_command_timeout(Duration::from_millis(50));

        let dir = tempfile::tempdir().unwrap();
        match driver.save(dir.path()) {
            Err(DeviceError::CommandTimeout { command, .. }) => {
                assert!(command.contains(stm::GPS_SUSPEND))
            },
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!driver.is_open());
    }

    #[test]
    fn test_get_param() {
        let (mut driver, mock) = driver_with(
            MockStm::new()
                .with_param(201, "0x1F")
                .with_param(500, "1.5e3")
                .with_param(227, "42"),
        );
        assert_eq!(driver.get_param(201).unwrap(), 0x1f);
        assert_eq!(driver.get_param(500).unwrap(), 1500);
        assert_eq!(driver.get_param(227).unwrap(), 42);

        match driver.get_param(999) {
            Err(DeviceError::Device(fault)) => assert_eq!(fault.kind, DeviceFaultKind::Rejected),
            other => panic!("unexpected result: {:?}", other),
        }
        assert!(!mock.stm().unwrap().suspended);
    }

    #[test]
    fn test_set_param_saves_and_resets() {
        let (mut driver, mock) = driver_with(MockStm::new());
        driver.set_param(201, 0x1f).unwrap();

        let state = mock.stm().unwrap();
        assert_eq!(state.params.get(&201).map(String::as_str), Some("0x0000001f"));
        assert_eq!(state.resets, 1);

        let written = mock.written();
        assert!(written.iter().any(|l| l.contains(stm::SAVE_PARAMS)));
        assert!(written.last().is_some_and(|l| l.contains(stm::SYSTEM_RESET)));
    }

    #[test]
    fn test_restore_defaults_and_reset() {
        let (mut driver, mock) = driver_with(MockStm::new().with_param(201, "0x1"));
        driver.restore_defaults().unwrap();
        assert!(mock.stm().unwrap().params.is_empty());

        driver.reset().unwrap();
        assert_eq!(mock.stm().unwrap().resets, 2);
    }

    #[test]
    fn test_parse_get_param_reply() {
        let reply = |raw: &str| {
            vec![Sentence::new(stm::SET_PARAM).with_fields(["1201", raw]).to_string()]
        };
        assert_eq!(parse_get_param_reply(1201, &reply("0b101")).unwrap(), 5);
        assert!(matches!(
            parse_get_param_reply(1201, &reply("garbage")),
            Err(DeviceError::Device(f)) if f.kind == DeviceFaultKind::InvalidResponse
        ));
        assert!(matches!(
            parse_get_param_reply(1201, &["$GPGGA,1*00".to_string()]),
            Err(DeviceError::Device(f)) if f.kind == DeviceFaultKind::InvalidResponse
        ));
        assert!(matches!(
            parse_get_param_reply(1201, &["$PSTMSETPAR,1201*00".to_string()]),
            Err(DeviceError::Device(f)) if f.kind == DeviceFaultKind::InvalidResponse
        ));
    }

    #[test]
    fn test_parse_param_value() {
        assert_eq!(parse_param_value("18446744073709551615"), Some(u64::MAX));
        assert_eq!(parse_param_value("2.0E+01"), Some(20));
        assert_eq!(parse_param_value("-3"), Some(0));
        assert_eq!(parse_param_value("0xdeadBEEF"), Some(0xdead_beef));
        assert_eq!(parse_param_value("inf"), None);
        assert_eq!(parse_param_value(""), None);
    }

    #[test]
    fn test_start_streams_until_cancelled() {
        let mock = MockTransport::new().with_stream(["$GPGGA,1*00", "$GPRMC,2*00", "$GPGSA,3*00"]);
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancelToken::new();

        let handle = {
            let sink = Arc::clone(&sink);
            let cancel = cancel.clone();
            let mut driver = StmDriver::new(mock.clone());
            thread::spawn(move || {
                let result = driver.start(&*sink, &cancel);
                (result, driver.is_open())
            })
        };

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.lines.lock().len() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        cancel.cancel();

        let (result, still_open) = handle.join().unwrap();
        assert!(result.is_ok());
        assert!(!still_open);
        assert_eq!(
            *sink.lines.lock(),
            vec![b"$GPGGA,1*00".to_vec(), b"$GPRMC,2*00".to_vec(), b"$GPGSA,3*00".to_vec()]
        );
    }

    #[test]
    fn test_start_returns_read_error() {
        let mock = MockTransport::new()
            .with_stream(["$GPGGA,1*00"])
            .with_read_error_after(1);
        let sink = RecordingSink::default();
        let mut driver = StmDriver::new(mock);

        let result = driver.start(&sink, &CancelToken::new());
        assert!(matches!(result, Err(DeviceError::Io(_))));
        assert_eq!(sink.lines.lock().len(), 1);
        assert!(!driver.is_open());
    }
}
