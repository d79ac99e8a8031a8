//! # GNSS NMEA
//!
//! NMEA 0183 语句的编码与解析（无硬件依赖）
//!
//! ## 模块
//!
//! - 根模块：`Sentence` 语句类型、校验和计算、解析
//! - `stm`: STM Teseo 模块的 PSTM 私有命令与 AGPS 语句前缀
//!
//! ## 语句格式
//!
//! ```text
//! $<KIND>,<field1>,<field2>,...*<CS>
//! ```
//!
//! `CS` 是 `$` 与 `*` 之间所有字节的异或值，两位大写十六进制。

pub mod stm;

use std::fmt;
use thiserror::Error;

/// NMEA 解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NmeaError {
    #[error("Missing sentence start '$'")]
    MissingStart,

    #[error("Empty sentence type")]
    EmptyKind,

    #[error("Invalid checksum field: {0:?}")]
    InvalidChecksum(String),

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// 计算 NMEA 校验和
///
/// `body` 为 `$` 与 `*` 之间的内容（不含这两个字符）。
///
/// # Example
///
/// ```
/// assert_eq!(gnss_nmea::checksum("PSTMDUMPEPHEMS,"), "3C");
/// ```
pub fn checksum(body: &str) -> String {
    let sum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("{:02X}", sum)
}

/// 单条 NMEA 语句
///
/// 同时用于构建发往设备的命令（`Display` 输出带校验和的完整语句）
/// 和解析设备返回的应答（[`Sentence::parse`]）。
///
/// # Example
///
/// ```
/// use gnss_nmea::Sentence;
///
/// let cmd = Sentence::new("PSTMGETPAR").with_field("1201");
/// assert_eq!(cmd.to_string(), format!("$PSTMGETPAR,1201*{}", gnss_nmea::checksum("PSTMGETPAR,1201")));
///
/// // 无字段时类型后面仍然保留逗号
/// assert_eq!(Sentence::new("PSTMGPSSUSPEND").to_string(), "$PSTMGPSSUSPEND,*38");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    /// 语句类型（如 `GPGGA`、`PSTMDUMPEPHEMS`），不含 `$`
    pub kind: String,
    /// 数据字段（按顺序，可以为空字符串）
    pub fields: Vec<String>,
}

impl Sentence {
    /// 创建不带字段的语句
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            fields: Vec::new(),
        }
    }

    /// 追加一个字段（链式调用）
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.fields.push(field.into());
        self
    }

    /// 批量追加字段（链式调用）
    pub fn with_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields.extend(fields.into_iter().map(Into::into));
        self
    }

    /// `$` 与 `*` 之间的语句主体
    fn body(&self) -> String {
        let mut body = self.kind.clone();
        if self.fields.is_empty() {
            // 没有数据时，类型后面必须跟一个逗号
            body.push(',');
        }
        for field in &self.fields {
            body.push(',');
            body.push_str(field);
        }
        body
    }

    /// 转换为字节（不含行结束符）
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// 解析一行 NMEA 语句
    ///
    /// - `$` 之前的内容会被忽略（设备偶尔会在语句前插入 NUL 等垃圾字节）
    /// - 如果存在 `*CS`，会校验校验和（十六进制大小写不敏感）
    /// - 行尾的 `\r`/`\n` 会被忽略
    pub fn parse(line: &str) -> Result<Self, NmeaError> {
        let start = line.find('$').ok_or(NmeaError::MissingStart)?;
        let line = line[start + 1..].trim_end_matches(['\r', '\n']);

        let body = match line.split_once('*') {
            Some((body, cs)) => {
                if cs.len() != 2 || !cs.bytes().all(|b| b.is_ascii_hexdigit()) {
                    return Err(NmeaError::InvalidChecksum(cs.to_string()));
                }
                let expected = checksum(body);
                if !expected.eq_ignore_ascii_case(cs) {
                    return Err(NmeaError::ChecksumMismatch {
                        expected,
                        actual: cs.to_ascii_uppercase(),
                    });
                }
                body
            },
            None => line,
        };

        let mut parts = body.split(',');
        let kind = parts.next().unwrap_or_default();
        if kind.is_empty() {
            return Err(NmeaError::EmptyKind);
        }

        Ok(Self {
            kind: kind.to_string(),
            fields: parts.map(str::to_string).collect(),
        })
    }

    /// 获取指定下标的字段
    pub fn field(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }
}

impl fmt::Display for Sentence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = self.body();
        write!(f, "${}*{}", body, checksum(&body))
    }
}
