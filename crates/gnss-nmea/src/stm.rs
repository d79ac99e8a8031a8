//! STM Teseo 私有命令（PSTM）
//!
//! 参考 Teseo LIV3F GNSS 软件手册中 PSTM 命令与 CDB（配置数据块）章节。

use crate::Sentence;

/// 暂停 GNSS 引擎（有应答）
pub const GPS_SUSPEND: &str = "PSTMGPSSUSPEND";
/// 恢复 GNSS 引擎（无应答）
pub const GPS_RESTART: &str = "PSTMGPSRESTART";
/// 导出星历
pub const DUMP_EPHEMERIDES: &str = "PSTMDUMPEPHEMS";
/// 导出历书
pub const DUMP_ALMANAC: &str = "PSTMDUMPALMANAC";
/// 读取 CDB 参数
pub const GET_PARAM: &str = "PSTMGETPAR";
/// 写入 CDB 参数（也是 GETPAR 应答的语句类型）
pub const SET_PARAM: &str = "PSTMSETPAR";
/// 把当前配置保存到 NVM
pub const SAVE_PARAMS: &str = "PSTMSAVEPAR";
/// 恢复出厂配置
pub const RESTORE_PARAMS: &str = "PSTMRESTOREPAR";
/// 系统复位（无应答）
pub const SYSTEM_RESET: &str = "PSTMSRR";
/// 设置接收机时间
pub const INIT_TIME: &str = "PSTMINITTIME";

/// 星历行前缀（持久化文件中只保存这种行）
pub const EPHEMERIS_PREFIX: &str = "$PSTMEPHEM,";
/// 历书行前缀
pub const ALMANAC_PREFIX: &str = "$PSTMALMANAC,";

/// GETPAR 失败标记
pub const GET_PARAM_ERROR: &str = "PSTMGETPARERROR";
/// SETPAR 失败标记
pub const SET_PARAM_ERROR: &str = "PSTMSETPARERROR";
/// INITTIME 成功标记
pub const INIT_TIME_OK: &str = "PSTMINITTIMEOK";
/// 星历/历书加载被拒绝时，应答语句类型以此结尾（如 `PSTMEPHEMERROR`）
pub const ERROR_SUFFIX: &str = "ERROR";

/// CDB 写入时使用的配置块编号（当前配置块）
pub const CURRENT_CONFIG_BLOCK: u8 = 3;

/// 设备启动完成后输出的横幅文本
pub const BOOT_BANNER_TEXT: &str = "DEFAULT LIV CONFIGURATION";

/// 设备启动完成横幅（`$GPTXT,DEFAULT LIV CONFIGURATION*..`）
pub fn boot_banner() -> Sentence {
    Sentence::new("GPTXT").with_field(BOOT_BANNER_TEXT)
}

/// 不带参数的命令
pub fn command(kind: &str) -> Sentence {
    Sentence::new(kind)
}

/// `$PSTMGETPAR,<cdb>`
pub fn get_param(cdb_id: u32) -> Sentence {
    Sentence::new(GET_PARAM).with_field(cdb_id.to_string())
}

/// `$PSTMSETPAR,3<cdb>,0x<value:08x>,0`
///
/// 第 4 个参数（按位 OR/AND 模式）固定为 0，即直接覆盖。
pub fn set_param(cdb_id: u32, value: u64) -> Sentence {
    Sentence::new(SET_PARAM).with_fields([
        format!("{}{}", CURRENT_CONFIG_BLOCK, cdb_id),
        format!("0x{:08x}", value),
        "0".to_string(),
    ])
}

/// GETPAR 应答行的匹配片段（`PSTMSETPAR,<cdb>`）
pub fn get_param_reply_marker(cdb_id: u32) -> String {
    format!("{},{}", SET_PARAM, cdb_id)
}

/// `$PSTMINITTIME,dd,mm,yyyy,hh,mm,ss`（UTC）
pub fn init_time(day: u32, month: u32, year: i32, hour: u32, minute: u32, second: u32) -> Sentence {
    Sentence::new(INIT_TIME).with_fields([
        format!("{:02}", day),
        format!("{:02}", month),
        format!("{:04}", year),
        format!("{:02}", hour),
        format!("{:02}", minute),
        format!("{:02}", second),
    ])
}

/// 判断一条应答是否为加载被拒绝（如 `$PSTMEPHEMERROR`、`$PSTMALMANACERROR`）
pub fn is_rejection(line: &str) -> bool {
    match Sentence::parse(line) {
        Ok(s) => s.kind.starts_with("PSTM") && s.kind.ends_with(ERROR_SUFFIX),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_param_layout() {
        let s = set_param(201, 0x1f);
        assert_eq!(s.fields, vec!["3201", "0x0000001f", "0"]);
        assert!(s.to_string().starts_with("$PSTMSETPAR,3201,0x0000001f,0*"));
    }

    #[test]
    fn test_get_param_layout() {
        assert!(get_param(1201).to_string().starts_with("$PSTMGETPAR,1201*"));
        assert_eq!(get_param_reply_marker(1201), "PSTMSETPAR,1201");
    }

    #[test]
    fn test_init_time_padding() {
        let s = init_time(7, 3, 2024, 5, 9, 0);
        assert_eq!(s.fields, vec!["07", "03", "2024", "05", "09", "00"]);
    }

    #[test]
    fn test_boot_banner() {
        let banner = boot_banner().to_string();
        assert!(banner.starts_with("$GPTXT,DEFAULT LIV CONFIGURATION*"));
    }

    #[test]
    fn test_is_rejection() {
        assert!(is_rejection(&Sentence::new("PSTMEPHEMERROR").to_string()));
        assert!(is_rejection(&Sentence::new("PSTMALMANACERROR").to_string()));
        assert!(!is_rejection(&Sentence::new("PSTMEPHEMOK").to_string()));
        assert!(!is_rejection("garbage"));
    }
}
