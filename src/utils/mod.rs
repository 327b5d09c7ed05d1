//! 时间工具

use chrono::Utc;

/// 当前 Unix 时间戳（秒）
pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

/// 当前 Unix 时间戳（毫秒）
pub fn unix_now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
