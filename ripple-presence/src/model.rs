//! 路由表数据模型

use serde::{Deserialize, Serialize};

/// 一条设备路由：某用户的某设备当前挂靠在哪个网关
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRoute {
    pub device_id: String,
    pub gateway_addr: String,
    /// 最近一次注册或心跳的 Unix 时间戳（秒）
    pub last_active: i64,
}

/// 用户在线状态：是否有任一设备在线，以及在线设备列表
#[derive(Debug, Clone, Default)]
pub struct OnlineStatus {
    pub online: bool,
    pub device_ids: Vec<String>,
}
