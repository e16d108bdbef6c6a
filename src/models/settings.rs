// 应用设置

use serde::{Deserialize, Serialize};

/// 引擎设置
///
/// 封闭结构体，字段在命令边界上校验，不接受任意键值。
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Settings {
    /// 新建主机的默认端口
    pub default_port: u16,
    /// 连接超时（秒）
    pub connection_timeout_secs: u32,
    /// SSH 心跳间隔（秒），0 表示禁用
    pub keepalive_interval_secs: u32,
    /// 严格主机密钥检查（密钥变化时直接拒绝，不询问）
    pub strict_host_key_checking: bool,
    /// 自动重连最大尝试次数
    pub reconnect_attempts: u32,
    /// 自动重连基础间隔（秒），按指数退避递增
    pub reconnect_interval_secs: u32,
    /// 延迟探测间隔（秒）
    pub latency_interval_secs: u32,
    /// 是否启用延迟探测
    pub show_latency: bool,
    /// 传输空闲超时（秒），超过无进度视为失败
    pub transfer_idle_timeout_secs: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            default_port: 22,
            connection_timeout_secs: 30,
            keepalive_interval_secs: 60,
            strict_host_key_checking: false,
            reconnect_attempts: 3,
            reconnect_interval_secs: 5,
            latency_interval_secs: 10,
            show_latency: true,
            transfer_idle_timeout_secs: 60,
        }
    }
}
