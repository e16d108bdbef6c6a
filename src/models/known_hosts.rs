// Known Hosts 数据模型
// 用于存储和验证 SSH 服务器公钥指纹

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 已知主机条目
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KnownHost {
    /// 主机地址（host:port 格式）
    pub host: String,
    /// 密钥类型（ssh-ed25519, ssh-rsa 等）
    pub key_type: String,
    /// SHA256 指纹
    pub fingerprint: String,
    /// 首次连接时间
    pub first_seen: DateTime<Utc>,
    /// 最后使用时间
    pub last_used: DateTime<Utc>,
}

impl KnownHost {
    /// 生成 host:port 形式的存储键
    pub fn address(hostname: &str, port: u16) -> String {
        format!("{}:{}", hostname, port)
    }

    pub fn new(hostname: &str, port: u16, key_type: String, fingerprint: String) -> Self {
        let now = Utc::now();
        Self {
            host: Self::address(hostname, port),
            key_type,
            fingerprint,
            first_seen: now,
            last_used: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_format() {
        assert_eq!(KnownHost::address("10.0.0.5", 22), "10.0.0.5:22");
        assert_eq!(KnownHost::address("example.com", 2222), "example.com:2222");
    }
}
