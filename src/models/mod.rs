// 数据模型
//
// 模块结构:
// - host: 主机与分组 (Host, HostInput, AuthType, HostGroup)
// - settings: 应用设置 (Settings)
// - snippet: 快捷命令 (Snippet)
// - vault_entry: 凭据条目 (VaultEntry, VaultEntryKind)
// - known_hosts: 已知主机密钥 (KnownHost)
// - sftp: 文件条目与路径工具 (FileEntry)

pub mod host;
pub mod known_hosts;
pub mod settings;
pub mod sftp;
pub mod snippet;
pub mod vault_entry;

pub use host::{AuthType, Host, HostCredentials, HostGroup, HostGroupInput, HostInput};
pub use known_hosts::KnownHost;
pub use settings::Settings;
pub use sftp::{format_bytes, FileEntry};
pub use snippet::{Snippet, SnippetInput};
pub use vault_entry::{NewVaultEntry, VaultEntry, VaultEntryKind, VaultEntryUpdate};
