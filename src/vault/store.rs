// 加密存储实现
//
// 单文件 JSON 布局:
// - 明文头部: magic + version + salt
// - verifier: 固定标记的密文，解锁时校验主密码
// - 各集合逐记录加密，记录 ID 保留明文用于索引与隔离
//
// 写入走临时文件 + rename，保证崩溃时旧文件完整。
// 每次保存为所有记录生成全新 nonce。

use std::io::Write;
use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::models::{
    Host, HostCredentials, HostGroup, HostGroupInput, HostInput, KnownHost, NewVaultEntry,
    Settings, Snippet, SnippetInput, VaultEntry, VaultEntryUpdate,
};

use super::crypto::{EncryptedData, VaultCrypto};
use super::VaultError;

const VAULT_MAGIC: &str = "SHELLVAULT";
const VAULT_VERSION: u32 = 1;
const VAULT_FILE: &str = "vault.dat";
const LOCK_FILE: &str = "vault.lock";
const VERIFIER_CANARY: &[u8] = b"shellvault.verifier.v1";

/// 磁盘文件格式
#[derive(Serialize, Deserialize)]
struct VaultFile {
    magic: String,
    version: u32,
    /// Base64 编码的 KDF 盐
    salt: String,
    /// 主密码校验密文
    verifier: EncryptedData,
    hosts: Vec<VaultRecord>,
    groups: Vec<VaultRecord>,
    snippets: Vec<VaultRecord>,
    entries: Vec<VaultRecord>,
    known_hosts: Vec<VaultRecord>,
    settings: Option<EncryptedData>,
}

/// 单条加密记录，ID 明文保留
#[derive(Clone, Serialize, Deserialize)]
struct VaultRecord {
    id: Uuid,
    data: EncryptedData,
}

/// 主机记录的加密载荷
///
/// 凭据字段单独加密，解锁期间内存里也只有密文，
/// 只在取用时解密成临时值。
#[derive(Serialize, Deserialize)]
struct StoredHost {
    host: Host,
    password: Option<EncryptedData>,
    passphrase: Option<EncryptedData>,
}

/// 凭据条目记录的加密载荷，秘密与主机凭据同样只存密文
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    entry: VaultEntry,
    secret: EncryptedData,
}

/// 解锁后的内存状态
struct Unlocked {
    crypto: VaultCrypto,
    salt: [u8; 16],
    hosts: Vec<StoredHost>,
    groups: Vec<HostGroup>,
    snippets: Vec<Snippet>,
    entries: Vec<StoredEntry>,
    known_hosts: Vec<KnownHost>,
    settings: Settings,
    /// 解密失败的记录，按原样保留，保存时写回
    quarantine: Quarantine,
}

/// 隔离区：单条记录损坏不影响其余记录
#[derive(Default)]
struct Quarantine {
    hosts: Vec<VaultRecord>,
    groups: Vec<VaultRecord>,
    snippets: Vec<VaultRecord>,
    entries: Vec<VaultRecord>,
    known_hosts: Vec<VaultRecord>,
}

impl Quarantine {
    fn count(&self) -> usize {
        self.hosts.len()
            + self.groups.len()
            + self.snippets.len()
            + self.entries.len()
            + self.known_hosts.len()
    }
}

/// 单实例文件锁
///
/// 打开时以 create_new 创建 lock 文件并写入 PID，
/// 已存在说明另一实例在用，返回 Busy。Drop 时删除。
struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    fn acquire(path: PathBuf) -> Result<Self, VaultError> {
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(VaultError::Busy(path))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// 加密凭据库
///
/// 所有读写操作都要求已解锁，锁定后仅 `unlock` 可用。
pub struct Vault {
    path: PathBuf,
    inner: RwLock<Option<Unlocked>>,
    _instance_lock: InstanceLock,
}

impl Vault {
    /// 打开（或初始化）凭据库并用主密码解锁
    pub async fn open(dir: impl AsRef<Path>, master_password: &str) -> Result<Self, VaultError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let instance_lock = InstanceLock::acquire(dir.join(LOCK_FILE))?;
        let path = dir.join(VAULT_FILE);

        let unlocked = if tokio::fs::try_exists(&path).await? {
            Self::load(&path, master_password).await?
        } else {
            info!("[Vault] Initializing new vault at {}", path.display());
            let salt = VaultCrypto::generate_salt();
            let crypto = VaultCrypto::from_password(master_password, &salt)?;
            let unlocked = Unlocked {
                crypto,
                salt,
                hosts: Vec::new(),
                groups: Vec::new(),
                snippets: Vec::new(),
                entries: Vec::new(),
                known_hosts: Vec::new(),
                settings: Settings::default(),
                quarantine: Quarantine::default(),
            };
            Self::persist(&path, &unlocked).await?;
            unlocked
        };

        Ok(Self {
            path,
            inner: RwLock::new(Some(unlocked)),
            _instance_lock: instance_lock,
        })
    }

    /// 从磁盘加载并解密
    async fn load(path: &Path, master_password: &str) -> Result<Unlocked, VaultError> {
        let raw = tokio::fs::read(path).await?;
        let file: VaultFile = serde_json::from_slice(&raw)
            .map_err(|e| VaultError::CorruptStore(format!("invalid vault file: {}", e)))?;

        if file.magic != VAULT_MAGIC {
            return Err(VaultError::CorruptStore("bad magic".to_string()));
        }
        if file.version != VAULT_VERSION {
            return Err(VaultError::CorruptStore(format!(
                "unsupported vault version {}",
                file.version
            )));
        }

        let salt_bytes = BASE64
            .decode(&file.salt)
            .map_err(|_| VaultError::CorruptStore("bad salt encoding".to_string()))?;
        let mut salt = [0u8; 16];
        if salt_bytes.len() != salt.len() {
            return Err(VaultError::CorruptStore("bad salt length".to_string()));
        }
        salt.copy_from_slice(&salt_bytes);

        let crypto = VaultCrypto::from_password(master_password, &salt)?;

        // 主密码校验：verifier 解不开或内容不符，直接失败
        let canary = crypto.decrypt(&file.verifier)?;
        if canary.as_slice() != VERIFIER_CANARY {
            return Err(VaultError::DecryptionFailed);
        }

        let mut quarantine = Quarantine::default();

        let hosts = decrypt_records(&crypto, file.hosts, &mut quarantine.hosts, "host");
        let groups = decrypt_records(&crypto, file.groups, &mut quarantine.groups, "group");
        let snippets = decrypt_records(&crypto, file.snippets, &mut quarantine.snippets, "snippet");
        let entries = decrypt_records(&crypto, file.entries, &mut quarantine.entries, "entry");
        let known_hosts = decrypt_records(
            &crypto,
            file.known_hosts,
            &mut quarantine.known_hosts,
            "known host",
        );

        let settings = match file.settings {
            Some(encrypted) => match crypto.decrypt_json::<Settings>(&encrypted) {
                Ok(settings) => settings,
                Err(_) => {
                    warn!("[Vault] Settings record is corrupt, falling back to defaults");
                    Settings::default()
                }
            },
            None => Settings::default(),
        };

        if quarantine.count() > 0 {
            warn!(
                "[Vault] {} corrupt record(s) quarantined",
                quarantine.count()
            );
        }

        Ok(Unlocked {
            crypto,
            salt,
            hosts,
            groups,
            snippets,
            entries,
            known_hosts,
            settings,
            quarantine,
        })
    }

    /// 全量加密并原子写盘
    async fn persist(path: &Path, u: &Unlocked) -> Result<(), VaultError> {
        let mut hosts: Vec<VaultRecord> = u
            .hosts
            .iter()
            .map(|sh| encrypt_record(&u.crypto, sh.host.id, sh))
            .collect::<Result<_, _>>()?;
        hosts.extend(u.quarantine.hosts.iter().cloned());

        let mut groups: Vec<VaultRecord> = u
            .groups
            .iter()
            .map(|g| encrypt_record(&u.crypto, g.id, g))
            .collect::<Result<_, _>>()?;
        groups.extend(u.quarantine.groups.iter().cloned());

        let mut snippets: Vec<VaultRecord> = u
            .snippets
            .iter()
            .map(|s| encrypt_record(&u.crypto, s.id, s))
            .collect::<Result<_, _>>()?;
        snippets.extend(u.quarantine.snippets.iter().cloned());

        let mut entries: Vec<VaultRecord> = u
            .entries
            .iter()
            .map(|se| encrypt_record(&u.crypto, se.entry.id, se))
            .collect::<Result<_, _>>()?;
        entries.extend(u.quarantine.entries.iter().cloned());

        let mut known_hosts: Vec<VaultRecord> = u
            .known_hosts
            .iter()
            .map(|kh| encrypt_record(&u.crypto, Uuid::new_v4(), kh))
            .collect::<Result<_, _>>()?;
        known_hosts.extend(u.quarantine.known_hosts.iter().cloned());

        let file = VaultFile {
            magic: VAULT_MAGIC.to_string(),
            version: VAULT_VERSION,
            salt: BASE64.encode(u.salt),
            verifier: u.crypto.encrypt(VERIFIER_CANARY)?,
            hosts,
            groups,
            snippets,
            entries,
            known_hosts,
            settings: Some(u.crypto.encrypt_json(&u.settings)?),
        };

        let json = serde_json::to_vec_pretty(&file)?;
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// 锁定凭据库，丢弃内存中的密钥与明文
    pub async fn lock(&self) {
        *self.inner.write().await = None;
        info!("[Vault] Locked");
    }

    /// 用主密码重新解锁
    pub async fn unlock(&self, master_password: &str) -> Result<(), VaultError> {
        let unlocked = Self::load(&self.path, master_password).await?;
        *self.inner.write().await = Some(unlocked);
        info!("[Vault] Unlocked");
        Ok(())
    }

    pub async fn is_unlocked(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// 隔离区记录数
    pub async fn quarantined_count(&self) -> Result<usize, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(u.quarantine.count())
    }

    /// 更换主密码（重新生成盐并全量重写）
    pub async fn change_master_password(
        &self,
        current: &str,
        new: &str,
    ) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;

        // 校验当前密码
        let check = VaultCrypto::from_password(current, &u.salt)?;
        let raw = tokio::fs::read(&self.path).await?;
        let file: VaultFile = serde_json::from_slice(&raw)
            .map_err(|e| VaultError::CorruptStore(format!("invalid vault file: {}", e)))?;
        let canary = check.decrypt(&file.verifier)?;
        if canary.as_slice() != VERIFIER_CANARY {
            return Err(VaultError::DecryptionFailed);
        }

        let new_salt = VaultCrypto::generate_salt();
        let new_crypto = VaultCrypto::from_password(new, &new_salt)?;

        // 凭据字段的内层密文在旧密钥下，换钥时逐个重加密
        for sh in u.hosts.iter_mut() {
            if let Some(enc) = &sh.password {
                let plain = u.crypto.decrypt(enc)?;
                sh.password = Some(new_crypto.encrypt(&plain)?);
            }
            if let Some(enc) = &sh.passphrase {
                let plain = u.crypto.decrypt(enc)?;
                sh.passphrase = Some(new_crypto.encrypt(&plain)?);
            }
        }
        for se in u.entries.iter_mut() {
            let plain = u.crypto.decrypt(&se.secret)?;
            se.secret = new_crypto.encrypt(&plain)?;
        }

        u.salt = new_salt;
        u.crypto = new_crypto;
        // 旧密钥下的损坏记录在新密钥下永远无法解开，随换钥丢弃
        u.quarantine = Quarantine::default();
        Self::persist(&self.path, u).await?;
        info!("[Vault] Master password changed");
        Ok(())
    }

    // ---- 主机 ----

    /// 新建主机，明文凭据随即加密入库
    pub async fn add_host(&self, input: HostInput) -> Result<Host, VaultError> {
        if input.name.trim().is_empty() || input.hostname.trim().is_empty() {
            return Err(VaultError::InvalidInput(
                "host name and hostname are required".to_string(),
            ));
        }
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;

        let host = Host::from_input(&input);
        let password = encrypt_opt_secret(&u.crypto, input.password.as_deref())?;
        let passphrase = encrypt_opt_secret(&u.crypto, input.passphrase.as_deref())?;
        u.hosts.push(StoredHost {
            host: host.clone(),
            password,
            passphrase,
        });
        Self::persist(&self.path, u).await?;
        info!("[Vault] Added host {} ({})", host.name, host.id);
        Ok(host)
    }

    /// 更新主机
    ///
    /// 输入中的 password/passphrase 为最终值：None 表示清除已存凭据。
    pub async fn update_host(&self, id: Uuid, input: HostInput) -> Result<Host, VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;

        let password = encrypt_opt_secret(&u.crypto, input.password.as_deref())?;
        let passphrase = encrypt_opt_secret(&u.crypto, input.passphrase.as_deref())?;
        let stored = u
            .hosts
            .iter_mut()
            .find(|sh| sh.host.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("host {}", id)))?;
        stored.host.apply_input(&input);
        stored.password = password;
        stored.passphrase = passphrase;
        let host = stored.host.clone();
        Self::persist(&self.path, u).await?;
        Ok(host)
    }

    /// 删除主机（包括同 ID 的隔离记录）
    pub async fn delete_host(&self, id: Uuid) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;

        let before = u.hosts.len() + u.quarantine.hosts.len();
        u.hosts.retain(|sh| sh.host.id != id);
        u.quarantine.hosts.retain(|r| r.id != id);
        if u.hosts.len() + u.quarantine.hosts.len() == before {
            return Err(VaultError::NotFound(format!("host {}", id)));
        }
        Self::persist(&self.path, u).await?;
        info!("[Vault] Deleted host {}", id);
        Ok(())
    }

    /// 列出主机（插入顺序，隔离记录不出现）
    pub async fn list_hosts(&self) -> Result<Vec<Host>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(u.hosts.iter().map(|sh| sh.host.clone()).collect())
    }

    pub async fn get_host(&self, id: Uuid) -> Result<Host, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        if u.quarantine.hosts.iter().any(|r| r.id == id) {
            return Err(VaultError::CorruptRecord(id));
        }
        u.hosts
            .iter()
            .find(|sh| sh.host.id == id)
            .map(|sh| sh.host.clone())
            .ok_or_else(|| VaultError::NotFound(format!("host {}", id)))
    }

    /// 取出主机的解密凭据，仅供建立连接时使用
    pub async fn host_credentials(&self, id: Uuid) -> Result<HostCredentials, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        if u.quarantine.hosts.iter().any(|r| r.id == id) {
            return Err(VaultError::CorruptRecord(id));
        }
        let stored = u
            .hosts
            .iter()
            .find(|sh| sh.host.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("host {}", id)))?;
        Ok(HostCredentials {
            password: stored
                .password
                .as_ref()
                .map(|e| decrypt_secret(&u.crypto, e))
                .transpose()?,
            passphrase: stored
                .passphrase
                .as_ref()
                .map(|e| decrypt_secret(&u.crypto, e))
                .transpose()?,
        })
    }

    /// 刷新主机最后连接时间
    pub async fn touch_host_connected(&self, id: Uuid) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let stored = u
            .hosts
            .iter_mut()
            .find(|sh| sh.host.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("host {}", id)))?;
        stored.host.last_connected = Some(chrono::Utc::now());
        Self::persist(&self.path, u).await?;
        Ok(())
    }

    // ---- 分组 ----

    pub async fn add_group(&self, input: HostGroupInput) -> Result<HostGroup, VaultError> {
        if input.name.trim().is_empty() {
            return Err(VaultError::InvalidInput(
                "group name is required".to_string(),
            ));
        }
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let group = HostGroup::from_input(&input);
        u.groups.push(group.clone());
        Self::persist(&self.path, u).await?;
        Ok(group)
    }

    pub async fn update_group(
        &self,
        id: Uuid,
        input: HostGroupInput,
    ) -> Result<HostGroup, VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let group = u
            .groups
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("group {}", id)))?;
        group.name = input.name;
        group.icon = input.icon;
        group.color = input.color;
        group.order = input.order;
        let group = group.clone();
        Self::persist(&self.path, u).await?;
        Ok(group)
    }

    /// 删除分组，引用该分组的主机自动解除关联
    pub async fn delete_group(&self, id: Uuid) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let before = u.groups.len() + u.quarantine.groups.len();
        u.groups.retain(|g| g.id != id);
        u.quarantine.groups.retain(|r| r.id != id);
        if u.groups.len() + u.quarantine.groups.len() == before {
            return Err(VaultError::NotFound(format!("group {}", id)));
        }
        for sh in u.hosts.iter_mut() {
            if sh.host.group_id == Some(id) {
                sh.host.group_id = None;
            }
        }
        Self::persist(&self.path, u).await?;
        Ok(())
    }

    pub async fn list_groups(&self) -> Result<Vec<HostGroup>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(u.groups.clone())
    }

    // ---- 快捷命令 ----

    pub async fn add_snippet(&self, input: SnippetInput) -> Result<Snippet, VaultError> {
        if input.name.trim().is_empty() {
            return Err(VaultError::InvalidInput(
                "snippet name is required".to_string(),
            ));
        }
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let snippet = Snippet::from_input(&input);
        u.snippets.push(snippet.clone());
        Self::persist(&self.path, u).await?;
        Ok(snippet)
    }

    pub async fn update_snippet(
        &self,
        id: Uuid,
        input: SnippetInput,
    ) -> Result<Snippet, VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let snippet = u
            .snippets
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("snippet {}", id)))?;
        snippet.apply_input(&input);
        let snippet = snippet.clone();
        Self::persist(&self.path, u).await?;
        Ok(snippet)
    }

    pub async fn delete_snippet(&self, id: Uuid) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let before = u.snippets.len() + u.quarantine.snippets.len();
        u.snippets.retain(|s| s.id != id);
        u.quarantine.snippets.retain(|r| r.id != id);
        if u.snippets.len() + u.quarantine.snippets.len() == before {
            return Err(VaultError::NotFound(format!("snippet {}", id)));
        }
        Self::persist(&self.path, u).await?;
        Ok(())
    }

    pub async fn list_snippets(&self) -> Result<Vec<Snippet>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(u.snippets.clone())
    }

    // ---- 凭据条目 ----

    pub async fn add_entry(&self, input: NewVaultEntry) -> Result<VaultEntry, VaultError> {
        if input.name.trim().is_empty() {
            return Err(VaultError::InvalidInput(
                "entry name is required".to_string(),
            ));
        }
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let entry = VaultEntry::from_input(&input);
        let secret = u.crypto.encrypt(input.secret.as_bytes())?;
        u.entries.push(StoredEntry {
            entry: entry.clone(),
            secret,
        });
        Self::persist(&self.path, u).await?;
        info!("[Vault] Added entry {} ({})", entry.name, entry.id);
        Ok(entry)
    }

    /// 更新条目元数据，update.secret 为 None 时保留原有秘密
    pub async fn update_entry(
        &self,
        id: Uuid,
        update: VaultEntryUpdate,
    ) -> Result<VaultEntry, VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let secret = match &update.secret {
            Some(secret) => Some(u.crypto.encrypt(secret.as_bytes())?),
            None => None,
        };
        let stored = u
            .entries
            .iter_mut()
            .find(|se| se.entry.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("entry {}", id)))?;
        stored.entry.apply_update(&update);
        if let Some(secret) = secret {
            stored.secret = secret;
        }
        let entry = stored.entry.clone();
        Self::persist(&self.path, u).await?;
        Ok(entry)
    }

    /// 删除条目（包括同 ID 的隔离记录）
    pub async fn delete_entry(&self, id: Uuid) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let before = u.entries.len() + u.quarantine.entries.len();
        u.entries.retain(|se| se.entry.id != id);
        u.quarantine.entries.retain(|r| r.id != id);
        if u.entries.len() + u.quarantine.entries.len() == before {
            return Err(VaultError::NotFound(format!("entry {}", id)));
        }
        Self::persist(&self.path, u).await?;
        info!("[Vault] Deleted entry {}", id);
        Ok(())
    }

    /// 列出条目（不含秘密载荷，插入顺序）
    pub async fn list_entries(&self) -> Result<Vec<VaultEntry>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(u.entries.iter().map(|se| se.entry.clone()).collect())
    }

    /// 按名称、用户名、URL、标签搜索条目（不区分大小写）
    pub async fn search_entries(&self, query: &str) -> Result<Vec<VaultEntry>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        let query = query.to_lowercase();
        Ok(u.entries
            .iter()
            .map(|se| &se.entry)
            .filter(|e| {
                e.name.to_lowercase().contains(&query)
                    || e.username
                        .as_deref()
                        .is_some_and(|v| v.to_lowercase().contains(&query))
                    || e.url
                        .as_deref()
                        .is_some_and(|v| v.to_lowercase().contains(&query))
                    || e.tags.iter().any(|t| t.to_lowercase().contains(&query))
            })
            .cloned()
            .collect())
    }

    /// 列出条目中出现过的文件夹名（去重，按插入顺序）
    pub async fn entry_folders(&self) -> Result<Vec<String>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        let mut folders: Vec<String> = Vec::new();
        for se in &u.entries {
            if let Some(folder) = &se.entry.folder {
                if !folders.contains(folder) {
                    folders.push(folder.clone());
                }
            }
        }
        Ok(folders)
    }

    pub async fn get_entry(&self, id: Uuid) -> Result<VaultEntry, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        if u.quarantine.entries.iter().any(|r| r.id == id) {
            return Err(VaultError::CorruptRecord(id));
        }
        u.entries
            .iter()
            .find(|se| se.entry.id == id)
            .map(|se| se.entry.clone())
            .ok_or_else(|| VaultError::NotFound(format!("entry {}", id)))
    }

    /// 解密条目秘密并刷新最后使用时间
    pub async fn get_secret(&self, id: Uuid) -> Result<Zeroizing<String>, VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        if u.quarantine.entries.iter().any(|r| r.id == id) {
            return Err(VaultError::CorruptRecord(id));
        }
        let stored = u
            .entries
            .iter_mut()
            .find(|se| se.entry.id == id)
            .ok_or_else(|| VaultError::NotFound(format!("entry {}", id)))?;
        stored.entry.last_used = Some(chrono::Utc::now());
        let secret = decrypt_secret(&u.crypto, &stored.secret)?;
        Self::persist(&self.path, u).await?;
        Ok(secret)
    }

    // ---- 已知主机 ----

    /// 查询已记录的主机密钥
    pub async fn known_host_for(
        &self,
        hostname: &str,
        port: u16,
    ) -> Result<Option<KnownHost>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        let address = KnownHost::address(hostname, port);
        Ok(u.known_hosts.iter().find(|kh| kh.host == address).cloned())
    }

    /// 记录或更新主机密钥指纹
    pub async fn remember_host_key(
        &self,
        hostname: &str,
        port: u16,
        key_type: String,
        fingerprint: String,
    ) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let address = KnownHost::address(hostname, port);
        match u.known_hosts.iter_mut().find(|kh| kh.host == address) {
            Some(existing) => {
                existing.key_type = key_type;
                existing.fingerprint = fingerprint;
                existing.last_used = chrono::Utc::now();
            }
            None => {
                u.known_hosts
                    .push(KnownHost::new(hostname, port, key_type, fingerprint));
            }
        }
        Self::persist(&self.path, u).await?;
        info!("[Vault] Remembered host key for {}", address);
        Ok(())
    }

    /// 删除已记录的主机密钥
    pub async fn forget_host_key(&self, hostname: &str, port: u16) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        let address = KnownHost::address(hostname, port);
        u.known_hosts.retain(|kh| kh.host != address);
        Self::persist(&self.path, u).await?;
        Ok(())
    }

    pub async fn list_known_hosts(&self) -> Result<Vec<KnownHost>, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(u.known_hosts.clone())
    }

    // ---- 设置 ----

    pub async fn settings(&self) -> Result<Settings, VaultError> {
        let guard = self.inner.read().await;
        let u = guard.as_ref().ok_or(VaultError::Locked)?;
        Ok(u.settings.clone())
    }

    pub async fn update_settings(&self, settings: Settings) -> Result<(), VaultError> {
        let mut guard = self.inner.write().await;
        let u = guard.as_mut().ok_or(VaultError::Locked)?;
        u.settings = settings;
        Self::persist(&self.path, u).await?;
        Ok(())
    }
}

fn encrypt_opt_secret(
    crypto: &VaultCrypto,
    secret: Option<&str>,
) -> Result<Option<EncryptedData>, VaultError> {
    secret.map(|s| crypto.encrypt(s.as_bytes())).transpose()
}

/// 解密凭据密文为临时字符串，离开作用域即清零
fn decrypt_secret(
    crypto: &VaultCrypto,
    encrypted: &EncryptedData,
) -> Result<Zeroizing<String>, VaultError> {
    let bytes = crypto.decrypt(encrypted)?;
    let text = std::str::from_utf8(&bytes).map_err(|_| VaultError::DecryptionFailed)?;
    Ok(Zeroizing::new(text.to_string()))
}

fn encrypt_record<T: Serialize>(
    crypto: &VaultCrypto,
    id: Uuid,
    value: &T,
) -> Result<VaultRecord, VaultError> {
    Ok(VaultRecord {
        id,
        data: crypto.encrypt_json(value)?,
    })
}

/// 逐记录解密，失败的记录进隔离区
fn decrypt_records<T: serde::de::DeserializeOwned>(
    crypto: &VaultCrypto,
    records: Vec<VaultRecord>,
    quarantine: &mut Vec<VaultRecord>,
    kind: &str,
) -> Vec<T> {
    let mut out = Vec::with_capacity(records.len());
    for record in records {
        match crypto.decrypt_json::<T>(&record.data) {
            Ok(value) => out.push(value),
            Err(_) => {
                warn!("[Vault] Quarantined corrupt {} record {}", kind, record.id);
                quarantine.push(record);
            }
        }
    }
    out
}

// 便于隔离测试直接操作文件
#[cfg(test)]
pub(crate) fn tamper_first_record(path: &Path, collection: &str) -> Uuid {
    let raw = std::fs::read(path).unwrap();
    let mut file: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    let record = &mut file[collection][0];
    let id: Uuid = serde_json::from_value(record["id"].clone()).unwrap();
    let ciphertext = record["data"]["ciphertext"].as_str().unwrap();
    let mut bytes = BASE64.decode(ciphertext).unwrap();
    bytes[0] ^= 0xff;
    record["data"]["ciphertext"] = serde_json::Value::String(BASE64.encode(&bytes));
    std::fs::write(path, serde_json::to_vec(&file).unwrap()).unwrap();
    id
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AuthType, VaultEntryKind};
    use tempfile::TempDir;

    const MASTER: &str = "correct horse battery staple";

    async fn open_vault(dir: &TempDir) -> Vault {
        Vault::open(dir.path(), MASTER).await.unwrap()
    }

    fn host_input(name: &str) -> HostInput {
        let mut input = HostInput::new(name, "10.0.0.5", "admin");
        input.password = Some("hunter2".to_string());
        input
    }

    fn entry_input(name: &str) -> NewVaultEntry {
        NewVaultEntry {
            name: name.to_string(),
            kind: VaultEntryKind::Password,
            username: Some("admin".to_string()),
            secret: "s3cr3t".to_string(),
            url: None,
            notes: None,
            tags: vec![],
            folder: None,
        }
    }

    #[tokio::test]
    async fn test_host_crud_roundtrip() {
        let dir = TempDir::new().unwrap();
        {
            let vault = open_vault(&dir).await;
            let host = vault.add_host(host_input("web-01")).await.unwrap();
            assert_eq!(host.auth_type, AuthType::Password);

            let creds = vault.host_credentials(host.id).await.unwrap();
            assert_eq!(creds.password.as_deref().map(String::as_str), Some("hunter2"));
        }

        // 重新打开后数据仍在
        let vault = open_vault(&dir).await;
        let hosts = vault.list_hosts().await.unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0].name, "web-01");

        let creds = vault.host_credentials(hosts[0].id).await.unwrap();
        assert_eq!(creds.password.as_deref().map(String::as_str), Some("hunter2"));

        vault.delete_host(hosts[0].id).await.unwrap();
        assert!(vault.list_hosts().await.unwrap().is_empty());
        assert!(matches!(
            vault.delete_host(hosts[0].id).await,
            Err(VaultError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_update_host_preserves_identity() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;
        let host = vault.add_host(host_input("web-01")).await.unwrap();

        let mut input = host_input("web-01-renamed");
        input.password = None;
        let updated = vault.update_host(host.id, input).await.unwrap();

        assert_eq!(updated.id, host.id);
        assert_eq!(updated.created_at, host.created_at);
        assert!(updated.updated_at >= host.updated_at);
        assert_eq!(updated.name, "web-01-renamed");

        // password 传 None 即清除
        let creds = vault.host_credentials(host.id).await.unwrap();
        assert!(creds.password.is_none());
    }

    #[tokio::test]
    async fn test_wrong_master_password() {
        let dir = TempDir::new().unwrap();
        {
            let vault = open_vault(&dir).await;
            vault.add_host(host_input("web-01")).await.unwrap();
        }
        match Vault::open(dir.path(), "wrong password").await {
            Err(VaultError::DecryptionFailed) => {}
            other => panic!("expected DecryptionFailed, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_second_instance_is_busy() {
        let dir = TempDir::new().unwrap();
        let _vault = open_vault(&dir).await;
        match Vault::open(dir.path(), MASTER).await {
            Err(VaultError::Busy(_)) => {}
            other => panic!("expected Busy, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_locked_vault_rejects_operations() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;
        vault.lock().await;
        assert!(!vault.is_unlocked().await);
        assert!(matches!(
            vault.list_hosts().await,
            Err(VaultError::Locked)
        ));
        assert!(matches!(
            vault.add_host(host_input("x")).await,
            Err(VaultError::Locked)
        ));

        vault.unlock(MASTER).await.unwrap();
        assert!(vault.is_unlocked().await);
        assert!(vault.list_hosts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_quarantined() {
        let dir = TempDir::new().unwrap();
        let (good_id, bad_id);
        {
            let vault = open_vault(&dir).await;
            bad_id = vault.add_entry(entry_input("first")).await.unwrap().id;
            good_id = vault.add_entry(entry_input("second")).await.unwrap().id;
        }

        // 破坏第一条记录的密文
        let tampered = tamper_first_record(&dir.path().join(VAULT_FILE), "entries");
        assert_eq!(tampered, bad_id);

        let vault = open_vault(&dir).await;
        assert_eq!(vault.quarantined_count().await.unwrap(), 1);

        // 损坏记录不出现在列表中，其余记录不受影响
        let entries = vault.list_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, good_id);

        assert!(matches!(
            vault.get_entry(bad_id).await,
            Err(VaultError::CorruptRecord(id)) if id == bad_id
        ));
        assert!(matches!(
            vault.get_secret(bad_id).await,
            Err(VaultError::CorruptRecord(_))
        ));

        // 保存后损坏记录原样保留
        vault.add_entry(entry_input("third")).await.unwrap();
        drop(vault);
        let vault = open_vault(&dir).await;
        assert_eq!(vault.quarantined_count().await.unwrap(), 1);

        // 删除即清除隔离记录
        vault.delete_entry(bad_id).await.unwrap();
        assert_eq!(vault.quarantined_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_entry_secret_lifecycle() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;
        let entry = vault.add_entry(entry_input("db password")).await.unwrap();
        assert!(entry.last_used.is_none());

        let secret = vault.get_secret(entry.id).await.unwrap();
        assert_eq!(secret.as_str(), "s3cr3t");
        assert!(vault.get_entry(entry.id).await.unwrap().last_used.is_some());

        // secret 为 None 的更新保留原秘密
        let update = VaultEntryUpdate {
            name: "db password (prod)".to_string(),
            kind: VaultEntryKind::Password,
            username: Some("admin".to_string()),
            secret: None,
            url: None,
            notes: None,
            tags: vec![],
            folder: None,
            favorite: true,
        };
        let updated = vault.update_entry(entry.id, update).await.unwrap();
        assert!(updated.favorite);
        assert_eq!(vault.get_secret(entry.id).await.unwrap().as_str(), "s3cr3t");

        // 提供 secret 即替换
        let update = VaultEntryUpdate {
            name: "db password (prod)".to_string(),
            kind: VaultEntryKind::Password,
            username: None,
            secret: Some("n3w-s3cr3t".to_string()),
            url: None,
            notes: None,
            tags: vec![],
            folder: None,
            favorite: true,
        };
        vault.update_entry(entry.id, update).await.unwrap();
        assert_eq!(
            vault.get_secret(entry.id).await.unwrap().as_str(),
            "n3w-s3cr3t"
        );
    }

    #[tokio::test]
    async fn test_entry_search_and_folders() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;

        let mut a = entry_input("Prod DB");
        a.tags = vec!["database".to_string()];
        a.folder = Some("work".to_string());
        let mut b = entry_input("Staging DB");
        b.username = Some("deploy".to_string());
        b.folder = Some("work".to_string());
        let mut c = entry_input("GitHub token");
        c.url = Some("https://github.com".to_string());
        c.folder = Some("personal".to_string());
        vault.add_entry(a).await.unwrap();
        vault.add_entry(b).await.unwrap();
        vault.add_entry(c).await.unwrap();

        // 名称不区分大小写
        let hits = vault.search_entries("db").await.unwrap();
        assert_eq!(hits.len(), 2);

        // 用户名、URL、标签均可命中
        assert_eq!(vault.search_entries("deploy").await.unwrap().len(), 1);
        assert_eq!(vault.search_entries("github.com").await.unwrap().len(), 1);
        assert_eq!(vault.search_entries("database").await.unwrap().len(), 1);
        assert!(vault.search_entries("nothing").await.unwrap().is_empty());

        // 文件夹去重且保持插入顺序
        let folders = vault.entry_folders().await.unwrap();
        assert_eq!(folders, vec!["work".to_string(), "personal".to_string()]);
    }

    #[tokio::test]
    async fn test_list_order_is_insertion_order() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;
        for name in ["charlie", "alpha", "bravo"] {
            vault.add_host(host_input(name)).await.unwrap();
        }
        drop(vault);
        let vault = open_vault(&dir).await;
        let names: Vec<String> = vault
            .list_hosts()
            .await
            .unwrap()
            .into_iter()
            .map(|h| h.name)
            .collect();
        assert_eq!(names, ["charlie", "alpha", "bravo"]);
    }

    #[tokio::test]
    async fn test_delete_group_clears_references() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;
        let group = vault
            .add_group(HostGroupInput {
                name: "production".to_string(),
                icon: None,
                color: None,
                order: 0,
            })
            .await
            .unwrap();

        let mut input = host_input("web-01");
        input.group_id = Some(group.id);
        let host = vault.add_host(input).await.unwrap();
        assert_eq!(host.group_id, Some(group.id));

        vault.delete_group(group.id).await.unwrap();
        assert!(vault.get_host(host.id).await.unwrap().group_id.is_none());
        assert!(vault.list_groups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_known_host_tracking() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;

        assert!(vault
            .known_host_for("10.0.0.5", 22)
            .await
            .unwrap()
            .is_none());

        vault
            .remember_host_key(
                "10.0.0.5",
                22,
                "ssh-ed25519".to_string(),
                "SHA256:abcdef".to_string(),
            )
            .await
            .unwrap();

        let known = vault
            .known_host_for("10.0.0.5", 22)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(known.fingerprint, "SHA256:abcdef");

        // 同一地址重复记录只更新指纹
        vault
            .remember_host_key(
                "10.0.0.5",
                22,
                "ssh-ed25519".to_string(),
                "SHA256:123456".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(vault.list_known_hosts().await.unwrap().len(), 1);
        assert_eq!(
            vault
                .known_host_for("10.0.0.5", 22)
                .await
                .unwrap()
                .unwrap()
                .fingerprint,
            "SHA256:123456"
        );

        vault.forget_host_key("10.0.0.5", 22).await.unwrap();
        assert!(vault
            .known_host_for("10.0.0.5", 22)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_settings_persist() {
        let dir = TempDir::new().unwrap();
        {
            let vault = open_vault(&dir).await;
            let mut settings = vault.settings().await.unwrap();
            assert_eq!(settings.default_port, 22);
            settings.reconnect_attempts = 7;
            vault.update_settings(settings).await.unwrap();
        }
        let vault = open_vault(&dir).await;
        assert_eq!(vault.settings().await.unwrap().reconnect_attempts, 7);
    }

    #[tokio::test]
    async fn test_change_master_password() {
        let dir = TempDir::new().unwrap();
        let (host_id, entry_id);
        {
            let vault = open_vault(&dir).await;
            host_id = vault.add_host(host_input("web-01")).await.unwrap().id;
            entry_id = vault.add_entry(entry_input("db")).await.unwrap().id;
            vault
                .change_master_password(MASTER, "new master password")
                .await
                .unwrap();
        }
        assert!(matches!(
            Vault::open(dir.path(), MASTER).await,
            Err(VaultError::DecryptionFailed)
        ));
        let vault = Vault::open(dir.path(), "new master password")
            .await
            .unwrap();
        assert_eq!(vault.list_hosts().await.unwrap().len(), 1);

        // 内层凭据密文随换钥重加密，新密钥下仍可解出
        let creds = vault.host_credentials(host_id).await.unwrap();
        assert_eq!(creds.password.as_deref().map(String::as_str), Some("hunter2"));
        assert_eq!(vault.get_secret(entry_id).await.unwrap().as_str(), "s3cr3t");
    }

    #[tokio::test]
    async fn test_unlocked_state_holds_ciphertext_only() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;
        let host = vault.add_host(host_input("web-01")).await.unwrap();
        let entry = vault.add_entry(entry_input("db")).await.unwrap();

        // 解锁状态下凭据字段保持密文
        {
            let guard = vault.inner.read().await;
            let u = guard.as_ref().unwrap();
            let stored = u.hosts.iter().find(|sh| sh.host.id == host.id).unwrap();
            let raw = BASE64
                .decode(&stored.password.as_ref().unwrap().ciphertext)
                .unwrap();
            assert_ne!(raw.as_slice(), b"hunter2");
            let se = u.entries.iter().find(|se| se.entry.id == entry.id).unwrap();
            let raw = BASE64.decode(&se.secret.ciphertext).unwrap();
            assert_ne!(raw.as_slice(), b"s3cr3t");
        }

        // 取用时按需解密
        let creds = vault.host_credentials(host.id).await.unwrap();
        assert_eq!(creds.password.as_deref().map(String::as_str), Some("hunter2"));
        assert_eq!(vault.get_secret(entry.id).await.unwrap().as_str(), "s3cr3t");
    }

    #[tokio::test]
    async fn test_change_master_password_requires_current() {
        let dir = TempDir::new().unwrap();
        let vault = open_vault(&dir).await;
        assert!(matches!(
            vault.change_master_password("wrong", "whatever").await,
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[tokio::test]
    async fn test_lock_file_released_on_drop() {
        let dir = TempDir::new().unwrap();
        {
            let _vault = open_vault(&dir).await;
            assert!(dir.path().join(LOCK_FILE).exists());
        }
        assert!(!dir.path().join(LOCK_FILE).exists());
        // 释放后可再次打开
        let _vault = open_vault(&dir).await;
    }
}
