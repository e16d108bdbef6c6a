// 凭据库加密原语
//
// - ChaCha20-Poly1305 认证加密
// - Argon2id 从主密码派生密钥（内存困难型 KDF）
//
// 每次加密生成全新随机 nonce，nonce 与密文一同存储。
// 密钥错误或密文被篡改时认证失败，解密返回 DecryptionFailed。

use argon2::{
    password_hash::{PasswordHasher, SaltString},
    Argon2, Params,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chacha20poly1305::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    ChaCha20Poly1305, Key, Nonce,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use zeroize::Zeroizing;

use super::VaultError;

/// 加密数据容器
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Base64 编码的密文
    pub ciphertext: String,
    /// Base64 编码的 nonce（ChaCha20-Poly1305 为 12 字节）
    pub nonce: String,
}

/// 凭据库加密器
pub struct VaultCrypto {
    cipher: ChaCha20Poly1305,
}

impl VaultCrypto {
    /// 从主密码派生密钥并构建加密器
    pub fn from_password(password: &str, salt: &[u8]) -> Result<Self, VaultError> {
        let key = Self::derive_key(password, salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&*key));
        Ok(Self { cipher })
    }

    /// 直接使用 32 字节原始密钥构建加密器
    pub fn from_key(key: &[u8; 32]) -> Self {
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
        Self { cipher }
    }

    /// 生成随机盐（16 字节）
    pub fn generate_salt() -> [u8; 16] {
        use rand::RngCore;
        let mut salt = [0u8; 16];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Argon2id 密钥派生
    fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, VaultError> {
        let params = Params::new(
            65536, // 64 MiB 内存
            3,     // 3 轮迭代
            1,     // 单线程
            Some(32),
        )
        .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

        let salt_string =
            SaltString::encode_b64(salt).map_err(|e| VaultError::Encryption(e.to_string()))?;

        let hash = argon2
            .hash_password(password.as_bytes(), &salt_string)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let hash_bytes = hash
            .hash
            .ok_or_else(|| VaultError::Encryption("empty KDF output".to_string()))?;

        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(hash_bytes.as_bytes());
        Ok(key)
    }

    /// 加密数据
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedData, VaultError> {
        let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        Ok(EncryptedData {
            ciphertext: BASE64.encode(&ciphertext),
            nonce: BASE64.encode(nonce.as_slice()),
        })
    }

    /// 解密数据
    ///
    /// 认证失败（密钥错误、密文或 nonce 被篡改）一律返回
    /// DecryptionFailed，失败即关闭，不会返回部分明文。
    pub fn decrypt(&self, encrypted: &EncryptedData) -> Result<Zeroizing<Vec<u8>>, VaultError> {
        let ciphertext = BASE64
            .decode(&encrypted.ciphertext)
            .map_err(|_| VaultError::DecryptionFailed)?;

        let nonce_bytes = BASE64
            .decode(&encrypted.nonce)
            .map_err(|_| VaultError::DecryptionFailed)?;

        if nonce_bytes.len() != 12 {
            return Err(VaultError::DecryptionFailed);
        }
        let nonce = Nonce::from_slice(&nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext.as_slice())
            .map_err(|_| VaultError::DecryptionFailed)?;

        Ok(Zeroizing::new(plaintext))
    }

    /// 将可序列化对象加密为 JSON 密文
    pub fn encrypt_json<T: Serialize>(&self, data: &T) -> Result<EncryptedData, VaultError> {
        let json = serde_json::to_vec(data)?;
        self.encrypt(&json)
    }

    /// 解密 JSON 密文为对象
    pub fn decrypt_json<T: DeserializeOwned>(
        &self,
        encrypted: &EncryptedData,
    ) -> Result<T, VaultError> {
        let plaintext = self.decrypt(encrypted)?;
        let data = serde_json::from_slice(&plaintext)?;
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let crypto = VaultCrypto::from_key(&[7u8; 32]);

        let plaintext = b"Hello, World!";
        let encrypted = crypto.encrypt(plaintext).unwrap();
        let decrypted = crypto.decrypt(&encrypted).unwrap();

        assert_eq!(plaintext.as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_nonce_unique_per_encryption() {
        let crypto = VaultCrypto::from_key(&[7u8; 32]);
        let a = crypto.encrypt(b"same input").unwrap();
        let b = crypto.encrypt(b"same input").unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_password_based_encryption() {
        let password = "test-password-123";
        let salt = VaultCrypto::generate_salt();

        let crypto = VaultCrypto::from_password(password, &salt).unwrap();
        let encrypted = crypto.encrypt(b"secret data").unwrap();

        // 相同密码和盐可以解密
        let crypto2 = VaultCrypto::from_password(password, &salt).unwrap();
        let decrypted = crypto2.decrypt(&encrypted).unwrap();
        assert_eq!(b"secret data".as_slice(), decrypted.as_slice());
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let crypto = VaultCrypto::from_key(&[1u8; 32]);
        let encrypted = crypto.encrypt(b"top secret").unwrap();

        let wrong = VaultCrypto::from_key(&[2u8; 32]);
        match wrong.decrypt(&encrypted) {
            Err(VaultError::DecryptionFailed) => {}
            other => panic!("expected DecryptionFailed, got {:?}", other.map(|v| v.len())),
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let crypto = VaultCrypto::from_key(&[1u8; 32]);
        let mut encrypted = crypto.encrypt(b"integrity matters").unwrap();

        // 篡改密文的一个字节
        let mut raw = BASE64.decode(&encrypted.ciphertext).unwrap();
        raw[0] ^= 0xff;
        encrypted.ciphertext = BASE64.encode(&raw);

        assert!(matches!(
            crypto.decrypt(&encrypted),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_json_roundtrip() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct TestData {
            name: String,
            value: i32,
        }

        let crypto = VaultCrypto::from_key(&[9u8; 32]);
        let data = TestData {
            name: "test".to_string(),
            value: 42,
        };

        let encrypted = crypto.encrypt_json(&data).unwrap();
        let decrypted: TestData = crypto.decrypt_json(&encrypted).unwrap();
        assert_eq!(data, decrypted);
    }
}
