use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use argon2::password_hash::{rand_core::OsRng as SaltRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use sha2::{Digest, Sha256};
use std::sync::OnceLock;
use thiserror::Error;

const NONCE_BYTES: usize = 12;

/// Charset for backup codes. 16 chars over a 36-symbol alphabet is ~82 bits
/// of entropy, which is why a plain SHA-256 of the code is enough at rest.
const BACKUP_CODE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const BACKUP_CODE_GROUPS: usize = 4;
const BACKUP_CODE_GROUP_LEN: usize = 4;

/// A password hash that can never verify. Federated users are created with
/// this sentinel so the password login path rejects them until a real
/// password is set through the reset flow.
pub const SENTINEL_PASSWORD_HASH: &str = "!sso";

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("encryption key is missing")]
    KeyMissing,

    #[error("encryption key must be 64 hex chars (32 bytes)")]
    InvalidKey,

    #[error("decryption failed")]
    DecryptFailed,

    #[error("password hash error: {0}")]
    Hash(String),
}

/// Symmetric vault for field-level secrets plus the one-way hash helpers.
///
/// Owns the master key material exclusively; everything else in the crate
/// sees only ciphertext in and plaintext out.
#[derive(Clone)]
pub struct CryptoVault {
    cipher: Aes256Gcm,
}

impl CryptoVault {
    /// Build the vault from the configured master key (64 hex chars).
    pub fn from_hex_key(hex_key: &str) -> Result<Self, VaultError> {
        if hex_key.trim().is_empty() {
            return Err(VaultError::KeyMissing);
        }
        let bytes = hex::decode(hex_key.trim()).map_err(|_| VaultError::InvalidKey)?;
        if bytes.len() != 32 {
            return Err(VaultError::InvalidKey);
        }
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&bytes));
        Ok(Self { cipher })
    }

    /// AES-256-GCM with a fresh 96-bit nonce prepended to the ciphertext,
    /// base64-encoded for storage in text columns.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_BYTES];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| VaultError::DecryptFailed)?;

        let mut out = Vec::with_capacity(NONCE_BYTES + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(base64::encode_config(out, base64::STANDARD))
    }

    pub fn decrypt(&self, stored: &str) -> Result<Vec<u8>, VaultError> {
        let raw = base64::decode_config(stored, base64::STANDARD)
            .map_err(|_| VaultError::DecryptFailed)?;
        if raw.len() <= NONCE_BYTES {
            return Err(VaultError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_BYTES);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| VaultError::DecryptFailed)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<String, VaultError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_str(&self, stored: &str) -> Result<String, VaultError> {
        let bytes = self.decrypt(stored)?;
        String::from_utf8(bytes).map_err(|_| VaultError::DecryptFailed)
    }
}

/// Hash a password with Argon2 and a fresh salt.
pub fn hash_password(plain: &str) -> Result<String, VaultError> {
    let salt = SaltString::generate(&mut SaltRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|h| h.to_string())
        .map_err(|e| VaultError::Hash(e.to_string()))
}

/// Verify a password against a stored hash. Unparseable hashes (including
/// the SSO sentinel) verify as false.
pub fn verify_password(plain: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(plain.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    }
}

/// Burn the same KDF work as a real verification. Called when the user does
/// not exist so login latency does not leak account existence.
pub fn dummy_password_verification(candidate: &str) {
    static DUMMY_HASH: OnceLock<String> = OnceLock::new();
    let hash = DUMMY_HASH.get_or_init(|| {
        hash_password("phoenix-dummy-password").expect("static dummy hash")
    });
    let _ = verify_password(candidate, hash);
}

/// URL-safe random token from the OS CSPRNG.
pub fn random_token(n_bytes: usize) -> String {
    let mut bytes = vec![0u8; n_bytes];
    OsRng.fill_bytes(&mut bytes);
    base64::encode_config(bytes, base64::URL_SAFE_NO_PAD)
}

/// Generate one backup code, e.g. `K7QH-29PM-XA4D-W8RT`.
pub fn backup_code_generate() -> String {
    let mut rng = rand::thread_rng();
    let mut groups = Vec::with_capacity(BACKUP_CODE_GROUPS);
    for _ in 0..BACKUP_CODE_GROUPS {
        let group: String = (0..BACKUP_CODE_GROUP_LEN)
            .map(|_| BACKUP_CODE_CHARSET[rng.gen_range(0..BACKUP_CODE_CHARSET.len())] as char)
            .collect();
        groups.push(group);
    }
    groups.join("-")
}

/// SHA-256 hex of the normalized code. Distinct from the password KDF on
/// purpose: the plaintext already carries 80+ bits of randomness.
pub fn backup_code_hash(plain: &str) -> String {
    let normalized = plain.to_uppercase().replace('-', "");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn backup_code_verify(plain: &str, stored_hash: &str) -> bool {
    backup_code_hash(plain) == stored_hash
}

/// SHA-256 hex of an opaque token, for reset tokens stored hashed at rest.
pub fn token_hash(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}
