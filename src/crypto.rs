// TechCodex Cloud shared cryptographic primitives
// Argon2id key derivation + AES-256-GCM authenticated encryption
// Used by the credential store's encrypted vault backend

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use argon2::Argon2;

pub const ARGON2_MEM_COST: u32 = 65536; // 64MB
pub const ARGON2_TIME_COST: u32 = 3;
pub const ARGON2_PARALLELISM: u32 = 4;

/// Derive a 256-bit key from a secret + salt using Argon2id
pub fn derive_key(secret: &str, salt: &[u8]) -> Result<[u8; 32], String> {
    let params = argon2::Params::new(
        ARGON2_MEM_COST,
        ARGON2_TIME_COST,
        ARGON2_PARALLELISM,
        Some(32),
    )
    .map_err(|e| format!("Argon2 params: {}", e))?;

    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let mut key = [0u8; 32];
    argon2
        .hash_password_into(secret.as_bytes(), salt, &mut key)
        .map_err(|e| format!("Argon2 derive: {}", e))?;
    Ok(key)
}

/// Encrypt plaintext using AES-256-GCM
pub fn encrypt_aes_gcm(key: &[u8; 32], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(nonce);
    cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| format!("AES-GCM encrypt: {}", e))
}

/// Decrypt ciphertext using AES-256-GCM
pub fn decrypt_aes_gcm(key: &[u8; 32], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, String> {
    let cipher = Aes256Gcm::new(GenericArray::from_slice(key));
    let nonce = GenericArray::from_slice(nonce);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| format!("AES-GCM decrypt: {}", e))
}

/// Generate cryptographically secure random bytes using OS entropy
pub fn random_bytes(len: usize) -> Vec<u8> {
    use rand::rngs::OsRng;
    use rand::RngCore;
    let mut buf = vec![0u8; len];
    OsRng.fill_bytes(&mut buf);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let salt = random_bytes(32);
        let key = derive_key("master password", &salt).unwrap();
        let nonce = random_bytes(12);

        let ciphertext = encrypt_aes_gcm(&key, &nonce, b"token material").unwrap();
        assert_ne!(ciphertext, b"token material");

        let plaintext = decrypt_aes_gcm(&key, &nonce, &ciphertext).unwrap();
        assert_eq!(plaintext, b"token material");
    }

    #[test]
    fn test_wrong_key_fails_decryption() {
        let salt = random_bytes(32);
        let key = derive_key("correct", &salt).unwrap();
        let other = derive_key("incorrect", &salt).unwrap();
        let nonce = random_bytes(12);

        let ciphertext = encrypt_aes_gcm(&key, &nonce, b"secret").unwrap();
        assert!(decrypt_aes_gcm(&other, &nonce, &ciphertext).is_err());
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let salt = vec![7u8; 32];
        assert_eq!(
            derive_key("pw", &salt).unwrap(),
            derive_key("pw", &salt).unwrap()
        );
    }
}
