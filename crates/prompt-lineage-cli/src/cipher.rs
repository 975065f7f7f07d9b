use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use prompt_lineage_core::{CipherError, CredentialCipher};
use rand::RngCore;

const CREDENTIAL_MAGIC: &[u8] = b"PLCRED1";
const SALT_LEN: usize = 32;
const NONCE_LEN: usize = 24;
const KEY_LEN: usize = 32;

/// Argon2id-derived key plus XChaCha20-Poly1305.
///
/// Sealed layout: `magic | salt | nonce | ciphertext`. The cost parameters are
/// not stored, so sealing and opening MUST use the same ones.
#[derive(Debug, Clone, Copy)]
pub struct PassphraseCipher {
    memory_kib: u32,
    iterations: u32,
    parallelism: u32,
}

impl Default for PassphraseCipher {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

impl PassphraseCipher {
    #[cfg(test)]
    fn with_params(memory_kib: u32, iterations: u32, parallelism: u32) -> Self {
        Self { memory_kib, iterations, parallelism }
    }

    fn derive_key(&self, passphrase: &str, salt: &[u8]) -> Result<[u8; KEY_LEN], CipherError> {
        if passphrase.is_empty() {
            return Err(CipherError::KeyDerivation("passphrase MUST be non-empty".to_string()));
        }
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, Some(KEY_LEN))
            .map_err(|err| CipherError::KeyDerivation(err.to_string()))?;
        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

        let mut key = [0_u8; KEY_LEN];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut key)
            .map_err(|err| CipherError::KeyDerivation(err.to_string()))?;
        Ok(key)
    }
}

impl CredentialCipher for PassphraseCipher {
    fn encrypt(&self, plaintext: &[u8], passphrase: &str) -> Result<Vec<u8>, CipherError> {
        let mut salt = [0_u8; SALT_LEN];
        let mut nonce = [0_u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let key = self.derive_key(passphrase, &salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|err| CipherError::Encryption(err.to_string()))?;

        let mut out =
            Vec::with_capacity(CREDENTIAL_MAGIC.len() + SALT_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(CREDENTIAL_MAGIC);
        out.extend_from_slice(&salt);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, sealed: &[u8], passphrase: &str) -> Result<Vec<u8>, CipherError> {
        let Some(body) = sealed.strip_prefix(CREDENTIAL_MAGIC) else {
            return Err(CipherError::Decryption("sealed credential is missing expected header".to_string()));
        };
        if body.len() <= SALT_LEN + NONCE_LEN {
            return Err(CipherError::Decryption("sealed credential is too short".to_string()));
        }

        let (salt, rest) = body.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        let key = self.derive_key(passphrase, salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        cipher.decrypt(XNonce::from_slice(nonce), ciphertext).map_err(|_| {
            CipherError::Decryption("wrong passphrase or corrupted credential".to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_cipher() -> PassphraseCipher {
        PassphraseCipher::with_params(1024, 1, 1)
    }

    #[test]
    fn sealed_credential_round_trips_with_same_passphrase() {
        let cipher = fast_cipher();
        let sealed = cipher
            .encrypt(b"sk-live-123", "correct horse")
            .unwrap_or_else(|err| panic!("encrypt failed: {err}"));
        assert!(sealed.starts_with(CREDENTIAL_MAGIC));
        assert!(!sealed.windows(11).any(|window| window == b"sk-live-123"));

        let opened = cipher
            .decrypt(&sealed, "correct horse")
            .unwrap_or_else(|err| panic!("decrypt failed: {err}"));
        assert_eq!(opened, b"sk-live-123");
    }

    #[test]
    fn wrong_passphrase_and_tampering_are_rejected() {
        let cipher = fast_cipher();
        let sealed = cipher
            .encrypt(b"secret", "right")
            .unwrap_or_else(|err| panic!("encrypt failed: {err}"));

        assert!(matches!(cipher.decrypt(&sealed, "wrong"), Err(CipherError::Decryption(_))));

        let mut tampered = sealed.clone();
        if let Some(last) = tampered.last_mut() {
            *last ^= 0x01;
        }
        assert!(matches!(cipher.decrypt(&tampered, "right"), Err(CipherError::Decryption(_))));
        assert!(matches!(cipher.decrypt(b"garbage", "right"), Err(CipherError::Decryption(_))));
    }

    #[test]
    fn each_seal_uses_fresh_salt_and_nonce() {
        let cipher = fast_cipher();
        let first = cipher.encrypt(b"same", "pass").unwrap_or_else(|err| panic!("{err}"));
        let second = cipher.encrypt(b"same", "pass").unwrap_or_else(|err| panic!("{err}"));
        assert_ne!(first, second);
    }

    #[test]
    fn empty_passphrase_is_rejected() {
        assert!(matches!(fast_cipher().encrypt(b"x", ""), Err(CipherError::KeyDerivation(_))));
    }
}
