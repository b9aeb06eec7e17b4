//! Keyring gateway for the receiver's long-term key.
//!
//! The keyring holds one identity: an ed25519 signing key used for detached
//! signatures on registration and report payloads, and an x25519 key used to
//! open messages delivered over the satellite broadcast. The secret material
//! is stored encrypted at rest (ChaCha20-Poly1305 under an Argon2id-derived
//! key) and unlocked into process memory only; the passphrase itself never
//! leaves this module.
//!
//! Broadcast messages use an ECIES-style envelope:
//!
//! ```text
//! eph_pk(32) || nonce(12) || ciphertext+tag
//! key = blake3::derive_key(context, shared_secret || eph_pk || recipient_pk)
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

const ENVELOPE_KEY_CONTEXT: &str = "satmon v1 broadcast envelope key";
const KEYFILE_KEY_CONTEXT: &str = "satmon v1 keyfile encryption key";

const SALT_SIZE: usize = 16;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Result type alias for keyring operations
pub type KeyringResult<T> = Result<T, KeyringError>;

/// Errors that can occur while operating the keyring
#[derive(Debug)]
pub enum KeyringError {
    /// The passphrase failed to decrypt the secret material
    BadPassphrase,

    /// An operation requiring secrets was attempted before unlock
    Locked,

    /// The key file or an envelope could not be parsed
    Malformed(String),

    /// A cryptographic primitive failed
    Crypto(String),

    /// I/O error (file access, permissions)
    Io(std::io::Error),
}

impl fmt::Display for KeyringError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyringError::BadPassphrase => write!(f, "incorrect keyring passphrase"),
            KeyringError::Locked => write!(f, "keyring is locked"),
            KeyringError::Malformed(msg) => write!(f, "malformed keyring data: {}", msg),
            KeyringError::Crypto(msg) => write!(f, "crypto failure: {}", msg),
            KeyringError::Io(err) => write!(f, "I/O error: {}", err),
        }
    }
}

impl std::error::Error for KeyringError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            KeyringError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for KeyringError {
    fn from(err: std::io::Error) -> Self {
        KeyringError::Io(err)
    }
}

/// On-disk key file layout
#[derive(Debug, Serialize, Deserialize)]
struct KeyFile {
    fingerprint: String,
    signing_public_key: String,
    decryption_public_key: String,
    salt: String,
    nonce: String,
    secret: String,
}

struct Secrets {
    signing: ed25519_dalek::SigningKey,
    decryption: x25519_dalek::StaticSecret,
}

/// Gateway over the receiver's long-term key.
pub struct Keyring {
    path: PathBuf,
    fingerprint: String,
    signing_public: ed25519_dalek::VerifyingKey,
    decryption_public: x25519_dalek::PublicKey,
    salt: [u8; SALT_SIZE],
    nonce: [u8; NONCE_SIZE],
    encrypted_secret: Vec<u8>,
    secrets: Option<Secrets>,
}

impl Keyring {
    /// Load an existing key file. The keyring starts locked.
    pub fn load(path: &Path) -> KeyringResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: KeyFile = serde_json::from_str(&content)
            .map_err(|e| KeyringError::Malformed(e.to_string()))?;

        let signing_public = ed25519_dalek::VerifyingKey::from_bytes(&decode_hex32(
            &file.signing_public_key,
            "signing_public_key",
        )?)
        .map_err(|e| KeyringError::Malformed(e.to_string()))?;
        let decryption_public = x25519_dalek::PublicKey::from(decode_hex32(
            &file.decryption_public_key,
            "decryption_public_key",
        )?);

        let salt: [u8; SALT_SIZE] = hex::decode(&file.salt)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| KeyringError::Malformed("bad salt".to_string()))?;
        let nonce: [u8; NONCE_SIZE] = hex::decode(&file.nonce)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| KeyringError::Malformed("bad nonce".to_string()))?;

        use base64::Engine;
        let encrypted_secret = base64::engine::general_purpose::STANDARD
            .decode(&file.secret)
            .map_err(|e| KeyringError::Malformed(e.to_string()))?;

        Ok(Self {
            path: path.to_path_buf(),
            fingerprint: file.fingerprint,
            signing_public,
            decryption_public,
            salt,
            nonce,
            encrypted_secret,
            secrets: None,
        })
    }

    /// Generate a fresh keypair and write the key file. Used on first-time
    /// setups; the returned keyring is already unlocked.
    pub fn generate(path: &Path, passphrase: &str) -> KeyringResult<Self> {
        let signing = ed25519_dalek::SigningKey::generate(&mut OsRng);
        let mut x_secret = [0u8; 32];
        OsRng.fill_bytes(&mut x_secret);
        let decryption = x25519_dalek::StaticSecret::from(x_secret);

        let signing_public = signing.verifying_key();
        let decryption_public = x25519_dalek::PublicKey::from(&decryption);
        let fingerprint = fingerprint_of(&signing_public);

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let mut nonce = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce);

        let mut plaintext = Zeroizing::new([0u8; 64]);
        plaintext[..32].copy_from_slice(&signing.to_bytes());
        plaintext[32..].copy_from_slice(decryption.as_bytes());

        let key = derive_file_key(passphrase, &salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let encrypted_secret = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
            .map_err(|e| KeyringError::Crypto(e.to_string()))?;

        use base64::Engine;
        let file = KeyFile {
            fingerprint: fingerprint.clone(),
            signing_public_key: hex::encode(signing_public.as_bytes()),
            decryption_public_key: hex::encode(decryption_public.as_bytes()),
            salt: hex::encode(salt),
            nonce: hex::encode(nonce),
            secret: base64::engine::general_purpose::STANDARD.encode(&encrypted_secret),
        };

        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
            restrict_permissions(dir, 0o700)?;
        }
        let content = serde_json::to_string_pretty(&file)
            .map_err(|e| KeyringError::Malformed(e.to_string()))?;
        std::fs::write(path, content)?;
        restrict_permissions(path, 0o600)?;

        info!("generated receiver key {fingerprint}");

        Ok(Self {
            path: path.to_path_buf(),
            fingerprint,
            signing_public,
            decryption_public,
            salt,
            nonce,
            encrypted_secret,
            secrets: Some(Secrets {
                signing,
                decryption,
            }),
        })
    }

    /// Verify the passphrase and cache the unlocked secrets for the process
    /// lifetime. The verification makes a throwaway signature and checks it
    /// against the stored public key.
    pub fn unlock(&mut self, passphrase: &str) -> KeyringResult<()> {
        if self.secrets.is_some() {
            debug!("keyring already unlocked");
            return Ok(());
        }

        let key = derive_file_key(passphrase, &self.salt)?;
        let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&self.nonce), self.encrypted_secret.as_slice())
                .map_err(|_| KeyringError::BadPassphrase)?,
        );

        if plaintext.len() != 64 {
            return Err(KeyringError::Malformed(
                "unexpected secret material length".to_string(),
            ));
        }

        let seed: [u8; 32] = plaintext[..32]
            .try_into()
            .map_err(|_| KeyringError::Malformed("bad seed".to_string()))?;
        let x_secret: [u8; 32] = plaintext[32..]
            .try_into()
            .map_err(|_| KeyringError::Malformed("bad decryption secret".to_string()))?;

        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        if signing.verifying_key() != self.signing_public {
            return Err(KeyringError::BadPassphrase);
        }

        let probe = signing.sign(b"throwaway");
        self.signing_public
            .verify(b"throwaway", &probe)
            .map_err(|e| KeyringError::Crypto(e.to_string()))?;

        self.secrets = Some(Secrets {
            signing,
            decryption: x25519_dalek::StaticSecret::from(x_secret),
        });

        debug!("keyring {} unlocked", self.fingerprint);
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.secrets.is_some()
    }

    /// Stable identifier of the key: the first 20 bytes of the blake3 hash
    /// of the signing public key, upper-hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Hex encoding of the signing public key, as submitted at enrollment.
    pub fn public_key(&self) -> String {
        hex::encode(self.signing_public.as_bytes())
    }

    pub fn decryption_public_key(&self) -> [u8; 32] {
        *self.decryption_public.as_bytes()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Detached signature over `data` with the long-term key.
    pub fn sign(&self, data: &[u8]) -> KeyringResult<ed25519_dalek::Signature> {
        let secrets = self.secrets.as_ref().ok_or(KeyringError::Locked)?;
        Ok(secrets.signing.sign(data))
    }

    /// Detached signature, base64-encoded for JSON transport.
    pub fn sign_b64(&self, data: &[u8]) -> KeyringResult<String> {
        use base64::Engine;
        let sig = self.sign(data)?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sig.to_bytes()))
    }

    /// Open a broadcast envelope addressed to this key.
    pub fn decrypt(&self, data: &[u8]) -> KeyringResult<Vec<u8>> {
        let secrets = self.secrets.as_ref().ok_or(KeyringError::Locked)?;

        if data.len() < 32 + NONCE_SIZE + TAG_SIZE {
            return Err(KeyringError::Malformed("envelope too short".to_string()));
        }

        let eph_pk: [u8; 32] = data[..32]
            .try_into()
            .map_err(|_| KeyringError::Malformed("bad ephemeral key".to_string()))?;
        let nonce = &data[32..32 + NONCE_SIZE];
        let ciphertext = &data[32 + NONCE_SIZE..];

        let shared = secrets
            .decryption
            .diffie_hellman(&x25519_dalek::PublicKey::from(eph_pk));
        let key = derive_envelope_key(shared.as_bytes(), &eph_pk, self.decryption_public.as_bytes());

        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &eph_pk,
                },
            )
            .map_err(|e| KeyringError::Crypto(e.to_string()))
    }
}

/// Seal a broadcast envelope to a recipient's x25519 public key.
///
/// The counterpart of [`Keyring::decrypt`]; the registry side of the
/// satellite link performs the same construction.
pub fn encrypt_to(recipient_pk: &[u8; 32], plaintext: &[u8]) -> KeyringResult<Vec<u8>> {
    let mut eph_secret = [0u8; 32];
    OsRng.fill_bytes(&mut eph_secret);
    let eph = x25519_dalek::StaticSecret::from(eph_secret);
    let eph_pk = x25519_dalek::PublicKey::from(&eph);

    let shared = eph.diffie_hellman(&x25519_dalek::PublicKey::from(*recipient_pk));
    let key = derive_envelope_key(shared.as_bytes(), eph_pk.as_bytes(), recipient_pk);

    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext,
                aad: eph_pk.as_bytes(),
            },
        )
        .map_err(|e| KeyringError::Crypto(e.to_string()))?;

    let mut out = Vec::with_capacity(32 + NONCE_SIZE + ciphertext.len());
    out.extend_from_slice(eph_pk.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Verify a detached signature against a hex-encoded public key.
pub fn verify_detached(public_key_hex: &str, data: &[u8], signature_b64: &str) -> bool {
    use base64::Engine;

    let Ok(pk_bytes) = hex::decode(public_key_hex) else {
        return false;
    };
    let pk_bytes: [u8; 32] = match pk_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let Ok(public) = ed25519_dalek::VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = base64::engine::general_purpose::STANDARD.decode(signature_b64) else {
        return false;
    };
    let sig_bytes: [u8; 64] = match sig_bytes.try_into() {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };
    let signature = ed25519_dalek::Signature::from_bytes(&sig_bytes);
    public.verify(data, &signature).is_ok()
}

fn fingerprint_of(public: &ed25519_dalek::VerifyingKey) -> String {
    let digest = blake3::hash(public.as_bytes());
    hex::encode_upper(&digest.as_bytes()[..20])
}

fn derive_file_key(passphrase: &str, salt: &[u8]) -> KeyringResult<Zeroizing<[u8; 32]>> {
    let params = Params::new(65536, 3, 1, Some(32))
        .map_err(|e| KeyringError::Crypto(e.to_string()))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut stretched = Zeroizing::new([0u8; 32]);
    argon2
        .hash_password_into(passphrase.as_bytes(), salt, stretched.as_mut_slice())
        .map_err(|e| KeyringError::Crypto(e.to_string()))?;

    // A final domain-separated derivation keeps the file key distinct from
    // any other use of the same passphrase.
    Ok(Zeroizing::new(blake3::derive_key(
        KEYFILE_KEY_CONTEXT,
        stretched.as_slice(),
    )))
}

fn derive_envelope_key(shared: &[u8; 32], eph_pk: &[u8; 32], recipient_pk: &[u8; 32]) -> [u8; 32] {
    let mut material = Vec::with_capacity(96);
    material.extend_from_slice(shared);
    material.extend_from_slice(eph_pk);
    material.extend_from_slice(recipient_pk);
    blake3::derive_key(ENVELOPE_KEY_CONTEXT, &material)
}

fn decode_hex32(value: &str, what: &str) -> KeyringResult<[u8; 32]> {
    hex::decode(value)
        .ok()
        .and_then(|v| v.try_into().ok())
        .ok_or_else(|| KeyringError::Malformed(format!("bad {what}")))
}

#[cfg(unix)]
fn restrict_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
