//! Checksum hashing and bundle payload decryption.
//!
//! Downloads are verified with SHA-256. When the update service encrypts a
//! bundle it sends a per-download session key of the form
//! `"<iv base64>:<wrapped key base64>"`: the AES key is wrapped with the RSA
//! key pair whose public half is configured on the device. Unwrapping is a
//! raw public-key operation followed by a PKCS#1 v1.5 padding strip; the
//! unwrapped key then drives AES-CBC over the payload and, optionally, over
//! the checksum field itself.

use std::path::Path;

use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, KeyIvInit};
use base64::Engine;
use rsa::traits::PublicKeyParts;
use rsa::{BigUint, RsaPublicKey};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::error::{Result, UpdateError};
use crate::store::BUILTIN_ID;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const AES_IV_SIZE: usize = 16;

/// Holds the optionally configured RSA public key.
#[derive(Debug, Default)]
pub struct Crypto {
    public_key: Option<RsaPublicKey>,
    key_id: Option<String>,
}

impl Crypto {
    /// Parse the configured PEM public key, accepting both SPKI
    /// (`BEGIN PUBLIC KEY`) and PKCS#1 (`BEGIN RSA PUBLIC KEY`) armor.
    pub fn new(public_key_pem: Option<&str>) -> Result<Self> {
        let Some(pem) = public_key_pem else {
            return Ok(Self::default());
        };

        use rsa::pkcs1::DecodeRsaPublicKey;
        use rsa::pkcs8::DecodePublicKey;

        let key = RsaPublicKey::from_public_key_pem(pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
            .map_err(|e| UpdateError::DecryptionFailed(format!("invalid public key: {e}")))?;

        Ok(Self {
            public_key: Some(key),
            key_id: derive_key_id(pem),
        })
    }

    /// Identifier of the configured verifier key, if any.
    pub fn key_id(&self) -> Option<&str> {
        self.key_id.as_deref()
    }

    /// Attempt to decrypt a base64 checksum field with the session key.
    ///
    /// Returns `None` on any format error; the caller then uses the raw
    /// field verbatim as the expected digest.
    pub fn decrypt_checksum(&self, encrypted_b64: &str, session_key: &str) -> Option<String> {
        let (iv, key) = self.unwrap_session_key(session_key).ok()?;
        let cipher_text = base64::engine::general_purpose::STANDARD
            .decode(encrypted_b64)
            .ok()?;
        let plain = aes_cbc_decrypt(&key, &iv, &cipher_text).ok()?;
        String::from_utf8(plain).ok()
    }

    /// Decrypt a downloaded payload in place.
    pub async fn decrypt_file(&self, path: &Path, session_key: &str) -> Result<()> {
        let (iv, key) = self.unwrap_session_key(session_key)?;
        let cipher_text = fs::read(path).await?;
        let plain = aes_cbc_decrypt(&key, &iv, &cipher_text)?;

        let tmp = path.with_extension("dec.tmp");
        fs::write(&tmp, plain).await?;
        fs::rename(&tmp, path).await?;

        debug!(path = %path.display(), "Payload decrypted");
        Ok(())
    }

    /// Split `"<iv b64>:<wrapped key b64>"` and unwrap the AES key with the
    /// configured public key.
    fn unwrap_session_key(&self, session_key: &str) -> Result<(Vec<u8>, Vec<u8>)> {
        let public_key = self
            .public_key
            .as_ref()
            .ok_or_else(|| UpdateError::DecryptionFailed("no public key configured".into()))?;

        let (iv_b64, key_b64) = session_key
            .split_once(':')
            .ok_or_else(|| UpdateError::DecryptionFailed("malformed session key".into()))?;

        let engine = base64::engine::general_purpose::STANDARD;
        let iv = engine
            .decode(iv_b64)
            .map_err(|e| UpdateError::DecryptionFailed(format!("bad session iv: {e}")))?;
        if iv.len() != AES_IV_SIZE {
            return Err(UpdateError::DecryptionFailed(format!(
                "session iv must be {AES_IV_SIZE} bytes, got {}",
                iv.len()
            )));
        }

        let wrapped = engine
            .decode(key_b64)
            .map_err(|e| UpdateError::DecryptionFailed(format!("bad wrapped key: {e}")))?;
        let key = public_decrypt(public_key, &wrapped)?;

        Ok((iv, key))
    }
}

/// Raw RSA public-key operation plus PKCS#1 v1.5 padding strip.
///
/// The service wraps session keys with its private key, so recovering the
/// plaintext is `c^e mod n` followed by removing the `00 || BT || PS || 00`
/// prefix.
fn public_decrypt(key: &RsaPublicKey, cipher_text: &[u8]) -> Result<Vec<u8>> {
    let c = BigUint::from_bytes_be(cipher_text);
    let m = rsa::hazmat::rsa_encrypt(key, &c)
        .map_err(|e| UpdateError::DecryptionFailed(format!("rsa operation failed: {e}")))?;

    let k = key.size();
    let bytes = m.to_bytes_be();
    if bytes.len() > k {
        return Err(UpdateError::DecryptionFailed("rsa output too large".into()));
    }
    // Left-pad to the modulus size; leading zeros are dropped by BigUint.
    let mut em = vec![0u8; k - bytes.len()];
    em.extend_from_slice(&bytes);

    if em.len() < 11 || em[0] != 0x00 || (em[1] != 0x01 && em[1] != 0x02) {
        return Err(UpdateError::DecryptionFailed("bad key padding".into()));
    }
    let sep = em[2..]
        .iter()
        .position(|&b| b == 0x00)
        .ok_or_else(|| UpdateError::DecryptionFailed("bad key padding".into()))?;
    if sep < 8 {
        return Err(UpdateError::DecryptionFailed("bad key padding".into()));
    }
    Ok(em[2 + sep + 1..].to_vec())
}

fn aes_cbc_decrypt(key: &[u8], iv: &[u8], cipher_text: &[u8]) -> Result<Vec<u8>> {
    let bad_len =
        |e: aes::cipher::InvalidLength| UpdateError::DecryptionFailed(format!("bad key/iv: {e}"));
    let bad_pad = |_| UpdateError::DecryptionFailed("bad padding".into());

    match key.len() {
        16 => Aes128CbcDec::new_from_slices(key, iv)
            .map_err(bad_len)?
            .decrypt_padded_vec_mut::<Pkcs7>(cipher_text)
            .map_err(bad_pad),
        32 => Aes256CbcDec::new_from_slices(key, iv)
            .map_err(bad_len)?
            .decrypt_padded_vec_mut::<Pkcs7>(cipher_text)
            .map_err(bad_pad),
        n => Err(UpdateError::DecryptionFailed(format!(
            "unsupported session key length {n}"
        ))),
    }
}

/// SHA-256 digest of a file, streamed in 64 KiB chunks.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compare a file's digest against an expected hex digest in constant time.
pub async fn verify_file(path: &Path, expected: &str) -> Result<bool> {
    let actual = hash_file(path).await?;
    Ok(constant_time_eq(actual.as_bytes(), expected.as_bytes()))
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Decompress if the input is a valid Brotli stream, else return it as-is.
pub fn try_decompress_brotli(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut reader = brotli::Decompressor::new(bytes, 4096);
    match std::io::Read::read_to_end(&mut reader, &mut out) {
        Ok(_) => out,
        Err(_) => bytes.to_vec(),
    }
}

/// Fresh opaque bundle id.
pub fn generate_bundle_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Identifier of a PEM public key: armor and whitespace stripped, first 20
/// characters of the body. `None` when nothing remains.
pub fn derive_key_id(pem: &str) -> Option<String> {
    let body: String = pem
        .lines()
        .filter(|line| !line.trim_start().starts_with("-----"))
        .collect::<Vec<_>>()
        .join("")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();

    if body.is_empty() {
        return None;
    }
    Some(body.chars().take(20).collect())
}
