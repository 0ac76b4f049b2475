//! Tablespace-key re-wrap used while copying page 0 of an encrypted file
//! during `PageCopy`: the source-side key is unwrapped under
//! the snapshot's transfer key and re-wrapped under the destination's
//! master key before `wrapped_key`/`wrapped_iv` ever leave the source.

use anyhow::Context;
use ck_api_types::{CloneError, EncryptionMetadata};
use openssl::rand::rand_bytes;
use openssl::symm::{Cipher, Crypter, Mode};

const AES_KEY_LEN: usize = 32;
const AES_IV_LEN: usize = 16;

/// Wraps `tablespace_key` under `master_key` using AES-256-CTR, the same
/// cipher construction the datastore's chunk/blob encryption already
/// relies on. Returns encryption metadata ready to embed in a
/// FILE_METADATA descriptor.
pub fn wrap_tablespace_key(
    master_key: &[u8; AES_KEY_LEN],
    key_version: u32,
    tablespace_key: &[u8],
    iv: &[u8; AES_IV_LEN],
) -> anyhow::Result<EncryptionMetadata> {
    let cipher = Cipher::aes_256_ctr();
    let mut crypter = Crypter::new(cipher, Mode::Encrypt, master_key, Some(iv))
        .context("initializing AES-256-CTR for tablespace key wrap")?;
    let mut wrapped = vec![0u8; tablespace_key.len() + cipher.block_size()];
    let mut count = crypter
        .update(tablespace_key, &mut wrapped)
        .context("wrapping tablespace key")?;
    count += crypter.finalize(&mut wrapped[count..])?;
    wrapped.truncate(count);

    Ok(EncryptionMetadata {
        encrypted: true,
        key_version,
        wrapped_key: wrapped,
        wrapped_iv: iv.to_vec(),
    })
}

/// Inverse of [`wrap_tablespace_key`], run on the destination side once
/// `FILE_METADATA` has been applied.
pub fn unwrap_tablespace_key(
    master_key: &[u8; AES_KEY_LEN],
    meta: &EncryptionMetadata,
) -> anyhow::Result<Vec<u8>> {
    if !meta.encrypted {
        return Err(CloneError::Internal(
            "unwrap_tablespace_key called on unencrypted metadata".into(),
        )
        .into());
    }
    let iv: [u8; AES_IV_LEN] = meta
        .wrapped_iv
        .as_slice()
        .try_into()
        .map_err(|_| CloneError::InvalidDescriptor("wrapped_iv has the wrong length".into()))?;

    let cipher = Cipher::aes_256_ctr();
    let mut crypter = Crypter::new(cipher, Mode::Decrypt, master_key, Some(&iv))
        .context("initializing AES-256-CTR for tablespace key unwrap")?;
    let mut out = vec![0u8; meta.wrapped_key.len() + cipher.block_size()];
    let mut count = crypter
        .update(&meta.wrapped_key, &mut out)
        .context("unwrapping tablespace key")?;
    count += crypter.finalize(&mut out[count..])?;
    out.truncate(count);
    Ok(out)
}

/// Short fingerprint of a key for log lines, so the real key material
/// never itself reaches a log file.
pub fn key_fingerprint(key: &[u8]) -> String {
    let digest = openssl::sha::sha256(key);
    hex::encode(&digest[..4])
}

/// Re-wraps an encrypted tablespace's key for the destination while page 0
/// crosses the wire during `PageCopy`: unwraps under the
/// source's local master key, then wraps a freshly generated IV under the
/// destination's master key. Unencrypted metadata passes through unchanged.
pub fn reencrypt_for_destination(
    meta: &EncryptionMetadata,
    local_master_key: &[u8; AES_KEY_LEN],
    dest_master_key: &[u8; AES_KEY_LEN],
    dest_key_version: u32,
) -> anyhow::Result<EncryptionMetadata> {
    if !meta.encrypted {
        return Ok(EncryptionMetadata::none());
    }
    let tablespace_key = unwrap_tablespace_key(local_master_key, meta)?;
    let mut iv = [0u8; AES_IV_LEN];
    rand_bytes(&mut iv).context("generating fresh IV for destination key wrap")?;
    wrap_tablespace_key(dest_master_key, dest_key_version, &tablespace_key, &iv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_then_unwrap_recovers_original_key() {
        let master_key = [7u8; AES_KEY_LEN];
        let iv = [3u8; AES_IV_LEN];
        let tablespace_key = b"0123456789abcdef0123456789abcdef".to_vec();

        let wrapped = wrap_tablespace_key(&master_key, 1, &tablespace_key, &iv).unwrap();
        assert!(wrapped.encrypted);

        let recovered = unwrap_tablespace_key(&master_key, &wrapped).unwrap();
        assert_eq!(recovered, tablespace_key);
    }

    #[test]
    fn key_fingerprint_is_stable_and_short() {
        let a = key_fingerprint(b"some-key-material");
        let b = key_fingerprint(b"some-key-material");
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn reencrypt_for_destination_preserves_the_tablespace_key() {
        let local_key = [1u8; AES_KEY_LEN];
        let dest_key = [2u8; AES_KEY_LEN];
        let tablespace_key = b"0123456789abcdef0123456789abcdef".to_vec();
        let iv = [9u8; AES_IV_LEN];

        let source_meta = wrap_tablespace_key(&local_key, 1, &tablespace_key, &iv).unwrap();
        let dest_meta = reencrypt_for_destination(&source_meta, &local_key, &dest_key, 2).unwrap();

        assert!(dest_meta.encrypted);
        assert_eq!(dest_meta.key_version, 2);
        assert_ne!(dest_meta.wrapped_key, source_meta.wrapped_key);
        assert_eq!(
            unwrap_tablespace_key(&dest_key, &dest_meta).unwrap(),
            tablespace_key
        );
    }

    #[test]
    fn reencrypt_for_destination_passes_through_unencrypted_metadata() {
        let local_key = [1u8; AES_KEY_LEN];
        let dest_key = [2u8; AES_KEY_LEN];
        let meta = EncryptionMetadata::none();
        let dest_meta = reencrypt_for_destination(&meta, &local_key, &dest_key, 1).unwrap();
        assert!(!dest_meta.encrypted);
    }
}
