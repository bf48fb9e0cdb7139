//! Crypto interface.
//!
//! This module provides the primitive operations shared by the obfuscation
//! methods: keyed digests with truncated tags, the OpenSSL-compatible
//! `EVP_BytesToKey` derivation, and the zero-IV AES-128-CBC transform used
//! to seal handshake headers.

use aes::Aes128;
use cbc::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use sha1::Sha1;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Selects the digest a method variant authenticates with.
///
/// The AES-variant wire format is identical between its two method names;
/// only the digest behind the truncated HMAC tags (and the user-secret hash)
/// differs. Carrying the choice as data keeps a single implementation for
/// both registry entries.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum HashKind {
    /// HMAC-MD5 tags, 16-byte digests.
    Md5,
    /// HMAC-SHA1 tags, 20-byte digests.
    Sha1,
}

impl HashKind {
    /// Digest output length in bytes.
    pub fn digest_len(self) -> usize {
        match self {
            HashKind::Md5 => 16,
            HashKind::Sha1 => 20,
        }
    }

    /// Plain (unkeyed) digest of `data`.
    pub fn hash(self, data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Md5 => Md5::digest(data).to_vec(),
            HashKind::Sha1 => Sha1::digest(data).to_vec(),
        }
    }

    /// Full-length keyed digest of `data`.
    pub fn hmac(self, key: &[u8], data: &[u8]) -> Vec<u8> {
        match self {
            HashKind::Md5 => hmac_md5(key, data).to_vec(),
            HashKind::Sha1 => {
                let mut mac = <Hmac<Sha1> as Mac>::new_from_slice(key)
                    .expect("HMAC accepts keys of any length");
                mac.update(data);
                mac.finalize().into_bytes().to_vec()
            }
        }
    }
}

pub(crate) fn hmac_md5(key: &[u8], data: &[u8]) -> [u8; 16] {
    let mut mac =
        <Hmac<Md5> as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// OpenSSL `EVP_BytesToKey` with MD5 and no salt, as used by the protocol
/// family to turn passwords into cipher keys.
pub(crate) fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len.div_ceil(16) * 16);
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut h = Md5::new();
        h.update(&prev);
        h.update(password);
        prev = h.finalize().to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// Encrypts the 16-byte handshake header block with AES-128-CBC, zero IV,
/// key derived from `password` via [`evp_bytes_to_key`].
pub(crate) fn seal_auth_header(password: &[u8], block: &[u8; 16]) -> [u8; 16] {
    let key = evp_bytes_to_key(password, 16);
    let mut buf = *block;
    Aes128CbcEnc::new_from_slices(&key, &[0u8; 16])
        .expect("AES-128-CBC key and IV lengths are fixed")
        .encrypt_padded_mut::<NoPadding>(&mut buf, 16)
        .expect("a single block never needs padding");
    buf
}

/// Inverse of [`seal_auth_header`].
pub(crate) fn open_auth_header(password: &[u8], block: &[u8; 16]) -> [u8; 16] {
    let key = evp_bytes_to_key(password, 16);
    let mut buf = *block;
    Aes128CbcDec::new_from_slices(&key, &[0u8; 16])
        .expect("AES-128-CBC key and IV lengths are fixed")
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .expect("a cipher-aligned block never fails unpadding");
    buf
}
