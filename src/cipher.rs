//! Stream cipher registry.
//!
//! Obfuscation methods reference their session ciphers by name. The registry
//! maps those names to descriptors carrying the key/IV geometry and a
//! constructor, so callers can size key material before building a stream.
//! It is populated once at startup and only read afterwards.

use std::collections::HashMap;

use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit as _};
use aes::Aes128;
use chacha20::cipher::{KeyIvInit as _, StreamCipher as _};
use chacha20::{ChaCha20, ChaCha20Legacy};
use rc4::{consts::U16, Rc4};

use crate::error::Error;

/// Whether a stream is created for the sealing or the opening side.
///
/// Pure keystream ciphers behave identically in both directions; the
/// block-chaining entry needs to know which way it runs.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Plaintext in, ciphertext out.
    Encrypt,
    /// Ciphertext in, plaintext out.
    Decrypt,
}

/// A stateful byte-stream transform produced by the registry.
pub trait StreamCipher: Send {
    /// Transforms `data` in place, advancing the internal keystream.
    fn xor_key_stream(&mut self, data: &mut [u8]);
}

type StreamCtor = fn(&[u8], &[u8], Direction) -> Box<dyn StreamCipher>;

/// Key and IV geometry for a named cipher, plus its stream constructor.
#[derive(Clone)]
pub struct CipherDescriptor {
    name: &'static str,
    key_len: usize,
    iv_len: usize,
    ctor: StreamCtor,
}

impl CipherDescriptor {
    /// Builds a descriptor for [`CipherRegistry::register`].
    pub fn new(name: &'static str, key_len: usize, iv_len: usize, ctor: StreamCtor) -> Self {
        Self {
            name,
            key_len,
            iv_len,
            ctor,
        }
    }

    /// The registered cipher name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Required key length in bytes.
    pub fn key_len(&self) -> usize {
        self.key_len
    }

    /// Required IV length in bytes.
    pub fn iv_len(&self) -> usize {
        self.iv_len
    }

    /// Creates a stream after validating key and IV lengths.
    pub fn new_stream(
        &self,
        key: &[u8],
        iv: &[u8],
        direction: Direction,
    ) -> Result<Box<dyn StreamCipher>, Error> {
        if key.len() != self.key_len {
            return Err(Error::InvalidKeyMaterial {
                name: self.name,
                what: "key",
                expected: self.key_len,
                got: key.len(),
            });
        }
        if iv.len() != self.iv_len {
            return Err(Error::InvalidKeyMaterial {
                name: self.name,
                what: "iv",
                expected: self.iv_len,
                got: iv.len(),
            });
        }
        Ok((self.ctor)(key, iv, direction))
    }
}

/// Write-once name-to-descriptor table. `&self` lookups only, so a single
/// instance can be shared across connection tasks.
#[derive(Clone, Default)]
pub struct CipherRegistry {
    ciphers: HashMap<&'static str, CipherDescriptor>,
}

impl CipherRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the ciphers the protocol family uses.
    pub fn with_builtin() -> Self {
        let mut r = Self::new();
        r.register(CipherDescriptor::new("none", 16, 0, new_none));
        r.register(CipherDescriptor::new("rc4", 16, 0, new_rc4));
        r.register(CipherDescriptor::new("aes-128-cbc", 16, 16, new_aes128_cbc));
        r.register(CipherDescriptor::new("chacha20", 32, 8, new_chacha20_legacy));
        r.register(CipherDescriptor::new("chacha20-ietf", 32, 12, new_chacha20_ietf));
        r
    }

    /// Adds or replaces a descriptor. Intended to run during startup,
    /// before the registry is shared.
    pub fn register(&mut self, descriptor: CipherDescriptor) {
        self.ciphers.insert(descriptor.name, descriptor);
    }

    /// Looks up a descriptor by name.
    pub fn lookup(&self, name: &str) -> Result<&CipherDescriptor, Error> {
        self.ciphers.get(name).ok_or_else(|| Error::UnsupportedCipher {
            name: name.to_string(),
        })
    }

    /// Convenience for `lookup(name)?.new_stream(..)`.
    pub fn new_stream(
        &self,
        name: &str,
        key: &[u8],
        iv: &[u8],
        direction: Direction,
    ) -> Result<Box<dyn StreamCipher>, Error> {
        self.lookup(name)?.new_stream(key, iv, direction)
    }
}

struct NoneCipher;

impl StreamCipher for NoneCipher {
    fn xor_key_stream(&mut self, _data: &mut [u8]) {}
}

fn new_none(_key: &[u8], _iv: &[u8], _direction: Direction) -> Box<dyn StreamCipher> {
    Box::new(NoneCipher)
}

struct Rc4Cipher(Rc4<U16>);

impl StreamCipher for Rc4Cipher {
    fn xor_key_stream(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

fn new_rc4(key: &[u8], _iv: &[u8], _direction: Direction) -> Box<dyn StreamCipher> {
    Box::new(Rc4Cipher(Rc4::new(rc4::Key::<U16>::from_slice(key))))
}

/// RC4 keystream over a 16-byte key, for methods that derive the key
/// themselves rather than going through a registry instance.
pub(crate) fn rc4_stream(key: &[u8]) -> Box<dyn StreamCipher> {
    new_rc4(key, &[], Direction::Encrypt)
}

struct ChaCha20Ietf(ChaCha20);

impl StreamCipher for ChaCha20Ietf {
    fn xor_key_stream(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

fn new_chacha20_ietf(key: &[u8], iv: &[u8], _direction: Direction) -> Box<dyn StreamCipher> {
    Box::new(ChaCha20Ietf(ChaCha20::new(
        chacha20::Key::from_slice(key),
        chacha20::Nonce::from_slice(iv),
    )))
}

struct ChaCha20Original(ChaCha20Legacy);

impl StreamCipher for ChaCha20Original {
    fn xor_key_stream(&mut self, data: &mut [u8]) {
        self.0.apply_keystream(data);
    }
}

fn new_chacha20_legacy(key: &[u8], iv: &[u8], _direction: Direction) -> Box<dyn StreamCipher> {
    Box::new(ChaCha20Original(ChaCha20Legacy::new(
        chacha20::Key::from_slice(key),
        chacha20::LegacyNonce::from_slice(iv),
    )))
}

/// AES-128-CBC with caller-provided IV, chained across calls.
///
/// Input must stay block-aligned; the framing layers only ever feed it
/// whole 16-byte blocks.
struct Aes128CbcCipher {
    cipher: Aes128,
    prev: [u8; 16],
    direction: Direction,
}

impl StreamCipher for Aes128CbcCipher {
    fn xor_key_stream(&mut self, data: &mut [u8]) {
        assert_eq!(data.len() % 16, 0, "aes-128-cbc requires block-aligned input");
        for chunk in data.chunks_exact_mut(16) {
            match self.direction {
                Direction::Encrypt => {
                    for (b, p) in chunk.iter_mut().zip(self.prev.iter()) {
                        *b ^= p;
                    }
                    let block = aes::Block::from_mut_slice(chunk);
                    self.cipher.encrypt_block(block);
                    self.prev.copy_from_slice(chunk);
                }
                Direction::Decrypt => {
                    let saved: [u8; 16] = chunk.try_into().unwrap();
                    let block = aes::Block::from_mut_slice(chunk);
                    self.cipher.decrypt_block(block);
                    for (b, p) in chunk.iter_mut().zip(self.prev.iter()) {
                        *b ^= p;
                    }
                    self.prev = saved;
                }
            }
        }
    }
}

fn new_aes128_cbc(key: &[u8], iv: &[u8], direction: Direction) -> Box<dyn StreamCipher> {
    let mut prev = [0u8; 16];
    prev.copy_from_slice(iv);
    Box::new(Aes128CbcCipher {
        cipher: Aes128::new_from_slice(key).expect("key length validated by descriptor"),
        prev,
        direction,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_unknown_name() {
        let r = CipherRegistry::with_builtin();
        assert!(matches!(
            r.lookup("aes-256-gcm"),
            Err(Error::UnsupportedCipher { .. })
        ));
    }

    #[test]
    fn test_key_material_validated() {
        let r = CipherRegistry::with_builtin();
        let err = r.new_stream("rc4", &[0u8; 8], &[], Direction::Encrypt);
        assert!(matches!(err, Err(Error::InvalidKeyMaterial { .. })));
    }

    #[test]
    fn test_none_is_identity() {
        let r = CipherRegistry::with_builtin();
        let mut s = r
            .new_stream("none", &[0u8; 16], &[], Direction::Encrypt)
            .unwrap();
        let mut data = b"untouched".to_vec();
        s.xor_key_stream(&mut data);
        assert_eq!(&data, b"untouched");
    }

    #[test]
    fn test_keystream_round_trip() {
        let r = CipherRegistry::with_builtin();
        for (name, key_len, iv_len) in
            [("rc4", 16, 0), ("chacha20", 32, 8), ("chacha20-ietf", 32, 12)]
        {
            let key = vec![0x42u8; key_len];
            let iv = vec![0x24u8; iv_len];
            let mut enc = r.new_stream(name, &key, &iv, Direction::Encrypt).unwrap();
            let mut dec = r.new_stream(name, &key, &iv, Direction::Decrypt).unwrap();
            let plaintext = b"the quick brown fox jumps over the lazy dog".to_vec();
            let mut data = plaintext.clone();
            // Split encryption across calls; the keystream must continue.
            s_split(&mut *enc, &mut data);
            assert_ne!(data, plaintext, "{name} produced no keystream");
            dec.xor_key_stream(&mut data);
            assert_eq!(data, plaintext, "{name} round trip failed");
        }
    }

    fn s_split(s: &mut dyn StreamCipher, data: &mut [u8]) {
        let mid = data.len() / 2;
        let (a, b) = data.split_at_mut(mid);
        s.xor_key_stream(a);
        s.xor_key_stream(b);
    }

    #[test]
    fn test_aes_cbc_chains_across_calls() {
        let r = CipherRegistry::with_builtin();
        let key = [7u8; 16];
        let iv = [9u8; 16];
        let mut enc = r
            .new_stream("aes-128-cbc", &key, &iv, Direction::Encrypt)
            .unwrap();
        let mut dec = r
            .new_stream("aes-128-cbc", &key, &iv, Direction::Decrypt)
            .unwrap();
        let plaintext = vec![0x5au8; 48];
        let mut data = plaintext.clone();
        enc.xor_key_stream(&mut data[..16]);
        enc.xor_key_stream(&mut data[16..]);
        // Identical plaintext blocks must not produce identical ciphertext.
        assert_ne!(data[..16], data[16..32]);
        dec.xor_key_stream(&mut data[..32]);
        dec.xor_key_stream(&mut data[32..]);
        assert_eq!(data, plaintext);
    }
}
