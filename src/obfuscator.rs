//! The obfuscation method capability trait and the method registry.
//!
//! A method implementation is a deterministic state machine over byte
//! slices. The relay owns the sockets: it reads ciphertext, feeds it through
//! the `*_post_decrypt` side, and pushes outgoing payload through the
//! `*_pre_encrypt` side. Methods that authenticate share a process-wide
//! [`ReplayTracker`] by composition; nothing here touches global state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::auth_aes128::AuthAes128;
use crate::auth_chain::AuthChainA;
use crate::config::SessionContext;
use crate::crypto::HashKind;
use crate::error::Error;
use crate::http_simple::HttpSimple;
use crate::plain::Plain;
use crate::replay::ReplayTracker;

/// One obfuscation method bound to one connection.
///
/// The TCP operations are stateful and must be called in transport order.
/// On the server decode path, the second element of the returned pair is
/// the `sendback` flag: when set, the relay should run an (empty)
/// `server_pre_encrypt` pass and flush, so handshake confirmations and
/// keep-alive frames get answered even without upstream payload.
pub trait Obfuscator: Send {
    /// Client TCP encode: wraps outgoing payload, emitting the handshake
    /// in front of the first call's data.
    fn client_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error>;

    /// Client TCP decode of server frames.
    fn client_post_decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error>;

    /// Server TCP encode of outgoing payload.
    fn server_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error>;

    /// Server TCP decode: verifies the handshake, then reassembles frames.
    /// Returns recovered payload and the `sendback` flag.
    fn server_post_decrypt(&mut self, buf: &[u8]) -> Result<(Vec<u8>, bool), Error>;

    /// Client UDP encode. Stateless apart from lazily resolved credentials.
    fn client_udp_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(buf.to_vec())
    }

    /// Client UDP decode. Datagrams that fail authentication collapse to an
    /// empty payload rather than an error.
    fn client_udp_post_decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(buf.to_vec())
    }

    /// Server UDP encode toward `user_id`.
    fn server_udp_pre_encrypt(
        &mut self,
        buf: &[u8],
        _user_id: Option<&[u8; 4]>,
    ) -> Result<Vec<u8>, Error> {
        Ok(buf.to_vec())
    }

    /// Server UDP decode. Returns the payload and the resolved user id,
    /// or an empty payload when authentication fails.
    fn server_udp_post_decrypt(&mut self, buf: &[u8]) -> Result<(Vec<u8>, Option<[u8; 4]>), Error> {
        Ok((buf.to_vec(), None))
    }

    /// Per-frame overhead in bytes the method currently adds.
    fn overhead(&self) -> usize {
        0
    }

    /// Releases the connection's reference in the replay tracker.
    fn dispose(&mut self) {}
}

/// Estimates the length of the plaintext address head at the start of
/// `buf`, falling back to `default` for unknown shapes.
pub(crate) fn head_size(buf: &[u8], default: usize) -> usize {
    if buf.len() < 2 {
        return default;
    }
    match buf[0] & 0x7 {
        1 => 7,
        4 => 19,
        3 => 4 + buf[1] as usize,
        _ => default,
    }
}

type MethodFactory = fn(SessionContext, Arc<ReplayTracker>) -> Box<dyn Obfuscator>;

/// Explicit name-to-factory table, built once at startup.
///
/// The relay resolves the configured method name through [`new_obfuscator`]
/// for every accepted connection, passing the connection's context and the
/// listener's shared tracker.
///
/// [`new_obfuscator`]: MethodRegistry::new_obfuscator
#[derive(Clone, Default)]
pub struct MethodRegistry {
    methods: HashMap<&'static str, MethodFactory>,
}

impl MethodRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with every built-in method.
    pub fn with_builtin() -> Self {
        let mut r = Self::new();
        r.register("plain", new_plain);
        r.register("http_simple", new_http_simple);
        r.register("auth_aes128_md5", new_auth_aes128_md5);
        r.register("auth_aes128_sha1", new_auth_aes128_sha1);
        r.register("auth_chain_a", new_auth_chain_a);
        r
    }

    /// Adds or replaces a method factory.
    pub fn register(&mut self, name: &'static str, factory: MethodFactory) {
        self.methods.insert(name, factory);
    }

    /// Instantiates the named method for one connection.
    pub fn new_obfuscator(
        &self,
        name: &str,
        ctx: SessionContext,
        tracker: Arc<ReplayTracker>,
    ) -> Result<Box<dyn Obfuscator>, Error> {
        let factory = self
            .methods
            .get(name)
            .ok_or_else(|| Error::UnsupportedMethod {
                name: name.to_string(),
            })?;
        Ok(factory(ctx, tracker))
    }
}

fn new_plain(ctx: SessionContext, _tracker: Arc<ReplayTracker>) -> Box<dyn Obfuscator> {
    Box::new(Plain::new(ctx))
}

fn new_http_simple(ctx: SessionContext, _tracker: Arc<ReplayTracker>) -> Box<dyn Obfuscator> {
    Box::new(HttpSimple::new(ctx))
}

fn new_auth_aes128_md5(ctx: SessionContext, tracker: Arc<ReplayTracker>) -> Box<dyn Obfuscator> {
    Box::new(AuthAes128::new(HashKind::Md5, ctx, tracker))
}

fn new_auth_aes128_sha1(ctx: SessionContext, tracker: Arc<ReplayTracker>) -> Box<dyn Obfuscator> {
    Box::new(AuthAes128::new(HashKind::Sha1, ctx, tracker))
}

fn new_auth_chain_a(ctx: SessionContext, tracker: Arc<ReplayTracker>) -> Box<dyn Obfuscator> {
    Box::new(AuthChainA::new(ctx, tracker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_method_names_resolve() {
        let registry = MethodRegistry::with_builtin();
        let tracker = Arc::new(ReplayTracker::new("test"));
        for name in [
            "plain",
            "http_simple",
            "auth_aes128_md5",
            "auth_aes128_sha1",
            "auth_chain_a",
        ] {
            let ctx = SessionContext::new()
                .with_key(vec![0u8; 16])
                .with_iv(vec![0u8; 16])
                .with_recv_iv(vec![0u8; 16]);
            assert!(
                registry.new_obfuscator(name, ctx, tracker.clone()).is_ok(),
                "{name} missing from builtin registry"
            );
        }
    }

    #[test]
    fn test_unknown_method_rejected() {
        let registry = MethodRegistry::with_builtin();
        let tracker = Arc::new(ReplayTracker::new("test"));
        let err = registry.new_obfuscator("tls1.2_ticket_auth", SessionContext::new(), tracker);
        assert!(matches!(err, Err(Error::UnsupportedMethod { .. })));
    }

    #[test]
    fn test_head_size() {
        assert_eq!(head_size(&[1, 0, 0, 0, 0, 0, 0], 30), 7);
        assert_eq!(head_size(&[4, 0], 30), 19);
        assert_eq!(head_size(&[3, 11], 30), 15);
        assert_eq!(head_size(&[0, 0], 30), 30);
        assert_eq!(head_size(&[1], 30), 30);
    }
}
