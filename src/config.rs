//! Per-connection configuration shared with an obfuscator.
//!
//! A [`SessionContext`] carries everything a method implementation needs to
//! know about one connection: cipher key material, the negotiated IVs, the
//! peer address, the method parameters and the per-port user table. The
//! relay builds one context per accepted connection and hands it to the
//! method registry; contexts are never shared between connections.
//!
//! # Example
//!
//! ```
//! use authwire::SessionContext;
//!
//! let ctx = SessionContext::new()
//!     .with_key(vec![0u8; 16])
//!     .with_iv(vec![0u8; 16])
//!     .with_recv_iv(vec![0u8; 16])
//!     .with_protocol_param("1024:killer");
//! assert_eq!(ctx.head_len(), 30);
//! ```

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::net::IpAddr;
use std::sync::Arc;

use zeroize::Zeroize;

/// Callback invoked when a server-side handshake resolves a user id, so the
/// accounting layer can attribute the connection's traffic.
pub type UpdateUserHook = Arc<dyn Fn(&[u8; 4]) + Send + Sync>;

/// Connection-scoped parameters for an obfuscation method.
///
/// Accessors are pure; the only mutation methods outside construction are
/// [`set_tcp_mss`](SessionContext::set_tcp_mss), which records the MSS the
/// RC4-chain method negotiates in-band, and the [`update_user`]
/// notification hook.
///
/// [`update_user`]: SessionContext::update_user
#[derive(Clone, Default)]
pub struct SessionContext {
    key: Vec<u8>,
    iv: Vec<u8>,
    recv_iv: Vec<u8>,
    host: String,
    port: u16,
    client: Option<IpAddr>,
    client_port: u16,
    protocol_param: String,
    obfs_param: String,
    head_len: usize,
    tcp_mss: usize,
    buffer_size: usize,
    overhead: usize,
    users: HashMap<[u8; 4], String>,
    update_user: Option<UpdateUserHook>,
}

impl SessionContext {
    /// A context with the protocol family's defaults: 30-byte address-head
    /// estimate, 1460-byte MSS, 32 KiB receive budget.
    pub fn new() -> Self {
        // Functional update syntax cannot move out of a Drop type, so the
        // defaults are assigned field by field.
        let mut ctx = Self::default();
        ctx.head_len = 30;
        ctx.tcp_mss = 1460;
        ctx.buffer_size = 32 * 1024 - 9;
        ctx
    }

    /// Primary cipher key, derived from the server password.
    pub fn with_key(mut self, key: Vec<u8>) -> Self {
        self.key = key;
        self
    }

    /// The IV of the outgoing cipher stream.
    pub fn with_iv(mut self, iv: Vec<u8>) -> Self {
        self.iv = iv;
        self
    }

    /// The IV received from the peer's cipher stream.
    pub fn with_recv_iv(mut self, recv_iv: Vec<u8>) -> Self {
        self.recv_iv = recv_iv;
        self
    }

    /// Server hostname, used by the HTTP camouflage method.
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Server port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Peer address, used in diagnostics only.
    pub fn with_client(mut self, client: IpAddr, client_port: u16) -> Self {
        self.client = Some(client);
        self.client_port = client_port;
        self
    }

    /// Client-side `"userId:secret"` credential string.
    pub fn with_protocol_param(mut self, param: impl Into<String>) -> Self {
        self.protocol_param = param.into();
        self
    }

    /// Obfuscation parameter (host allow-list for HTTP camouflage).
    pub fn with_obfs_param(mut self, param: impl Into<String>) -> Self {
        self.obfs_param = param.into();
        self
    }

    /// Expected plaintext address-head length estimate.
    pub fn with_head_len(mut self, head_len: usize) -> Self {
        self.head_len = head_len;
        self
    }

    /// TCP maximum segment size used to shape padding.
    pub fn with_tcp_mss(mut self, tcp_mss: usize) -> Self {
        self.tcp_mss = tcp_mss;
        self
    }

    /// Payload size above which no padding is added.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    /// Per-frame overhead the outer cipher layer adds.
    pub fn with_overhead(mut self, overhead: usize) -> Self {
        self.overhead = overhead;
        self
    }

    /// Server-side user table mapping little-endian packed ids to secrets.
    pub fn with_users(mut self, users: HashMap<[u8; 4], String>) -> Self {
        self.users = users;
        self
    }

    /// Registers the user-resolution notification hook.
    pub fn with_update_user_hook(mut self, hook: UpdateUserHook) -> Self {
        self.update_user = Some(hook);
        self
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn iv(&self) -> &[u8] {
        &self.iv
    }

    pub fn recv_iv(&self) -> &[u8] {
        &self.recv_iv
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn client(&self) -> Option<IpAddr> {
        self.client
    }

    pub fn client_port(&self) -> u16 {
        self.client_port
    }

    pub fn protocol_param(&self) -> &str {
        &self.protocol_param
    }

    pub fn obfs_param(&self) -> &str {
        &self.obfs_param
    }

    pub fn head_len(&self) -> usize {
        self.head_len
    }

    pub fn tcp_mss(&self) -> usize {
        self.tcp_mss
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn overhead(&self) -> usize {
        self.overhead
    }

    /// Looks up a user secret by packed id.
    pub fn user_secret(&self, user_id: &[u8; 4]) -> Option<&str> {
        self.users.get(user_id).map(String::as_str)
    }

    /// Whether the user table is empty (single-key deployments).
    pub fn has_users(&self) -> bool {
        !self.users.is_empty()
    }

    /// Records the MSS negotiated in-band by the RC4-chain method.
    pub(crate) fn set_tcp_mss(&mut self, tcp_mss: usize) {
        self.tcp_mss = tcp_mss;
    }

    /// Notifies the accounting layer that this connection belongs to `user_id`.
    pub(crate) fn update_user(&self, user_id: &[u8; 4]) {
        if let Some(hook) = &self.update_user {
            hook(user_id);
        }
    }
}

impl Drop for SessionContext {
    fn drop(&mut self) {
        self.key.zeroize();
        self.iv.zeroize();
        self.recv_iv.zeroize();
    }
}

impl Debug for SessionContext {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("key", &"*****")
            .field("iv", &"*****")
            .field("recv_iv", &"*****")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("client", &self.client)
            .field("client_port", &self.client_port)
            .field("protocol_param", &self.protocol_param)
            .field("obfs_param", &self.obfs_param)
            .field("head_len", &self.head_len)
            .field("tcp_mss", &self.tcp_mss)
            .field("buffer_size", &self.buffer_size)
            .field("overhead", &self.overhead)
            .field("users", &self.users.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let ctx = SessionContext::new();
        assert_eq!(ctx.head_len(), 30);
        assert_eq!(ctx.tcp_mss(), 1460);
        assert_eq!(ctx.buffer_size(), 32 * 1024 - 9);
        assert!(!ctx.has_users());
    }

    #[test]
    fn test_user_lookup() {
        let mut users = HashMap::new();
        users.insert(1024u32.to_le_bytes(), "killer".to_string());
        let ctx = SessionContext::new().with_users(users);
        assert_eq!(ctx.user_secret(&1024u32.to_le_bytes()), Some("killer"));
        assert_eq!(ctx.user_secret(&1u32.to_le_bytes()), None);
    }

    #[test]
    fn test_update_user_hook_fires() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let seen = Arc::new(AtomicU32::new(0));
        let seen2 = seen.clone();
        let ctx = SessionContext::new().with_update_user_hook(Arc::new(move |uid| {
            seen2.store(u32::from_le_bytes(*uid), Ordering::SeqCst);
        }));
        ctx.update_user(&77u32.to_le_bytes());
        assert_eq!(seen.load(Ordering::SeqCst), 77);
    }

    #[test]
    fn test_debug_redacts_key_material() {
        let ctx = SessionContext::new().with_key(vec![0xAA; 16]);
        let printed = format!("{ctx:?}");
        assert!(!printed.contains("170"));
        assert!(!printed.to_lowercase().contains("aa"));
    }
}
