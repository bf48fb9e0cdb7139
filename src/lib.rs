//! Authwire is a sans-I/O implementation of the ShadowsocksR obfuscation
//! protocol family: per-connection wire-format codecs with per-user
//! authentication and sliding-window replay protection, designed to counter
//! deep packet inspection (DPI) and active probing of endpoints.
//!
//! ## Quick Start
//!
//! The central interface is the [`Obfuscator`] trait. An obfuscator is a
//! deterministic state machine over byte slices, following the sans-I/O
//! principle: it contains no network code and spawns no threads. The relay
//! owns the sockets, feeds received ciphertext through the `*_post_decrypt`
//! operations and pushes outgoing payload through the `*_pre_encrypt`
//! operations, on whichever side of the connection it sits.
//!
//! Obfuscators are built through a [`MethodRegistry`], which maps the
//! protocol family's method names to constructors:
//!
//! * `plain` — the identity method.
//! * `http_simple` — camouflages the first payload as an HTTP/1.1 exchange.
//! * `auth_aes128_md5` / `auth_aes128_sha1` — HMAC-framed payload with an
//!   AES-sealed, replay-protected handshake.
//! * `auth_chain_a` — RC4-encrypted payload with deterministic padding
//!   derived from a chained frame hash.
//!
//! ```
//! use std::sync::Arc;
//! use authwire::{MethodRegistry, Obfuscator, ReplayTracker, SessionContext};
//!
//! let registry = MethodRegistry::with_builtin();
//! let tracker = Arc::new(ReplayTracker::new("auth_aes128_md5"));
//! let ctx = SessionContext::new()
//!     .with_key(vec![0u8; 16])
//!     .with_iv(vec![0u8; 16])
//!     .with_recv_iv(vec![0u8; 16])
//!     .with_protocol_param("1024:killer");
//! let mut client = registry
//!     .new_obfuscator("auth_aes128_md5", ctx, tracker)
//!     .unwrap();
//! let wire = client.client_pre_encrypt(b"hello").unwrap();
//! assert!(wire.len() > 5);
//! ```
//!
//! ## Configuration
//!
//! Each connection gets a [`SessionContext`] carrying its key material, the
//! negotiated IVs, the method parameters and (server-side) the user table.
//! Authenticating methods additionally share one [`ReplayTracker`] per
//! listener; the tracker issues client/connection nonces on the client side
//! and enforces the sliding window on the server side.
//!
//! Session ciphers for the outer encryption layer are resolved by name
//! through a [`CipherRegistry`].
//!
//! Note: the authenticating methods rely on system time. Ensure that the
//! UTC time difference between both communication endpoints stays within
//! the freshness window (24 hours), regardless of time zone.
//!
//! ## Error handling
//!
//! Server-side handshake rejections are deliberately not surfaced as
//! errors: the obfuscator switches to raw passthrough and returns a
//! camouflage buffer so an active prober cannot distinguish a rejection
//! from garbled traffic. Failures after an established handshake surface
//! as [`Error::BadDataReceived`]; see [`error`] for the suggested
//! disconnection strategy.
#![warn(unreachable_pub)]
#![forbid(unsafe_code)]

pub mod config;
pub mod error;

mod auth_aes128;
mod auth_chain;
mod buffer;
mod cipher;
mod crypto;
mod http_simple;
mod obfuscator;
mod plain;
mod prng;
mod replay;

pub use auth_aes128::AuthAes128;
pub use auth_chain::AuthChainA;
pub use cipher::{CipherDescriptor, CipherRegistry, Direction, StreamCipher};
pub use config::{SessionContext, UpdateUserHook};
pub use crypto::HashKind;
pub use error::{BadDataReceived, Error};
pub use http_simple::HttpSimple;
pub use obfuscator::{MethodRegistry, Obfuscator};
pub use plain::Plain;
pub use replay::ReplayTracker;

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex};

/// Process-wide trackers, one per method name.
///
/// Only consulted when a listener starts; per-connection paths never touch
/// this lock.
static TRACKERS: LazyLock<Mutex<HashMap<String, Arc<ReplayTracker>>>> =
    LazyLock::new(|| Mutex::new(HashMap::new()));

/// Returns the process-wide [`ReplayTracker`] for `method`, creating it on
/// first use.
///
/// Every listener running the same method must share one tracker: the
/// client-side nonce counter would otherwise issue colliding client ids,
/// and the server-side replay window would miss handshakes replayed
/// against a different port.
pub fn shared_tracker(method: &str) -> Arc<ReplayTracker> {
    let mut trackers = TRACKERS.lock().expect("tracker registry poisoned");
    trackers
        .entry(method.to_string())
        .or_insert_with(|| Arc::new(ReplayTracker::new(method)))
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_tracker_is_per_method() {
        let a = shared_tracker("auth_aes128_md5");
        let b = shared_tracker("auth_aes128_md5");
        let c = shared_tracker("auth_chain_a");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(c.name(), "auth_chain_a");
    }
}
