//! Handshake replay protection.
//!
//! Every authenticated handshake carries a `(client id, connection id)`
//! pair. The tracker keeps a sliding window of recently seen connection ids
//! per client so a recorded handshake cannot be played back, and bounds how
//! many clients a single user id may run concurrently. One tracker instance
//! is shared by every connection of a listener; obfuscators hold it behind
//! an [`Arc`](std::sync::Arc).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{info, warn};
use rand::rngs::OsRng;
use rand::TryRngCore;

/// Window spans 64 ids behind the first seen connection id.
const WINDOW_BEHIND: i64 = 64;
/// A connection id may run at most this far ahead of the window front.
const WINDOW_AHEAD: i64 = 0x4000;
/// Compaction keeps the dense window at most this wide.
const WINDOW_COMPACT: i64 = 0x1000;
/// A queue with live references counts as active this long after its last
/// successful insert or keep-alive.
const QUEUE_ACTIVE: Duration = Duration::from_secs(600);
/// Idle queues fall out of the per-user cache after this long.
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Sliding connection-id window for one `(user, client id)` pair.
#[derive(Debug)]
struct ClientQueue {
    front: i64,
    back: i64,
    alloc: HashSet<i64>,
    enable: bool,
    last_update: Instant,
    refs: u32,
}

impl ClientQueue {
    fn new(begin_id: i64) -> Self {
        Self {
            front: begin_id - WINDOW_BEHIND,
            back: begin_id + 1,
            alloc: HashSet::new(),
            enable: true,
            last_update: Instant::now(),
            refs: 0,
        }
    }

    fn touch(&mut self) {
        self.last_update = Instant::now();
    }

    fn add_ref(&mut self) {
        self.refs += 1;
    }

    fn del_ref(&mut self) {
        self.refs = self.refs.saturating_sub(1);
    }

    fn is_active(&self) -> bool {
        self.refs > 0 && self.last_update.elapsed() < QUEUE_ACTIVE
    }

    /// Resets the window around a fresh connection id.
    fn re_enable(&mut self, connection_id: i64) {
        self.enable = true;
        self.front = connection_id - WINDOW_BEHIND;
        self.back = connection_id + 1;
        self.alloc.clear();
    }

    fn insert(&mut self, connection_id: i64) -> bool {
        if !self.enable {
            warn!("replay tracker: client queue disabled");
            return false;
        }
        if !self.is_active() {
            self.re_enable(connection_id);
        }
        self.touch();
        if connection_id < self.front {
            warn!("replay tracker: deprecated connection id, possible replay attack");
            return false;
        }
        if connection_id > self.front + WINDOW_AHEAD {
            warn!("replay tracker: connection id too far ahead of window");
            return false;
        }
        if self.alloc.contains(&connection_id) {
            warn!("replay tracker: duplicate connection id, possible replay attack");
            return false;
        }
        if self.back <= connection_id {
            self.back = connection_id + 1;
        }
        self.alloc.insert(connection_id);
        while self.alloc.contains(&self.back) && self.front + WINDOW_COMPACT < self.back {
            self.alloc.remove(&self.front);
            self.front += 1;
        }
        self.add_ref();
        true
    }
}

/// TTL-bounded LRU of client queues belonging to one user id.
#[derive(Debug, Default)]
struct UserQueues {
    queues: HashMap<u32, (ClientQueue, Instant)>,
    // Least recently touched id at the front.
    order: VecDeque<u32>,
}

impl UserQueues {
    fn expire_stale(&mut self) {
        while let Some(&id) = self.order.front() {
            let stale = self
                .queues
                .get(&id)
                .map(|(_, touched)| touched.elapsed() >= CACHE_TTL)
                .unwrap_or(true);
            if !stale {
                break;
            }
            self.order.pop_front();
            self.queues.remove(&id);
        }
    }

    fn refresh(&mut self, client_id: u32) {
        if let Some(pos) = self.order.iter().position(|&id| id == client_id) {
            self.order.remove(pos);
        }
        self.order.push_back(client_id);
        if let Some((_, touched)) = self.queues.get_mut(&client_id) {
            *touched = Instant::now();
        }
    }

    fn remove_entry(&mut self, client_id: u32) {
        self.queues.remove(&client_id);
        if let Some(pos) = self.order.iter().position(|&id| id == client_id) {
            self.order.remove(pos);
        }
    }

    fn least_recent(&self) -> Option<u32> {
        self.order.front().copied()
    }
}

#[derive(Debug, Default)]
struct NonceState {
    local_client_id: Option<[u8; 4]>,
    connection_id: u32,
}

/// Shared anti-replay state for one protocol instance.
///
/// Servers feed it incoming handshakes through [`insert`], keep sessions
/// alive with [`update`] and release them with [`remove`]; clients draw
/// their own handshake nonces from [`auth_data`].
///
/// [`insert`]: ReplayTracker::insert
/// [`update`]: ReplayTracker::update
/// [`remove`]: ReplayTracker::remove
/// [`auth_data`]: ReplayTracker::auth_data
pub struct ReplayTracker {
    name: String,
    max_client: AtomicUsize,
    max_buffer: AtomicUsize,
    users: RwLock<HashMap<[u8; 4], Arc<Mutex<UserQueues>>>>,
    nonce: Mutex<NonceState>,
}

impl ReplayTracker {
    /// A tracker named after its protocol, with the default limit of 64
    /// concurrent clients per user.
    pub fn new(name: impl Into<String>) -> Self {
        let tracker = Self {
            name: name.into(),
            max_client: AtomicUsize::new(0),
            max_buffer: AtomicUsize::new(0),
            users: RwLock::new(HashMap::new()),
            nonce: Mutex::new(NonceState::default()),
        };
        tracker.set_max_client(64);
        tracker
    }

    /// The protocol name this tracker was created for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Sets the per-user concurrent client limit. The internal cache bound
    /// never drops below 1024 entries.
    pub fn set_max_client(&self, max_client: usize) {
        self.max_client.store(max_client, Ordering::Relaxed);
        self.max_buffer
            .store(max_client.max(1024), Ordering::Relaxed);
    }

    fn user_queues(&self, user_id: [u8; 4]) -> Arc<Mutex<UserQueues>> {
        if let Some(q) = self.users.read().unwrap().get(&user_id) {
            return q.clone();
        }
        self.users
            .write()
            .unwrap()
            .entry(user_id)
            .or_default()
            .clone()
    }

    /// Admits a handshake, returning `false` on replay, an out-of-window
    /// connection id, or a user at its session limit.
    pub fn insert(&self, user_id: [u8; 4], client_id: u32, connection_id: u32) -> bool {
        let queues = self.user_queues(user_id);
        let mut q = queues.lock().unwrap();
        q.expire_stale();

        let known_enabled = q
            .queues
            .get(&client_id)
            .map(|(queue, _)| queue.enable)
            .unwrap_or(false);
        if known_enabled {
            q.refresh(client_id);
            let (queue, _) = q.queues.get_mut(&client_id).unwrap();
            return queue.insert(connection_id as i64);
        }

        // Hard cache bound, independent of the session limit: the map may
        // never hold more queues than the buffer allows, even active ones.
        let max_buffer = self.max_buffer.load(Ordering::Relaxed);
        while q.queues.len() >= max_buffer {
            match q.least_recent() {
                Some(oldest) => q.remove_entry(oldest),
                None => break,
            }
        }

        // New or disabled client: admit under the limit, otherwise try to
        // evict the least recently used inactive queue.
        let max_client = self.max_client.load(Ordering::Relaxed);
        if q.queues.len() >= max_client {
            match q.least_recent() {
                Some(oldest)
                    if !q
                        .queues
                        .get(&oldest)
                        .map(|(queue, _)| queue.is_active())
                        .unwrap_or(false) =>
                {
                    q.remove_entry(oldest);
                }
                _ => {
                    warn!(
                        "{}: user {} client {} rejected, no inactive client to evict",
                        self.name,
                        u32::from_le_bytes(user_id),
                        client_id
                    );
                    return false;
                }
            }
        }
        info!(
            "{}: new client {} for user {}",
            self.name,
            client_id,
            u32::from_le_bytes(user_id)
        );
        match q.queues.get_mut(&client_id) {
            Some((queue, _)) => queue.re_enable(connection_id as i64),
            None => {
                q.queues.insert(
                    client_id,
                    (ClientQueue::new(connection_id as i64), Instant::now()),
                );
            }
        }
        q.refresh(client_id);
        let (queue, _) = q.queues.get_mut(&client_id).unwrap();
        queue.insert(connection_id as i64)
    }

    /// Keep-alive: refreshes the activity timestamp of a known client queue.
    pub fn update(&self, user_id: [u8; 4], client_id: u32, _connection_id: u32) {
        let queues = self.user_queues(user_id);
        let mut q = queues.lock().unwrap();
        q.refresh(client_id);
        if let Some((queue, _)) = q.queues.get_mut(&client_id) {
            queue.touch();
        }
    }

    /// Drops one reference held by a closing connection.
    pub fn remove(&self, user_id: [u8; 4], client_id: u32) {
        if let Some(queues) = self.users.read().unwrap().get(&user_id) {
            if let Some((queue, _)) = queues.lock().unwrap().queues.get_mut(&client_id) {
                queue.del_ref();
            }
        }
    }

    /// Produces the 12-byte handshake nonce a client embeds in its header:
    /// `LE32(unix time) || local client id || LE32(connection id)`.
    ///
    /// The local client id is regenerated once the connection counter passes
    /// 0xFF000000, so the id space never wraps into previously used pairs.
    pub fn auth_data(&self) -> [u8; 12] {
        let mut st = self.nonce.lock().unwrap();
        if st.connection_id > 0xFF00_0000 {
            st.local_client_id = None;
        }
        if st.local_client_id.is_none() {
            let mut id = [0u8; 4];
            OsRng
                .try_fill_bytes(&mut id)
                .expect("system random source failure");
            st.local_client_id = Some(id);
            let mut counter = [0u8; 4];
            OsRng
                .try_fill_bytes(&mut counter)
                .expect("system random source failure");
            // Start low in the counter space so the id survives many
            // connections before the regeneration threshold.
            st.connection_id = u32::from_le_bytes(counter) & 0x00FF_FFFF;
        }
        st.connection_id = st.connection_id.wrapping_add(1);

        let utc = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as u32;
        let mut out = [0u8; 12];
        out[..4].copy_from_slice(&utc.to_le_bytes());
        out[4..8].copy_from_slice(&st.local_client_id.unwrap());
        out[8..].copy_from_slice(&st.connection_id.to_le_bytes());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const USER: [u8; 4] = 1024u32.to_le_bytes();

    #[test]
    fn test_insert_then_duplicate_rejected() {
        let t = ReplayTracker::new("test");
        assert!(t.insert(USER, 1, 1000));
        assert!(!t.insert(USER, 1, 1000));
        assert!(t.insert(USER, 1, 1001));
    }

    #[test]
    fn test_window_bounds() {
        let t = ReplayTracker::new("test");
        assert!(t.insert(USER, 1, 1000));
        // Behind the window front (1000 - 64).
        assert!(!t.insert(USER, 1, 900));
        // Too far ahead of the front.
        assert!(!t.insert(USER, 1, 1000 - 64 + 0x4000 + 1));
        // Just inside both bounds.
        assert!(t.insert(USER, 1, 950));
    }

    #[test]
    fn test_inactive_queue_reenables_window() {
        let t = ReplayTracker::new("test");
        assert!(t.insert(USER, 1, 100_000));
        t.remove(USER, 1);
        // No live references: the stale window resets around the new id.
        assert!(t.insert(USER, 1, 50));
    }

    #[test]
    fn test_session_limit_rejects_active_users() {
        let t = ReplayTracker::new("test");
        t.set_max_client(2);
        assert!(t.insert(USER, 1, 1000));
        assert!(t.insert(USER, 2, 1000));
        // Both queues hold references, nothing can be evicted.
        assert!(!t.insert(USER, 3, 1000));
    }

    #[test]
    fn test_inactive_queue_evicted_at_limit() {
        let t = ReplayTracker::new("test");
        t.set_max_client(1);
        assert!(t.insert(USER, 1, 1000));
        t.remove(USER, 1);
        assert!(t.insert(USER, 2, 1000));
    }

    #[test]
    fn test_remove_is_floored_at_zero() {
        let t = ReplayTracker::new("test");
        assert!(t.insert(USER, 1, 1000));
        t.remove(USER, 1);
        t.remove(USER, 1);
        t.remove(USER, 1);
        assert!(t.insert(USER, 1, 2000));
    }

    #[test]
    fn test_cache_bound_caps_queue_count() {
        let t = ReplayTracker::new("test");
        // A session limit above the cache floor exposes the buffer bound.
        t.set_max_client(1500);
        for client in 0..1200u32 {
            assert!(t.insert(USER, client, 1000));
        }
        let users = t.users.read().unwrap();
        let q = users.get(&USER).unwrap().lock().unwrap();
        assert!(q.queues.len() <= 1024);
    }

    #[test]
    fn test_update_keeps_window_intact() {
        let t = ReplayTracker::new("test");
        assert!(t.insert(USER, 1, 1000));
        t.update(USER, 1, 1000);
        // A refreshed queue still rejects the replayed id.
        assert!(!t.insert(USER, 1, 1000));
        assert!(t.insert(USER, 1, 1001));
        // Updates for clients the tracker never saw are a no-op.
        t.update(USER, 99, 5);
    }

    #[test]
    fn test_users_are_isolated() {
        let t = ReplayTracker::new("test");
        let other: [u8; 4] = 2048u32.to_le_bytes();
        assert!(t.insert(USER, 1, 1000));
        // Same client and connection id under a different user is fresh.
        assert!(t.insert(other, 1, 1000));
    }

    #[test]
    fn test_auth_data_layout_and_monotonic_counter() {
        let t = ReplayTracker::new("test");
        let a = t.auth_data();
        let b = t.auth_data();
        assert_eq!(a[4..8], b[4..8], "local client id must be stable");
        let ca = u32::from_le_bytes(a[8..12].try_into().unwrap());
        let cb = u32::from_le_bytes(b[8..12].try_into().unwrap());
        assert_eq!(cb, ca.wrapping_add(1));
        let utc = u32::from_le_bytes(a[..4].try_into().unwrap()) as u64;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert!(now.abs_diff(utc) < 5);
    }

    #[test]
    fn test_auth_data_unique_under_concurrency() {
        let t = Arc::new(ReplayTracker::new("test"));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let t = t.clone();
            handles.push(thread::spawn(move || {
                (0..256).map(|_| t.auth_data()).collect::<Vec<_>>()
            }));
        }
        let mut ids = HashSet::new();
        for h in handles {
            for nonce in h.join().unwrap() {
                let conn = u32::from_le_bytes(nonce[8..12].try_into().unwrap());
                assert!(ids.insert(conn), "connection id issued twice");
            }
        }
    }
}
