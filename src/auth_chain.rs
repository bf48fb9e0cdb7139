//! RC4-chain obfuscation method (`auth_chain_a`).
//!
//! The handshake mirrors the AES-variant's shape at a different geometry:
//! a 12-byte check head, then a 24-byte credential block whose sealed core
//! carries the nonce and the client's frame overhead, with the user id
//! XOR-masked by part of the check-head digest. Payload frames are RC4
//! encrypted under a key derived from the credentials and the check-head
//! digest, and chained: each frame's MAC becomes part of the next frame's
//! length mask and seeds the deterministic padding generator, so both
//! sides derive identical padding without transmitting its length. One
//! tampered frame therefore desynchronizes everything after it.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::prelude::{Engine, BASE64_STANDARD};
use log::{error, info, warn};
use rand::{Rng, TryRngCore};

use crate::buffer::RecvBuffer;
use crate::cipher::{rc4_stream, StreamCipher};
use crate::config::SessionContext;
use crate::crypto::{evp_bytes_to_key, hmac_md5, open_auth_header, seal_auth_header};
use crate::error::{BadDataReceived, Error};
use crate::obfuscator::{head_size, Obfuscator};
use crate::prng::XorShift128Plus;
use crate::replay::ReplayTracker;

const SALT: &[u8] = b"auth_chain_a";
/// Default payload bytes per frame until the MSS is negotiated.
const DEFAULT_UNIT_LEN: usize = 2800;
/// Frames longer than this are rejected.
const MAX_FRAME_LEN: usize = 4096;
/// Handshake timestamp freshness window in seconds.
const MAX_TIME_DIF: i64 = 60 * 60 * 24;
/// Check head (12) plus credential block (24).
const HEADER_LEN: usize = 36;
const FILLER_LEN: usize = 2048;

pub struct AuthChainA {
    ctx: SessionContext,
    tracker: Arc<ReplayTracker>,
    recv_buf: RecvBuffer,
    raw_trans: bool,
    has_sent_header: bool,
    has_recv_header: bool,
    unit_len: usize,
    client_id: u32,
    connection_id: u32,
    pack_id: u32,
    recv_id: u32,
    user_id: Option<[u8; 4]>,
    user_key: Option<Vec<u8>>,
    client_overhead: usize,
    last_client_hash: [u8; 16],
    last_server_hash: [u8; 16],
    random_client: XorShift128Plus,
    random_server: XorShift128Plus,
    enc: Option<Box<dyn StreamCipher>>,
    dec: Option<Box<dyn StreamCipher>>,
    overhead: usize,
}

impl AuthChainA {
    pub fn new(ctx: SessionContext, tracker: Arc<ReplayTracker>) -> Self {
        Self {
            ctx,
            tracker,
            recv_buf: RecvBuffer::new(),
            raw_trans: false,
            has_sent_header: false,
            has_recv_header: false,
            unit_len: DEFAULT_UNIT_LEN,
            client_id: 0,
            connection_id: 0,
            pack_id: 1,
            recv_id: 1,
            user_id: None,
            user_key: None,
            client_overhead: 4,
            last_client_hash: [0; 16],
            last_server_hash: [0; 16],
            random_client: XorShift128Plus::new(),
            random_server: XorShift128Plus::new(),
            enc: None,
            dec: None,
            overhead: 4,
        }
    }

    fn user_key(&self) -> &[u8] {
        self.user_key
            .as_deref()
            .expect("user key resolved before framing")
    }

    fn not_match_return(&mut self) -> (Vec<u8>, bool) {
        self.raw_trans = true;
        self.overhead = 0;
        self.recv_buf.clear();
        (vec![b'E'; FILLER_LEN], false)
    }

    /// Resolves `"userId:secret"`; without a credential the primary key
    /// stands in and the user id is random noise.
    fn resolve_param_user(&mut self) -> Result<[u8; 4], Error> {
        let param = self.ctx.protocol_param();
        match param.split_once(':') {
            Some((uid, secret)) => {
                let uid: u32 = uid.parse().map_err(|_| Error::InvalidProtocolParam {
                    param: param.to_string(),
                })?;
                self.user_key = Some(secret.as_bytes().to_vec());
                Ok(uid.to_le_bytes())
            }
            None => {
                let mut uid = [0u8; 4];
                rand::rngs::OsRng
                    .try_fill_bytes(&mut uid)
                    .expect("system random source failure");
                self.user_key = Some(self.ctx.key().to_vec());
                Ok(uid)
            }
        }
    }

    fn session_cipher_key(user_key: &[u8], hash: &[u8; 16]) -> Vec<u8> {
        let mut password = BASE64_STANDARD.encode(user_key).into_bytes();
        password.extend_from_slice(BASE64_STANDARD.encode(hash).as_bytes());
        evp_bytes_to_key(&password, 16)
    }

    fn init_session_cipher(&mut self, user_key: &[u8], hash: &[u8; 16]) {
        let key = Self::session_cipher_key(user_key, hash);
        self.enc = Some(rc4_stream(&key));
        self.dec = Some(rc4_stream(&key));
    }

    fn header_password(user_key: &[u8]) -> Vec<u8> {
        let mut password = BASE64_STANDARD.encode(user_key).into_bytes();
        password.extend_from_slice(SALT);
        password
    }

    /// Padding length for a frame of `buf_size` payload bytes, derived
    /// deterministically from the rolling hash.
    fn rnd_data_len(random: &mut XorShift128Plus, last_hash: &[u8; 16], buf_size: usize) -> usize {
        if buf_size > 1440 {
            return 0;
        }
        random.init_from_bin_len(last_hash, buf_size);
        let modulus = if buf_size > 1300 {
            31
        } else if buf_size > 900 {
            127
        } else if buf_size > 400 {
            521
        } else {
            1021
        };
        (random.next() % modulus) as usize
    }

    fn udp_rnd_data_len(random: &mut XorShift128Plus, seed: &[u8]) -> usize {
        random.init_from_bin(seed);
        (random.next() % 127) as usize
    }

    fn rnd_start_pos(random: &mut XorShift128Plus, rand_len: usize) -> usize {
        if rand_len > 0 {
            (random.next() % 8589934609 % rand_len as u64) as usize
        } else {
            0
        }
    }

    /// Splices `buf` into freshly drawn padding at a derived offset.
    fn rnd_data(random: &mut XorShift128Plus, last_hash: &[u8; 16], buf: &[u8]) -> Vec<u8> {
        let rand_len = Self::rnd_data_len(random, last_hash, buf.len());
        let mut rnd_buf = vec![0u8; rand_len];
        rand::rng().fill(&mut rnd_buf[..]);
        if buf.is_empty() {
            return rnd_buf;
        }
        if rand_len == 0 {
            return buf.to_vec();
        }
        let start = Self::rnd_start_pos(random, rand_len);
        let mut out = Vec::with_capacity(rand_len + buf.len());
        out.extend_from_slice(&rnd_buf[..start]);
        out.extend_from_slice(buf);
        out.extend_from_slice(&rnd_buf[start..]);
        out
    }

    fn pack_client_data(&mut self, buf: &[u8]) -> Vec<u8> {
        let mut enc = buf.to_vec();
        self.enc
            .as_mut()
            .expect("session cipher initialized with the handshake")
            .xor_key_stream(&mut enc);
        let data = Self::rnd_data(&mut self.random_client, &self.last_client_hash, &enc);

        let mask = u16::from_le_bytes([self.last_client_hash[14], self.last_client_hash[15]]);
        let length = enc.len() as u16 ^ mask;
        let mut out = length.to_le_bytes().to_vec();
        out.extend_from_slice(&data);

        let mut mac_key = self.user_key().to_vec();
        mac_key.extend_from_slice(&self.pack_id.to_le_bytes());
        self.last_client_hash = hmac_md5(&mac_key, &out);
        out.extend_from_slice(&self.last_client_hash[..2]);
        self.pack_id = self.pack_id.wrapping_add(1);
        out
    }

    fn pack_server_data(&mut self, buf: &[u8]) -> Vec<u8> {
        let mut enc = buf.to_vec();
        self.enc
            .as_mut()
            .expect("session cipher initialized with the handshake")
            .xor_key_stream(&mut enc);
        let data = Self::rnd_data(&mut self.random_server, &self.last_server_hash, &enc);

        let mask = u16::from_le_bytes([self.last_server_hash[14], self.last_server_hash[15]]);
        let length = enc.len() as u16 ^ mask;
        let mut out = length.to_le_bytes().to_vec();
        out.extend_from_slice(&data);

        let mut mac_key = self.user_key().to_vec();
        mac_key.extend_from_slice(&self.pack_id.to_le_bytes());
        self.last_server_hash = hmac_md5(&mac_key, &out);
        out.extend_from_slice(&self.last_server_hash[..2]);
        self.pack_id = self.pack_id.wrapping_add(1);
        out
    }

    fn pack_auth_data(&mut self, auth_data: &[u8; 12], buf: &[u8]) -> Result<Vec<u8>, Error> {
        let mut head = [0u8; 16];
        head[..12].copy_from_slice(auth_data);
        head[12..14].copy_from_slice(&(self.ctx.overhead() as u16).to_le_bytes());

        let mut mac_key = self.ctx.iv().to_vec();
        mac_key.extend_from_slice(self.ctx.key());

        let mut check_head = vec![0u8; 4];
        rand::rng().fill(&mut check_head[..]);
        self.last_client_hash = hmac_md5(&mac_key, &check_head);
        check_head.extend_from_slice(&self.last_client_hash[..8]);

        let uid_pack = self.resolve_param_user()?;
        self.user_id = Some(uid_pack);
        let user_key = self.user_key().to_vec();

        let mask = u32::from_le_bytes([
            self.last_client_hash[8],
            self.last_client_hash[9],
            self.last_client_hash[10],
            self.last_client_hash[11],
        ]);
        let masked_uid = (u32::from_le_bytes(uid_pack) ^ mask).to_le_bytes();

        let sealed = seal_auth_header(&Self::header_password(&user_key), &head);
        let mut credential = masked_uid.to_vec();
        credential.extend_from_slice(&sealed);
        self.last_server_hash = hmac_md5(&user_key, &credential);

        let mut out = check_head;
        out.extend_from_slice(&credential);
        out.extend_from_slice(&self.last_server_hash[..4]);

        let check_head_hash = self.last_client_hash;
        self.init_session_cipher(&user_key, &check_head_hash);
        out.extend_from_slice(&self.pack_client_data(buf));
        Ok(out)
    }

    fn unix_now() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs() as u32 as i64
    }
}

impl Obfuscator for AuthChainA {
    fn client_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buf = buf;
        let mut result = Vec::new();
        if !self.has_sent_header {
            let head_size = head_size(buf, 30);
            let data_len = buf
                .len()
                .min(rand::rng().random_range(0..31) + head_size);
            let auth_data = self.tracker.auth_data();
            result.extend_from_slice(&self.pack_auth_data(&auth_data, &buf[..data_len])?);
            buf = &buf[data_len..];
            self.has_sent_header = true;
        }
        while buf.len() > self.unit_len {
            let unit_len = self.unit_len;
            let frame = self.pack_client_data(&buf[..unit_len]);
            result.extend_from_slice(&frame);
            buf = &buf[unit_len..];
        }
        result.extend_from_slice(&self.pack_client_data(buf));
        Ok(result)
    }

    fn client_post_decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if self.raw_trans {
            return Ok(buf.to_vec());
        }
        self.recv_buf.extend(buf);
        let mut result = Vec::new();
        while self.recv_buf.len() > 4 {
            let b = self.recv_buf.as_slice().to_vec();
            let mask =
                u16::from_le_bytes([self.last_server_hash[14], self.last_server_hash[15]]);
            let data_len = (u16::from_le_bytes([b[0], b[1]]) ^ mask) as usize;
            let rand_len =
                Self::rnd_data_len(&mut self.random_server, &self.last_server_hash, data_len);
            let length = data_len + rand_len;
            if length > MAX_FRAME_LEN {
                self.raw_trans = true;
                self.recv_buf.clear();
                return Err(BadDataReceived::MalformedFrame { len: length }.into());
            }
            if length + 4 > b.len() {
                break;
            }

            let mut mac_key = self.user_key().to_vec();
            mac_key.extend_from_slice(&self.recv_id.to_le_bytes());
            let server_hash = hmac_md5(&mac_key, &b[..length + 2]);
            if server_hash[..2] != b[length + 2..length + 4] {
                info!("auth_chain_a: checksum error, data {}", hex::encode(&b[..length]));
                self.raw_trans = true;
                self.recv_buf.clear();
                return Err(BadDataReceived::ChecksumMismatch.into());
            }

            let pos = if data_len > 0 && rand_len > 0 {
                2 + Self::rnd_start_pos(&mut self.random_server, rand_len)
            } else {
                2
            };
            let mut cleartext = b[pos..pos + data_len].to_vec();
            self.dec
                .as_mut()
                .expect("session cipher initialized with the handshake")
                .xor_key_stream(&mut cleartext);
            result.extend_from_slice(&cleartext);
            self.last_server_hash = server_hash;
            if self.recv_id == 1 {
                // First server frame opens with the negotiated MSS.
                let mss = u16::from_le_bytes([result[0], result[1]]) as usize;
                self.ctx.set_tcp_mss(mss);
                result.drain(..2);
            }
            self.recv_id = self.recv_id.wrapping_add(1);
            self.recv_buf.advance(length + 4);
        }
        Ok(result)
    }

    fn server_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if self.raw_trans {
            return Ok(buf.to_vec());
        }
        if self.pack_id == 1 {
            // The first reply announces the MSS and fixes the frame size.
            let mss = self.ctx.tcp_mss().min(1500);
            self.ctx.set_tcp_mss(mss);
            self.unit_len = mss - self.client_overhead;
            let mut data = (mss as u16).to_le_bytes().to_vec();
            data.extend_from_slice(buf);
            return self.pack_server_frames(&data);
        }
        self.pack_server_frames(buf)
    }

    fn server_post_decrypt(&mut self, buf: &[u8]) -> Result<(Vec<u8>, bool), Error> {
        if self.raw_trans {
            return Ok((buf.to_vec(), false));
        }
        self.recv_buf.extend(buf);
        let mut result = Vec::new();
        let mut sendback = false;

        if !self.has_recv_header {
            let mut check_hash = [0u8; 16];
            let len = self.recv_buf.len();
            if len >= 12 || len == 7 || len == 8 {
                let recv_len = len.min(12);
                let mut mac_key = self.ctx.recv_iv().to_vec();
                mac_key.extend_from_slice(self.ctx.key());
                let b = self.recv_buf.as_slice();
                check_hash = hmac_md5(&mac_key, &b[..4]);
                if check_hash[..recv_len - 4] != b[4..recv_len] {
                    error!(
                        "auth_chain_a: check head mismatch, expected {}, received {}",
                        hex::encode(&check_hash[..recv_len - 4]),
                        hex::encode(&b[4..recv_len])
                    );
                    return Ok(self.not_match_return());
                }
            }
            if self.recv_buf.len() < HEADER_LEN {
                return Ok((Vec::new(), false));
            }

            let b = self.recv_buf.as_slice().to_vec();
            self.last_client_hash = check_hash;

            let mask = u32::from_le_bytes(check_hash[8..12].try_into().unwrap());
            let uid = u32::from_le_bytes(b[12..16].try_into().unwrap()) ^ mask;
            let uid_pack = uid.to_le_bytes();
            let user_key = match self.ctx.user_secret(&uid_pack) {
                Some(secret) => secret.as_bytes().to_vec(),
                None => return Err(Error::UnknownUser { user_id: uid }),
            };
            self.user_id = Some(uid_pack);
            self.ctx.update_user(&uid_pack);

            let credential_hash = hmac_md5(&user_key, &b[12..32]);
            if credential_hash[..4] != b[32..36] {
                error!(
                    "auth_chain_a: incorrect credential tag from {:?}:{}, data {}",
                    self.ctx.client(),
                    self.ctx.client_port(),
                    hex::encode(&b)
                );
                return Ok(self.not_match_return());
            }
            self.last_server_hash = credential_hash;

            let sealed: [u8; 16] = b[16..32].try_into().unwrap();
            let head = open_auth_header(&Self::header_password(&user_key), &sealed);
            self.client_overhead = u16::from_le_bytes([head[12], head[13]]) as usize;

            let utc = u32::from_le_bytes(head[..4].try_into().unwrap());
            let client_id = u32::from_le_bytes(head[4..8].try_into().unwrap());
            let connection_id = u32::from_le_bytes(head[8..12].try_into().unwrap());

            let time_dif = utc as i64 - Self::unix_now();
            if !(-MAX_TIME_DIF..=MAX_TIME_DIF).contains(&time_dif) {
                info!(
                    "auth_chain_a: wrong timestamp, time_dif {}, data {}",
                    time_dif,
                    hex::encode(head)
                );
                return Ok(self.not_match_return());
            }
            if !self.tracker.insert(uid_pack, client_id, connection_id) {
                info!("auth_chain_a: replay tracker rejected handshake");
                return Ok(self.not_match_return());
            }
            self.client_id = client_id;
            self.connection_id = connection_id;

            let check_head_hash = self.last_client_hash;
            self.init_session_cipher(&user_key, &check_head_hash);
            self.user_key = Some(user_key);
            self.recv_buf.advance(HEADER_LEN);
            self.has_recv_header = true;
            sendback = true;
        }

        while self.recv_buf.len() > 4 {
            let b = self.recv_buf.as_slice().to_vec();
            let mask =
                u16::from_le_bytes([self.last_client_hash[14], self.last_client_hash[15]]);
            let data_len = (u16::from_le_bytes([b[0], b[1]]) ^ mask) as usize;
            let rand_len =
                Self::rnd_data_len(&mut self.random_client, &self.last_client_hash, data_len);
            let length = data_len + rand_len;
            if length >= MAX_FRAME_LEN {
                info!("auth_chain_a: frame over size");
                if self.recv_id == 1 {
                    return Ok(self.not_match_return());
                }
                self.raw_trans = true;
                self.recv_buf.clear();
                return Err(BadDataReceived::MalformedFrame { len: length }.into());
            }
            if length + 4 > b.len() {
                break;
            }

            let mut mac_key = self.user_key().to_vec();
            mac_key.extend_from_slice(&self.recv_id.to_le_bytes());
            let client_hash = hmac_md5(&mac_key, &b[..length + 2]);
            if client_hash[..2] != b[length + 2..length + 4] {
                info!("auth_chain_a: checksum error, data {}", hex::encode(&b[..length]));
                if self.recv_id == 1 {
                    return Ok(self.not_match_return());
                }
                self.raw_trans = true;
                self.recv_buf.clear();
                return Err(BadDataReceived::ChecksumMismatch.into());
            }
            self.recv_id = self.recv_id.wrapping_add(1);

            let pos = if data_len > 0 && rand_len > 0 {
                2 + Self::rnd_start_pos(&mut self.random_client, rand_len)
            } else {
                2
            };
            let mut cleartext = b[pos..pos + data_len].to_vec();
            self.dec
                .as_mut()
                .expect("session cipher initialized with the handshake")
                .xor_key_stream(&mut cleartext);
            result.extend_from_slice(&cleartext);
            self.last_client_hash = client_hash;
            self.recv_buf.advance(length + 4);
            if data_len == 0 {
                sendback = true;
            }
        }

        if !result.is_empty() {
            if let Some(uid) = self.user_id {
                self.tracker.update(uid, self.client_id, self.connection_id);
            }
        }
        Ok((result, sendback))
    }

    fn client_udp_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if self.user_key.is_none() {
            self.user_id = Some(self.resolve_param_user()?);
        }
        let mut auth_data = [0u8; 3];
        rand::rng().fill(&mut auth_data[..]);
        let seed = hmac_md5(self.ctx.key(), &auth_data);

        let uid = u32::from_le_bytes(self.user_id.unwrap())
            ^ u32::from_le_bytes(seed[..4].try_into().unwrap());
        let rand_len = Self::udp_rnd_data_len(&mut self.random_client, &seed);
        let key = Self::session_cipher_key(self.user_key(), &seed);

        let mut out = buf.to_vec();
        rc4_stream(&key).xor_key_stream(&mut out);
        let mut padding = vec![0u8; rand_len];
        rand::rng().fill(&mut padding[..]);
        out.extend_from_slice(&padding);
        out.extend_from_slice(&auth_data);
        out.extend_from_slice(&uid.to_le_bytes());
        let tag = hmac_md5(self.user_key(), &out);
        out.push(tag[0]);
        Ok(out)
    }

    fn client_udp_post_decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if buf.len() < 9 {
            return Ok(Vec::new());
        }
        if self.user_key.is_none() {
            self.user_id = Some(self.resolve_param_user()?);
        }
        let tag = hmac_md5(self.user_key(), &buf[..buf.len() - 1]);
        if tag[0] != buf[buf.len() - 1] {
            return Ok(Vec::new());
        }
        let seed = hmac_md5(self.ctx.key(), &buf[buf.len() - 8..buf.len() - 1]);
        let rand_len = Self::udp_rnd_data_len(&mut self.random_server, &seed);
        if buf.len() < 8 + rand_len {
            return Ok(Vec::new());
        }
        let key = Self::session_cipher_key(self.user_key(), &seed);
        let mut out = buf[..buf.len() - 8 - rand_len].to_vec();
        rc4_stream(&key).xor_key_stream(&mut out);
        Ok(out)
    }

    fn server_udp_pre_encrypt(
        &mut self,
        buf: &[u8],
        user_id: Option<&[u8; 4]>,
    ) -> Result<Vec<u8>, Error> {
        let user_key = match user_id.and_then(|uid| self.ctx.user_secret(uid)) {
            Some(secret) => secret.as_bytes().to_vec(),
            None if !self.ctx.has_users() => self.ctx.key().to_vec(),
            None => self.ctx.recv_iv().to_vec(),
        };
        let mut auth_data = [0u8; 7];
        rand::rng().fill(&mut auth_data[..]);
        let seed = hmac_md5(self.ctx.key(), &auth_data);
        let rand_len = Self::udp_rnd_data_len(&mut self.random_server, &seed);
        let key = Self::session_cipher_key(&user_key, &seed);

        let mut out = buf.to_vec();
        rc4_stream(&key).xor_key_stream(&mut out);
        let mut padding = vec![0u8; rand_len];
        rand::rng().fill(&mut padding[..]);
        out.extend_from_slice(&padding);
        out.extend_from_slice(&auth_data);
        let tag = hmac_md5(&user_key, &out);
        out.push(tag[0]);
        Ok(out)
    }

    fn server_udp_post_decrypt(&mut self, buf: &[u8]) -> Result<(Vec<u8>, Option<[u8; 4]>), Error> {
        if buf.len() < 9 {
            return Ok((Vec::new(), None));
        }
        let seed = hmac_md5(self.ctx.key(), &buf[buf.len() - 8..buf.len() - 5]);
        let uid = u32::from_le_bytes(buf[buf.len() - 5..buf.len() - 1].try_into().unwrap())
            ^ u32::from_le_bytes(seed[..4].try_into().unwrap());
        let uid_pack = uid.to_le_bytes();
        let user_key = match self.ctx.user_secret(&uid_pack) {
            Some(secret) => secret.as_bytes().to_vec(),
            None if !self.ctx.has_users() => self.ctx.key().to_vec(),
            None => self.ctx.recv_iv().to_vec(),
        };
        let tag = hmac_md5(&user_key, &buf[..buf.len() - 1]);
        if tag[0] != buf[buf.len() - 1] {
            return Ok((Vec::new(), None));
        }
        let rand_len = Self::udp_rnd_data_len(&mut self.random_server, &seed);
        if buf.len() < 8 + rand_len {
            warn!("auth_chain_a: udp datagram shorter than its padding");
            return Ok((Vec::new(), None));
        }
        let key = Self::session_cipher_key(&user_key, &seed);
        let mut out = buf[..buf.len() - 8 - rand_len].to_vec();
        rc4_stream(&key).xor_key_stream(&mut out);
        Ok((out, Some(uid_pack)))
    }

    fn overhead(&self) -> usize {
        self.overhead
    }

    fn dispose(&mut self) {
        if let Some(uid) = self.user_id {
            self.tracker.remove(uid, self.client_id);
        }
    }
}

impl AuthChainA {
    fn pack_server_frames(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        let mut buf = buf;
        let mut result = Vec::new();
        while buf.len() > self.unit_len {
            let unit_len = self.unit_len;
            let frame = self.pack_server_data(&buf[..unit_len]);
            result.extend_from_slice(&frame);
            buf = &buf[unit_len..];
        }
        result.extend_from_slice(&self.pack_server_data(buf));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn context() -> SessionContext {
        let iv = hex::decode("271d7f17d03ed7cd1f44327456aebfa2").unwrap();
        let key = hex::decode("b36d331451a61eb2d76860e00c347396").unwrap();
        let mut users = HashMap::new();
        users.insert(1024u32.to_le_bytes(), "killer".to_string());
        SessionContext::new()
            .with_key(key)
            .with_iv(iv.clone())
            .with_recv_iv(iv)
            .with_protocol_param("1024:killer")
            .with_users(users)
            .with_overhead(4)
    }

    fn pair() -> (AuthChainA, AuthChainA) {
        let _ = env_logger::builder().is_test(true).try_init();
        let tracker = Arc::new(ReplayTracker::new("test"));
        (
            AuthChainA::new(context(), tracker.clone()),
            AuthChainA::new(context(), tracker),
        )
    }

    #[test]
    fn test_round_trip_with_mss_negotiation() {
        let (mut client, mut server) = pair();
        let data = b"hello".repeat(100);

        let wire = client.client_pre_encrypt(&data).unwrap();
        let (decoded, sendback) = server.server_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, data);
        assert!(sendback);

        let wire = server.server_pre_encrypt(&data).unwrap();
        let decoded = client.client_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, data);
        // The first server frame announced min(mss, 1500).
        assert_eq!(client.ctx.tcp_mss(), 1460);
    }

    #[test]
    fn test_partial_delivery() {
        let (mut client, mut server) = pair();
        let data = b"hello".repeat(100);
        let wire = client.client_pre_encrypt(&data).unwrap();

        let mut decoded = Vec::new();
        for chunk in wire.chunks(7) {
            let (part, _) = server.server_post_decrypt(chunk).unwrap();
            decoded.extend_from_slice(&part);
        }
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_multi_frame_payload() {
        let (mut client, mut server) = pair();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let wire = client.client_pre_encrypt(&data).unwrap();
        let (decoded, _) = server.server_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_empty_frame_requests_sendback() {
        let (mut client, mut server) = pair();
        let wire = client.client_pre_encrypt(&b"hello".repeat(100)).unwrap();
        server.server_post_decrypt(&wire).unwrap();

        let keepalive = client.client_pre_encrypt(&[]).unwrap();
        let (decoded, sendback) = server.server_post_decrypt(&keepalive).unwrap();
        assert!(decoded.is_empty());
        assert!(sendback);
    }

    #[test]
    fn test_tampered_handshake_gets_filler() {
        let (mut client, mut server) = pair();
        let mut wire = client.client_pre_encrypt(&b"hello".repeat(100)).unwrap();
        wire[34] ^= 0xFF; // Inside the credential tag.
        let (out, sendback) = server.server_post_decrypt(&wire).unwrap();
        assert_eq!(out, vec![b'E'; FILLER_LEN]);
        assert!(!sendback);
        assert_eq!(server.overhead(), 0);
        let (out, _) = server.server_post_decrypt(b"anything").unwrap();
        assert_eq!(out, b"anything");
    }

    #[test]
    fn test_tampered_frame_desyncs_stream() {
        let (mut client, mut server) = pair();
        let wire = client.client_pre_encrypt(&b"hello".repeat(100)).unwrap();
        server.server_post_decrypt(&wire).unwrap();

        let mut frame = client.client_pre_encrypt(b"second").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let err = server.server_post_decrypt(&frame);
        assert!(matches!(
            err,
            Err(Error::BadDataReceived(BadDataReceived::ChecksumMismatch))
                | Err(Error::BadDataReceived(BadDataReceived::MalformedFrame { .. }))
        ));
    }

    #[test]
    fn test_handshake_replay_rejected() {
        let tracker = Arc::new(ReplayTracker::new("test"));
        let mut client = AuthChainA::new(context(), tracker.clone());
        let wire = client.client_pre_encrypt(&b"hello".repeat(100)).unwrap();

        let mut first = AuthChainA::new(context(), tracker.clone());
        let (decoded, _) = first.server_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, b"hello".repeat(100));

        let mut second = AuthChainA::new(context(), tracker);
        let (out, _) = second.server_post_decrypt(&wire).unwrap();
        assert_eq!(out, vec![b'E'; FILLER_LEN]);
    }

    #[test]
    fn test_unknown_user_surfaced() {
        let tracker = Arc::new(ReplayTracker::new("test"));
        let mut client = AuthChainA::new(
            context().with_protocol_param("999:wrong"),
            tracker.clone(),
        );
        let mut server = AuthChainA::new(context(), tracker);
        let wire = client.client_pre_encrypt(&b"hello".repeat(100)).unwrap();
        let err = server.server_post_decrypt(&wire);
        assert_eq!(err, Err(Error::UnknownUser { user_id: 999 }));
    }

    #[test]
    fn test_udp_round_trip() {
        let (mut client, mut server) = pair();

        let wire = client.client_udp_pre_encrypt(b"dns query").unwrap();
        let (decoded, uid) = server.server_udp_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, b"dns query");
        assert_eq!(uid, Some(1024u32.to_le_bytes()));

        let wire = server
            .server_udp_pre_encrypt(b"dns reply", uid.as_ref())
            .unwrap();
        let decoded = client.client_udp_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, b"dns reply");
    }

    #[test]
    fn test_udp_tamper_drops_silently() {
        let (mut client, mut server) = pair();
        let mut wire = client.client_udp_pre_encrypt(b"dns query").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xFF;
        let (decoded, uid) = server.server_udp_post_decrypt(&wire).unwrap();
        assert!(decoded.is_empty());
        assert_eq!(uid, None);
    }
}
