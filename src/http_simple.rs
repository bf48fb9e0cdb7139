//! HTTP camouflage method.
//!
//! The first client packet is disguised as a browser `GET` request: the
//! leading bytes ride in the request path as percent-encoded hex, the Host
//! header is drawn from the obfuscation parameter, and the remainder of the
//! packet follows the blank line. The server strips the camouflage, checks
//! the Host against its allow-list and answers with a canned nginx response
//! header. Everything after the first packet passes through untouched.

use chrono::Utc;
use log::warn;
use rand::prelude::IndexedRandom;
use rand::Rng;

use crate::buffer::RecvBuffer;
use crate::config::SessionContext;
use crate::error::Error;
use crate::obfuscator::Obfuscator;

const USER_AGENT: &[&str] = &[
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/40.0",
    "Mozilla/5.0 (Windows NT 6.3; WOW64; rv:40.0) Gecko/20100101 Firefox/44.0",
    "Mozilla/5.0 (Windows NT 6.1) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/41.0.2228.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/535.11 (KHTML, like Gecko) Ubuntu/11.10 Chromium/27.0.1453.93 Chrome/27.0.1453.93 Safari/537.36",
    "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:35.0) Gecko/20100101 Firefox/35.0",
    "Mozilla/5.0 (compatible; WOW64; MSIE 10.0; Windows NT 6.2)",
    "Mozilla/5.0 (Windows; U; Windows NT 6.1; en-US) AppleWebKit/533.20.25 (KHTML, like Gecko) Version/5.0.4 Safari/533.20.27",
    "Mozilla/4.0 (compatible; MSIE 7.0; Windows NT 6.3; Trident/7.0; .NET4.0E; .NET4.0C)",
    "Mozilla/5.0 (Windows NT 6.3; Trident/7.0; rv:11.0) like Gecko",
    "Mozilla/5.0 (Linux; Android 4.4; Nexus 5 Build/BuildID) AppleWebKit/537.36 (KHTML, like Gecko) Version/4.0 Chrome/30.0.0.0 Mobile Safari/537.36",
    "Mozilla/5.0 (iPad; CPU OS 5_0 like Mac OS X) AppleWebKit/534.46 (KHTML, like Gecko) Version/5.1 Mobile/9A334 Safari/7534.48.3",
    "Mozilla/5.0 (iPhone; CPU iPhone OS 5_0 like Mac OS X) AppleWebKit/534.46 (KHTML, like Gecko) Version/5.1 Mobile/9A334 Safari/7534.48.3",
];

const FILLER_LEN: usize = 2048;

pub struct HttpSimple {
    ctx: SessionContext,
    has_sent_header: bool,
    has_recv_header: bool,
    recv_buf: RecvBuffer,
}

impl HttpSimple {
    pub fn new(ctx: SessionContext) -> Self {
        Self {
            ctx,
            has_sent_header: false,
            has_recv_header: false,
            recv_buf: RecvBuffer::new(),
        }
    }

    fn encode_head(head: &[u8]) -> String {
        let mut out = String::with_capacity(head.len() * 3);
        for b in head {
            out.push('%');
            out.push_str(&hex::encode([*b]));
        }
        out
    }

    /// Recovers the percent-encoded bytes from the request line.
    fn data_from_http_header(buf: &[u8]) -> Option<Vec<u8>> {
        let text = String::from_utf8_lossy(buf);
        let first_line = text.split("\r\n").next()?;
        let mut items = first_line.split('%');
        items.next()?; // "GET /"
        let mut result = Vec::new();
        for item in items {
            if item.len() == 2 {
                result.extend_from_slice(&hex::decode(item).ok()?);
            } else if item.len() > 2 {
                // Last item runs into " HTTP/1.1".
                result.extend_from_slice(&hex::decode(&item[..2]).ok()?);
                break;
            } else {
                return None;
            }
        }
        Some(result)
    }

    fn host_from_http_header(buf: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(buf).into_owned();
        text.split("\r\n")
            .find_map(|line| line.strip_prefix("Host: ").map(str::to_string))
    }

    fn not_match_return(&mut self) -> (Vec<u8>, bool) {
        self.has_sent_header = true;
        self.has_recv_header = true;
        self.recv_buf.clear();
        (vec![b'E'; FILLER_LEN], false)
    }
}

impl Obfuscator for HttpSimple {
    fn client_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if self.has_sent_header {
            return Ok(buf.to_vec());
        }
        let head_size = self.ctx.iv().len() + self.ctx.head_len();
        let head_len = if buf.len() > head_size + 64 {
            head_size + rand::rng().random_range(0..64)
        } else {
            buf.len()
        };
        let (head_data, rest) = buf.split_at(head_len);

        let mut hosts = if !self.ctx.obfs_param().is_empty() {
            self.ctx.obfs_param().to_string()
        } else {
            self.ctx.host().to_string()
        };
        // Everything after '#' is a literal request body template.
        let mut body = String::new();
        if let Some(pos) = hosts.find('#') {
            body = hosts[pos + 1..]
                .replace("\\n", "\r\n")
                .replace('\n', "\r\n");
            hosts.truncate(pos);
        }
        let host_list: Vec<&str> = hosts.split(',').collect();
        let host = host_list
            .choose(&mut rand::rng())
            .copied()
            .unwrap_or_default();
        let port = if self.ctx.port() != 80 {
            format!(":{}", self.ctx.port())
        } else {
            String::new()
        };

        let mut request = format!(
            "GET /{} HTTP/1.1\r\nHost: {}{}\r\n",
            Self::encode_head(head_data),
            host,
            port
        );
        if !body.is_empty() {
            request.push_str(&body);
            request.push_str("\r\n\r\n");
        } else {
            let agent = USER_AGENT
                .choose(&mut rand::rng())
                .copied()
                .unwrap_or_default();
            request.push_str(&format!("User-Agent: {agent}\r\n"));
            request.push_str(
                "Accept: text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8\r\n\
                 Accept-Language: en-US,en;q=0.8\r\nAccept-Encoding: gzip, deflate\r\n\
                 DNT: 1\r\nConnection: keep-alive\r\n\r\n",
            );
        }
        self.has_sent_header = true;
        let mut out = request.into_bytes();
        out.extend_from_slice(rest);
        Ok(out)
    }

    fn client_post_decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if self.has_recv_header {
            return Ok(buf.to_vec());
        }
        self.recv_buf.extend(buf);
        let b = self.recv_buf.as_slice();
        match b.windows(4).position(|w| w == b"\r\n\r\n") {
            Some(pos) => {
                let out = b[pos + 4..].to_vec();
                self.has_recv_header = true;
                self.recv_buf.clear();
                Ok(out)
            }
            None => Ok(Vec::new()),
        }
    }

    fn server_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        if self.has_sent_header {
            return Ok(buf.to_vec());
        }
        let header = format!(
            "HTTP/1.1 200 OK\r\nConnection: keep-alive\r\nContent-Encoding: gzip\r\n\
             Content-Type: text/html\r\nDate: {}\r\nServer: nginx\r\n\
             Vary: Accept-Encoding\r\n\r\n",
            Utc::now().format("%a, %d %b %Y %H:%M:%S GMT")
        );
        self.has_sent_header = true;
        let mut out = header.into_bytes();
        out.extend_from_slice(buf);
        Ok(out)
    }

    fn server_post_decrypt(&mut self, buf: &[u8]) -> Result<(Vec<u8>, bool), Error> {
        if self.has_recv_header {
            return Ok((buf.to_vec(), true));
        }
        self.recv_buf.extend(buf);
        let buf = self.recv_buf.as_slice().to_vec();
        if buf.len() <= 10 {
            return Ok((Vec::new(), false));
        }
        if !(buf.starts_with(b"GET ") || buf.starts_with(b"POST ")) {
            warn!("http_simple: request line does not match");
            return Ok(self.not_match_return());
        }
        if buf.len() > 65536 {
            warn!("http_simple: camouflage header over size");
            return Ok(self.not_match_return());
        }

        let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") else {
            return Ok((Vec::new(), false));
        };

        let Some(mut result) = Self::data_from_http_header(&buf) else {
            return Ok(self.not_match_return());
        };

        if let Some(host) = Self::host_from_http_header(&buf) {
            if !host.is_empty() && !self.ctx.obfs_param().is_empty() {
                let host = host.split(':').next().unwrap_or_default();
                let allowed = self
                    .ctx
                    .obfs_param()
                    .split('#')
                    .next()
                    .unwrap_or_default()
                    .split(',')
                    .any(|h| h == host);
                if !allowed {
                    warn!("http_simple: host {host:?} not in allow list");
                    return Ok(self.not_match_return());
                }
            }
        }

        if result.len() < 4 {
            return Ok(self.not_match_return());
        }
        result.extend_from_slice(&buf[header_end + 4..]);
        if result.len() >= 13 {
            self.has_recv_header = true;
            self.recv_buf.clear();
            return Ok((result, true));
        }
        Ok(self.not_match_return())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> SessionContext {
        SessionContext::new()
            .with_iv(vec![0u8; 16])
            .with_port(8388)
            .with_host("example.com")
    }

    #[test]
    fn test_round_trip_first_packet() {
        let mut client = HttpSimple::new(context());
        let mut server = HttpSimple::new(context());
        let payload: Vec<u8> = (0u8..=255).cycle().take(400).collect();

        let wire = client.client_pre_encrypt(&payload).unwrap();
        assert!(wire.starts_with(b"GET /%"));
        let (decoded, sendback) = server.server_post_decrypt(&wire).unwrap();
        assert!(sendback);
        assert_eq!(decoded, payload);

        // Later packets pass through untouched.
        let wire = client.client_pre_encrypt(b"follow-up").unwrap();
        assert_eq!(wire, b"follow-up");
        let (decoded, _) = server.server_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, b"follow-up");
    }

    #[test]
    fn test_server_response_camouflage() {
        let mut client = HttpSimple::new(context());
        let mut server = HttpSimple::new(context());
        let wire = server.server_pre_encrypt(b"reply").unwrap();
        assert!(wire.starts_with(b"HTTP/1.1 200 OK\r\n"));
        let decoded = client.client_post_decrypt(&wire).unwrap();
        assert_eq!(decoded, b"reply");
    }

    #[test]
    fn test_partial_header_waits() {
        let mut client = HttpSimple::new(context());
        let mut server = HttpSimple::new(context());
        let payload = vec![0x5au8; 300];
        let wire = client.client_pre_encrypt(&payload).unwrap();

        // First delivery ends inside the request line.
        let (out, sendback) = server.server_post_decrypt(&wire[..20]).unwrap();
        assert!(out.is_empty());
        assert!(!sendback);
        let (decoded, sendback) = server.server_post_decrypt(&wire[20..]).unwrap();
        assert!(sendback);
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_non_http_input_gets_filler() {
        let mut server = HttpSimple::new(context());
        let (out, sendback) = server.server_post_decrypt(&[0u8; 64]).unwrap();
        assert_eq!(out, vec![b'E'; FILLER_LEN]);
        assert!(!sendback);
        // Raw passthrough from here on.
        let (out, _) = server.server_post_decrypt(b"anything").unwrap();
        assert_eq!(out, b"anything");
    }

    #[test]
    fn test_host_allow_list_enforced() {
        let ctx = context().with_obfs_param("cdn.example.com");
        let mut client = HttpSimple::new(
            context().with_obfs_param("evil.example.org"),
        );
        let mut server = HttpSimple::new(ctx);
        let wire = client.client_pre_encrypt(&vec![1u8; 300]).unwrap();
        let (out, _) = server.server_post_decrypt(&wire).unwrap();
        assert_eq!(out, vec![b'E'; FILLER_LEN]);
    }
}
