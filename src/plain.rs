//! The null method: every transform is the identity.
//!
//! Useful for deployments that rely on the outer cipher layer alone, and as
//! the baseline the other methods extend.

use crate::config::SessionContext;
use crate::error::Error;
use crate::obfuscator::Obfuscator;

pub struct Plain {
    #[allow(dead_code)]
    ctx: SessionContext,
}

impl Plain {
    pub fn new(ctx: SessionContext) -> Self {
        Self { ctx }
    }
}

impl Obfuscator for Plain {
    fn client_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(buf.to_vec())
    }

    fn client_post_decrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(buf.to_vec())
    }

    fn server_pre_encrypt(&mut self, buf: &[u8]) -> Result<Vec<u8>, Error> {
        Ok(buf.to_vec())
    }

    fn server_post_decrypt(&mut self, buf: &[u8]) -> Result<(Vec<u8>, bool), Error> {
        Ok((buf.to_vec(), false))
    }
}
