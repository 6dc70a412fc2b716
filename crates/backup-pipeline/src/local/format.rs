//! On-disk layout of a backup artifact.
//!
//! ```text
//! header  : "BKUP" | version u8 | flags u8 | timestamp_ms i64 LE
//! frame*  : tag u8 | len u32 LE | body
//! trailer : 0xFF   | 32 u32 LE  | sha256(all preceding bytes)
//! ```
//!
//! Entry and media bodies are sealed with ChaCha20-Poly1305 (12-byte nonce
//! prefix) unless the plaintext flag is set.

use std::io::{self, Write};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::config::BackupKey;
use crate::error::{Error, Result};

pub const MAGIC: &[u8; 4] = b"BKUP";
pub const VERSION: u8 = 1;
pub const HEADER_LEN: usize = 14;
pub const FLAG_ENCRYPTED: u8 = 0x01;

pub const TAG_ENTRY: u8 = 0x01;
pub const TAG_MEDIA: u8 = 0x02;
pub const TAG_TRAILER: u8 = 0xFF;

pub const NONCE_LEN: usize = 12;
pub const DIGEST_LEN: usize = 32;

pub fn encode_header(encrypted: bool, timestamp_ms: i64) -> [u8; HEADER_LEN] {
    let mut out = [0u8; HEADER_LEN];
    out[..4].copy_from_slice(MAGIC);
    out[4] = VERSION;
    out[5] = if encrypted { FLAG_ENCRYPTED } else { 0 };
    out[6..].copy_from_slice(&timestamp_ms.to_le_bytes());
    out
}

pub fn frame_header(tag: u8, len: usize) -> Result<[u8; 5]> {
    let len = u32::try_from(len)
        .map_err(|_| Error::msg(format!("artifact frame too large ({len} bytes)")))?;
    let mut out = [0u8; 5];
    out[0] = tag;
    out[1..].copy_from_slice(&len.to_le_bytes());
    Ok(out)
}

pub fn trailer(digest: &[u8; DIGEST_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(5 + DIGEST_LEN);
    out.push(TAG_TRAILER);
    out.extend_from_slice(&(DIGEST_LEN as u32).to_le_bytes());
    out.extend_from_slice(digest);
    out
}

pub fn encode_entry(path: &str, data: &[u8]) -> Result<Vec<u8>> {
    let plen = u16::try_from(path.len())
        .map_err(|_| Error::msg(format!("entry path too long: {path}")))?;
    let mut out = Vec::with_capacity(2 + path.len() + data.len());
    out.extend_from_slice(&plen.to_le_bytes());
    out.extend_from_slice(path.as_bytes());
    out.extend_from_slice(data);
    Ok(out)
}

/// Splits an entry body into path and data.
pub fn decode_entry(body: &[u8]) -> std::result::Result<(&str, &[u8]), String> {
    if body.len() < 2 {
        return Err("entry shorter than its path length".into());
    }
    let plen = u16::from_le_bytes([body[0], body[1]]) as usize;
    let rest = &body[2..];
    if rest.len() < plen {
        return Err("entry path runs past the frame".into());
    }
    let path = std::str::from_utf8(&rest[..plen]).map_err(|_| "entry path is not utf-8".to_string())?;
    if path.is_empty() {
        return Err("entry has an empty path".into());
    }
    Ok((path, &rest[plen..]))
}

pub struct Sealer {
    cipher: Option<ChaCha20Poly1305>,
}

impl Sealer {
    pub fn new(key: &BackupKey, encrypted: bool) -> Self {
        Self {
            cipher: encrypted.then(|| ChaCha20Poly1305::new(Key::from_slice(key.as_bytes()))),
        }
    }

    pub fn seal(&self, body: Vec<u8>) -> Result<Vec<u8>> {
        let Some(cipher) = self.cipher.as_ref() else {
            return Ok(body);
        };
        let mut nonce = [0u8; NONCE_LEN];
        rand::rng().fill_bytes(&mut nonce);
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), body.as_slice())
            .map_err(|_| Error::msg("failed to seal artifact frame"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    pub fn open(&self, body: &[u8]) -> std::result::Result<Vec<u8>, String> {
        let Some(cipher) = self.cipher.as_ref() else {
            return Ok(body.to_vec());
        };
        if body.len() < NONCE_LEN {
            return Err("sealed frame shorter than its nonce".into());
        }
        let (nonce, ct) = body.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ct)
            .map_err(|_| "frame failed authentication".to_string())
    }
}

/// Writer that hashes everything passing through it.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn finish(mut self) -> io::Result<[u8; DIGEST_LEN]> {
        self.inner.flush()?;
        Ok(self.hasher.finalize().into())
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written = self.written.saturating_add(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
