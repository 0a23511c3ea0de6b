//! Shadowsocks AEAD client outbound
//!
//! Wire format per direction: a random salt, then chunks of
//! `AEAD(len) | AEAD(payload)` where both pieces carry their own tag and
//! the nonce is a little-endian counter. The first chunk the client sends
//! starts with the SOCKS5-encoded target address.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::Aead;
use aes_gcm::{Aes128Gcm, Aes256Gcm, KeyInit};
use async_trait::async_trait;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use rand::RngCore;
use sha1::Sha1;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::common::{Metadata, Result, Stream};
use crate::error::Error;
use crate::transport::tcp;

use super::{server_addr, OutboundAdapter, ProxyKind, ShadowsocksOption};

const TAG_SIZE: usize = 16;
const MAX_CHUNK_SIZE: usize = 0x3FFF;

/// Supported AEAD ciphers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CipherKind {
    Aes128Gcm,
    Aes256Gcm,
    Chacha20Poly1305,
}

impl CipherKind {
    fn parse(name: &str) -> Result<Self> {
        match name.to_lowercase().as_str() {
            "aes-128-gcm" => Ok(CipherKind::Aes128Gcm),
            "aes-256-gcm" => Ok(CipherKind::Aes256Gcm),
            "chacha20-ietf-poly1305" | "chacha20-poly1305" => Ok(CipherKind::Chacha20Poly1305),
            other => Err(Error::Config(format!(
                "unsupported shadowsocks cipher: {other}"
            ))),
        }
    }

    fn key_len(&self) -> usize {
        match self {
            CipherKind::Aes128Gcm => 16,
            CipherKind::Aes256Gcm | CipherKind::Chacha20Poly1305 => 32,
        }
    }

    fn salt_len(&self) -> usize {
        self.key_len()
    }
}

/// Derive the master key from the password, OpenSSL EVP_BytesToKey style
fn evp_bytes_to_key(password: &str, key_len: usize) -> Vec<u8> {
    let mut key = Vec::new();
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut data = prev.clone();
        data.extend_from_slice(password.as_bytes());
        let digest = md5::compute(&data);
        prev = digest.0.to_vec();
        key.extend_from_slice(&prev);
    }
    key.truncate(key_len);
    key
}

/// Per-session subkey via HKDF-SHA1 with the "ss-subkey" info string
fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut okm = vec![0u8; key_len];
    hk.expand(b"ss-subkey", &mut okm)
        .map_err(|e| Error::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// AEAD session with the little-endian counter nonce
struct SessionCipher {
    kind: CipherKind,
    key: Vec<u8>,
    counter: u64,
}

impl SessionCipher {
    fn new(kind: CipherKind, key: Vec<u8>) -> Self {
        Self {
            kind,
            key,
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..8].copy_from_slice(&self.counter.to_le_bytes());
        self.counter = self.counter.wrapping_add(1);
        nonce
    }

    fn seal(&mut self, plaintext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let nonce = GenericArray::from_slice(&nonce);
        let result = match self.kind {
            CipherKind::Aes128Gcm => {
                Aes128Gcm::new(GenericArray::from_slice(&self.key)).encrypt(nonce, plaintext)
            }
            CipherKind::Aes256Gcm => {
                Aes256Gcm::new(GenericArray::from_slice(&self.key)).encrypt(nonce, plaintext)
            }
            CipherKind::Chacha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key)).encrypt(nonce, plaintext)
            }
        };
        result.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "AEAD seal failed"))
    }

    fn open(&mut self, ciphertext: &[u8]) -> io::Result<Vec<u8>> {
        let nonce = self.next_nonce();
        let nonce = GenericArray::from_slice(&nonce);
        let result = match self.kind {
            CipherKind::Aes128Gcm => {
                Aes128Gcm::new(GenericArray::from_slice(&self.key)).decrypt(nonce, ciphertext)
            }
            CipherKind::Aes256Gcm => {
                Aes256Gcm::new(GenericArray::from_slice(&self.key)).decrypt(nonce, ciphertext)
            }
            CipherKind::Chacha20Poly1305 => {
                ChaCha20Poly1305::new(GenericArray::from_slice(&self.key)).decrypt(nonce, ciphertext)
            }
        };
        result.map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "AEAD open failed"))
    }
}

// ============================================================================
// Stream
// ============================================================================

enum ReadState {
    /// Waiting for the server salt
    Salt { buf: Vec<u8>, pos: usize },
    Length { buf: [u8; 2 + TAG_SIZE], pos: usize },
    Data { buf: Vec<u8>, pos: usize },
}

/// Shadowsocks AEAD-encrypted stream
struct ShadowsocksStream {
    inner: Stream,
    kind: CipherKind,
    master_key: Vec<u8>,

    write_cipher: SessionCipher,
    /// Salt plus the address chunk, sent in front of the first payload
    pending_head: Option<Vec<u8>>,

    read_cipher: Option<SessionCipher>,
    read_state: ReadState,
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl ShadowsocksStream {
    fn client(inner: Stream, kind: CipherKind, master_key: Vec<u8>, target: &[u8]) -> io::Result<Self> {
        let mut salt = vec![0u8; kind.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);

        let subkey = derive_subkey(&master_key, &salt, kind.key_len())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        let mut write_cipher = SessionCipher::new(kind, subkey);

        // salt | AEAD(len(addr)) | AEAD(addr)
        let mut head = salt;
        head.extend_from_slice(&seal_chunk(&mut write_cipher, target)?);

        Ok(Self {
            inner,
            kind,
            master_key,
            write_cipher,
            pending_head: Some(head),
            read_cipher: None,
            read_state: ReadState::Salt {
                buf: vec![0u8; kind.salt_len()],
                pos: 0,
            },
            read_buf: Vec::new(),
            read_pos: 0,
        })
    }
}

fn seal_chunk(cipher: &mut SessionCipher, payload: &[u8]) -> io::Result<Vec<u8>> {
    let len_bytes = (payload.len() as u16).to_be_bytes();
    let mut out = cipher.seal(&len_bytes)?;
    out.extend_from_slice(&cipher.seal(payload)?);
    Ok(out)
}

impl AsyncRead for ShadowsocksStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        // Serve decrypted leftovers first
        if this.read_pos < this.read_buf.len() {
            let n = (this.read_buf.len() - this.read_pos).min(out.remaining());
            out.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
            this.read_pos += n;
            return Poll::Ready(Ok(()));
        }
        this.read_buf.clear();
        this.read_pos = 0;

        loop {
            match &mut this.read_state {
                ReadState::Salt { buf, pos } => {
                    let mut temp = ReadBuf::new(&mut buf[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Ok(()));
                            }
                            *pos += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    if *pos < buf.len() {
                        continue;
                    }

                    let subkey = derive_subkey(&this.master_key, buf, this.kind.key_len())
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    this.read_cipher = Some(SessionCipher::new(this.kind, subkey));
                    this.read_state = ReadState::Length {
                        buf: [0u8; 2 + TAG_SIZE],
                        pos: 0,
                    };
                }

                ReadState::Length { buf, pos } => {
                    let mut temp = ReadBuf::new(&mut buf[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                if *pos == 0 {
                                    return Poll::Ready(Ok(()));
                                }
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "truncated length chunk",
                                )));
                            }
                            *pos += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    if *pos < buf.len() {
                        continue;
                    }

                    let cipher = this.read_cipher.as_mut().expect("cipher after salt");
                    let plain = cipher.open(&buf[..])?;
                    let length = u16::from_be_bytes([plain[0], plain[1]]) as usize & MAX_CHUNK_SIZE;
                    this.read_state = ReadState::Data {
                        buf: vec![0u8; length + TAG_SIZE],
                        pos: 0,
                    };
                }

                ReadState::Data { buf, pos } => {
                    let mut temp = ReadBuf::new(&mut buf[*pos..]);
                    match Pin::new(&mut this.inner).poll_read(cx, &mut temp) {
                        Poll::Ready(Ok(())) => {
                            let n = temp.filled().len();
                            if n == 0 {
                                return Poll::Ready(Err(io::Error::new(
                                    io::ErrorKind::UnexpectedEof,
                                    "truncated payload chunk",
                                )));
                            }
                            *pos += n;
                        }
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                    if *pos < buf.len() {
                        continue;
                    }

                    let data = std::mem::take(buf);
                    this.read_state = ReadState::Length {
                        buf: [0u8; 2 + TAG_SIZE],
                        pos: 0,
                    };

                    let cipher = this.read_cipher.as_mut().expect("cipher after salt");
                    let plain = cipher.open(&data)?;
                    let n = plain.len().min(out.remaining());
                    out.put_slice(&plain[..n]);
                    if n < plain.len() {
                        this.read_buf = plain;
                        this.read_pos = n;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

impl AsyncWrite for ShadowsocksStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let this = self.get_mut();
        let size = buf.len().min(MAX_CHUNK_SIZE);
        let chunk = seal_chunk(&mut this.write_cipher, &buf[..size])?;

        let to_write = match this.pending_head.take() {
            Some(mut head) => {
                head.extend_from_slice(&chunk);
                head
            }
            None => chunk,
        };

        match Pin::new(&mut this.inner).poll_write(cx, &to_write) {
            Poll::Ready(Ok(n)) if n == to_write.len() => Poll::Ready(Ok(size)),
            Poll::Ready(Ok(_)) => Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial chunk write",
            ))),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

// ============================================================================
// Adapter
// ============================================================================

/// Shadowsocks proxy client
pub struct ShadowsocksAdapter {
    option: ShadowsocksOption,
    kind: CipherKind,
    master_key: Vec<u8>,
}

impl ShadowsocksAdapter {
    pub fn new(option: ShadowsocksOption) -> Result<Self> {
        if option.server.is_empty() {
            return Err(Error::Config(format!(
                "shadowsocks proxy {}: missing server",
                option.name
            )));
        }
        if option.password.is_empty() {
            return Err(Error::Config(format!(
                "shadowsocks proxy {}: missing password",
                option.name
            )));
        }
        let kind = CipherKind::parse(&option.cipher)?;
        let master_key = evp_bytes_to_key(&option.password, kind.key_len());
        Ok(Self {
            option,
            kind,
            master_key,
        })
    }
}

#[async_trait]
impl OutboundAdapter for ShadowsocksAdapter {
    fn name(&self) -> &str {
        &self.option.name
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Shadowsocks
    }

    fn addr(&self) -> String {
        server_addr(&self.option.server, self.option.port)
    }

    fn supports_udp(&self) -> bool {
        self.option.udp
    }

    async fn dial(&self, metadata: &Metadata) -> Result<Stream> {
        let server = (self.option.server.as_str(), self.option.port).into();
        let stream = tcp::dial(&server).await?;

        let target = metadata.destination().to_socks_bytes();
        let ss = ShadowsocksStream::client(stream, self.kind, self.master_key.clone(), &target)?;
        Ok(Box::new(ss))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_evp_bytes_to_key() {
        // Matches OpenSSL EVP_BytesToKey(md5, no salt, 1 round)
        let key = evp_bytes_to_key("barfoo!", 32);
        assert_eq!(key.len(), 32);
        // Deterministic
        assert_eq!(key, evp_bytes_to_key("barfoo!", 32));
        assert_ne!(key[..16], key[16..]);
    }

    #[test]
    fn test_cipher_parse() {
        assert!(CipherKind::parse("aes-128-gcm").is_ok());
        assert!(CipherKind::parse("AES-256-GCM").is_ok());
        assert!(CipherKind::parse("chacha20-ietf-poly1305").is_ok());
        assert!(CipherKind::parse("rc4-md5").is_err());
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let key = vec![7u8; 16];
        let mut seal = SessionCipher::new(CipherKind::Aes128Gcm, key.clone());
        let mut open = SessionCipher::new(CipherKind::Aes128Gcm, key);

        for payload in [&b"hello"[..], &b""[..], &[0u8; 1000][..]] {
            let sealed = seal.seal(payload).unwrap();
            let opened = open.open(&sealed).unwrap();
            assert_eq!(opened, payload);
        }
    }
}
