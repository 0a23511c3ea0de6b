//! VMess AEAD header sealing
//!
//! Client half of the AEAD header format used when alter_id = 0: the
//! request header is sealed under keys derived from the command key, and
//! the response header is opened under keys derived from the request body
//! key/IV.

use aes::cipher::{BlockEncrypt, KeyInit as AesKeyInit};
use aes::Aes128;
use aes_gcm::{aead::Aead, Aes128Gcm, KeyInit, Nonce};
use crc32fast::Hasher as Crc32Hasher;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

use crate::error::{Error, Result};

// KDF salt constants
pub const KDF_SALT_VMESS_AEAD_KDF: &[u8] = b"VMess AEAD KDF";
pub const KDF_SALT_AUTH_ID_ENCRYPTION_KEY: &str = "AES Auth ID Encryption";
pub const KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_KEY: &str = "VMess Header AEAD Key";
pub const KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_IV: &str = "VMess Header AEAD Nonce";
pub const KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_KEY: &str = "VMess Header AEAD Key_Length";
pub const KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_IV: &str = "VMess Header AEAD Nonce_Length";
pub const KDF_SALT_AEAD_RESP_HEADER_LEN_KEY: &str = "AEAD Resp Header Len Key";
pub const KDF_SALT_AEAD_RESP_HEADER_LEN_IV: &str = "AEAD Resp Header Len IV";
pub const KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_KEY: &str = "AEAD Resp Header Key";
pub const KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_IV: &str = "AEAD Resp Header IV";

const HMAC_BLOCK_SIZE: usize = 64; // SHA256 block size

fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut hmac =
        <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC can take key of any size");
    hmac.update(data);
    let result = hmac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&result);
    out
}

/// Hash if longer than the block size, zero-pad otherwise
fn process_hmac_key(key: &[u8]) -> [u8; HMAC_BLOCK_SIZE] {
    let mut result = [0u8; HMAC_BLOCK_SIZE];
    if key.len() > HMAC_BLOCK_SIZE {
        use sha2::Digest;
        let hash = sha2::Sha256::digest(key);
        result[..32].copy_from_slice(&hash);
    } else {
        result[..key.len()].copy_from_slice(key);
    }
    result
}

/// V2Ray's nested-HMAC KDF.
///
/// With no path this is HMAC-SHA256(KDF_SALT, key); each path wraps the
/// previous HMAC as the hash function of a new one, outermost last.
pub fn kdf(key: &[u8], paths: &[&[u8]]) -> Vec<u8> {
    kdf_recursive(key, paths)
}

fn kdf_recursive(message: &[u8], paths: &[&[u8]]) -> Vec<u8> {
    if paths.is_empty() {
        return hmac_sha256(KDF_SALT_VMESS_AEAD_KDF, message).to_vec();
    }

    let last_path = paths[paths.len() - 1];
    let remaining = &paths[..paths.len() - 1];

    let processed_key = process_hmac_key(last_path);

    let mut ipad = [0x36u8; HMAC_BLOCK_SIZE];
    let mut opad = [0x5cu8; HMAC_BLOCK_SIZE];
    for i in 0..HMAC_BLOCK_SIZE {
        ipad[i] ^= processed_key[i];
        opad[i] ^= processed_key[i];
    }

    // inner = H(ipad || message), outer = H(opad || inner), where H is the
    // nested HMAC for the remaining paths
    let mut inner_data = Vec::with_capacity(HMAC_BLOCK_SIZE + message.len());
    inner_data.extend_from_slice(&ipad);
    inner_data.extend_from_slice(message);
    let inner = kdf_recursive(&inner_data, remaining);

    let mut outer_data = Vec::with_capacity(HMAC_BLOCK_SIZE + 32);
    outer_data.extend_from_slice(&opad);
    outer_data.extend_from_slice(&inner);
    kdf_recursive(&outer_data, remaining)
}

/// KDF truncated to 16 bytes
pub fn kdf16(key: &[u8], paths: &[&[u8]]) -> [u8; 16] {
    let result = kdf(key, paths);
    let mut out = [0u8; 16];
    out.copy_from_slice(&result[..16]);
    out
}

/// Auth ID: AES(kdf16(cmd_key), timestamp + random + crc32)
pub fn create_auth_id(cmd_key: &[u8], timestamp: i64) -> [u8; 16] {
    let mut buf = Vec::with_capacity(16);
    buf.extend_from_slice(&timestamp.to_be_bytes());

    let mut random = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut random);
    buf.extend_from_slice(&random);

    let mut hasher = Crc32Hasher::new();
    hasher.update(&buf);
    let checksum = hasher.finalize();
    buf.extend_from_slice(&checksum.to_be_bytes());

    let aes_key = kdf16(cmd_key, &[KDF_SALT_AUTH_ID_ENCRYPTION_KEY.as_bytes()]);
    let cipher = Aes128::new_from_slice(&aes_key).expect("16-byte key");

    let mut result: [u8; 16] = buf.try_into().expect("16-byte auth id");
    let block = aes::Block::from_mut_slice(&mut result);
    cipher.encrypt_block(block);
    result
}

/// Seal the request header:
/// auth_id(16) | sealed_length(18) | nonce(8) | sealed_payload
pub fn seal_vmess_aead_header(cmd_key: &[u8; 16], data: &[u8]) -> Result<Vec<u8>> {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Protocol(format!("time error: {}", e)))?
        .as_secs() as i64;

    let auth_id = create_auth_id(cmd_key, timestamp);

    let mut connection_nonce = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut connection_nonce);

    let payload_length = data.len() as u16;
    let length_bytes = payload_length.to_be_bytes();

    let length_key = kdf16(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_KEY.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    );
    let length_iv = kdf(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_PAYLOAD_LENGTH_AEAD_IV.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    );

    let length_cipher = Aes128Gcm::new_from_slice(&length_key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {}", e)))?;
    let encrypted_length = length_cipher
        .encrypt(
            Nonce::from_slice(&length_iv[..12]),
            aes_gcm::aead::Payload {
                msg: &length_bytes,
                aad: &auth_id,
            },
        )
        .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

    let payload_key = kdf16(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_KEY.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    );
    let payload_iv = kdf(
        cmd_key,
        &[
            KDF_SALT_VMESS_HEADER_PAYLOAD_AEAD_IV.as_bytes(),
            &auth_id,
            &connection_nonce,
        ],
    );

    let payload_cipher = Aes128Gcm::new_from_slice(&payload_key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {}", e)))?;
    let encrypted_payload = payload_cipher
        .encrypt(
            Nonce::from_slice(&payload_iv[..12]),
            aes_gcm::aead::Payload {
                msg: data,
                aad: &auth_id,
            },
        )
        .map_err(|e| Error::Crypto(format!("encryption failed: {}", e)))?;

    let mut output = Vec::with_capacity(16 + 18 + 8 + encrypted_payload.len());
    output.extend_from_slice(&auth_id);
    output.extend_from_slice(&encrypted_length);
    output.extend_from_slice(&connection_nonce);
    output.extend_from_slice(&encrypted_payload);
    Ok(output)
}

/// Open the response header length (first 18 bytes from the server)
pub fn open_aead_response_header(
    response_body_key: &[u8; 16],
    response_body_iv: &[u8; 16],
    encrypted_length: &[u8; 18],
) -> Result<u16> {
    let length_key = kdf16(
        response_body_key,
        &[KDF_SALT_AEAD_RESP_HEADER_LEN_KEY.as_bytes()],
    );
    let length_iv = kdf(
        response_body_iv,
        &[KDF_SALT_AEAD_RESP_HEADER_LEN_IV.as_bytes()],
    );

    let cipher = Aes128Gcm::new_from_slice(&length_key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {}", e)))?;
    let decrypted = cipher
        .decrypt(Nonce::from_slice(&length_iv[..12]), encrypted_length.as_ref())
        .map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))?;

    if decrypted.len() < 2 {
        return Err(Error::Protocol("invalid response header length".into()));
    }
    Ok(u16::from_be_bytes([decrypted[0], decrypted[1]]))
}

/// Open the response header payload
pub fn open_aead_response_payload(
    response_body_key: &[u8; 16],
    response_body_iv: &[u8; 16],
    encrypted_payload: &[u8],
) -> Result<Vec<u8>> {
    let payload_key = kdf16(
        response_body_key,
        &[KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_KEY.as_bytes()],
    );
    let payload_iv = kdf(
        response_body_iv,
        &[KDF_SALT_AEAD_RESP_HEADER_PAYLOAD_IV.as_bytes()],
    );

    let cipher = Aes128Gcm::new_from_slice(&payload_key)
        .map_err(|e| Error::Crypto(format!("cipher init failed: {}", e)))?;
    cipher
        .decrypt(Nonce::from_slice(&payload_iv[..12]), encrypted_payload)
        .map_err(|e| Error::Crypto(format!("decryption failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_no_path() {
        let key = b"test key";
        let result = kdf(key, &[]);
        let hex_result: String = result.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex_result,
            "e4389fc55d2b40befe2bfc5787a202916e0b57213465d55c5bedc08be576f2af"
        );
    }

    #[test]
    fn test_kdf_one_path() {
        let key = b"test key";
        let result = kdf(key, &[b"path1"]);
        let hex_result: String = result.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex_result,
            "274e0b9dacec4540b504cffbbd235394346da66ff89f8c1af2a10c62e27e1090"
        );
    }

    #[test]
    fn test_kdf_two_paths() {
        let key = b"test key";
        let result = kdf(key, &[b"path1", b"path2"]);
        let hex_result: String = result.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(
            hex_result,
            "7b78473a74cb9f81d07befa35223da86e8de962c4ccf51a8d208b73bcd27cfd6"
        );
    }

    #[test]
    fn test_kdf16_auth_id() {
        let key = b"test key";
        let result = kdf16(key, &[b"AES Auth ID Encryption"]);
        let hex_result: String = result.iter().map(|b| format!("{:02x}", b)).collect();
        assert_eq!(hex_result, "79a99739c76a37ab3f652841fbcf3cd0");
    }

    #[test]
    fn test_create_auth_id() {
        let cmd_key = [0u8; 16];
        let timestamp = 1234567890i64;
        let auth_id = create_auth_id(&cmd_key, timestamp);
        assert_eq!(auth_id.len(), 16);
    }
}
