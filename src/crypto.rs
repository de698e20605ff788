//! Payload decryption for socket telemetry
//!
//! The vendor backend encrypts socket payloads with AES in ECB mode, keyed
//! directly by the session token bytes. Ciphertext arrives base64-encoded
//! inside the frame envelope; the plaintext is PKCS#7-padded JSON that some
//! firmware revisions additionally pad with trailing NUL bytes.
//!
//! Only the decrypt direction exists: the client never encrypts.

use crate::error::{Error, Result};
use aes::cipher::{Block, BlockDecrypt, BlockSizeUser, KeyInit};
use aes::{Aes128, Aes192, Aes256};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// AES block size in bytes
const BLOCK_SIZE: usize = 16;

/// Decrypt a base64 ciphertext with the session token as the AES key.
///
/// Token length selects the cipher: 16 bytes AES-128, 24 bytes AES-192,
/// 32 bytes AES-256. A failure here usually means the token rotated under
/// us, not that the frame itself was malformed.
pub fn decrypt(ciphertext_b64: &str, token: &str) -> Result<String> {
    let mut data = BASE64
        .decode(ciphertext_b64.trim())
        .map_err(|e| Error::Decode(format!("ciphertext is not valid base64: {e}")))?;

    if data.is_empty() || data.len() % BLOCK_SIZE != 0 {
        return Err(Error::Decode(format!(
            "ciphertext length {} is not a positive multiple of the block size",
            data.len()
        )));
    }

    let key = token.as_bytes();
    match key.len() {
        16 => ecb_decrypt(&new_cipher::<Aes128>(key)?, &mut data),
        24 => ecb_decrypt(&new_cipher::<Aes192>(key)?, &mut data),
        32 => ecb_decrypt(&new_cipher::<Aes256>(key)?, &mut data),
        n => {
            return Err(Error::Decode(format!(
                "token length {n} does not match a supported AES key size"
            )))
        }
    }

    let unpadded = pkcs7_unpad(&data)?;

    // Some payloads carry NUL padding past the PKCS#7 layer
    let trimmed = unpadded
        .iter()
        .rposition(|&b| b != 0)
        .map_or(&unpadded[..0], |i| &unpadded[..=i]);

    String::from_utf8(trimmed.to_vec())
        .map_err(|e| Error::Decode(format!("plaintext is not UTF-8: {e}")))
}

fn new_cipher<C: KeyInit>(key: &[u8]) -> Result<C> {
    C::new_from_slice(key).map_err(|_| Error::Decode("invalid AES key".to_string()))
}

fn ecb_decrypt<C: BlockDecrypt + BlockSizeUser>(cipher: &C, buf: &mut [u8]) {
    for chunk in buf.chunks_exact_mut(C::block_size()) {
        cipher.decrypt_block(Block::<C>::from_mut_slice(chunk));
    }
}

fn pkcs7_unpad(data: &[u8]) -> Result<&[u8]> {
    let pad = *data.last().ok_or_else(|| Error::Decode("empty plaintext".to_string()))? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(Error::Decode(format!("invalid PKCS#7 pad byte {pad}")));
    }
    let (body, padding) = data.split_at(data.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(Error::Decode("inconsistent PKCS#7 padding".to_string()));
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::BlockEncrypt;

    const TOKEN: &str = "0123456789abcdef";

    /// Build ciphertext the way the vendor backend does: PKCS#7 pad, then
    /// AES-128-ECB with the token bytes as key, then base64.
    fn encrypt_fixture(plaintext: &str, token: &str) -> String {
        let mut data = plaintext.as_bytes().to_vec();
        let pad = BLOCK_SIZE - data.len() % BLOCK_SIZE;
        data.extend(std::iter::repeat(pad as u8).take(pad));

        let cipher = Aes128::new_from_slice(token.as_bytes()).unwrap();
        for chunk in data.chunks_exact_mut(BLOCK_SIZE) {
            cipher.encrypt_block(Block::<Aes128>::from_mut_slice(chunk));
        }
        BASE64.encode(&data)
    }

    #[test]
    fn test_round_trip() {
        let plain = r#"{"infoType":20001,"data":{"mode":"sweep","elec":55}}"#;
        let ciphertext = encrypt_fixture(plain, TOKEN);
        assert_eq!(decrypt(&ciphertext, TOKEN).unwrap(), plain);
    }

    #[test]
    fn test_round_trip_exact_block_multiple() {
        // 16 bytes of payload forces a full extra padding block
        let plain = "0123456789abcdef";
        let ciphertext = encrypt_fixture(plain, TOKEN);
        assert_eq!(decrypt(&ciphertext, TOKEN).unwrap(), plain);
    }

    #[test]
    fn test_trailing_nul_stripped() {
        let ciphertext = encrypt_fixture("{\"a\":1}\0\0\0", TOKEN);
        assert_eq!(decrypt(&ciphertext, TOKEN).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_wrong_token_length_rejected() {
        let ciphertext = encrypt_fixture("{}", TOKEN);
        match decrypt(&ciphertext, "short") {
            Err(Error::Decode(msg)) => assert!(msg.contains("key size")),
            other => panic!("expected Decode error, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_token_bad_padding() {
        // Decrypting with a different key of valid length yields garbage
        // padding, which must surface as a decode failure.
        let ciphertext = encrypt_fixture("{\"infoType\":20001}", TOKEN);
        assert!(decrypt(&ciphertext, "fedcba9876543210").is_err());
    }

    #[test]
    fn test_truncated_ciphertext_rejected() {
        let ciphertext = BASE64.encode([0u8; 15]);
        assert!(decrypt(&ciphertext, TOKEN).is_err());
    }
}
