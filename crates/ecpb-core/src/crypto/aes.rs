use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;

use crate::error::{EcpbError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

const IV_LEN: usize = 16;

/// A per-job AES-256 key.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct AesKey(pub [u8; 32]);

impl AesKey {
    /// Generate a fresh key from the OS cryptographic RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut key);
        AesKey(key)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|_| EcpbError::InvalidDigest(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| EcpbError::InvalidDigest(s.to_string()))?;
        Ok(AesKey(arr))
    }
}

impl std::fmt::Debug for AesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        write!(f, "AesKey(..)")
    }
}

/// Encrypt with AES-256-CBC / PKCS#7. Wire format: `[16-byte IV][ciphertext]`.
/// A fresh random IV is generated for every call.
pub fn encrypt(plaintext: &[u8], key: &AesKey) -> Result<Vec<u8>> {
    let mut iv = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut iv);

    let cipher = Aes256CbcEnc::new_from_slices(&key.0, &iv)
        .expect("valid key and IV lengths for AES-256-CBC");
    let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
    out.extend_from_slice(&iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt data produced by [`encrypt`]. Fails on short input, invalid
/// padding, or a wrong key.
pub fn decrypt(data: &[u8], key: &AesKey) -> Result<Vec<u8>> {
    if data.len() < IV_LEN + 16 {
        return Err(EcpbError::DecryptionFailed);
    }
    let (iv, ciphertext) = data.split_at(IV_LEN);
    if ciphertext.len() % 16 != 0 {
        return Err(EcpbError::DecryptionFailed);
    }

    let cipher = Aes256CbcDec::new_from_slices(&key.0, iv)
        .expect("valid key and IV lengths for AES-256-CBC");
    cipher
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| EcpbError::DecryptionFailed)
}
