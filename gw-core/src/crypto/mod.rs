//! The cryptographic core of the handshake: ECDH key agreement on the
//! device family's custom 160-bit curve, MD5-based key derivation, and
//! AES-128-CBC payload encryption.
//!
//! Mirrors the reference firmware's `EcoflowCrypto` module: a raw-point
//! ECDH (no KDF beyond MD5, no HKDF, no curve negotiation), a session key
//! looked up from a per-device key table by an index the peer derives from
//! its own random seed, and AES-CBC with the IV re-initialized from a
//! stored value on every call rather than chained across messages.

pub mod curve;

use aes::Aes128;
use cbc::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use curve::{InvalidPoint, Point, FIELD_BYTES};
use md5::{Digest, Md5};
use num_bigint::BigUint;
use rand_core::{CryptoRng, RngCore};

/// Raw, uncompressed `X‖Y` public key: 40 bytes for a 160-bit curve.
pub type PublicKeyBytes = [u8; FIELD_BYTES * 2];

/// Errors produced by the cryptographic core.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error(transparent)]
    InvalidPeerKey(#[from] InvalidPoint),

    #[error("ciphertext length {0} is not a multiple of the AES block size")]
    UnalignedCiphertext(usize),

    #[error("ciphertext padding is invalid or was corrupted in transit")]
    BadPadding,

    #[error("session key table index {0} is out of range for the configured key table")]
    KeyTableIndexOutOfRange(usize),
}

/// An ephemeral ECDH key pair generated for one handshake attempt.
pub struct KeyPair {
    private: BigUint,
    public: Point,
}

impl KeyPair {
    /// Generates a fresh key pair using the supplied CSPRNG.
    ///
    /// The private scalar is sampled uniformly from `[1, n-1]` by rejection
    /// sampling over full-width random bytes, the same approach `mbedtls`
    /// uses for `mbedtls_ecp_gen_privkey`.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let order = curve::order();
        let private = loop {
            let mut bytes = [0u8; FIELD_BYTES];
            rng.fill_bytes(&mut bytes);
            let candidate = BigUint::from_bytes_be(&bytes);
            if candidate > BigUint::from(0u8) && candidate < order {
                break candidate;
            }
        };
        let public = Point::generator().scalar_mul(&private);
        KeyPair { private, public }
    }

    /// The public key in wire format (`X‖Y`, 40 bytes, no `0x04` prefix).
    pub fn public_key(&self) -> PublicKeyBytes {
        self.public.to_uncompressed()
    }

    /// Computes the shared secret with a peer's public key.
    ///
    /// Returns the X coordinate of `private * peer_public` as 20 raw bytes;
    /// the caller derives the AES key, IV, and session key from it.
    pub fn shared_secret(&self, peer_public: &PublicKeyBytes) -> Result<SharedSecret, CryptoError> {
        let peer_point = Point::from_uncompressed(peer_public)?;
        let shared_point = peer_point.scalar_mul(&self.private);
        Ok(SharedSecret(shared_point.x_bytes()))
    }
}

/// The raw 20-byte X-coordinate shared secret, and the values derived from
/// it for the rest of the handshake.
#[derive(Clone)]
pub struct SharedSecret(pub [u8; FIELD_BYTES]);

impl SharedSecret {
    /// The AES key: the first 16 bytes of the shared secret.
    pub fn aes_key(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key.copy_from_slice(&self.0[..16]);
        key
    }

    /// The AES IV: MD5 of the full 20-byte shared secret.
    pub fn aes_iv(&self) -> [u8; 16] {
        let mut hasher = Md5::new();
        hasher.update(self.0);
        hasher.finalize().into()
    }
}

/// Derives the session key from a peer-chosen 2-byte seed, a device key
/// table, and the peer's 16-byte random nonce.
///
/// The seed selects a 16-byte slice of the key table at
/// `offset = seed[0] * 0x10 + ((seed[1] - 1) & 0xFF) * 0x100`; the session
/// key is `MD5(key_table[offset..offset+16] ‖ srand)`.
pub fn derive_session_key(key_table: &[u8], seed: [u8; 2], srand: &[u8; 16]) -> Result<[u8; 16], CryptoError> {
    let offset = seed[0] as usize * 0x10 + (seed[1].wrapping_sub(1) as usize) * 0x100;
    let slice = key_table
        .get(offset..offset + 16)
        .ok_or(CryptoError::KeyTableIndexOutOfRange(offset))?;

    let mut hasher = Md5::new();
    hasher.update(slice);
    hasher.update(srand);
    Ok(hasher.finalize().into())
}

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// Encrypts `plaintext` with AES-128-CBC / PKCS7, re-initializing the
/// cipher's IV from `iv` rather than chaining it from a previous call —
/// every frame on the wire is encrypted independently.
pub fn aes_cbc_encrypt(key: &[u8; 16], iv: &[u8; 16], plaintext: &[u8]) -> Vec<u8> {
    Aes128CbcEnc::new(key.into(), iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext)
}

/// Decrypts and unpads an AES-128-CBC / PKCS7 ciphertext produced by
/// [`aes_cbc_encrypt`].
pub fn aes_cbc_decrypt(key: &[u8; 16], iv: &[u8; 16], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() % 16 != 0 || ciphertext.is_empty() {
        return Err(CryptoError::UnalignedCiphertext(ciphertext.len()));
    }
    Aes128CbcDec::new(key.into(), iv.into())
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| CryptoError::BadPadding)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn handshake_produces_matching_shared_secrets() {
        let gateway = KeyPair::generate(&mut OsRng);
        let device = KeyPair::generate(&mut OsRng);

        let shared_on_gateway = gateway.shared_secret(&device.public_key()).unwrap();
        let shared_on_device = device.shared_secret(&gateway.public_key()).unwrap();

        assert_eq!(shared_on_gateway.0, shared_on_device.0);
        assert_eq!(shared_on_gateway.aes_key(), shared_on_device.aes_key());
        assert_eq!(shared_on_gateway.aes_iv(), shared_on_device.aes_iv());
    }

    #[test]
    fn rejects_peer_key_not_on_curve() {
        let gateway = KeyPair::generate(&mut OsRng);
        let mut bogus = gateway.public_key();
        bogus[0] ^= 0xFF;
        assert!(gateway.shared_secret(&bogus).is_err());
    }

    #[test]
    fn aes_cbc_round_trips() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let plaintext = b"device telemetry payload, multi-block length!!";
        let ciphertext = aes_cbc_encrypt(&key, &iv, plaintext);
        assert_eq!(ciphertext.len() % 16, 0);
        let decrypted = aes_cbc_decrypt(&key, &iv, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_cbc_rejects_corrupted_padding() {
        let key = [0x11u8; 16];
        let iv = [0x22u8; 16];
        let mut ciphertext = aes_cbc_encrypt(&key, &iv, b"0123456789abcdef");
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(aes_cbc_decrypt(&key, &iv, &ciphertext).is_err());
    }

    #[test]
    fn session_key_derivation_selects_table_offset() {
        // offset = 0x02*0x10 + ((0x05-1)&0xFF)*0x100 = 0x20 + 0x400 = 0x420
        let mut key_table = vec![0u8; 0x430];
        let expected_slice = [0xABu8; 16];
        key_table[0x420..0x430].copy_from_slice(&expected_slice);
        let srand = [0x5Au8; 16];

        let key = derive_session_key(&key_table, [0x02, 0x05], &srand).unwrap();

        let mut hasher = Md5::new();
        hasher.update(expected_slice);
        hasher.update(srand);
        let expected: [u8; 16] = hasher.finalize().into();
        assert_eq!(key, expected);
    }

    #[test]
    fn session_key_derivation_rejects_short_table() {
        let key_table = vec![0u8; 4];
        assert!(derive_session_key(&key_table, [0xFF, 0xFF], &[0u8; 16]).is_err());
    }
}
