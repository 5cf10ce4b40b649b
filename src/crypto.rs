//! CA generation, AES-256-GCM encryption, and secure randomness helpers.
//!
//! Every selection decision in the crate draws from the OS cryptographic RNG
//! through [`secure_random_index`]. The naming helpers generate the repository
//! names, stage names, and gateway titles used when provisioning cloud
//! resources.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::rngs::OsRng;
use rand::{Rng, RngCore};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    KeyPair, KeyUsagePurpose, SerialNumber,
};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use time::{Duration, OffsetDateTime};

use crate::error::CryptoError;

const RSA_KEY_BITS: usize = 2048;
const AES_KEY_BYTES: usize = 32;
const AES_NONCE_BYTES: usize = 12;
const CA_VALIDITY_DAYS: i64 = 365;

/// Word pool for generating innocuous-looking resource names.
pub const RANDOM_WORDS: &[&str] = &[
    "apple", "banana", "cat", "dog", "elephant", "fish", "gorilla", "hat", "icecream", "jacket",
    "kangaroo", "lemon", "monkey", "ninja", "orange", "penguin", "queen", "rabbit", "snake",
    "tiger", "umbrella", "vampire", "whale", "xylophone", "yak", "zebra",
];

/// Generates a self-signed RSA CA certificate suitable for TLS interception.
///
/// rcgen cannot generate RSA keys itself, so the key comes from the `rsa`
/// crate and is wrapped into an rcgen key pair for signing. Returns the
/// certificate and key in PEM form.
pub fn generate_rsa_ca_certificate() -> Result<(String, String), CryptoError> {
    let private_key = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
        .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;
    let key_der = private_key
        .to_pkcs8_der()
        .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;
    let key_pair = KeyPair::try_from(key_der.as_bytes())
        .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;

    let mut dn = DistinguishedName::new();
    dn.push(DnType::OrganizationName, "IPSpinner Tool");

    let mut params = CertificateParams::default();
    params.distinguished_name = dn;
    params.serial_number = Some(SerialNumber::from(vec![1u8]));
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];

    let now = OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + Duration::days(CA_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::CertGeneration(e.to_string()))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Generates a random 32-byte AES-256 key, hex-encoded.
pub fn aes256_generate_key() -> String {
    let mut bytes = [0u8; AES_KEY_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Encrypts with AES-256-GCM. The output is `hex(nonce ‖ ciphertext ‖ tag)`
/// with a fresh random nonce per call.
pub fn aes256_encrypt(data: &[u8], key_hex: &str) -> Result<String, CryptoError> {
    let cipher = cipher_from_hex_key(key_hex)?;

    let mut nonce_bytes = [0u8; AES_NONCE_BYTES];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher.encrypt(nonce, data).map_err(|_| CryptoError::Cipher)?;

    let mut out = Vec::with_capacity(AES_NONCE_BYTES + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);

    Ok(hex::encode(out))
}

/// Decrypts the `hex(nonce ‖ ciphertext ‖ tag)` format produced by
/// [`aes256_encrypt`].
pub fn aes256_decrypt(encrypted_hex: &str, key_hex: &str) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_from_hex_key(key_hex)?;

    let data =
        hex::decode(encrypted_hex).map_err(|e| CryptoError::InvalidCiphertext(e.to_string()))?;

    if data.len() <= AES_NONCE_BYTES {
        return Err(CryptoError::InvalidCiphertext(
            "ciphertext shorter than the nonce".into(),
        ));
    }

    let (nonce_bytes, ciphertext) = data.split_at(AES_NONCE_BYTES);
    let nonce = Nonce::from_slice(nonce_bytes);

    cipher.decrypt(nonce, ciphertext).map_err(|_| CryptoError::Cipher)
}

fn cipher_from_hex_key(key_hex: &str) -> Result<Aes256Gcm, CryptoError> {
    let key_bytes = hex::decode(key_hex).map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    if key_bytes.len() != AES_KEY_BYTES {
        return Err(CryptoError::InvalidKey(format!(
            "expected {} key bytes, got {}",
            AES_KEY_BYTES,
            key_bytes.len()
        )));
    }

    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)))
}

/// Uniform random index in `0..len` from the OS cryptographic RNG.
pub fn secure_random_index(len: usize) -> usize {
    if len == 0 {
        return 0;
    }

    OsRng.gen_range(0..len)
}

/// Random element of a slice, `None` when empty.
pub fn random_element<T>(slice: &[T]) -> Option<&T> {
    if slice.is_empty() {
        None
    } else {
        Some(&slice[secure_random_index(slice.len())])
    }
}

/// Random lowercase string of the given length.
pub fn random_prefix(len: usize) -> String {
    const LOWERCASE: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

    (0..len)
        .map(|_| LOWERCASE[secure_random_index(LOWERCASE.len())] as char)
        .collect()
}

/// Random sentence of `words` words from the word pool, first letter
/// capitalised.
pub fn random_sentence(words: usize) -> String {
    let mut sentence = String::new();

    for i in 0..words {
        if i > 0 {
            sentence.push(' ');
        }

        sentence.push_str(RANDOM_WORDS[secure_random_index(RANDOM_WORDS.len())]);
    }

    let mut chars = sentence.chars();

    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => sentence,
    }
}

/// Random password with at least one character of each class (minimum
/// effective size of 4), shuffled.
pub fn random_password(len: usize) -> String {
    const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
    const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    const DIGITS: &[u8] = b"0123456789";
    const SPECIAL: &[u8] = b"!.*";

    let random_char = |set: &[u8]| set[secure_random_index(set.len())] as char;

    let all: Vec<u8> = [LOWER, UPPER, DIGITS, SPECIAL].concat();

    let mut chars = vec![
        random_char(LOWER),
        random_char(UPPER),
        random_char(DIGITS),
        random_char(SPECIAL),
    ];

    for _ in 0..len.saturating_sub(4) {
        chars.push(random_char(&all));
    }

    // Fisher-Yates with the same RNG as everything else
    for i in (1..chars.len()).rev() {
        chars.swap(i, secure_random_index(i + 1));
    }

    chars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ca_certificate_is_pem() {
        let (cert, key) = generate_rsa_ca_certificate().expect("Failed to generate CA");

        assert!(cert.contains("BEGIN CERTIFICATE"));
        assert!(cert.contains("END CERTIFICATE"));
        assert!(key.contains("BEGIN PRIVATE KEY"));
    }

    #[test]
    fn aes_round_trip() {
        let key = aes256_generate_key();

        let plaintext = b"GET https://x.test/ HTTP/1.1";
        let encrypted = aes256_encrypt(plaintext, &key).expect("encrypt failed");
        let decrypted = aes256_decrypt(&encrypted, &key).expect("decrypt failed");

        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn aes_nonce_freshness() {
        let key = aes256_generate_key();

        let first = aes256_encrypt(b"same input", &key).expect("encrypt failed");
        let second = aes256_encrypt(b"same input", &key).expect("encrypt failed");

        // Identical plaintext and key must still yield distinct ciphertexts
        assert_ne!(first, second);
    }

    #[test]
    fn aes_rejects_wrong_key_size() {
        assert!(aes256_encrypt(b"data", "deadbeef").is_err());
    }

    #[test]
    fn aes_rejects_truncated_ciphertext() {
        let key = aes256_generate_key();

        assert!(aes256_decrypt("00ff", &key).is_err());
    }

    #[test]
    fn random_prefix_is_lowercase() {
        let prefix = random_prefix(10);

        assert_eq!(prefix.len(), 10);
        assert!(prefix.chars().all(|c| c.is_ascii_lowercase()));
    }

    #[test]
    fn random_sentence_word_count() {
        let sentence = random_sentence(3);

        assert_eq!(sentence.split(' ').count(), 3);
        assert!(sentence.chars().next().expect("empty sentence").is_uppercase());
    }

    #[test]
    fn random_password_has_all_classes() {
        let password = random_password(15);

        assert_eq!(password.len(), 15);
        assert!(password.chars().any(|c| c.is_ascii_lowercase()));
        assert!(password.chars().any(|c| c.is_ascii_uppercase()));
        assert!(password.chars().any(|c| c.is_ascii_digit()));
    }
}
