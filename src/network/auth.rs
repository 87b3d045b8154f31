//! SCRAM-SHA-256 client authentication.
//!
//! The handshake carries a SCRAM exchange inside JSON messages:
//!
//! 1. client-first `n,,n=<user>,r=<client nonce>`
//! 2. server-first `r=<server nonce>,s=<salt>,i=<iterations>`
//! 3. client-final `c=biws,r=<server nonce>,p=<proof>`
//! 4. server-final `v=<server signature>`
//!
//! PBKDF2 is the expensive step, so salted passwords are memoised in a
//! bounded [`KeyDerivationCache`] shared by every connection of a pool.

use std::fmt;
use std::num::NonZeroUsize;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use lru::LruCache;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const NONCE_BYTES: usize = 18;
const DEFAULT_CACHE_CAPACITY: usize = 64;
const CLIENT_FINAL_WITHOUT_PROOF_PREFIX: &str = "c=biws";

#[derive(Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    password_digest: [u8; 32],
    salt: Vec<u8>,
    iterations: u32,
}

/// Bounded LRU of PBKDF2 outputs keyed by (password, salt, iterations).
pub struct KeyDerivationCache {
    entries: Mutex<LruCache<CacheKey, [u8; 32]>>,
}

impl KeyDerivationCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Salted password for the given parameters, derived once per key.
    pub async fn salted_password(&self, password: &[u8], salt: &[u8], iterations: u32) -> Result<[u8; 32]> {
        let key = CacheKey {
            password_digest: Sha256::digest(password).into(),
            salt: salt.to_vec(),
            iterations,
        };
        if let Some(hit) = self.entries.lock().get(&key) {
            return Ok(*hit);
        }

        let password = password.to_vec();
        let salt = key.salt.clone();
        let derived = tokio::task::spawn_blocking(move || {
            let mut out = [0u8; 32];
            pbkdf2::pbkdf2_hmac::<Sha256>(&password, &salt, iterations, &mut out);
            out
        })
        .await
        .map_err(|e| Error::auth("Key derivation task failed").with_cause(e))?;

        self.entries.lock().put(key, derived);
        Ok(derived)
    }
}

impl Default for KeyDerivationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

impl fmt::Debug for KeyDerivationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyDerivationCache")
            .field("len", &self.len())
            .finish()
    }
}

/// Fresh base64 client nonce.
pub fn generate_nonce() -> String {
    let mut nonce = [0u8; NONCE_BYTES];
    rand::thread_rng().fill_bytes(&mut nonce);
    BASE64.encode(nonce)
}

/// `n,,n=<user>,r=<nonce>`
pub fn client_first_message(user: &str, nonce: &str) -> String {
    format!("n,,n={},r={}", user, nonce)
}

/// Values of a parsed server-first message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFirst {
    pub nonce: String,
    pub salt: Vec<u8>,
    pub iterations: u32,
}

impl ServerFirst {
    pub fn parse(message: &str, client_nonce: &str) -> Result<Self> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for part in message.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value.to_string());
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(
                    BASE64
                        .decode(value)
                        .map_err(|e| Error::auth("Invalid salt in server-first message").with_cause(e))?,
                );
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|e| Error::auth("Invalid iteration count").with_cause(e))?,
                );
            }
        }

        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            return Err(Error::auth(format!("Malformed server-first message: {}", message)));
        };
        if !nonce.starts_with(client_nonce) {
            return Err(Error::auth("Invalid nonce from server"));
        }
        Ok(Self {
            nonce,
            salt,
            iterations,
        })
    }
}

/// Output of the proof computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScramProof {
    /// `c=biws,r=<server nonce>,p=<proof>`
    pub client_final: String,
    /// Expected base64 server signature.
    pub server_signature: String,
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::auth("Invalid HMAC key"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Compute the client proof and expected server signature.
pub async fn compute_proof(
    server_first: &str,
    client_nonce: &str,
    user: &str,
    password: &[u8],
    cache: &KeyDerivationCache,
) -> Result<ScramProof> {
    let parsed = ServerFirst::parse(server_first, client_nonce)?;
    let salted = cache
        .salted_password(password, &parsed.salt, parsed.iterations)
        .await?;

    let client_key = hmac(&salted, b"Client Key")?;
    let stored_key = Sha256::digest(&client_key);
    let client_final_without_proof = format!("{},r={}", CLIENT_FINAL_WITHOUT_PROOF_PREFIX, parsed.nonce);
    let auth_message = format!(
        "n={},r={},{},{}",
        user, client_nonce, server_first, client_final_without_proof
    );

    let client_signature = hmac(&stored_key, auth_message.as_bytes())?;
    let proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(k, s)| k ^ s)
        .collect();

    let server_key = hmac(&salted, b"Server Key")?;
    let server_signature = BASE64.encode(hmac(&server_key, auth_message.as_bytes())?);

    Ok(ScramProof {
        client_final: format!("{},p={}", client_final_without_proof, BASE64.encode(proof)),
        server_signature,
    })
}

/// Check the server-final `v=<sig>` against the expected signature.
///
/// Everything up to and including the first `=` of the returned value is
/// ignored before comparing.
pub fn compare_digest(returned: &str, expected: &str) -> Result<()> {
    let signature = returned
        .split_once('=')
        .map(|(_, signature)| signature)
        .unwrap_or(returned);
    if signature.len() != expected.len() {
        return Err(Error::auth("Invalid server signature"));
    }
    let diff = signature
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff == 0 {
        Ok(())
    } else {
        Err(Error::auth("Invalid server signature"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    // RFC 7677 section 3 example exchange.
    const USER: &str = "user";
    const PASSWORD: &str = "pencil";
    const CLIENT_NONCE: &str = "rOprNGfwEbeRWgbNEkqO";
    const SERVER_FIRST: &str =
        "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096";

    #[tokio::test]
    async fn test_rfc7677_vector() {
        let cache = KeyDerivationCache::default();
        let proof = compute_proof(SERVER_FIRST, CLIENT_NONCE, USER, PASSWORD.as_bytes(), &cache)
            .await
            .unwrap();

        assert_eq!(
            proof.client_final,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        assert_eq!(
            proof.server_signature,
            "6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4="
        );
        compare_digest(
            "v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=",
            &proof.server_signature,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_cache_memoises_derivation() {
        let cache = KeyDerivationCache::new(2);
        let first = cache.salted_password(b"pw", b"salt", 16).await.unwrap();
        let second = cache.salted_password(b"pw", b"salt", 16).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);

        cache.salted_password(b"pw", b"other", 16).await.unwrap();
        cache.salted_password(b"pw2", b"salt", 16).await.unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_nonce_mismatch() {
        let err = ServerFirst::parse("r=someoneelse,s=AAAA,i=10", CLIENT_NONCE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn test_malformed_server_first() {
        let err = ServerFirst::parse("r=rOprNGfwEbeRWgbNEkqO", CLIENT_NONCE).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Auth);
    }

    #[test]
    fn test_signature_mismatch() {
        assert!(compare_digest("v=abc=", "abc=").is_ok());
        assert_eq!(
            compare_digest("v=abd=", "abc=").unwrap_err().kind(),
            ErrorKind::Auth
        );
    }

    #[test]
    fn test_nonce_shape() {
        let nonce = generate_nonce();
        assert_eq!(BASE64.decode(&nonce).unwrap().len(), NONCE_BYTES);
        assert_eq!(client_first_message("admin", "abc"), "n,,n=admin,r=abc");
    }
}
