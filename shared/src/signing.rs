//! Signed request envelopes shared by the registry client and the gateway.
//!
//! A request is signed over a canonical message built from the request line,
//! the algorithm name, both hostnames, a random nonce and the raw body. The
//! signature and public key travel in `x-dweb-cloud-*` headers, so the body is
//! never rewritten.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use http::{HeaderMap, HeaderValue, Uri};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use crate::codec;
use crate::protocol::{
    ALGORITHM, HEADER_ALGORITHM, HEADER_HOST, HEADER_NOISE, HEADER_ORIGIN, HEADER_PUBLIC_KEY,
    HEADER_SIGNATURE,
};

const NOISE_LEN: usize = 16;
const ADDRESS_HASH_LEN: usize = 20;
const ADDRESS_PREFIX: &str = "b";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("missing header {0}")]
    MissingHeader(&'static str),

    #[error("header {0} is not valid text")]
    InvalidHeader(&'static str),

    #[error("unsupported algorithm {0:?}")]
    UnsupportedAlgorithm(String),

    #[error("malformed url {0:?}")]
    MalformedUrl(String),

    #[error("invalid public key")]
    InvalidPublicKey,

    #[error("invalid signature encoding")]
    InvalidSignature,

    #[error(transparent)]
    Codec(#[from] codec::CodecError),
}

/// Ed25519 keypair held by a registering peer.
#[derive(Clone)]
pub struct Keypair {
    signing: SigningKey,
}

impl Keypair {
    /// Fresh random keypair
    pub fn generate() -> Self {
        Self {
            signing: SigningKey::generate(&mut OsRng),
        }
    }

    /// Deterministic keypair from a secret phrase (seed = SHA-256 of the secret).
    pub fn from_secret(secret: &str) -> Self {
        let seed: [u8; 32] = Sha256::digest(secret.as_bytes()).into();
        Self {
            signing: SigningKey::from_bytes(&seed),
        }
    }

    pub fn private_key(&self) -> [u8; 32] {
        self.signing.to_bytes()
    }

    pub fn public_key(&self) -> [u8; 32] {
        self.signing.verifying_key().to_bytes()
    }

    /// Peer address derived from this keypair's public key
    pub fn address(&self) -> String {
        derive_address(&self.public_key())
    }

    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing.sign(message).to_bytes()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &hex::encode(self.public_key()))
            .finish_non_exhaustive()
    }
}

/// One-way, deterministic peer address: `b` + hex of the first 20 bytes of
/// SHA-256(public key). Lowercase so it is usable as a DNS label.
pub fn derive_address(public_key: &[u8]) -> String {
    let digest = Sha256::digest(public_key);
    format!("{ADDRESS_PREFIX}{}", hex::encode(&digest[..ADDRESS_HASH_LEN]))
}

/// Build the exact bytes that are signed and verified.
pub fn canonical_message(
    method: &str,
    path: &str,
    query: &str,
    from_hostname: &str,
    to_hostname: &str,
    noise: &str,
    body: Option<&[u8]>,
) -> Vec<u8> {
    let head = format!(
        "{} {}?{}\nALGORITHM {}\nFROM {}\nTO {}\nNOISE {}\n",
        method.to_ascii_uppercase(),
        path,
        query,
        ALGORITHM,
        from_hostname,
        to_hostname,
        noise,
    );
    let mut message = head.into_bytes();
    if let Some(body) = body {
        message.extend_from_slice(body);
    }
    message
}

fn random_noise() -> String {
    hex::encode(rand::random::<[u8; NOISE_LEN]>())
}

/// Sign a request to `target_url` on behalf of `from_hostname`, returning the
/// headers to attach to it.
pub fn sign_request(
    keypair: &Keypair,
    from_hostname: &str,
    target_url: &str,
    method: &str,
    body: Option<&[u8]>,
) -> Result<HeaderMap, SignatureError> {
    let uri: Uri = target_url
        .parse()
        .map_err(|_| SignatureError::MalformedUrl(target_url.to_string()))?;
    let scheme = uri
        .scheme_str()
        .ok_or_else(|| SignatureError::MalformedUrl(target_url.to_string()))?;
    let to_hostname = uri
        .host()
        .ok_or_else(|| SignatureError::MalformedUrl(target_url.to_string()))?;

    let noise = random_noise();
    let message = canonical_message(
        method,
        uri.path(),
        uri.query().unwrap_or(""),
        from_hostname,
        to_hostname,
        &noise,
        body,
    );
    let signature = keypair.sign(&message);

    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| -> Result<(), SignatureError> {
        let value = HeaderValue::from_str(&value).map_err(|_| SignatureError::InvalidHeader(name))?;
        headers.insert(name, value);
        Ok(())
    };
    put(HEADER_HOST, to_hostname.to_string())?;
    put(HEADER_ORIGIN, format!("{scheme}://{from_hostname}"))?;
    put(HEADER_NOISE, noise)?;
    put(HEADER_ALGORITHM, ALGORITHM.to_string())?;
    put(HEADER_PUBLIC_KEY, codec::encode(&keypair.public_key()))?;
    put(HEADER_SIGNATURE, codec::encode(&signature))?;

    Ok(headers)
}

/// Authenticated-but-not-yet-verified request. The body is checked later, once
/// it has been read, through [`PendingVerification::verify`].
#[derive(Debug, Clone)]
pub struct PendingVerification {
    pub public_key: Vec<u8>,
    pub from_hostname: String,
    pub to_hostname: String,
    head: Vec<u8>,
    signature: Signature,
    verifying_key: VerifyingKey,
}

impl PendingVerification {
    /// Check the signature against the canonical message plus `body`.
    pub fn verify(&self, body: Option<&[u8]>) -> bool {
        let mut message = self.head.clone();
        if let Some(body) = body {
            message.extend_from_slice(body);
        }
        self.verifying_key.verify(&message, &self.signature).is_ok()
    }

    /// Peer address derived from the signing key
    pub fn address(&self) -> String {
        derive_address(&self.public_key)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .ok_or(SignatureError::MissingHeader(name))?
        .to_str()
        .map_err(|_| SignatureError::InvalidHeader(name))
}

/// Rebuild the canonical message of an inbound request from its request line
/// and headers.
pub fn verify_request(
    uri: &Uri,
    method: &str,
    headers: &HeaderMap,
) -> Result<PendingVerification, SignatureError> {
    let algorithm = header(headers, HEADER_ALGORITHM)?;
    if algorithm != ALGORITHM {
        return Err(SignatureError::UnsupportedAlgorithm(algorithm.to_string()));
    }

    let to_hostname = header(headers, HEADER_HOST)?;
    let origin = header(headers, HEADER_ORIGIN)?;
    let noise = header(headers, HEADER_NOISE)?;
    let public_key = codec::decode(header(headers, HEADER_PUBLIC_KEY)?)?;
    let signature = codec::decode(header(headers, HEADER_SIGNATURE)?)?;

    let from_hostname = origin
        .parse::<Uri>()
        .ok()
        .and_then(|origin| origin.host().map(str::to_string))
        .ok_or_else(|| SignatureError::MalformedUrl(origin.to_string()))?;

    let key_bytes: [u8; 32] = public_key
        .as_slice()
        .try_into()
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_bytes).map_err(|_| SignatureError::InvalidPublicKey)?;
    let signature =
        Signature::from_slice(&signature).map_err(|_| SignatureError::InvalidSignature)?;

    let head = canonical_message(
        method,
        uri.path(),
        uri.query().unwrap_or(""),
        &from_hostname,
        to_hostname,
        noise,
        None,
    );

    Ok(PendingVerification {
        public_key,
        from_hostname,
        to_hostname: to_hostname.to_string(),
        head,
        signature,
        verifying_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const TARGET: &str = "http://gw.local:8080/registry";

    fn signed(body: &[u8]) -> (Keypair, HeaderMap) {
        let keypair = Keypair::from_secret("abc");
        let from = format!("{}-gw.local", keypair.address());
        let headers = sign_request(&keypair, &from, TARGET, "POST", Some(body)).unwrap();
        (keypair, headers)
    }

    fn registry_uri() -> Uri {
        "/registry".parse().unwrap()
    }

    #[test]
    fn test_sign_then_verify() {
        let (keypair, headers) = signed(b"{\"hello\":1}");
        let pending = verify_request(&registry_uri(), "POST", &headers).unwrap();

        assert_eq!(pending.public_key, keypair.public_key().to_vec());
        assert_eq!(pending.to_hostname, "gw.local");
        assert_eq!(pending.from_hostname, format!("{}-gw.local", keypair.address()));
        assert_eq!(pending.address(), keypair.address());
        assert!(pending.verify(Some(b"{\"hello\":1}")));
    }

    #[test]
    fn test_altered_body_fails() {
        let (_, headers) = signed(b"{\"port\":9001}");
        let pending = verify_request(&registry_uri(), "POST", &headers).unwrap();
        assert!(!pending.verify(Some(b"{\"port\":9002}")));
        assert!(!pending.verify(None));
    }

    #[test]
    fn test_changed_noise_fails() {
        let (_, mut headers) = signed(b"body");
        headers.insert(HEADER_NOISE, HeaderValue::from_static("00000000000000000000000000000000"));
        let pending = verify_request(&registry_uri(), "POST", &headers).unwrap();
        assert!(!pending.verify(Some(b"body")));
    }

    #[test]
    fn test_swapped_gateway_fails() {
        let (_, mut headers) = signed(b"body");
        headers.insert(HEADER_HOST, HeaderValue::from_static("other-gateway.local"));
        let pending = verify_request(&registry_uri(), "POST", &headers).unwrap();
        assert!(!pending.verify(Some(b"body")));
    }

    #[test]
    fn test_other_method_or_path_fails() {
        let (_, headers) = signed(b"body");
        let pending = verify_request(&registry_uri(), "PUT", &headers).unwrap();
        assert!(!pending.verify(Some(b"body")));

        let pending = verify_request(&"/query".parse().unwrap(), "POST", &headers).unwrap();
        assert!(!pending.verify(Some(b"body")));
    }

    #[test]
    fn test_missing_headers_rejected() {
        for name in [
            HEADER_HOST,
            HEADER_ORIGIN,
            HEADER_NOISE,
            HEADER_ALGORITHM,
            HEADER_PUBLIC_KEY,
            HEADER_SIGNATURE,
        ] {
            let (_, mut headers) = signed(b"body");
            headers.remove(name);
            assert!(
                verify_request(&registry_uri(), "POST", &headers).is_err(),
                "missing {name} should be rejected"
            );
        }
    }

    #[test]
    fn test_wrong_algorithm_rejected() {
        let (_, mut headers) = signed(b"body");
        headers.insert(HEADER_ALGORITHM, HeaderValue::from_static("web3"));
        assert!(matches!(
            verify_request(&registry_uri(), "POST", &headers),
            Err(SignatureError::UnsupportedAlgorithm(_))
        ));
    }

    #[test]
    fn test_address_is_deterministic() {
        let a = Keypair::from_secret("abc");
        let b = Keypair::from_secret("abc");
        let c = Keypair::from_secret("abd");

        assert_eq!(a.address(), b.address());
        assert_ne!(a.address(), c.address());
        assert!(a.address().starts_with('b'));
        assert_eq!(a.address().len(), 1 + ADDRESS_HASH_LEN * 2);
        assert!(a.address().chars().all(|c| c.is_ascii_hexdigit() || c == 'b'));
    }

    #[test]
    fn test_canonical_message_layout() {
        let message = canonical_message("get", "/query", "hostname=a", "from", "to", "n", Some(b"xyz"));
        assert_eq!(
            message,
            b"GET /query?hostname=a\nALGORITHM bioforestchain\nFROM from\nTO to\nNOISE n\nxyz".to_vec()
        );
    }
}
