//! Signature verification boundary.
//!
//! Bastion never implements cryptography itself. A [`SignatureVerifier`]
//! wraps whatever primitive the deployment provides; the gate only picks
//! the algorithm from the message's string tag.

use crate::AuthError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Recognized signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignatureAlgorithm {
    /// Edwards-curve signatures (Ed25519, Ed448).
    #[serde(rename = "EdDSA")]
    EdDsa,
    /// Elliptic-curve DSA.
    #[serde(rename = "ECDSA")]
    Ecdsa,
    /// RSA with PSS padding.
    #[serde(rename = "RSA-PSS")]
    RsaPss,
}

impl SignatureAlgorithm {
    /// Canonical tag.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EdDsa => "EdDSA",
            Self::Ecdsa => "ECDSA",
            Self::RsaPss => "RSA-PSS",
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = AuthError;

    /// Parses a tag case-insensitively; `-` and `_` are interchangeable.
    ///
    /// ```
    /// use bastion_auth::SignatureAlgorithm;
    ///
    /// assert_eq!("eddsa".parse::<SignatureAlgorithm>().ok(), Some(SignatureAlgorithm::EdDsa));
    /// assert_eq!("rsa_pss".parse::<SignatureAlgorithm>().ok(), Some(SignatureAlgorithm::RsaPss));
    /// assert!("hmac".parse::<SignatureAlgorithm>().is_err());
    /// ```
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('_', "-").as_str() {
            "EDDSA" => Ok(Self::EdDsa),
            "ECDSA" => Ok(Self::Ecdsa),
            "RSA-PSS" | "RSAPSS" => Ok(Self::RsaPss),
            _ => Err(AuthError::UnknownAlgorithm { tag: s.to_string() }),
        }
    }
}

/// Signature attached to an inbound message.
///
/// `Debug` output omits key and signature bytes.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSignature {
    /// Algorithm tag as sent by the caller (e.g. `"EdDSA"`).
    pub algorithm: String,
    /// Caller's public key.
    pub public_key: Vec<u8>,
    /// Signature over the message payload.
    pub signature: Vec<u8>,
}

impl MessageSignature {
    /// Creates a signature record.
    #[must_use]
    pub fn new(
        algorithm: impl Into<String>,
        public_key: impl Into<Vec<u8>>,
        signature: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            algorithm: algorithm.into(),
            public_key: public_key.into(),
            signature: signature.into(),
        }
    }
}

impl fmt::Debug for MessageSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageSignature")
            .field("algorithm", &self.algorithm)
            .field("public_key", &format_args!("<{} bytes>", self.public_key.len()))
            .field("signature", &format_args!("<{} bytes>", self.signature.len()))
            .finish()
    }
}

/// External signature verification primitive.
///
/// Any `Fn(SignatureAlgorithm, &[u8], &[u8], &[u8]) -> bool` closure is a
/// verifier, which keeps tests and adapters short.
pub trait SignatureVerifier: Send + Sync {
    /// Returns `true` if `signature` over `payload` verifies under `public_key`.
    fn verify(
        &self,
        algorithm: SignatureAlgorithm,
        public_key: &[u8],
        signature: &[u8],
        payload: &[u8],
    ) -> bool;
}

impl<F> SignatureVerifier for F
where
    F: Fn(SignatureAlgorithm, &[u8], &[u8], &[u8]) -> bool + Send + Sync,
{
    fn verify(
        &self,
        algorithm: SignatureAlgorithm,
        public_key: &[u8],
        signature: &[u8],
        payload: &[u8],
    ) -> bool {
        self(algorithm, public_key, signature, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tags() {
        assert_eq!("EdDSA".parse::<SignatureAlgorithm>().ok(), Some(SignatureAlgorithm::EdDsa));
        assert_eq!("ecdsa".parse::<SignatureAlgorithm>().ok(), Some(SignatureAlgorithm::Ecdsa));
        assert_eq!("RSA-PSS".parse::<SignatureAlgorithm>().ok(), Some(SignatureAlgorithm::RsaPss));
        assert_eq!("RsaPss".parse::<SignatureAlgorithm>().ok(), Some(SignatureAlgorithm::RsaPss));
    }

    #[test]
    fn unknown_tag_is_error() {
        let err = "HS256".parse::<SignatureAlgorithm>().expect_err("unknown tag");
        assert!(matches!(err, AuthError::UnknownAlgorithm { ref tag } if tag == "HS256"));
    }

    #[test]
    fn display_roundtrips_through_parse() {
        for alg in [
            SignatureAlgorithm::EdDsa,
            SignatureAlgorithm::Ecdsa,
            SignatureAlgorithm::RsaPss,
        ] {
            assert_eq!(alg.to_string().parse::<SignatureAlgorithm>().ok(), Some(alg));
        }
    }

    #[test]
    fn debug_hides_bytes() {
        let sig = MessageSignature::new("EdDSA", vec![1, 2, 3], vec![9; 64]);
        let dbg = format!("{sig:?}");
        assert!(dbg.contains("<3 bytes>"));
        assert!(dbg.contains("<64 bytes>"));
        assert!(!dbg.contains("9, 9"));
    }

    #[test]
    fn closure_is_verifier() {
        let v = |_: SignatureAlgorithm, _: &[u8], sig: &[u8], _: &[u8]| sig == b"ok";
        assert!(v.verify(SignatureAlgorithm::EdDsa, b"k", b"ok", b"p"));
        assert!(!v.verify(SignatureAlgorithm::EdDsa, b"k", b"no", b"p"));
    }
}
