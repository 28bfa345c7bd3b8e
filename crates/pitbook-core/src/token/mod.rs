//! Signed staff tokens.
//!
//! Tokens are the only authentication artifact accepted on the operator
//! lane. The wire form is `pbt1.<claims>.<sig>` where `<claims>` is the
//! URL-safe base64 of the claims JSON and `<sig>` is the URL-safe base64
//! of an HMAC-SHA256 over the claims segment. The MAC input carries a
//! domain-separation prefix so a signature minted here can never verify
//! as anything else signed with the same key.
//!
//! # What a token is not
//!
//! A token authenticates a subject; it does not authorize anything.
//! Tenant and staff-id fields in the claims are hints for lookup and
//! cross-checking only. Authority is derived from the identity record
//! resolved inside the serving transaction, never from the claims.
//!
//! # Security Invariants
//!
//! - Signature comparison is constant-time via `subtle::ConstantTimeEq`.
//! - Unknown version prefixes are rejected, never interpreted.
//! - The claims segment is not parsed until the signature has verified,
//!   so attacker-controlled bytes never reach the JSON parser.
//! - Signing keys shorter than [`MIN_KEY_LEN`] bytes are refused at
//!   construction time.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::identity::{StaffId, TenantId};

type HmacSha256 = Hmac<Sha256>;

/// Wire-format version prefix for staff tokens.
const TOKEN_PREFIX: &str = "pbt1";

/// Domain-separation prefix mixed into every MAC input.
const TOKEN_MAC_DOMAIN: &[u8] = b"pitbook-staff-token-v1\n";

/// Minimum accepted signing key length in bytes.
pub const MIN_KEY_LEN: usize = 32;

/// Claims carried by a staff token.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TokenClaims {
    /// Verified auth subject (the identity provider's stable user id).
    pub subject: String,

    /// Optional staff-id lookup hint. Cross-checked against the resolved
    /// record's subject; a mismatch fails resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub staff_hint: Option<StaffId>,

    /// Optional tenant hint. Cross-checked against the resolved record's
    /// tenant binding; a mismatch fails context establishment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_hint: Option<TenantId>,

    /// Mint timestamp, nanoseconds since the Unix epoch.
    pub issued_at_ns: i64,

    /// Expiry timestamp, nanoseconds since the Unix epoch. A token is
    /// rejected once `now >= expires_at_ns`.
    pub expires_at_ns: i64,
}

/// Errors from minting or verifying staff tokens.
#[derive(Debug, Error)]
pub enum TokenError {
    /// The signing key is shorter than [`MIN_KEY_LEN`] bytes.
    #[error("token signing key too short: {len} bytes, need at least {MIN_KEY_LEN}")]
    KeyTooShort {
        /// Length of the rejected key.
        len: usize,
    },

    /// The token string does not have the expected shape. Covers bad
    /// version prefixes, wrong segment counts, and undecodable segments.
    #[error("malformed token")]
    Malformed,

    /// The signature does not verify for this key.
    #[error("token signature verification failed")]
    BadSignature,

    /// The token verified but is past its expiry.
    #[error("token expired at {expires_at_ns}ns (now {now_ns}ns)")]
    Expired {
        /// Expiry carried by the token.
        expires_at_ns: i64,
        /// Clock reading the check was made against.
        now_ns: i64,
    },

    /// The underlying MAC construction rejected the key material.
    #[error("token MAC construction failed: {0}")]
    Mac(String),

    /// Claims serialization failed during minting.
    #[error("failed to serialize token claims: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Mints and verifies staff tokens with a shared secret key.
pub struct TokenMinter {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenMinter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output and logs.
        f.debug_struct("TokenMinter")
            .field("key_len", &self.key.len())
            .finish()
    }
}

impl TokenMinter {
    /// Builds a minter from raw key bytes.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::KeyTooShort`] for keys under [`MIN_KEY_LEN`]
    /// bytes.
    pub fn new(key: &[u8]) -> Result<Self, TokenError> {
        if key.len() < MIN_KEY_LEN {
            return Err(TokenError::KeyTooShort { len: key.len() });
        }
        Ok(Self { key: key.to_vec() })
    }

    fn sign_segment(&self, payload_b64: &str) -> Result<Vec<u8>, TokenError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|err| TokenError::Mac(err.to_string()))?;
        mac.update(TOKEN_MAC_DOMAIN);
        mac.update(payload_b64.as_bytes());
        Ok(mac.finalize().into_bytes().to_vec())
    }

    /// Mints a signed token for the given claims.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::Serialize`] if the claims cannot be encoded.
    pub fn mint(&self, claims: &TokenClaims) -> Result<String, TokenError> {
        let payload = serde_json::to_vec(claims)?;
        let payload_b64 = URL_SAFE_NO_PAD.encode(payload);
        let sig = self.sign_segment(&payload_b64)?;
        let sig_b64 = URL_SAFE_NO_PAD.encode(sig);
        Ok(format!("{TOKEN_PREFIX}.{payload_b64}.{sig_b64}"))
    }

    /// Verifies a token string and returns its claims.
    ///
    /// `now_ns` is the caller's clock reading; expiry is checked against
    /// it after the signature verifies.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Malformed`] for anything that is not shaped like a
    ///   token minted here
    /// - [`TokenError::BadSignature`] if the MAC does not verify
    /// - [`TokenError::Expired`] if the verified claims are past expiry
    pub fn verify(&self, token: &str, now_ns: i64) -> Result<TokenClaims, TokenError> {
        let mut parts = token.splitn(3, '.');
        let (Some(prefix), Some(payload_b64), Some(sig_b64)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Malformed);
        };
        if prefix != TOKEN_PREFIX {
            return Err(TokenError::Malformed);
        }

        let presented_sig = URL_SAFE_NO_PAD
            .decode(sig_b64)
            .map_err(|_| TokenError::Malformed)?;
        let expected_sig = self.sign_segment(payload_b64)?;
        let sig_matches = presented_sig.len() == expected_sig.len()
            && bool::from(presented_sig.ct_eq(&expected_sig));
        if !sig_matches {
            return Err(TokenError::BadSignature);
        }

        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let claims: TokenClaims =
            serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;

        if now_ns >= claims.expires_at_ns {
            return Err(TokenError::Expired {
                expires_at_ns: claims.expires_at_ns,
                now_ns,
            });
        }
        Ok(claims)
    }
}
