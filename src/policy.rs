#![cfg(feature = "stack-api")]

// Built-in security-policy providers and a static credential store. Real
// deployments plug their own [`SecurityPolicy`] implementation; these cover
// unsecured channels, a keyed-MAC signing policy, and tests.

use ahash::AHashMap;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::api::{Authenticator, Credentials, PolicyError, PolicyOffer, SecurityMode, SecurityPolicy};

type HmacSha256 = Hmac<Sha256>;

/// Policy for unsecured channels: no signature, payloads pass through.
#[derive(Debug, Default)]
pub struct NullPolicy;

impl SecurityPolicy for NullPolicy {
    fn id(&self) -> &str {
        "None"
    }

    fn mode(&self) -> SecurityMode {
        SecurityMode::None
    }

    fn signature_len(&self) -> usize {
        0
    }

    fn negotiate(&self, peer_offer: &PolicyOffer) -> Result<(), PolicyError> {
        if peer_offer.policy_id == self.id() && peer_offer.mode == SecurityMode::None {
            Ok(())
        } else {
            Err(PolicyError::Rejected {
                offered: peer_offer.policy_id.clone(),
            })
        }
    }

    fn sign(&self, _data: &[u8], _token_id: u32) -> Result<Bytes, PolicyError> {
        Ok(Bytes::new())
    }

    fn verify(&self, _data: &[u8], _signature: &[u8], _token_id: u32) -> Result<(), PolicyError> {
        Ok(())
    }

    fn encrypt(&self, data: &[u8], _token_id: u32) -> Result<Bytes, PolicyError> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decrypt(&self, data: &[u8], _token_id: u32) -> Result<Bytes, PolicyError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Signing policy keyed with a pre-shared secret. The token identifier is
/// mixed into the MAC so a signature never validates under another token.
pub struct HmacSha256Policy {
    key: [u8; 32],
}

impl HmacSha256Policy {
    /// Policy identifier advertised during negotiation.
    pub const ID: &'static str = "Hmac-Sha256-Sign";

    /// Creates the policy with the given pre-shared key.
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Creates the policy with a random key, for tests and loopback setups.
    pub fn random() -> Self {
        Self::new(rand::random())
    }

    fn mac(&self, data: &[u8], token_id: u32) -> HmacSha256 {
        let mut mac =
            HmacSha256::new_from_slice(&self.key).expect("hmac accepts any key length");
        mac.update(&token_id.to_be_bytes());
        mac.update(data);
        mac
    }
}

impl SecurityPolicy for HmacSha256Policy {
    fn id(&self) -> &str {
        Self::ID
    }

    fn mode(&self) -> SecurityMode {
        SecurityMode::Sign
    }

    fn signature_len(&self) -> usize {
        32
    }

    fn negotiate(&self, peer_offer: &PolicyOffer) -> Result<(), PolicyError> {
        if peer_offer.policy_id == self.id() && peer_offer.mode == SecurityMode::Sign {
            Ok(())
        } else {
            Err(PolicyError::Rejected {
                offered: peer_offer.policy_id.clone(),
            })
        }
    }

    fn sign(&self, data: &[u8], token_id: u32) -> Result<Bytes, PolicyError> {
        let tag = self.mac(data, token_id).finalize().into_bytes();
        Ok(Bytes::copy_from_slice(&tag))
    }

    fn verify(&self, data: &[u8], signature: &[u8], token_id: u32) -> Result<(), PolicyError> {
        let tag = self.mac(data, token_id).finalize().into_bytes();
        if tag.ct_eq(signature).into() {
            Ok(())
        } else {
            Err(PolicyError::Verification)
        }
    }

    fn encrypt(&self, _data: &[u8], _token_id: u32) -> Result<Bytes, PolicyError> {
        Err(PolicyError::Unsupported("encrypt"))
    }

    fn decrypt(&self, _data: &[u8], _token_id: u32) -> Result<Bytes, PolicyError> {
        Err(PolicyError::Unsupported("decrypt"))
    }
}

/// Credential store backed by an in-memory user table. Secrets are compared
/// in constant time.
#[derive(Debug, Default)]
pub struct StaticUserAuthenticator {
    users: AHashMap<String, Bytes>,
    allow_anonymous: bool,
}

impl StaticUserAuthenticator {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Permits anonymous activation.
    pub fn allow_anonymous(mut self) -> Self {
        self.allow_anonymous = true;
        self
    }

    /// Registers one user with its secret.
    pub fn with_user(mut self, user: impl Into<String>, secret: impl Into<Bytes>) -> Self {
        self.users.insert(user.into(), secret.into());
        self
    }
}

impl Authenticator for StaticUserAuthenticator {
    fn authenticate(&self, credentials: &Credentials) -> bool {
        match credentials {
            Credentials::Anonymous => self.allow_anonymous,
            Credentials::UserName { user, secret } => self
                .users
                .get(user)
                .is_some_and(|expected| expected.ct_eq(secret).into()),
            Credentials::Certificate(_) => false,
        }
    }
}
