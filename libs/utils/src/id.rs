//! Tenant identity types.
//!
//! A [`TenantId`] is an opaque 24-byte value rendered as URL-safe unpadded
//! base64 (32 characters). The all-zeroes id is reserved: a peer attaching
//! with it is performing a liveness ping, not binding a tenant.
//!
//! A [`TenantKey`] is the 32-byte preshared token that authorizes a remote
//! peer to attach as a given tenant. It is never logged or displayed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub const TENANT_ID_LEN: usize = 24;
pub const TENANT_KEY_LEN: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum IdError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("decoded length {0}, expected {1}")]
    BadLength(usize, usize),
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TenantId([u8; TENANT_ID_LEN]);

impl TenantId {
    pub const ZERO: TenantId = TenantId([0u8; TENANT_ID_LEN]);

    pub const fn from_bytes(b: [u8; TENANT_ID_LEN]) -> Self {
        TenantId(b)
    }

    pub fn as_bytes(&self) -> &[u8; TENANT_ID_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; TENANT_ID_LEN]
    }

    pub fn generate() -> Self {
        let mut b = [0u8; TENANT_ID_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut b[..]);
        TenantId(b)
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&base64::encode_config(self.0, base64::URL_SAFE_NO_PAD))
    }
}

impl fmt::Debug for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for TenantId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = base64::decode_config(s, base64::URL_SAFE_NO_PAD)?;
        let b: [u8; TENANT_ID_LEN] = raw
            .try_into()
            .map_err(|v: Vec<u8>| IdError::BadLength(v.len(), TENANT_ID_LEN))?;
        Ok(TenantId(b))
    }
}

impl Serialize for TenantId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TenantKey([u8; TENANT_KEY_LEN]);

impl TenantKey {
    pub const ZERO: TenantKey = TenantKey([0u8; TENANT_KEY_LEN]);

    pub const fn from_bytes(b: [u8; TENANT_KEY_LEN]) -> Self {
        TenantKey(b)
    }

    pub fn as_bytes(&self) -> &[u8; TENANT_KEY_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; TENANT_KEY_LEN]
    }

    pub fn generate() -> Self {
        let mut b = [0u8; TENANT_KEY_LEN];
        rand::Rng::fill(&mut rand::thread_rng(), &mut b[..]);
        TenantKey(b)
    }
}

// The key is a credential: Debug must not leak it.
impl fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TenantKey(..)")
    }
}

impl FromStr for TenantKey {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = base64::decode_config(s, base64::URL_SAFE_NO_PAD)?;
        let b: [u8; TENANT_KEY_LEN] = raw
            .try_into()
            .map_err(|v: Vec<u8>| IdError::BadLength(v.len(), TENANT_KEY_LEN))?;
        Ok(TenantKey(b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_id_roundtrip() {
        let id = TenantId::generate();
        let s = id.to_string();
        assert_eq!(s.len(), 32);
        assert_eq!(s.parse::<TenantId>().unwrap(), id);
    }

    #[test]
    fn zero_is_reserved() {
        assert!(TenantId::ZERO.is_zero());
        assert!(!TenantId::generate().is_zero());
        assert_eq!(
            TenantId::ZERO.to_string().parse::<TenantId>().unwrap(),
            TenantId::ZERO
        );
    }

    #[test]
    fn bad_length_rejected() {
        let short = base64::encode_config([1u8; 8], base64::URL_SAFE_NO_PAD);
        assert!(matches!(
            short.parse::<TenantId>(),
            Err(IdError::BadLength(8, TENANT_ID_LEN))
        ));
    }

    #[test]
    fn key_debug_redacted() {
        let key = TenantKey::generate();
        assert_eq!(format!("{key:?}"), "TenantKey(..)");
    }

    #[test]
    fn serde_as_string() {
        let id = TenantId::from_bytes([7u8; TENANT_ID_LEN]);
        let json = serde_json::to_string(&id).unwrap();
        let back: TenantId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
