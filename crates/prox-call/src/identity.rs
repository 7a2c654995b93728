use thiserror::Error;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("signing failed: {0}")]
    Signing(String),
}

/// The device's long-lived identity. Key storage and the signature scheme
/// live behind this trait; the call layer only needs the public key and a
/// way to sign trust declarations.
pub trait IdentityProvider: Send + Sync {
    fn public_key(&self) -> &str;

    fn sign(&self, payload: &[u8]) -> Result<String, IdentityError>;
}

/// An identity with a fixed key whose "signature" is the hex of the payload.
/// Used by tests and debugging tools.
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    public_key: String,
}

impl StaticIdentity {
    pub fn new(public_key: impl Into<String>) -> Self {
        Self {
            public_key: public_key.into(),
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn public_key(&self) -> &str {
        &self.public_key
    }

    fn sign(&self, payload: &[u8]) -> Result<String, IdentityError> {
        Ok(payload.iter().map(|byte| format!("{byte:02x}")).collect())
    }
}
