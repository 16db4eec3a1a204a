use secrecy::{ExposeSecret, SecretString};

/// Wraps the upstream API key with secrecy protection (zeroized on drop,
/// redacted in Debug).
#[derive(Clone)]
pub struct ApiKey(pub SecretString);

impl ApiKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(SecretString::from(key.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.expose_secret()
    }

    /// `Authorization` header value for the upstream request.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.expose())
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ApiKey([REDACTED])")
    }
}
