//! Cloud credential lookup.

use std::env;

/// Env vars checked for the cloud API key, in order.
pub const CREDENTIAL_ENV_VARS: [&str; 2] = ["DEEPSEEK_API_KEY", "OPENAI_API_KEY"];

/// Supplies the cloud API key. Pure lookup; absence is not an error here.
pub trait CredentialProvider: Send + Sync {
    /// Returns the raw credential, or `None` when none is configured.
    fn get_credential(&self) -> Option<String>;
}

/// Reads the key from the process environment on every lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentials;

impl CredentialProvider for EnvCredentials {
    fn get_credential(&self) -> Option<String> {
        CREDENTIAL_ENV_VARS
            .iter()
            .filter_map(|key| env::var(key).ok())
            .map(|v| v.trim().to_string())
            .find(|v| !v.is_empty())
    }
}

/// A fixed key, or a fixed absence of one.
#[derive(Debug, Default, Clone)]
pub struct StaticCredential(pub Option<String>);

impl StaticCredential {
    pub fn new(key: impl Into<String>) -> Self {
        Self(Some(key.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

impl CredentialProvider for StaticCredential {
    fn get_credential(&self) -> Option<String> {
        self.0.clone()
    }
}
