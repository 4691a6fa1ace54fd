//! Environment-variable credential provider
//!
//! A bot's credential reference `main` resolves to
//! `EXCHANGE_ACCESS_KEY_MAIN` / `EXCHANGE_SECRET_KEY_MAIN`. Keys are read on
//! every connect so a fixed `.env` is picked up without a restart.

use engine::{CredentialProvider, Credentials, ExchangeError};

pub struct EnvCredentialProvider {
    lookup: Box<dyn Fn(&str) -> Option<String> + Send + Sync>,
}

impl EnvCredentialProvider {
    pub fn new() -> Self {
        Self::with_lookup(|key| std::env::var(key).ok())
    }

    pub fn with_lookup(lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            lookup: Box::new(lookup),
        }
    }
}

impl Default for EnvCredentialProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// `my-keys` → `MY_KEYS`
fn env_suffix(credential_ref: &str) -> String {
    credential_ref
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self, credential_ref: &str) -> Result<Credentials, ExchangeError> {
        let suffix = env_suffix(credential_ref);
        let read = |prefix: &str| {
            (self.lookup)(&format!("{prefix}_{suffix}")).filter(|v| !v.trim().is_empty())
        };

        match (read("EXCHANGE_ACCESS_KEY"), read("EXCHANGE_SECRET_KEY")) {
            (Some(access), Some(secret)) => Ok(Credentials::new(access, secret)),
            _ => Err(ExchangeError::MissingCredentials(credential_ref.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn provider(vars: &[(&str, &str)]) -> EnvCredentialProvider {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        EnvCredentialProvider::with_lookup(move |key| vars.get(key).cloned())
    }

    #[test]
    fn test_env_suffix() {
        assert_eq!(env_suffix("main"), "MAIN");
        assert_eq!(env_suffix("sub-account.2"), "SUB_ACCOUNT_2");
    }

    #[test]
    fn test_resolves_key_pair() {
        let p = provider(&[
            ("EXCHANGE_ACCESS_KEY_MAIN", "access"),
            ("EXCHANGE_SECRET_KEY_MAIN", "secret"),
        ]);
        let creds = p.credentials("main").unwrap();
        assert_eq!(creds.access_key(), "access");
    }

    #[test]
    fn test_missing_or_blank_keys_are_fatal() {
        let p = provider(&[
            ("EXCHANGE_ACCESS_KEY_MAIN", "access"),
            ("EXCHANGE_SECRET_KEY_MAIN", "  "),
        ]);
        let err = p.credentials("main").unwrap_err();
        assert!(matches!(err, ExchangeError::MissingCredentials(ref r) if r == "main"));
        assert!(err.is_fatal());
        assert!(p.credentials("other").is_err());
    }
}
