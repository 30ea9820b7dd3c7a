//! Credential Provider (C2, §4.2): a capability with one method,
//! `headers() -> map`, isolated from the turn loop so a future OAuth/refresh
//! flow only has to add a new variant here.

use std::collections::HashMap;

use sa_domain::error::{Error, Result};

/// Produces the HTTP headers needed to authenticate an upstream request.
pub trait CredentialProvider: Send + Sync {
    fn headers(&self) -> Result<HashMap<String, String>>;
}

/// A single static API key sent either as a named header or as a bearer
/// token on `Authorization`.
pub struct StaticApiKey {
    api_key: String,
    header_name: String,
    treat_authorization_as_bearer: bool,
}

impl StaticApiKey {
    pub fn new(
        api_key: impl Into<String>,
        header_name: impl Into<String>,
        treat_authorization_as_bearer: bool,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            header_name: header_name.into(),
            treat_authorization_as_bearer,
        }
    }
}

impl CredentialProvider for StaticApiKey {
    fn headers(&self) -> Result<HashMap<String, String>> {
        if self.api_key.is_empty() {
            return Err(Error::MissingCredential(format!(
                "no API key configured for header '{}'",
                self.header_name
            )));
        }
        let value = if self.header_name.eq_ignore_ascii_case("authorization")
            && self.treat_authorization_as_bearer
        {
            format!("Bearer {}", self.api_key)
        } else {
            self.api_key.clone()
        };
        let mut headers = HashMap::new();
        headers.insert(self.header_name.clone(), value);
        Ok(headers)
    }
}

/// No credentials required (e.g. a local endpoint with no auth).
pub struct NoAuth;

impl CredentialProvider for NoAuth {
    fn headers(&self) -> Result<HashMap<String, String>> {
        Ok(HashMap::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_api_key_bearer() {
        let cred = StaticApiKey::new("sk-abc", "Authorization", true);
        let headers = cred.headers().unwrap();
        assert_eq!(headers.get("Authorization").unwrap(), "Bearer sk-abc");
    }

    #[test]
    fn static_api_key_named_header() {
        let cred = StaticApiKey::new("sk-abc", "x-api-key", false);
        let headers = cred.headers().unwrap();
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-abc");
    }

    #[test]
    fn empty_key_fails_with_missing_credential() {
        let cred = StaticApiKey::new("", "Authorization", true);
        let err = cred.headers().unwrap_err();
        assert_eq!(err.code(), "missing_credential");
    }

    #[test]
    fn no_auth_returns_empty_map() {
        let cred = NoAuth;
        assert!(cred.headers().unwrap().is_empty());
    }
}
