//! URL groups: sites sharing one authentication configuration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use serde::Serialize;

use crate::http::site::UrlPrefix;

/// Authentication a URL group asks of its clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Default)]
pub enum AuthScheme {
    #[default]
    Anonymous,
    Basic,
    Digest,
    Ntlm,
    Negotiate,
    Kerberos,
}

impl AuthScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthScheme::Anonymous => "Anonymous",
            AuthScheme::Basic => "Basic",
            AuthScheme::Digest => "Digest",
            AuthScheme::Ntlm => "NTLM",
            AuthScheme::Negotiate => "Negotiate",
            AuthScheme::Kerberos => "Kerberos",
        }
    }
}

/// The five fields that identify a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Default)]
pub struct AuthConfig {
    pub name: String,
    pub scheme: AuthScheme,
    pub ntlm_cache: bool,
    pub realm: String,
    pub domain: String,
}

#[derive(Debug)]
pub struct UrlGroup {
    auth: AuthConfig,
    started: AtomicBool,
    prefixes: RwLock<Vec<UrlPrefix>>,
}

impl UrlGroup {
    pub fn new(auth: AuthConfig) -> Self {
        Self {
            auth,
            started: AtomicBool::new(false),
            prefixes: RwLock::new(Vec::new()),
        }
    }

    pub fn auth(&self) -> &AuthConfig {
        &self.auth
    }

    pub fn scheme(&self) -> AuthScheme {
        self.auth.scheme
    }

    pub fn realm(&self) -> &str {
        &self.auth.realm
    }

    /// Structural equality on all five authentication fields.
    pub fn matches(&self, auth: &AuthConfig) -> bool {
        self.auth == *auth
    }

    /// Start the group. Basic needs a realm to put in the challenge.
    pub fn start(&self) -> bool {
        if self.auth.scheme == AuthScheme::Basic && self.auth.realm.is_empty() {
            tracing::error!(group = %self.auth.name, "Basic authentication requires a realm");
            return false;
        }
        self.started.store(true, Ordering::SeqCst);
        tracing::debug!(group = %self.auth.name, scheme = self.auth.scheme.as_str(), "URL group started");
        true
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn add_prefix(&self, prefix: UrlPrefix) {
        if let Ok(mut prefixes) = self.prefixes.write() {
            if !prefixes.contains(&prefix) {
                prefixes.push(prefix);
            }
        }
    }

    /// Returns true if the prefix was registered here.
    pub fn remove_prefix(&self, prefix: &UrlPrefix) -> bool {
        match self.prefixes.write() {
            Ok(mut prefixes) => {
                let before = prefixes.len();
                prefixes.retain(|p| p != prefix);
                prefixes.len() != before
            }
            Err(_) => false,
        }
    }

    pub fn prefix_count(&self) -> usize {
        self.prefixes.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.prefix_count() == 0
    }

    /// Check a request's Authorization header against this group.
    ///
    /// Only `Basic` is enforced; the other schemes are passed through to
    /// the site handler.
    pub fn authorize(&self, authorization: Option<&str>) -> bool {
        match self.auth.scheme {
            AuthScheme::Basic => authorization
                .and_then(|value| value.split_once(' '))
                .map(|(scheme, credentials)| {
                    scheme.eq_ignore_ascii_case("basic") && !credentials.trim().is_empty()
                })
                .unwrap_or(false),
            _ => true,
        }
    }

    /// `WWW-Authenticate` value for a rejected request.
    pub fn challenge(&self) -> String {
        format!("Basic realm=\"{}\"", self.auth.realm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic() -> AuthConfig {
        AuthConfig {
            name: "secure".to_string(),
            scheme: AuthScheme::Basic,
            realm: "events".to_string(),
            ..AuthConfig::default()
        }
    }

    #[test]
    fn test_matching_is_structural() {
        let group = UrlGroup::new(basic());
        assert!(group.matches(&basic()));
        let mut other = basic();
        other.domain = "corp".to_string();
        assert!(!group.matches(&other));
    }

    #[test]
    fn test_basic_requires_realm() {
        let mut config = basic();
        config.realm.clear();
        assert!(!UrlGroup::new(config).start());
        assert!(UrlGroup::new(basic()).start());
    }

    #[test]
    fn test_basic_authorization() {
        let group = UrlGroup::new(basic());
        assert!(!group.authorize(None));
        assert!(!group.authorize(Some("Bearer abc")));
        assert!(group.authorize(Some("Basic dXNlcjpwYXNz")));
        assert_eq!(group.challenge(), "Basic realm=\"events\"");
        assert!(UrlGroup::new(AuthConfig::default()).authorize(None));
    }
}
