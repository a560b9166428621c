//! Sites and URL prefixes.
//!
//! A site is a `(port, base path)` pair with a handler. Its URL prefix
//! (`http://+:8080/app/`) is what the request queue matches against.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use futures_util::future::BoxFuture;
use serde::Serialize;

pub use crate::config::schema::ChannelType;
use crate::http::message::HttpMessage;
use crate::http::url_group::UrlGroup;

/// Application code answering the requests of a site.
pub trait SiteHandler: Send + Sync {
    fn handle<'a>(&'a self, message: &'a mut HttpMessage) -> BoxFuture<'a, ()>;
}

impl<F> SiteHandler for F
where
    F: Fn(&mut HttpMessage) + Send + Sync,
{
    fn handle<'a>(&'a self, message: &'a mut HttpMessage) -> BoxFuture<'a, ()> {
        self(message);
        Box::pin(async {})
    }
}

/// Normalize a base path so it starts and ends with `/`.
pub fn normalize_base(base: &str) -> String {
    let trimmed = base.trim().trim_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        format!("/{trimmed}/")
    }
}

/// Ports a site may bind: the HTTP defaults or anything unprivileged.
pub fn is_allowed_port(port: u16) -> bool {
    port >= 1024 || port == 80 || port == 443
}

/// Short host name of this machine.
pub fn machine_name() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UrlPrefix {
    pub channel_type: ChannelType,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub base: String,
}

impl UrlPrefix {
    /// Build a prefix; `address` is the bound IP, used for `Address`.
    pub fn new(channel_type: ChannelType, secure: bool, port: u16, base: &str, address: &str) -> Self {
        let host = match channel_type {
            ChannelType::Strong => "+".to_string(),
            ChannelType::Weak => "*".to_string(),
            ChannelType::Named => machine_name()
                .split('.')
                .next()
                .unwrap_or("localhost")
                .to_string(),
            ChannelType::FullyQualified => machine_name(),
            ChannelType::Address => address.to_string(),
        };
        Self {
            channel_type,
            host,
            port,
            secure,
            base: normalize_base(base),
        }
    }

    /// Higher wins: strong wildcard, explicit host, weak wildcard.
    fn precedence(&self) -> u8 {
        match self.channel_type {
            ChannelType::Strong => 2,
            ChannelType::Weak => 0,
            _ => 1,
        }
    }

    /// Rank of this prefix for a request, `None` if it does not apply.
    /// Compare ranks to pick the best prefix.
    pub fn rank(&self, host: &str, port: u16, path: &str) -> Option<(u8, usize)> {
        if port != self.port {
            return None;
        }
        let host_ok = match self.channel_type {
            ChannelType::Strong | ChannelType::Weak => true,
            _ => self.host.eq_ignore_ascii_case(host),
        };
        if !host_ok {
            return None;
        }
        let path_ok = path.starts_with(&self.base) || format!("{path}/") == self.base;
        path_ok.then_some((self.precedence(), self.base.len()))
    }
}

impl std::fmt::Display for UrlPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let scheme = if self.secure { "https" } else { "http" };
        write!(f, "{}://{}:{}{}", scheme, self.host, self.port, self.base)
    }
}

/// A registered site.
pub struct Site {
    port: u16,
    base: String,
    prefix: UrlPrefix,
    main_site: Option<Weak<Site>>,
    group: Arc<UrlGroup>,
    handler: RwLock<Arc<dyn SiteHandler>>,
    started: AtomicBool,
    requests: AtomicU64,
}

impl std::fmt::Debug for Site {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Site")
            .field("prefix", &self.prefix.to_string())
            .field("subsite", &self.is_subsite())
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SiteStatus {
    pub prefix: String,
    pub port: u16,
    pub base: String,
    pub subsite: bool,
    pub started: bool,
    pub requests: u64,
    pub authentication: &'static str,
}

impl Site {
    pub fn new(
        prefix: UrlPrefix,
        main_site: Option<&Arc<Site>>,
        group: Arc<UrlGroup>,
        handler: Arc<dyn SiteHandler>,
    ) -> Self {
        Self {
            port: prefix.port,
            base: prefix.base.clone(),
            prefix,
            main_site: main_site.map(Arc::downgrade),
            group,
            handler: RwLock::new(handler),
            started: AtomicBool::new(false),
            requests: AtomicU64::new(0),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn prefix(&self) -> &UrlPrefix {
        &self.prefix
    }

    pub fn group(&self) -> &Arc<UrlGroup> {
        &self.group
    }

    pub fn is_subsite(&self) -> bool {
        self.main_site.is_some()
    }

    pub fn main_site(&self) -> Option<Arc<Site>> {
        self.main_site.as_ref().and_then(Weak::upgrade)
    }

    /// Whether `other` is the main site of this one.
    pub fn depends_on(&self, other: &Arc<Site>) -> bool {
        self.main_site
            .as_ref()
            .map(|main| std::ptr::eq(main.as_ptr(), Arc::as_ptr(other)))
            .unwrap_or(false)
    }

    pub fn handler(&self) -> Option<Arc<dyn SiteHandler>> {
        self.handler.read().ok().map(|h| Arc::clone(&h))
    }

    pub fn set_handler(&self, handler: Arc<dyn SiteHandler>) {
        if let Ok(mut slot) = self.handler.write() {
            *slot = handler;
        }
    }

    /// Start accepting requests. Fails if the URL group is not started.
    pub fn start(&self) -> bool {
        if !self.group.is_started() {
            tracing::error!(prefix = %self.prefix, "Site cannot start: URL group not started");
            return false;
        }
        self.started.store(true, Ordering::SeqCst);
        true
    }

    pub fn stop(&self) {
        self.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_handled(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SiteStatus {
        SiteStatus {
            prefix: self.prefix.to_string(),
            port: self.port,
            base: self.base.clone(),
            subsite: self.is_subsite(),
            started: self.is_started(),
            requests: self.requests_handled(),
            authentication: self.group.scheme().as_str(),
        }
    }
}

/// Sites keyed by `(port, base)`.
#[derive(Debug, Default)]
pub struct SiteRegistry {
    sites: BTreeMap<(u16, String), Arc<Site>>,
}

impl SiteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(port: u16, base: &str) -> (u16, String) {
        (port, normalize_base(base))
    }

    pub fn get(&self, port: u16, base: &str) -> Option<Arc<Site>> {
        self.sites.get(&Self::key(port, base)).cloned()
    }

    /// Main site whose base is the longest prefix of `base` on `port`.
    pub fn find_main_site(&self, port: u16, base: &str) -> Option<Arc<Site>> {
        let base = normalize_base(base);
        self.sites
            .values()
            .filter(|s| s.port == port && !s.is_subsite() && base.starts_with(&s.base))
            .max_by_key(|s| s.base.len())
            .cloned()
    }

    /// Site that owns a URL prefix string.
    pub fn find_by_prefix(&self, prefix: &str) -> Option<Arc<Site>> {
        self.sites
            .values()
            .find(|s| s.prefix.to_string() == prefix)
            .cloned()
    }

    /// Returns false if the key is taken.
    pub fn insert(&mut self, site: Arc<Site>) -> bool {
        let key = Self::key(site.port, &site.base);
        if self.sites.contains_key(&key) {
            return false;
        }
        self.sites.insert(key, site);
        true
    }

    pub fn remove(&mut self, port: u16, base: &str) -> Option<Arc<Site>> {
        self.sites.remove(&Self::key(port, base))
    }

    pub fn has_dependents(&self, site: &Arc<Site>) -> bool {
        self.sites.values().any(|s| s.depends_on(site))
    }

    pub fn all(&self) -> Vec<Arc<Site>> {
        self.sites.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn drain(&mut self) -> Vec<Arc<Site>> {
        std::mem::take(&mut self.sites).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::url_group::AuthConfig;

    fn site(base: &str, main: Option<&Arc<Site>>) -> Arc<Site> {
        let prefix = UrlPrefix::new(ChannelType::Strong, false, 8080, base, "127.0.0.1");
        let group = Arc::new(UrlGroup::new(AuthConfig::default()));
        let handler: Arc<dyn SiteHandler> = Arc::new(|_: &mut HttpMessage| {});
        Arc::new(Site::new(prefix, main, group, handler))
    }

    #[test]
    fn test_prefix_format() {
        let prefix = UrlPrefix::new(ChannelType::Weak, true, 443, "app", "10.0.0.1");
        assert_eq!(prefix.to_string(), "https://*:443/app/");
        let address = UrlPrefix::new(ChannelType::Address, false, 8080, "/", "10.0.0.1");
        assert_eq!(address.to_string(), "http://10.0.0.1:8080/");
    }

    #[test]
    fn test_allowed_ports() {
        assert!(is_allowed_port(80));
        assert!(is_allowed_port(443));
        assert!(is_allowed_port(1024));
        assert!(!is_allowed_port(500));
        assert!(!is_allowed_port(1023));
    }

    #[test]
    fn test_prefix_precedence() {
        let strong = UrlPrefix::new(ChannelType::Strong, false, 8080, "/", "");
        let weak = UrlPrefix::new(ChannelType::Weak, false, 8080, "/app", "");
        let explicit = UrlPrefix::new(ChannelType::Address, false, 8080, "/", "example.org");

        let path = "/app/page";
        let strong_rank = strong.rank("example.org", 8080, path).unwrap();
        let weak_rank = weak.rank("example.org", 8080, path).unwrap();
        let explicit_rank = explicit.rank("example.org", 8080, path).unwrap();
        assert!(strong_rank > explicit_rank);
        assert!(explicit_rank > weak_rank);
        assert!(explicit.rank("other.org", 8080, path).is_none());
        assert!(weak.rank("example.org", 8081, path).is_none());
        assert!(weak.rank("example.org", 8080, "/app").is_some());
        assert!(weak.rank("example.org", 8080, "/apple").is_none());
    }

    #[test]
    fn test_registry_main_site_lookup() {
        let mut registry = SiteRegistry::new();
        let main = site("/app", None);
        assert!(registry.insert(main.clone()));
        assert!(!registry.insert(site("/app/", None)));

        let found = registry.find_main_site(8080, "/app/sub").unwrap();
        assert!(Arc::ptr_eq(&found, &main));
        assert!(registry.find_main_site(8080, "/other").is_none());

        let sub = site("/app/sub", Some(&main));
        assert!(registry.insert(sub.clone()));
        assert!(registry.has_dependents(&main));
        assert!(!registry.has_dependents(&sub));
        assert!(registry.find_by_prefix("http://+:8080/app/sub/").is_some());
    }
}
