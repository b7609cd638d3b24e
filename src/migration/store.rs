//! Content-store collaborator: payload in, stable delivery URL out.

use crate::error::OptimizeError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Named delivery variants, chosen per reference context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Variant {
    Public,
    Thumbnail,
    Social,
    Icon,
}

impl Variant {
    pub const ALL: [Variant; 4] = [Variant::Public, Variant::Thumbnail, Variant::Social, Variant::Icon];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Thumbnail => "thumbnail",
            Self::Social => "social",
            Self::Icon => "icon",
        }
    }
}

impl fmt::Display for Variant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Cheap existence check, makes migration idempotent
    async fn exists(&self, key: &str) -> Result<bool, OptimizeError>;

    /// Store the payload and return its delivery URL
    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<String, OptimizeError>;

    /// Delivery URL of an existing key (the `public` variant)
    fn delivery_url(&self, key: &str) -> String;

    /// Delivery URL for a named variant; the last path segment names the variant
    fn variant_url(&self, delivery_url: &str, variant: Variant) -> String {
        match delivery_url.rsplit_once('/') {
            Some((prefix, last)) if last == Variant::Public.as_str() => format!("{}/{}", prefix, variant),
            _ => delivery_url.to_string(),
        }
    }
}

/// Content-addressed key for a source URL, keeps the extension for the store's mime sniffing
pub fn store_key(url: &str) -> String {
    let hash = crate::optimizer::content_hash(url.as_bytes());
    let path = url.split(['?', '#']).next().unwrap_or(url);
    let ext = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()));
    match ext {
        Some(ext) => format!("{}.{}", &hash[..32], ext),
        None => hash[..32].to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl ContentStore for Fixed {
        async fn exists(&self, _key: &str) -> Result<bool, OptimizeError> {
            Ok(false)
        }
        async fn put(&self, key: &str, _bytes: Vec<u8>, _content_type: &str) -> Result<String, OptimizeError> {
            Ok(self.delivery_url(key))
        }
        fn delivery_url(&self, key: &str) -> String {
            format!("https://imagedelivery.net/acc/{}/public", key)
        }
    }

    #[test]
    fn test_variant_urls() {
        let store = Fixed;
        let public = store.delivery_url("k");
        assert_eq!(store.variant_url(&public, Variant::Thumbnail), "https://imagedelivery.net/acc/k/thumbnail");
        assert_eq!(store.variant_url(&public, Variant::Public), public);
        assert_eq!(store.variant_url("https://cdn.test/raw.png", Variant::Icon), "https://cdn.test/raw.png");
    }

    #[test]
    fn test_store_key_is_stable() {
        let a = store_key("https://acme.test/img/Hero.JPG?v=2");
        assert_eq!(a, store_key("https://acme.test/img/Hero.JPG?v=2"));
        assert!(a.ends_with(".jpg"));
        assert_eq!(a.len(), 36);
        assert_ne!(a, store_key("https://acme.test/img/Hero.JPG?v=3"));
        assert_eq!(store_key("https://acme.test/image").len(), 32);
    }
}
