use http::HeaderMap;
use std::collections::HashMap;

/// Well-known keys carrying cross-protocol metadata inside the unified
/// header bag. Protocol codecs fill these on decode and strip them on encode.
pub const HEADER_METHOD: &str = "x-mosn-method";
pub const HEADER_HOST: &str = "x-mosn-host";
pub const HEADER_PATH: &str = "x-mosn-path";
pub const HEADER_QUERYSTRING: &str = "x-mosn-querystring";
pub const HEADER_STATUS: &str = "x-mosn-status";
pub const HEADER_GLOBAL_TIMEOUT: &str = "x-mosn-global-timeout";

/// Protocol-agnostic header map. `:`-prefixed pseudo headers are normalized
/// to plain names on insert so route matchers see one namespace.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HeaderBag {
    inner: HashMap<String, String>,
}

impl HeaderBag {
    pub fn new() -> Self {
        HeaderBag {
            inner: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.inner.get(Self::normalize(key).as_ref()).map(|v| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.inner
            .insert(Self::normalize(key).into_owned(), value.into());
    }

    pub fn del(&mut self, key: &str) -> Option<String> {
        self.inner.remove(Self::normalize(key).as_ref())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.contains_key(Self::normalize(key).as_ref())
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.inner.iter()
    }

    fn normalize(key: &str) -> std::borrow::Cow<'_, str> {
        let key = key.strip_prefix(':').unwrap_or(key);
        if key.chars().any(|c| c.is_ascii_uppercase()) {
            std::borrow::Cow::Owned(key.to_ascii_lowercase())
        } else {
            std::borrow::Cow::Borrowed(key)
        }
    }
}

impl From<&HeaderMap> for HeaderBag {
    fn from(value: &HeaderMap) -> HeaderBag {
        value.iter().fold(HeaderBag::new(), |mut bag, (k, v)| {
            if let Ok(v) = v.to_str() {
                bag.set(k.as_str(), v);
            }
            bag
        })
    }
}

impl FromIterator<(String, String)> for HeaderBag {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        let mut bag = HeaderBag::new();
        for (k, v) in iter {
            bag.set(&k, v);
        }
        bag
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pseudo_headers_are_normalized() {
        let mut bag = HeaderBag::new();
        bag.set(":authority", "example.com");
        assert_eq!(bag.get("authority"), Some("example.com"));
        assert_eq!(bag.get(":authority"), Some("example.com"));
    }

    #[test]
    fn case_insensitive_keys() {
        let mut bag = HeaderBag::new();
        bag.set("X-Mosn-Status", "200");
        assert_eq!(bag.get(HEADER_STATUS), Some("200"));
        assert!(bag.del(HEADER_STATUS).is_some());
        assert!(bag.is_empty());
    }
}
