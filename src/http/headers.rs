//! Ordered header multimap shared by requests and responses.

use bytes::{BufMut, BytesMut};
use std::fmt;

/// Header lines in wire order. Keys compare case-insensitively and
/// duplicates are kept as separate entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpHeaders {
    entries: Vec<(String, String)>,
}

impl HttpHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_parsed(headers: &[httparse::Header<'_>]) -> Self {
        let entries = headers
            .iter()
            .map(|h| {
                (
                    h.name.to_string(),
                    String::from_utf8_lossy(h.value).trim().to_string(),
                )
            })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remove every entry for `key`, returning how many were dropped
    pub fn remove(&mut self, key: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !k.eq_ignore_ascii_case(key));
        before - self.entries.len()
    }

    /// Overwrite the first entry for `key` in place, or append one
    pub fn replace(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .entries
            .iter_mut()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
        {
            Some(entry) => *entry = (key.to_string(), value),
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn add(&mut self, key: &str, value: impl Into<String>) {
        self.entries.push((key.to_string(), value.into()));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// True if any comma separated element of any `key` entry equals
    /// `token` (case-insensitive). Used for `Connection` and
    /// `Transfer-Encoding`.
    pub fn has_token(&self, key: &str, token: &str) -> bool {
        self.get_all(key).iter().any(|value| {
            value
                .split(',')
                .any(|part| part.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Append the header lines and the terminating blank line
    pub fn write_to(&self, buf: &mut BytesMut) {
        for (key, value) in &self.entries {
            buf.reserve(key.len() + value.len() + 4);
            buf.put_slice(key.as_bytes());
            buf.put_slice(b": ");
            buf.put_slice(value.as_bytes());
            buf.put_slice(b"\r\n");
        }
        buf.put_slice(b"\r\n");
    }
}

impl fmt::Display for HttpHeaders {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.entries {
            write!(f, "{}: {}\r\n", key, value)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> HttpHeaders {
        let mut h = HttpHeaders::new();
        h.add("Host", "example.com");
        h.add("Set-Cookie", "a=1");
        h.add("Accept", "*/*");
        h.add("set-cookie", "b=2");
        h
    }

    #[test]
    fn test_get_is_case_insensitive_and_first_wins() {
        let h = sample();
        assert_eq!(h.get("host"), Some("example.com"));
        assert_eq!(h.get("SET-COOKIE"), Some("a=1"));
        assert_eq!(h.get("Missing"), None);
    }

    #[test]
    fn test_duplicates_are_preserved() {
        let h = sample();
        assert_eq!(h.get_all("Set-Cookie"), vec!["a=1", "b=2"]);
        assert_eq!(h.len(), 4);
    }

    #[test]
    fn test_remove_drops_all_matches() {
        let mut h = sample();
        assert_eq!(h.remove("set-cookie"), 2);
        assert_eq!(h.len(), 2);
        assert!(!h.contains("Set-Cookie"));
    }

    #[test]
    fn test_replace_keeps_position() {
        let mut h = sample();
        h.replace("accept", "text/html");
        let keys: Vec<&str> = h.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["Host", "Set-Cookie", "accept", "set-cookie"]);
        assert_eq!(h.get("Accept"), Some("text/html"));

        h.replace("Via", "1.1 sidegate");
        assert_eq!(h.iter().last(), Some(("Via", "1.1 sidegate")));
    }

    #[test]
    fn test_has_token() {
        let mut h = HttpHeaders::new();
        h.add("Connection", "Upgrade, Keep-Alive");
        h.add("Transfer-Encoding", "gzip, chunked");
        assert!(h.has_token("connection", "keep-alive"));
        assert!(!h.has_token("connection", "close"));
        assert!(h.has_token("Transfer-Encoding", "CHUNKED"));
    }

    #[test]
    fn test_write_to_serializes_in_order() {
        let mut h = HttpHeaders::new();
        h.add("Host", "a");
        h.add("X-Test", "1");
        let mut buf = BytesMut::new();
        h.write_to(&mut buf);
        assert_eq!(&buf[..], b"Host: a\r\nX-Test: 1\r\n\r\n");
    }
}
