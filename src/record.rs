// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

/// A single framed record read from a tailed file.
///
/// The body is the literal file content between two frame boundaries with the
/// trailing LF (and a preceding CR, if any) stripped. Headers carry the file
/// group's static overlay plus any per-record additions (path, byte offset,
/// multiline markers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    body: Vec<u8>,
    headers: HashMap<String, String>,
}

impl Record {
    /// Create a record with the given body and no headers
    pub fn with_body(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: HashMap::new(),
        }
    }

    /// The raw record bytes
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The body decoded as UTF-8, replacing invalid sequences
    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Set a single header, replacing any previous value
    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(key.into(), value.into());
    }

    /// Merge a header map into the record without overwriting existing keys
    pub fn add_headers(&mut self, headers: &HashMap<String, String>) {
        for (k, v) in headers {
            self.headers.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_body() {
        let rec = Record::with_body(b"hello".to_vec());
        assert_eq!(rec.body(), b"hello");
        assert_eq!(rec.body_string(), "hello");
        assert!(rec.headers().is_empty());
    }

    #[test]
    fn test_record_headers_no_overwrite() {
        let mut rec = Record::with_body(b"x".to_vec());
        rec.set_header("k", "record");

        let mut group = HashMap::new();
        group.insert("k".to_string(), "group".to_string());
        group.insert("other".to_string(), "v".to_string());
        rec.add_headers(&group);

        assert_eq!(rec.headers().get("k").unwrap(), "record");
        assert_eq!(rec.headers().get("other").unwrap(), "v");
    }
}
