//! Inbound/outbound request value and HTTP methods.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// HTTP method of a request or route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = UnknownMethod;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let m = match s.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "PATCH" => Method::Patch,
            "HEAD" => Method::Head,
            "OPTIONS" => Method::Options,
            _ => return Err(UnknownMethod(s.to_string())),
        };
        Ok(m)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown method {0:?}")]
pub struct UnknownMethod(pub String);

/// A request: method, path, query, metadata (lowercased headers plus path parameters), body.
/// Path parameters are also kept apart so a parameter never reads back a header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    method: Method,
    path: String,
    query: Option<String>,
    metadata: BTreeMap<String, String>,
    params: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl Request {
    /// `target` is the request target as it appears on the request line (path plus optional query).
    pub fn new(method: Method, target: &str) -> Self {
        let (path, query) = match target.split_once('?') {
            Some((p, q)) => (p, Some(q.to_string())),
            None => (target, None),
        };
        Self {
            method,
            path: path.to_string(),
            query,
            metadata: BTreeMap::new(),
            params: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// Attach captured path parameters. They are copied into metadata without
    /// replacing a header of the same name.
    pub(crate) fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        for (name, value) in params {
            self.metadata
                .entry(name.clone())
                .or_insert_with(|| value.clone());
            self.params.insert(name, value);
        }
        self
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// Path plus query, as sent on the request line.
    pub fn target(&self) -> String {
        match &self.query {
            Some(q) => format!("{}?{}", self.path, q),
            None => self.path.clone(),
        }
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    /// Header lookup, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.metadata
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Path parameter captured from a `:name` route segment.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn params(&self) -> &BTreeMap<String, String> {
        &self.params
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_query() {
        let r = Request::new(Method::Get, "/contacts?limit=5");
        assert_eq!(r.path(), "/contacts");
        assert_eq!(r.query(), Some("limit=5"));
        assert_eq!(r.target(), "/contacts?limit=5");
    }

    #[test]
    fn headers_case_insensitive() {
        let r = Request::new(Method::Put, "/").with_header("Content-Type", "application/json");
        assert_eq!(r.header("content-type"), Some("application/json"));
        assert_eq!(r.header("CONTENT-TYPE"), Some("application/json"));
    }

    #[test]
    fn params_do_not_shadow_headers() {
        let r = Request::new(Method::Get, "/x/node7")
            .with_header("Host", "10.0.0.2:8080")
            .with_header("Accept", "application/json")
            .with_params(vec![
                ("host".to_string(), "node7".to_string()),
                ("id".to_string(), "42".to_string()),
            ]);
        assert_eq!(r.param("host"), Some("node7"));
        assert_eq!(r.header("host"), Some("10.0.0.2:8080"));
        assert_eq!(r.param("accept"), None);
        assert_eq!(r.metadata().get("id").map(String::as_str), Some("42"));
    }

    #[test]
    fn method_parse() {
        assert_eq!("get".parse::<Method>(), Ok(Method::Get));
        assert_eq!("DELETE".parse::<Method>(), Ok(Method::Delete));
        assert!("BREW".parse::<Method>().is_err());
    }
}
