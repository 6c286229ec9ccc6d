//! Routes: (method, path pattern) pairs. Pattern segments are literals or `:name` parameters.

use std::fmt;

use crate::capability::Capability;
use crate::request::Method;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Param(String),
}

/// Parsed path pattern such as `/contacts/:id`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
}

impl PathPattern {
    pub fn parse(pattern: &str) -> Result<Self, RouteError> {
        if !pattern.starts_with('/') {
            return Err(RouteError::MissingLeadingSlash(pattern.to_string()));
        }
        let mut segments = Vec::new();
        for part in split_path(pattern) {
            match part.strip_prefix(':') {
                Some("") => return Err(RouteError::EmptyParameter(pattern.to_string())),
                Some(name) => {
                    let dup = segments
                        .iter()
                        .any(|s| matches!(s, Segment::Param(n) if n == name));
                    if dup {
                        return Err(RouteError::DuplicateParameter(name.to_string()));
                    }
                    segments.push(Segment::Param(name.to_string()));
                }
                None => segments.push(Segment::Literal(part.to_string())),
            }
        }
        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Number of `:param` segments. Zero means an exact path.
    pub fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Param(_)))
            .count()
    }

    /// Parameter names in pattern order.
    pub fn param_names(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Param(n) => Some(n.as_str()),
            Segment::Literal(_) => None,
        })
    }

    /// Match a request path. Returns captured (name, percent-decoded value) pairs.
    pub fn matches(&self, path: &str) -> Option<Vec<(String, String)>> {
        let parts: Vec<&str> = split_path(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }
        let mut params = Vec::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    let value = urlencoding::decode(part)
                        .map(|v| v.into_owned())
                        .unwrap_or_else(|_| part.to_string());
                    params.push((name.clone(), value));
                }
            }
        }
        Some(params)
    }

    /// Fill `:param` segments from `lookup`; `None` if a parameter has no value.
    pub fn interpolate(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        if self.segments.is_empty() {
            return Some("/".to_string());
        }
        let mut out = String::new();
        for segment in &self.segments {
            out.push('/');
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Param(name) => {
                    let value = lookup(name)?;
                    out.push_str(&urlencoding::encode(&value));
                }
            }
        }
        Some(out)
    }
}

/// Segments of a path, ignoring leading, trailing and repeated `/`.
fn split_path(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Binds a method to a path pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    method: Method,
    pattern: PathPattern,
}

impl Route {
    pub fn new(method: Method, pattern: &str) -> Result<Self, RouteError> {
        Ok(Self {
            method,
            pattern: PathPattern::parse(pattern)?,
        })
    }

    pub fn get(pattern: &str) -> Result<Self, RouteError> {
        Self::new(Method::Get, pattern)
    }

    pub fn post(pattern: &str) -> Result<Self, RouteError> {
        Self::new(Method::Post, pattern)
    }

    pub fn put(pattern: &str) -> Result<Self, RouteError> {
        Self::new(Method::Put, pattern)
    }

    pub fn delete(pattern: &str) -> Result<Self, RouteError> {
        Self::new(Method::Delete, pattern)
    }

    /// `PUT /action/:action`, served by every node for inbound actions.
    pub fn action() -> Self {
        Self {
            method: Method::Put,
            pattern: PathPattern {
                raw: crate::action::ACTION_ROUTE.to_string(),
                segments: vec![
                    Segment::Literal("action".to_string()),
                    Segment::Param("action".to_string()),
                ],
            },
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn pattern(&self) -> &PathPattern {
        &self.pattern
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.pattern.as_str())
    }
}

impl From<&Route> for Capability {
    fn from(route: &Route) -> Self {
        Capability::new(route.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("path pattern {0:?} must start with '/'")]
    MissingLeadingSlash(String),
    #[error("path pattern {0:?} has an unnamed parameter")]
    EmptyParameter(String),
    #[error("parameter :{0} appears twice")]
    DuplicateParameter(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_capture() {
        let p = PathPattern::parse("/contacts/:id").unwrap();
        assert_eq!(
            p.matches("/contacts/42"),
            Some(vec![("id".to_string(), "42".to_string())])
        );
        assert_eq!(p.matches("/contacts"), None);
        assert_eq!(p.matches("/contacts/42/photo"), None);
        assert_eq!(p.wildcard_count(), 1);
    }

    #[test]
    fn trailing_slash_ignored() {
        let p = PathPattern::parse("/contacts").unwrap();
        assert!(p.matches("/contacts/").is_some());
        assert!(PathPattern::parse("/").unwrap().matches("/").is_some());
    }

    #[test]
    fn param_values_percent_decoded() {
        let p = PathPattern::parse("/action/:action").unwrap();
        let params = p.matches("/action/say%20hello").unwrap();
        assert_eq!(params[0].1, "say hello");
    }

    #[test]
    fn bad_patterns() {
        assert!(matches!(
            PathPattern::parse("contacts"),
            Err(RouteError::MissingLeadingSlash(_))
        ));
        assert!(matches!(
            PathPattern::parse("/contacts/:"),
            Err(RouteError::EmptyParameter(_))
        ));
        assert!(matches!(
            PathPattern::parse("/a/:id/b/:id"),
            Err(RouteError::DuplicateParameter(_))
        ));
    }

    #[test]
    fn interpolate_fills_params() {
        let p = PathPattern::parse("/contacts/:identifier").unwrap();
        let path = p.interpolate(|name| (name == "identifier").then(|| "a b".to_string()));
        assert_eq!(path.as_deref(), Some("/contacts/a%20b"));
        assert_eq!(p.interpolate(|_| None), None);
    }

    #[test]
    fn action_route_matches_parsed_pattern() {
        assert_eq!(
            Route::action(),
            Route::put(crate::action::ACTION_ROUTE).unwrap()
        );
    }

    #[test]
    fn route_capability_name() {
        let r = Route::get("/contacts/:id").unwrap();
        assert_eq!(Capability::from(&r).name(), "GET /contacts/:id");
    }
}
