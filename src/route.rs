//! Route matching and reverse templating.
//!
//! Grounded in `examples/original_source/server-cpp/src/server.cc`'s
//! `RegexRoute::can_handle`/`path_for`: routes are tried in declaration
//! order, first match wins, and there is no collision detection.

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;

use crate::error::{ServerError, ServerResult};

pub type UrlParams = HashMap<String, String>;

pub trait Route: Send + Sync {
    fn name(&self) -> &str;
    /// `Some(params)` if this route matches the full path, with captured
    /// named groups filled in. Errors only on a misconfigured route (a
    /// declared capture group index with no matching group), which is
    /// distinct from a genuine non-match.
    fn can_handle(&self, path: &str) -> ServerResult<Option<UrlParams>>;
    /// Reverse-templates the route's pattern using `params`. Fails if a
    /// `{name}` placeholder has no corresponding entry.
    fn path_for(&self, params: &UrlParams) -> ServerResult<String>;
}

/// An exact-string route; `path_for` ignores `params` since there's
/// nothing to substitute.
pub struct StringRoute {
    name: String,
    path: String,
}

impl StringRoute {
    pub fn new(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }
}

impl Route for StringRoute {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, path: &str) -> ServerResult<Option<UrlParams>> {
        Ok((path == self.path).then(HashMap::new))
    }

    fn path_for(&self, _params: &UrlParams) -> ServerResult<String> {
        Ok(self.path.clone())
    }
}

/// A regex-matched route with named capture groups and a reverse
/// template (e.g. `/api/proc/{procID}{remainder}`) used to rebuild a
/// concrete path from a parameter map.
pub struct RegexRoute {
    name: String,
    source_pattern: String,
    regex: Regex,
    /// capture group index -> parameter name
    group_names: Vec<(usize, String)>,
    reverse_template: String,
}

impl RegexRoute {
    pub fn new(
        name: impl Into<String>,
        pattern: &str,
        group_names: Vec<(usize, &str)>,
        reverse_template: impl Into<String>,
    ) -> ServerResult<Self> {
        let regex = Regex::new(pattern)
            .map_err(|e| ServerError::Internal(format!("bad route pattern {pattern:?}: {e}")))?;
        Ok(Self {
            name: name.into(),
            source_pattern: pattern.to_string(),
            regex,
            group_names: group_names
                .into_iter()
                .map(|(i, n)| (i, n.to_string()))
                .collect(),
            reverse_template: reverse_template.into(),
        })
    }

    pub fn source_pattern(&self) -> &str {
        &self.source_pattern
    }

    pub fn reverse_template(&self) -> &str {
        &self.reverse_template
    }

    pub fn group_names(&self) -> &[(usize, String)] {
        &self.group_names
    }
}

impl Route for RegexRoute {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_handle(&self, path: &str) -> ServerResult<Option<UrlParams>> {
        let Some(caps) = self.regex.captures(path) else {
            return Ok(None);
        };
        let mut params = HashMap::new();
        for (index, name) in &self.group_names {
            let Some(value) = caps.get(*index) else {
                return Err(ServerError::Internal(format!(
                    "route {:?} pattern yielded {} groups, expected {}-th",
                    self.name,
                    caps.len(),
                    index
                )));
            };
            params.insert(name.clone(), value.as_str().to_string());
        }
        Ok(Some(params))
    }

    fn path_for(&self, params: &UrlParams) -> ServerResult<String> {
        let mut out = self.reverse_template.clone();
        // Substituted values never contain braces, so this terminates.
        loop {
            let Some(start) = out.find('{') else { break };
            let Some(end) = out[start..].find('}').map(|e| start + e) else {
                return Err(ServerError::Internal(format!(
                    "unterminated placeholder in reverse template {:?}",
                    self.reverse_template
                )));
            };
            let key = &out[start + 1..end];
            let value = params.get(key).ok_or_else(|| {
                ServerError::Internal(format!("no value for route parameter {key:?}"))
            })?;
            out.replace_range(start..=end, value);
        }
        Ok(out)
    }
}

// Lets `Arc<dyn Route>` (or `Arc<RegexRoute>`) satisfy `Box<dyn Route>`
// call sites, so a single route can be shared between the server's
// route table and a resource that needs to reverse-template it itself
// (the process resource, computing `_link` via the forwarding route).
impl<T: Route + ?Sized> Route for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn can_handle(&self, path: &str) -> ServerResult<Option<UrlParams>> {
        (**self).can_handle(path)
    }

    fn path_for(&self, params: &UrlParams) -> ServerResult<String> {
        (**self).path_for(params)
    }
}

pub type Routes = Vec<Box<dyn Route>>;

/// Describes a registered route for the `/api/routes` debug listing —
/// built alongside the routes themselves since `Route` trait objects
/// don't expose their concrete pattern/template to a generic listener.
#[derive(Debug, Clone)]
pub struct RouteInfo {
    pub name: String,
    pub kind: &'static str,
    pub pattern: Option<String>,
    pub reverse_template: Option<String>,
    pub groups: Vec<(usize, String)>,
}

impl RouteInfo {
    pub fn exact(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: "exact",
            pattern: Some(path.to_string()),
            reverse_template: Some(path.to_string()),
            groups: Vec::new(),
        }
    }

    pub fn regex(name: &str, route: &RegexRoute) -> Self {
        Self {
            name: name.to_string(),
            kind: "regex-based",
            pattern: Some(route.source_pattern().to_string()),
            reverse_template: Some(route.reverse_template().to_string()),
            groups: route.group_names().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proc_route() -> RegexRoute {
        RegexRoute::new(
            "proc",
            r"^/api/proc(?:/([A-Za-z0-9_\-]+))?$",
            vec![(1, "procID")],
            "/api/proc/{procID}",
        )
        .unwrap()
    }

    #[test]
    fn string_route_matches_exactly() {
        let r = StringRoute::new("routes", "/api/routes");
        assert!(r.can_handle("/api/routes").unwrap().is_some());
        assert!(r.can_handle("/api/routes/").unwrap().is_none());
    }

    #[test]
    fn regex_route_extracts_named_capture() {
        let r = proc_route();
        let params = r.can_handle("/api/proc/worker-1").unwrap().unwrap();
        assert_eq!(params.get("procID").map(String::as_str), Some("worker-1"));
    }

    #[test]
    fn regex_route_is_inverse_of_path_for() {
        let r = proc_route();
        let path = "/api/proc/worker-1";
        let params = r.can_handle(path).unwrap().unwrap();
        assert_eq!(r.path_for(&params).unwrap(), path);
    }

    #[test]
    fn path_for_fails_on_missing_param() {
        let r = proc_route();
        let params = UrlParams::new();
        assert!(r.path_for(&params).is_err());
    }

    #[test]
    fn forwarding_route_captures_remainder() {
        let r = RegexRoute::new(
            "proc-fwd",
            r"^/api/proc/([A-Za-z0-9_\-]+)(/.+)$",
            vec![(1, "procID"), (2, "remainder")],
            "/api/proc/{procID}{remainder}",
        )
        .unwrap();
        let params = r.can_handle("/api/proc/worker-1/status").unwrap().unwrap();
        assert_eq!(params.get("procID").map(String::as_str), Some("worker-1"));
        assert_eq!(params.get("remainder").map(String::as_str), Some("/status"));
    }

    #[test]
    fn can_handle_raises_hard_error_on_misconfigured_group_index() {
        // Declares a third capture group that the pattern never produces.
        let r = RegexRoute::new(
            "broken",
            r"^/api/proc/([A-Za-z0-9_\-]+)$",
            vec![(1, "procID"), (2, "bogus")],
            "/api/proc/{procID}",
        )
        .unwrap();
        assert!(r.can_handle("/api/proc/worker-1").is_err());
    }
}
