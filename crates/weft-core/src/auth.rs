// Per-job credential forwarding. The API extracts these from the submit
// request; the worker hands them to the fetcher and every runner sub-request.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Credentials attached to a single job run. Persisted encrypted on the job
/// record so the worker can forward them on sub-requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthContext {
    /// Bearer token forwarded as `Authorization: Bearer …`.
    pub bearer: Option<String>,
    /// Cookies forwarded verbatim on sub-requests.
    pub cookies: HashMap<String, String>,
    /// Token used by the CWL engine to pull the container image
    /// (X-Auth-Docker at deploy or submit time).
    pub docker_token: Option<String>,
}

impl AuthContext {
    pub fn is_empty(&self) -> bool {
        self.bearer.is_none() && self.cookies.is_empty() && self.docker_token.is_none()
    }

    /// `Cookie` header value, if any cookies are present.
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        let mut pairs: Vec<_> = self.cookies.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        Some(
            pairs
                .into_iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Apply bearer and cookie headers to an outgoing request.
    pub fn apply(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(token) = &self.bearer {
            req = req.bearer_auth(token);
        }
        if let Some(cookies) = self.cookie_header() {
            req = req.header(reqwest::header::COOKIE, cookies);
        }
        req
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_header_is_sorted_and_joined() {
        let mut ctx = AuthContext::default();
        ctx.cookies.insert("b".into(), "2".into());
        ctx.cookies.insert("a".into(), "1".into());
        assert_eq!(ctx.cookie_header().unwrap(), "a=1; b=2");
    }

    #[test]
    fn empty_context() {
        assert!(AuthContext::default().is_empty());
        assert!(AuthContext::default().cookie_header().is_none());
    }
}
