//! Request context backed by an HTTP header map.

use axum::http::{HeaderMap, HeaderName, HeaderValue};

use crate::ratelimit::{HeaderError, RequestContext};

/// Collects quota headers for a response that does not exist yet.
#[derive(Debug, Default)]
pub struct HttpContext {
    address: Option<String>,
    headers: HeaderMap,
}

impl HttpContext {
    pub fn new(address: Option<String>) -> Self {
        Self {
            address,
            headers: HeaderMap::new(),
        }
    }

    /// The headers gathered so far.
    pub fn into_headers(self) -> HeaderMap {
        self.headers
    }
}

impl RequestContext for HttpContext {
    fn caller_address(&self) -> Option<String> {
        self.address.clone()
    }

    fn set_header(&mut self, name: &'static str, value: &str) -> Result<(), HeaderError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| HeaderError::Invalid(e.to_string()))?;
        let value = HeaderValue::from_str(value).map_err(|e| HeaderError::Invalid(e.to_string()))?;
        self.headers.insert(name, value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headers_are_collected() {
        let mut ctx = HttpContext::new(Some("10.0.0.1".to_string()));
        ctx.set_header("X-RateLimit-Limit", "5").unwrap();

        assert_eq!(ctx.caller_address().as_deref(), Some("10.0.0.1"));
        let headers = ctx.into_headers();
        assert_eq!(headers.get("x-ratelimit-limit").unwrap(), "5");
    }

    #[test]
    fn test_invalid_value_is_refused() {
        let mut ctx = HttpContext::default();
        let err = ctx.set_header("X-RateLimit-Limit", "bad\nvalue").unwrap_err();
        assert!(matches!(err, HeaderError::Invalid(_)));
        assert!(ctx.into_headers().is_empty());
    }
}
