//! Cache key resolution
//!
//! A resolver turns `(endpoint name, arguments)` into a [`CacheKey`]. The
//! default resolver renders the arguments as RFC 8785 canonical JSON, so
//! object key order never changes the key.

use serde_json::Value;

use crate::cache::types::CacheKey;
use crate::error::{QueryCacheError, Result};

/// Strategy for computing cache keys
///
/// Implementations must be deterministic. Collision-freedom is the
/// implementor's responsibility and is not checked.
pub trait KeyResolver: Send + Sync {
    fn resolve(&self, endpoint: &str, args: &Value) -> Result<CacheKey>;
}

/// Default resolver: `endpoint(canonical-json-args)`
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyResolver;

impl KeyResolver for DefaultKeyResolver {
    fn resolve(&self, endpoint: &str, args: &Value) -> Result<CacheKey> {
        let key_error = |reason: String| QueryCacheError::KeyResolution {
            endpoint: endpoint.to_string(),
            reason,
        };
        let bytes = serde_json_canonicalizer::to_vec(args).map_err(|e| key_error(e.to_string()))?;
        let canonical = String::from_utf8(bytes).map_err(|e| key_error(e.to_string()))?;
        Ok(CacheKey::new(format!("{}({})", endpoint, canonical)))
    }
}

impl<F> KeyResolver for F
where
    F: Fn(&str, &Value) -> std::result::Result<String, String> + Send + Sync,
{
    fn resolve(&self, endpoint: &str, args: &Value) -> Result<CacheKey> {
        self(endpoint, args)
            .map(CacheKey::new)
            .map_err(|reason| QueryCacheError::KeyResolution {
                endpoint: endpoint.to_string(),
                reason,
            })
    }
}
