//! Connection tokens
//!
//! A token is a self-contained string an operator can paste into another
//! instance to link it with this one: `adbconn_` followed by base64 of the
//! JSON object `{url, name, key}`.

use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Error, Result};

/// Prefix identifying connection tokens
pub const TOKEN_PREFIX: &str = "adbconn_";

/// Contents of a connection token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionToken {
    /// Base URL of the issuing instance
    pub url: String,
    /// Display name of the issuing instance
    pub name: String,
    /// API key issued for the recipient
    pub key: String,
}

impl ConnectionToken {
    /// Encode as a shareable string
    pub fn encode(&self) -> String {
        // serde_json cannot fail on a struct of strings
        let json = serde_json::to_vec(self).unwrap_or_default();
        format!("{TOKEN_PREFIX}{}", STANDARD.encode(json))
    }

    /// Decode a token. The prefix is optional.
    pub fn decode(token: &str) -> Result<Self> {
        let token = token.trim();
        let body = token.strip_prefix(TOKEN_PREFIX).unwrap_or(token);
        if body.is_empty() {
            return Err(Error::validation("connection string is empty"));
        }

        let json = STANDARD
            .decode(body)
            .or_else(|_| URL_SAFE.decode(body))
            .or_else(|_| URL_SAFE_NO_PAD.decode(body))
            .map_err(|e| Error::validation(format!("connection string is not valid base64: {e}")))?;

        let token: Self = serde_json::from_slice(&json)
            .map_err(|e| Error::validation(format!("connection string has invalid contents: {e}")))?;

        if token.key.trim().is_empty() {
            return Err(Error::validation("connection string has no key"));
        }
        normalize_url(&token.url)?;
        Ok(token)
    }
}

/// Check that `raw` is an absolute http(s) URL with a host, and return it
/// without a trailing slash.
pub fn normalize_url(raw: &str) -> Result<String> {
    let raw = raw.trim();
    let url = Url::parse(raw).map_err(|e| Error::validation(format!("invalid URL {raw:?}: {e}")))?;

    if !matches!(url.scheme(), "http" | "https") {
        return Err(Error::validation(format!(
            "URL {raw:?} must use http or https"
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(Error::validation(format!("URL {raw:?} has no host")));
    }

    Ok(url.as_str().trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_bare_base64() {
        let json = r#"{"url":"http://5.6.7.8:3000","name":"RemoteNode","key":"adb_key123"}"#;
        let token = ConnectionToken::decode(&STANDARD.encode(json)).unwrap();
        assert_eq!(token.url, "http://5.6.7.8:3000");
        assert_eq!(token.name, "RemoteNode");
        assert_eq!(token.key, "adb_key123");
    }

    #[test]
    fn test_encode_decode_with_prefix() {
        let token = ConnectionToken {
            url: "https://media.example.net".into(),
            name: "Cabin".into(),
            key: "adb_abc".into(),
        };
        let encoded = token.encode();
        assert!(encoded.starts_with(TOKEN_PREFIX));
        assert_eq!(ConnectionToken::decode(&encoded).unwrap(), token);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(ConnectionToken::decode(""), Err(Error::Validation(_))));
        assert!(matches!(ConnectionToken::decode("adbconn_!!!"), Err(Error::Validation(_))));

        let not_json = STANDARD.encode("hello");
        assert!(matches!(ConnectionToken::decode(&not_json), Err(Error::Validation(_))));

        let bad_url = STANDARD.encode(r#"{"url":"5.6.7.8","name":"n","key":"k"}"#);
        assert!(matches!(ConnectionToken::decode(&bad_url), Err(Error::Validation(_))));

        let no_key = STANDARD.encode(r#"{"url":"http://a:1","name":"n","key":""}"#);
        assert!(matches!(ConnectionToken::decode(&no_key), Err(Error::Validation(_))));
    }

    #[test]
    fn test_normalize_url() {
        assert_eq!(normalize_url("http://5.6.7.8:3000/").unwrap(), "http://5.6.7.8:3000");
        assert_eq!(normalize_url(" https://host ").unwrap(), "https://host");
        assert!(normalize_url("ftp://host").is_err());
        assert!(normalize_url("not a url").is_err());
        assert!(normalize_url("http://").is_err());
    }
}
