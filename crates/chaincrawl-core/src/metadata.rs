//! Token metadata resolution.
//!
//! A token URI is one of three schemes: an HTTP(S) document, an inline
//! `data:application/json;base64,` payload, or a content-addressed `ipfs://`
//! reference served through a public gateway. Anything else is kept as an
//! opaque URI and yields a partial metadata record.

use base64::Engine as _;
use log::{debug, warn};
use serde_json::Value;

use crate::{CrawlError, CrawlResult, TokenAttribute, TokenMetadata};

pub const IPFS_GATEWAY: &str = "https://ipfs.io/ipfs/";
const INLINE_JSON_PREFIX: &str = "data:application/json;base64,";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenUri {
    /// Fetchable over HTTP(S); content-addressed URIs are already rewritten to the gateway
    Http(String),
    /// Base64 payload of an inline JSON document
    Inline(String),
    Unknown(String),
}

impl TokenUri {
    pub fn parse(uri: &str) -> Self {
        let uri = uri.trim();
        if let Some(path) = uri.strip_prefix("ipfs://") {
            let path = path.strip_prefix("ipfs/").unwrap_or(path);
            TokenUri::Http(format!("{}{}", IPFS_GATEWAY, path))
        } else if uri.starts_with("http://") || uri.starts_with("https://") {
            TokenUri::Http(uri.to_string())
        } else if let Some(payload) = uri.strip_prefix(INLINE_JSON_PREFIX) {
            TokenUri::Inline(payload.to_string())
        } else {
            TokenUri::Unknown(uri.to_string())
        }
    }
}

/// Rewrite `ipfs://` image links to the gateway, leave everything else alone
pub fn gateway_url(uri: &str) -> String {
    match TokenUri::parse(uri) {
        TokenUri::Http(url) => url,
        _ => uri.to_string(),
    }
}

pub fn decode_inline_json(payload: &str) -> CrawlResult<Value> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| CrawlError::Decode(format!("invalid base64 metadata: {}", e)))?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Fetch the JSON document behind a token URI.
///
/// `Ok(None)` means the URI scheme is not resolvable or the remote document
/// could not be retrieved; the caller falls back to a partial record.
pub async fn fetch_document(client: &reqwest::Client, uri: &str) -> CrawlResult<Option<Value>> {
    match TokenUri::parse(uri) {
        TokenUri::Inline(payload) => decode_inline_json(&payload).map(Some),
        TokenUri::Http(url) => {
            debug!("Fetching token metadata from {}", url);
            let response = match client.get(&url).send().await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Metadata fetch from {} failed: {}", url, e);
                    return Ok(None);
                }
            };
            if !response.status().is_success() {
                warn!("Metadata fetch from {} returned {}", url, response.status());
                return Ok(None);
            }
            match response.json::<Value>().await {
                Ok(doc) => Ok(Some(doc)),
                Err(e) => {
                    warn!("Metadata at {} is not JSON: {}", url, e);
                    Ok(None)
                }
            }
        }
        TokenUri::Unknown(_) => Ok(None),
    }
}

/// `[{trait_type, value, display_type}]`
pub fn attributes_from_array(value: Option<&Value>) -> Vec<TokenAttribute> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let trait_type = item
                .get("trait_type")
                .or_else(|| item.get("name"))
                .and_then(Value::as_str)?;
            Some(TokenAttribute {
                trait_type: trait_type.to_string(),
                value: item.get("value").cloned().unwrap_or(Value::Null),
                display_type: item
                    .get("display_type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            })
        })
        .collect()
}

/// `{trait: value}` or `{trait: {value, display_type}}`
pub fn attributes_from_object(value: Option<&Value>) -> Vec<TokenAttribute> {
    let Some(Value::Object(map)) = value else {
        return Vec::new();
    };
    map.iter()
        .map(|(key, entry)| match entry {
            Value::Object(inner) if inner.contains_key("value") => TokenAttribute {
                trait_type: key.clone(),
                value: inner.get("value").cloned().unwrap_or(Value::Null),
                display_type: inner
                    .get("display_type")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            other => TokenAttribute {
                trait_type: key.clone(),
                value: other.clone(),
                display_type: None,
            },
        })
        .collect()
}

/// Record for a URI that could not be resolved
pub fn partial_metadata(
    chain_id: &str,
    contract_address: &str,
    token_id: &str,
    token_uri: &str,
    name: Option<String>,
    symbol: Option<String>,
) -> TokenMetadata {
    TokenMetadata {
        chain_id: chain_id.to_string(),
        contract_address: contract_address.to_string(),
        token_id: token_id.to_string(),
        token_uri: token_uri.to_string(),
        name,
        symbol,
        description: None,
        image: None,
        attributes: Vec::new(),
        resolved: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_uri_schemes() {
        assert_eq!(
            TokenUri::parse("ipfs://QmHash/7.json"),
            TokenUri::Http("https://ipfs.io/ipfs/QmHash/7.json".to_string())
        );
        assert_eq!(
            TokenUri::parse("ipfs://ipfs/QmHash"),
            TokenUri::Http("https://ipfs.io/ipfs/QmHash".to_string())
        );
        assert_eq!(
            TokenUri::parse("https://example.org/meta/1"),
            TokenUri::Http("https://example.org/meta/1".to_string())
        );
        assert_eq!(
            TokenUri::parse("data:application/json;base64,e30="),
            TokenUri::Inline("e30=".to_string())
        );
        assert_eq!(
            TokenUri::parse("ar://weird"),
            TokenUri::Unknown("ar://weird".to_string())
        );
    }

    #[tokio::test]
    async fn test_inline_document_is_decoded_without_network() {
        let doc = json!({"name": "Inline", "attributes": []});
        let encoded = base64::engine::general_purpose::STANDARD.encode(doc.to_string());
        let client = reqwest::Client::new();
        let fetched = fetch_document(&client, &format!("{}{}", INLINE_JSON_PREFIX, encoded))
            .await
            .unwrap();
        assert_eq!(fetched, Some(doc));
    }

    #[tokio::test]
    async fn test_unknown_scheme_yields_nothing() {
        let client = reqwest::Client::new();
        assert_eq!(fetch_document(&client, "ar://tx").await.unwrap(), None);
    }

    #[test]
    fn test_bad_inline_payload_is_a_decode_error() {
        assert!(matches!(
            decode_inline_json("***"),
            Err(CrawlError::Decode(_))
        ));
    }

    #[test]
    fn test_attribute_shapes() {
        let array = json!([
            {"trait_type": "Eyes", "value": "Blue"},
            {"trait_type": "Level", "value": 5, "display_type": "number"},
            {"value": "orphan"}
        ]);
        let attrs = attributes_from_array(Some(&array));
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[1].display_type.as_deref(), Some("number"));

        let object = json!({"Background": "Red", "Power": {"value": 9, "display_type": "boost_number"}});
        let attrs = attributes_from_object(Some(&object));
        assert_eq!(attrs.len(), 2);
        let power = attrs.iter().find(|a| a.trait_type == "Power").unwrap();
        assert_eq!(power.value, json!(9));
        assert_eq!(power.display_type.as_deref(), Some("boost_number"));
    }
}
