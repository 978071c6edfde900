//! OAuth 1.0a request signing (HMAC-SHA1)
//!
//! User-context endpoints (media upload, publishing) require every request to
//! carry an `Authorization: OAuth ...` header whose signature covers the
//! method, the base URL, the query parameters and any form-encoded body
//! parameters. Multipart and JSON bodies are not part of the signature.

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::distributions::Alphanumeric;
use rand::Rng;
use secrecy::{ExposeSecret, SecretString};
use sha1::Sha1;

use crate::error::{RemoteError, RemoteResult};

type HmacSha1 = Hmac<Sha1>;

/// Consumer and access-token credentials of the operator account
#[derive(Clone)]
pub struct OAuth1Credentials {
    pub consumer_key: String,
    pub consumer_secret: SecretString,
    pub access_token: String,
    pub access_secret: SecretString,
}

impl std::fmt::Debug for OAuth1Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OAuth1Credentials")
            .field("consumer_key", &self.consumer_key)
            .field("access_token", &self.access_token)
            .finish_non_exhaustive()
    }
}

/// RFC 3986 percent-encoding (unreserved characters are left alone)
fn encode(s: &str) -> String {
    urlencoding::encode(s).into_owned()
}

/// Build the signature base string
///
/// `params` holds query and form parameters together with the `oauth_*` ones.
pub fn signature_base(method: &str, base_url: &str, params: &[(String, String)]) -> String {
    let mut encoded: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| (encode(k), encode(v)))
        .collect();
    encoded.sort();

    let param_string = encoded
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    format!(
        "{}&{}&{}",
        method.to_uppercase(),
        encode(base_url),
        encode(&param_string)
    )
}

fn sign(credentials: &OAuth1Credentials, base: &str) -> RemoteResult<String> {
    let key = format!(
        "{}&{}",
        encode(credentials.consumer_secret.expose_secret()),
        encode(credentials.access_secret.expose_secret())
    );
    let mut mac = HmacSha1::new_from_slice(key.as_bytes())
        .map_err(|e| RemoteError::Fatal(format!("Failed to initialize request signer: {}", e)))?;
    mac.update(base.as_bytes());
    Ok(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
}

/// Authorization header for a request, with explicit nonce and timestamp
pub fn authorization_header_with(
    credentials: &OAuth1Credentials,
    method: &str,
    base_url: &str,
    request_params: &[(String, String)],
    nonce: &str,
    timestamp: i64,
) -> RemoteResult<String> {
    let mut oauth_params = vec![
        ("oauth_consumer_key".to_string(), credentials.consumer_key.clone()),
        ("oauth_nonce".to_string(), nonce.to_string()),
        ("oauth_signature_method".to_string(), "HMAC-SHA1".to_string()),
        ("oauth_timestamp".to_string(), timestamp.to_string()),
        ("oauth_token".to_string(), credentials.access_token.clone()),
        ("oauth_version".to_string(), "1.0".to_string()),
    ];

    let mut all_params = oauth_params.clone();
    all_params.extend_from_slice(request_params);
    let signature = sign(credentials, &signature_base(method, base_url, &all_params))?;
    oauth_params.push(("oauth_signature".to_string(), signature));
    oauth_params.sort();

    let header = oauth_params
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", encode(k), encode(v)))
        .collect::<Vec<_>>()
        .join(", ");

    Ok(format!("OAuth {}", header))
}

/// Authorization header for a request made now
pub fn authorization_header(
    credentials: &OAuth1Credentials,
    method: &str,
    base_url: &str,
    request_params: &[(String, String)],
) -> RemoteResult<String> {
    let nonce: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    let timestamp = chrono::Utc::now().timestamp();

    authorization_header_with(credentials, method, base_url, request_params, &nonce, timestamp)
}
