use axum::http::HeaderMap;
use sha2::{Digest, Sha256};

const UNKNOWN: &str = "unknown";
const KEY_LEN: usize = 32;

// Create a client key (hash of ip + user agent), never stores the raw values
pub fn derive_client_key(headers: &HeaderMap) -> String {
    let ip = client_ip(headers);
    let user_agent = header_str(headers, "user-agent").unwrap_or(UNKNOWN);

    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hasher.update(b"|");
    hasher.update(user_agent.as_bytes());
    let mut key = format!("{:x}", hasher.finalize());
    key.truncate(KEY_LEN);
    key
}

// First hop of x-forwarded-for, else x-real-ip, else the sentinel
fn client_ip(headers: &HeaderMap) -> &str {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| header_str(headers, "x-real-ip").map(str::trim).filter(|ip| !ip.is_empty()))
        .unwrap_or(UNKNOWN)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
