use mockgate_core::security::ApiKey;
use mockgate_core::Headers;

/// Headers that describe the inbound hop and must not be forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

/// Filter the caller's headers for forwarding. A configured key replaces any
/// caller-supplied `Authorization`; `Content-Type` defaults to JSON.
pub fn prepare_headers(
    original: &Headers,
    api_key: Option<&ApiKey>,
) -> Vec<(String, String)> {
    let mut out: Vec<(String, String)> = original
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()))
        .filter(|(name, _)| api_key.is_none() || !name.eq_ignore_ascii_case("authorization"))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();

    if let Some(key) = api_key {
        out.push(("Authorization".into(), key.bearer()));
    }
    if !out.iter().any(|(name, _)| name.eq_ignore_ascii_case("content-type")) {
        out.push(("Content-Type".into(), "application/json".into()));
    }
    out
}
