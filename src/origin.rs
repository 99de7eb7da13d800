use url::Url;

use crate::config::EmptyOriginList;

/// Decides whether a socket's `Origin` header may connect to an app.
///
/// An absent or blank origin never passes, whatever the allow-list says.
/// Entries are either `*`, an exact origin (`https://example.com`), or a
/// subdomain wildcard with or without scheme (`*.example.com`,
/// `https://*.example.com`).
pub fn origin_allowed(origin: Option<&str>, allowed: &[String], empty_list: EmptyOriginList) -> bool {
    let Some(origin) = origin.map(str::trim).filter(|value| !value.is_empty()) else {
        return false;
    };
    if allowed.iter().all(|entry| entry.trim().is_empty()) {
        return matches!(empty_list, EmptyOriginList::AllowAny);
    }
    let candidate = ParsedOrigin::parse(origin);
    allowed
        .iter()
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .any(|entry| entry_matches(entry, origin, candidate.as_ref()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ParsedOrigin {
    scheme: String,
    host: String,
    serialized: String,
}

impl ParsedOrigin {
    fn parse(raw: &str) -> Option<Self> {
        let url = Url::parse(raw).ok()?;
        let host = url.host_str()?.to_ascii_lowercase();
        Some(Self {
            scheme: url.scheme().to_ascii_lowercase(),
            host,
            serialized: url.origin().ascii_serialization(),
        })
    }
}

fn entry_matches(entry: &str, raw_origin: &str, candidate: Option<&ParsedOrigin>) -> bool {
    if entry == "*" {
        return true;
    }
    if let Some((scheme, suffix)) = split_wildcard(entry) {
        let Some(candidate) = candidate else {
            return false;
        };
        if scheme.is_some_and(|scheme| !scheme.eq_ignore_ascii_case(&candidate.scheme)) {
            return false;
        }
        let suffix = suffix.to_ascii_lowercase();
        return candidate.host.len() > suffix.len() + 1
            && candidate.host.ends_with(&suffix)
            && candidate.host[..candidate.host.len() - suffix.len()].ends_with('.');
    }
    match (ParsedOrigin::parse(entry), candidate) {
        (Some(expected), Some(candidate)) => expected.serialized == candidate.serialized,
        _ => normalize_raw(entry) == normalize_raw(raw_origin),
    }
}

/// Splits `https://*.example.com` into (`Some("https")`, `example.com`) and
/// `*.example.com` into (`None`, `example.com`).
fn split_wildcard(entry: &str) -> Option<(Option<&str>, &str)> {
    let (scheme, rest) = match entry.split_once("://") {
        Some((scheme, rest)) => (Some(scheme), rest),
        None => (None, entry),
    };
    let suffix = rest.strip_prefix("*.")?.trim_end_matches('/');
    if suffix.is_empty() {
        return None;
    }
    Some((scheme, suffix))
}

fn normalize_raw(value: &str) -> String {
    value.trim().trim_end_matches('/').to_ascii_lowercase()
}
