//! Target resolution for requests that arrive outside a CONNECT tunnel

use regex::Regex;
use std::sync::LazyLock;

static PROXY_EP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"proxy-ep=([^;]+)").expect("valid regex"));

/// Known Copilot endpoints, keyed by the path prefix clients use
pub const COPILOT_ROUTES: &[(&str, &str)] = &[
    ("github/login", "https://github.com/login"),
    ("api/github/user", "https://api.github.com"),
    ("api/github/copilot", "https://api.github.com/copilot_internal"),
    ("copilot/telemetry", "https://copilot-telemetry.githubusercontent.com"),
    ("vscode/ab", "https://default.exp-tas.com"),
    ("copilot/proxy", "https://copilot-proxy.githubusercontent.com"),
    ("origin-tracker", "https://origin-tracker.githubusercontent.com"),
    ("copilot/suggestions", "https://githubcopilot.com"),
    ("copilot_internal/user", "https://api.github.com/copilot_internal/user"),
    ("copilot_internal/v2/token", "https://api.github.com/copilot_internal/v2/token"),
    ("telemetry", "https://copilot-telemetry.githubusercontent.com"),
    ("login/oauth/access_token", "https://github.com/login/oauth/access_token"),
    ("api/copilot_internal", "https://api.github.com/copilot_internal"),
    (
        "v1/completions",
        "https://copilot-proxy.githubusercontent.com/v1/engines/copilot-codex/completions",
    ),
    ("chat/completions", "https://api.githubcopilot.com/chat/completions"),
    ("models", "https://api.githubcopilot.com/models"),
];

/// Upstream base taken from a Copilot token's `proxy-ep=` field
///
/// A value without a scheme is assumed to be HTTPS.
pub fn proxy_endpoint(authorization: &str) -> Option<String> {
    let value = PROXY_EP.captures(authorization)?.get(1)?.as_str().trim();
    if value.is_empty() {
        return None;
    }
    if value.contains("://") {
        Some(value.trim_end_matches('/').to_string())
    } else {
        Some(format!("https://{}", value.trim_end_matches('/')))
    }
}

/// Map a request path onto a known upstream URL
///
/// Exact matches win; otherwise the longest route that is a whole-segment
/// prefix of `path` is used and the remainder appended.
pub fn resolve_target(path: &str) -> Option<String> {
    let (bare, query) = match path.split_once('?') {
        Some((bare, query)) => (bare, Some(query)),
        None => (path, None),
    };
    let bare = bare.trim_matches('/');

    let target = if let Some((_, target)) = COPILOT_ROUTES.iter().find(|(route, _)| *route == bare) {
        target.to_string()
    } else {
        let (route, target) = COPILOT_ROUTES
            .iter()
            .filter(|(route, _)| {
                bare.strip_prefix(route)
                    .is_some_and(|rest| rest.starts_with('/'))
            })
            .max_by_key(|(route, _)| route.len())?;
        format!("{}/{}", target, &bare[route.len() + 1..])
    };

    Some(match query {
        Some(query) => format!("{}?{}", target, query),
        None => target,
    })
}

/// Where a plain (non-tunneled) request should go
pub fn target_url(authorization: Option<&str>, path: &str) -> Option<String> {
    match authorization.and_then(proxy_endpoint) {
        Some(base) => Some(format!("{}/{}", base, path.trim_start_matches('/'))),
        None => resolve_target(path),
    }
}

/// Split a CONNECT target into host and port
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host.to_string(), port))
}
