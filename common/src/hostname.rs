//! Hostname validation and wildcard intersection
//!
//! Gateway API hostnames are either exact DNS names (`app.example.com`) or carry a
//! single leading wildcard label (`*.example.com`). A wildcard matches one or more
//! subdomain labels, so `*.example.com` covers both `a.example.com` and
//! `a.b.example.com`, but never the apex `example.com`.

/// Maximum hostname length (RFC 1123)
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Validate hostname according to DNS-1123 subdomain rules
///
/// Rules:
/// - Lowercase alphanumeric characters, hyphens, and dots only
/// - Must not start or end with hyphen
/// - Must not have empty labels
/// - Can start with wildcard "*."
/// - Max length 253 characters
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("Hostname cannot be empty".to_string());
    }

    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(format!(
            "Hostname '{}' exceeds {} characters",
            hostname, MAX_HOSTNAME_LEN
        ));
    }

    let hostname_to_check = hostname.strip_prefix("*.").unwrap_or(hostname);

    if hostname_to_check.is_empty() {
        return Err("Hostname cannot be just '*.'".to_string());
    }

    for label in hostname_to_check.split('.') {
        if label.is_empty() {
            return Err(format!("Hostname '{}' contains an empty label", hostname));
        }

        if label.starts_with('-') {
            return Err(format!("Hostname label '{}' cannot start with '-'", label));
        }
        if label.ends_with('-') {
            return Err(format!("Hostname label '{}' cannot end with '-'", label));
        }

        if let Some(c) = label
            .chars()
            .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-')
        {
            return Err(format!(
                "Hostname '{}' contains invalid character '{}' (must be lowercase alphanumeric or hyphen)",
                hostname, c
            ));
        }
    }

    Ok(())
}

/// Whether `hostname` carries a leading wildcard label
#[inline]
pub fn is_wildcard(hostname: &str) -> bool {
    hostname.starts_with("*.")
}

/// Match a wildcard `pattern` against an exact `host`
///
/// The wildcard label stands for one or more labels. Non-wildcard patterns never
/// match here; use equality for those.
pub fn wildcard_matches(pattern: &str, host: &str) -> bool {
    let Some(suffix) = pattern.strip_prefix("*.") else {
        return false;
    };

    let host = host.strip_prefix("*.").unwrap_or(host);
    if host.len() <= suffix.len() + 1 {
        return false;
    }

    let boundary = host.len() - suffix.len() - 1;
    host.ends_with(suffix) && host.as_bytes()[boundary] == b'.'
}

/// Intersect a route hostname with a listener hostname
///
/// Returns the more specific of the two when they overlap:
/// - equal hostnames intersect to themselves
/// - `*.example.com` and `app.example.com` intersect to `app.example.com`
/// - `*.example.com` and `*.a.example.com` intersect to `*.a.example.com`
pub fn intersection(route_hostname: &str, listener_hostname: &str) -> Option<String> {
    let route = route_hostname.to_ascii_lowercase();
    let listener = listener_hostname.to_ascii_lowercase();

    if route == listener {
        return Some(route);
    }

    match (is_wildcard(&route), is_wildcard(&listener)) {
        (true, false) if wildcard_matches(&route, &listener) => Some(listener),
        (false, true) if wildcard_matches(&listener, &route) => Some(route),
        (true, true) => {
            if wildcard_matches(&listener, &route) {
                Some(route)
            } else if wildcard_matches(&route, &listener) {
                Some(listener)
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Whether a route hostname overlaps a listener hostname
#[inline]
pub fn intersects(route_hostname: &str, listener_hostname: &str) -> bool {
    intersection(route_hostname, listener_hostname).is_some()
}

/// Whether any of `route_hostnames` is admissible on a listener
///
/// A listener without a hostname accepts everything, and a route without hostnames
/// matches any listener hostname.
pub fn route_matches_listener(route_hostnames: &[String], listener_hostname: Option<&str>) -> bool {
    match listener_hostname {
        None => true,
        Some(_) if route_hostnames.is_empty() => true,
        Some(listener) => route_hostnames.iter().any(|h| intersects(h, listener)),
    }
}

/// Compute the hostnames a route is served on, given the listeners it bound to
///
/// `None` in the output means "any host". Order follows the route hostnames, then
/// listener order; duplicates are removed.
pub fn effective_hostnames(
    route_hostnames: &[String],
    listener_hostnames: &[Option<String>],
) -> Vec<Option<String>> {
    let mut out: Vec<Option<String>> = Vec::new();
    let mut push = |candidate: Option<String>| {
        if !out.contains(&candidate) {
            out.push(candidate);
        }
    };

    if route_hostnames.is_empty() {
        for listener in listener_hostnames {
            push(listener.as_ref().map(|h| h.to_ascii_lowercase()));
        }
        return out;
    }

    for route in route_hostnames {
        for listener in listener_hostnames {
            match listener {
                None => push(Some(route.to_ascii_lowercase())),
                Some(listener) => {
                    if let Some(hostname) = intersection(route, listener) {
                        push(Some(hostname));
                    }
                }
            }
        }
    }

    out
}
