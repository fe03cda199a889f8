//! Address and stream-URL normalization.
//!
//! Devices reach the gateway over dual-stack sockets, so the same camera can
//! show up as `192.168.1.15`, `::ffff:192.168.1.15`, or inside a URL such as
//! `http://::ffff:192.168.1.15:81/stream`. Every registry key and every stored
//! or proxied URL goes through the routines here so that all of those collapse
//! to one canonical IPv4 form.

use std::net::{IpAddr, Ipv6Addr};

use reqwest::Url;

/// Prefix for registry keys derived from a source address.
pub const IP_KEY_PREFIX: &str = "ip:";

/// Port the camera firmware serves its MJPEG stream on.
pub const GUESS_STREAM_PORT: u16 = 81;

/// Path of the camera firmware's MJPEG stream.
pub const GUESS_STREAM_PATH: &str = "/stream";

/// Canonical textual form of a device address.
///
/// Strips legacy `ip:` markers, unwraps IPv6-mapped IPv4 literals and
/// re-serializes parseable addresses so that equivalent spellings compare equal.
/// Hostnames are returned trimmed but otherwise untouched.
pub fn normalize_ip(raw: &str) -> String {
    let mut s = raw.trim();
    while let Some(rest) = strip_prefix_ignore_case(s, IP_KEY_PREFIX) {
        s = rest;
    }
    let s = s
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(s);

    match s.parse::<IpAddr>() {
        Ok(IpAddr::V6(v6)) => match v6.to_ipv4_mapped() {
            Some(v4) => v4.to_string(),
            None => v6.to_string(),
        },
        Ok(v4) => v4.to_string(),
        // Legacy keys such as `ip::ffff:10.0.0.2` lose a colon to the marker.
        Err(_) => mapped_suffix(s)
            .map(|v4| v4.to_string())
            .unwrap_or_else(|| s.to_string()),
    }
}

/// Registry key for a source address.
pub fn ip_key(raw_ip: &str) -> String {
    format!("{}{}", IP_KEY_PREFIX, normalize_ip(raw_ip))
}

/// Canonical form of any registry key: address keys are normalized, device
/// identifiers are only trimmed.
pub fn canonical_key(key: &str) -> String {
    let key = key.trim();
    match strip_prefix_ignore_case(key, IP_KEY_PREFIX) {
        Some(rest) => ip_key(rest),
        None => key.to_string(),
    }
}

/// Rewrite a stream URL so its host is never an IPv6-mapped IPv4 literal and
/// any IPv6 literal is bracketed.
///
/// Scheme, port, path and query are preserved. A URL that needs no change is
/// returned exactly as given (trimmed).
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return String::new();
    }

    let (mut parsed, rebracketed) = match Url::parse(trimmed) {
        Ok(url) => (url, false),
        Err(_) => match bracket_authority(trimmed).and_then(|b| Url::parse(&b).ok()) {
            Some(url) => (url, true),
            None => return replace_mapped_literal(trimmed),
        },
    };

    if unmap_host(&mut parsed) || rebracketed {
        parsed.to_string()
    } else {
        trimmed.to_string()
    }
}

/// True for absolute `http://` or `https://` URLs that parse, once
/// normalized, with a non-empty host.
pub fn is_http_url(candidate: &str) -> bool {
    match Url::parse(&normalize_url(candidate)) {
        Ok(url) => {
            matches!(url.scheme(), "http" | "https")
                && url.host_str().is_some_and(|host| !host.is_empty())
        }
        Err(_) => false,
    }
}

/// Stream URL the camera firmware serves by convention on the given address.
pub fn guess_stream_url(raw_ip: &str) -> String {
    let host = normalize_ip(raw_ip);
    if host.contains(':') {
        format!("http://[{}]:{}{}", host, GUESS_STREAM_PORT, GUESS_STREAM_PATH)
    } else {
        format!("http://{}:{}{}", host, GUESS_STREAM_PORT, GUESS_STREAM_PATH)
    }
}

/// Drop the named parameters from a raw query string, keeping the remaining
/// pairs byte-for-byte in their original order.
///
/// Returns an empty string or a string starting with `?`.
pub fn strip_query_params(query: Option<&str>, names: &[&str]) -> String {
    let kept: Vec<&str> = query
        .unwrap_or_default()
        .trim_start_matches('?')
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or_default();
            !names.contains(&key)
        })
        .collect();

    if kept.is_empty() {
        String::new()
    } else {
        format!("?{}", kept.join("&"))
    }
}

/// Append a `?`-prefixed query string to a URL that may already carry one.
pub fn append_query(url: &str, query: &str) -> String {
    match query.strip_prefix('?') {
        Some(rest) if !rest.is_empty() => {
            let sep = if url.contains('?') { '&' } else { '?' };
            format!("{}{}{}", url, sep, rest)
        }
        _ => url.to_string(),
    }
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

fn mapped_suffix(s: &str) -> Option<std::net::Ipv4Addr> {
    let lower = s.to_ascii_lowercase();
    let idx = lower.rfind("ffff:")?;
    s[idx + "ffff:".len()..].parse().ok()
}

fn unmap_host(url: &mut Url) -> bool {
    let mapped = url
        .host_str()
        .and_then(|h| h.strip_prefix('[')?.strip_suffix(']'))
        .and_then(|h| h.parse::<Ipv6Addr>().ok())
        .and_then(|v6| v6.to_ipv4_mapped());

    match mapped {
        Some(v4) => url.set_ip_host(IpAddr::V4(v4)).is_ok(),
        None => false,
    }
}

/// Bracket an unbracketed IPv6 literal in the authority of `scheme://host[:port]/...`.
fn bracket_authority(raw: &str) -> Option<String> {
    let (scheme, rest) = raw.split_once("://")?;
    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(end);
    let (userinfo, hostport) = match authority.rsplit_once('@') {
        Some((user, hostport)) => (Some(user), hostport),
        None => (None, authority),
    };
    if hostport.starts_with('[') {
        return None;
    }

    let (host, port) = if hostport.parse::<Ipv6Addr>().is_ok() {
        (hostport, None)
    } else {
        let (host, port) = hostport.rsplit_once(':')?;
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        host.parse::<Ipv6Addr>().ok()?;
        (host, Some(port))
    };

    let mut out = format!("{}://", scheme);
    if let Some(user) = userinfo {
        out.push_str(user);
        out.push('@');
    }
    out.push('[');
    out.push_str(host);
    out.push(']');
    if let Some(port) = port {
        out.push(':');
        out.push_str(port);
    }
    out.push_str(tail);
    Some(out)
}

/// Last-resort textual rewrite of `::ffff:a.b.c.d` for strings no URL parser accepts.
fn replace_mapped_literal(raw: &str) -> String {
    const MARKER: &str = "::ffff:";
    let Some(idx) = raw.to_ascii_lowercase().find(MARKER) else {
        return raw.to_string();
    };
    let start = idx + MARKER.len();
    let len = raw[start..]
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len() - start);
    let literal = &raw[start..start + len];
    if literal.parse::<std::net::Ipv4Addr>().is_err() {
        return raw.to_string();
    }
    format!("{}{}{}", &raw[..idx], literal, &raw[start + len..])
}
