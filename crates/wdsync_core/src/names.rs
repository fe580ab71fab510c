//! Page-name normalization and site address helpers.

pub const WIKIDOT_DOMAIN: &str = "wikidot.com";

/// Normalize a page name into its Wikidot unix name.
///
/// Lowercases, maps `~` runs to the category separator `:`, turns every
/// character outside `[a-z0-9_:]` into `-`, collapses dash runs and trims
/// dashes per category segment. A leading `_` in a segment is kept (it marks
/// hidden pages such as `_template`); any other `_` becomes `-`.
/// Applying it twice yields the same result as applying it once.
pub fn unix_name(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let mut mapped = String::with_capacity(lowered.len());
    let mut in_tilde = false;
    for ch in lowered.chars() {
        if ch == '~' {
            if !in_tilde {
                mapped.push(':');
            }
            in_tilde = true;
            continue;
        }
        in_tilde = false;
        if ch.is_ascii_alphanumeric() || ch == ':' || ch == '_' {
            mapped.push(ch);
        } else {
            mapped.push('-');
        }
    }

    mapped
        .split(':')
        .filter_map(normalize_segment)
        .collect::<Vec<_>>()
        .join(":")
}

fn normalize_segment(segment: &str) -> Option<String> {
    let (prefix, rest) = match segment.strip_prefix('_') {
        Some(rest) => ("_", rest),
        None => ("", segment),
    };
    let dashed = rest.replace('_', "-");
    let collapsed = collapse_dashes(&dashed);
    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        return None;
    }
    Some(format!("{prefix}{trimmed}"))
}

fn collapse_dashes(value: &str) -> String {
    let mut output = String::with_capacity(value.len());
    let mut previous_dash = false;
    for ch in value.chars() {
        if ch == '-' {
            if !previous_dash {
                output.push(ch);
            }
            previous_dash = true;
        } else {
            output.push(ch);
            previous_dash = false;
        }
    }
    output
}

/// Unix name for account names: no categories, only `[a-z0-9]` and dashes.
pub fn unix_name_plain(name: &str) -> String {
    let lowered = name.trim().to_lowercase();
    let mapped: String = lowered
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '-' })
        .collect();
    collapse_dashes(&mapped).trim_matches('-').to_string()
}

/// Resolve a site reference (`scp-wiki` or a full URL) into its base URL.
pub fn site_base_url(site: &str) -> String {
    let trimmed = site.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.trim_end_matches('/').to_string()
    } else {
        format!("http://{trimmed}.{WIKIDOT_DOMAIN}")
    }
}

/// Host part of a site reference, e.g. `scp-wiki.wikidot.com`.
pub fn site_authority(site: &str) -> String {
    let base = site_base_url(site);
    let without_scheme = base
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(&base);
    without_scheme
        .split('/')
        .next()
        .unwrap_or(without_scheme)
        .to_string()
}

/// Inverse of [`site_authority`]: wikidot subdomains collapse back to the
/// short site name, custom domains become an explicit URL.
pub fn site_from_authority(authority: &str) -> String {
    let suffix = format!(".{WIKIDOT_DOMAIN}");
    match authority.strip_suffix(&suffix) {
        Some(short) if !short.is_empty() && !short.contains('.') => short.to_string(),
        _ => format!("http://{authority}"),
    }
}

/// The `https://` variant of a base URL, if it is plain `http://`.
pub fn https_variant(base_url: &str) -> Option<String> {
    base_url
        .strip_prefix("http://")
        .map(|rest| format!("https://{rest}"))
}

pub fn url_join(base: &str, parts: &[&str]) -> String {
    let mut output = base.trim_end_matches('/').to_string();
    for part in parts {
        let trimmed = part.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        output.push('/');
        output.push_str(trimmed);
    }
    output
}
