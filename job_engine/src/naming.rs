//! Container and host name helpers.

use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;

const MAX_HOST_NAME_LEN: usize = 64;
const HOST_NAME_KEEP: usize = 30;

/// Unique container name: `<prefix>-<purpose>-<unix nanos>-<5 letters>`.
pub fn container_name(prefix: &str, purpose: &str) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    sanitize_container_name(&format!(
        "{}-{}-{}-{}",
        prefix,
        purpose,
        nanos,
        random_lowercase(5)
    ))
}

/// Replace every character Docker rejects in names with `_`.
pub fn sanitize_container_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Shorten host names over 64 characters, keeping both ends.
pub fn condense_host_name(host_name: &str) -> String {
    let chars: Vec<char> = host_name.chars().collect();
    if chars.len() <= MAX_HOST_NAME_LEN {
        return host_name.to_string();
    }

    let head: String = chars[..HOST_NAME_KEEP].iter().collect();
    let tail: String = chars[chars.len() - HOST_NAME_KEEP..].iter().collect();
    format!("{}_._{}", head, tail)
}

/// `n` random letters from `a` to `z`.
pub fn random_lowercase(n: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..n).map(|_| rng.gen_range(b'a'..=b'z') as char).collect()
}
