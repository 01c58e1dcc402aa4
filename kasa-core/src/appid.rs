//! Human-shareable application-id tokens: `KASA-<millis base36>-<6 random>`.

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

const PREFIX: &str = "KASA";
const RANDOM_LEN: usize = 6;
const ALPHABET: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

static ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^KASA-[0-9A-Z]+-[0-9A-Z]{6}$").unwrap());

fn to_base36_upper(mut n: u64) -> String {
    if n == 0 {
        return "0".into();
    }
    let mut out = Vec::new();
    while n > 0 {
        out.push(ALPHABET[(n % 36) as usize]);
        n /= 36;
    }
    out.reverse();
    String::from_utf8(out).unwrap()
}

/// Generate a fresh application id. The timestamp part orders ids roughly by
/// submission time; the random part comes from a v4 UUID.
pub fn generate() -> String {
    let millis = Utc::now().timestamp_millis().max(0) as u64;
    let uuid = Uuid::new_v4();
    let random: String = uuid
        .as_bytes()
        .iter()
        .map(|b| ALPHABET[(*b as usize) % 36] as char)
        .take(RANDOM_LEN)
        .collect();
    format!("{PREFIX}-{}-{}", to_base36_upper(millis), random)
}

/// Shape check for ids arriving from user input or QR links.
pub fn is_valid(id: &str) -> bool {
    ID_RE.is_match(id)
}

/// Shareable verification link for an application, as encoded in the QR code.
pub fn verify_url(site_base: &str, application_id: &str) -> String {
    format!("{}/verify?id={}", site_base.trim_end_matches('/'), application_id)
}
