use sha2::{Digest, Sha256};

use crate::index::url_key;

pub const ETHERPAD_HOST: &str = "etherpad.wikimedia.org";
pub const EXPORT_BASE_URL: &str = "https://etherpad.wikimedia.org/p/";
pub const CONTENT_EXTENSION: &str = "txt";

const MAX_NAME_CHARS: usize = 80;
const DIGEST_HEX_CHARS: usize = 16;

/// A pad to archive: where it was cited, where its text export lives, and
/// the file it is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PadTarget {
    pub url: String,
    pub pad_name: String,
    pub export_url: String,
    pub file_name: String,
}

impl PadTarget {
    /// Returns None when the URL names no pad (e.g. the service front page).
    pub fn from_url(url: &str) -> Option<Self> {
        let pad_name = extract_pad_name(url)?;
        Some(Self {
            url: url.to_string(),
            export_url: format!("{EXPORT_BASE_URL}{pad_name}/export/txt"),
            file_name: content_file_name(&pad_name, url),
            pad_name,
        })
    }
}

/// Pad name from `/p/<name>`, legacy `/ep/pad/view/<name>/latest`, or a bare
/// `etherpad.wikimedia.org/<name>` path.
pub fn extract_pad_name(url: &str) -> Option<String> {
    let url = url
        .split(['?', '#'])
        .next()
        .unwrap_or(url)
        .trim()
        .trim_end_matches('/');

    let name = if let Some((_, rest)) = url.split_once("/p/") {
        rest.to_string()
    } else if let Some((_, rest)) = url.split_once(&format!("{ETHERPAD_HOST}/")) {
        if let Some(legacy) = rest.strip_prefix("ep/pad/view/") {
            legacy.trim_end_matches("/latest").replace('/', "_")
        } else if rest == "p" {
            String::new()
        } else {
            rest.to_string()
        }
    } else {
        String::new()
    };

    let name = name.trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

/// `<sanitized pad name>-<16 hex of sha256(scheme-agnostic url)>.txt`.
pub fn content_file_name(pad_name: &str, url: &str) -> String {
    format!(
        "{}-{}.{CONTENT_EXTENSION}",
        sanitize_pad_name(pad_name),
        url_digest(url)
    )
}

pub fn url_digest(url: &str) -> String {
    let digest = Sha256::digest(url_key(url).as_bytes());
    let mut output = String::with_capacity(DIGEST_HEX_CHARS);
    for byte in digest.iter().take(DIGEST_HEX_CHARS / 2) {
        output.push_str(&format!("{byte:02x}"));
    }
    output
}

pub fn content_digest(content: &[u8]) -> String {
    let digest = Sha256::digest(content);
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

/// The URL digest embedded in a content file name, if the name follows the
/// naming scheme.
pub fn digest_from_file_name(file_name: &str) -> Option<&str> {
    let stem = file_name.strip_suffix(&format!(".{CONTENT_EXTENSION}"))?;
    let (_, digest) = stem.rsplit_once('-')?;
    let valid = digest.len() == DIGEST_HEX_CHARS
        && digest
            .chars()
            .all(|ch| ch.is_ascii_digit() || ('a'..='f').contains(&ch));
    valid.then_some(digest)
}

fn sanitize_pad_name(pad_name: &str) -> String {
    let decoded = urlencoding::decode(pad_name)
        .map(|decoded| decoded.into_owned())
        .unwrap_or_else(|_| pad_name.to_string());
    let sanitized = decoded
        .chars()
        .map(|ch| {
            if ch.is_alphanumeric() || matches!(ch, '_' | '-' | '.') {
                ch
            } else {
                '_'
            }
        })
        .take(MAX_NAME_CHARS)
        .collect::<String>();
    if sanitized.is_empty() {
        "pad".to_string()
    } else {
        sanitized
    }
}
