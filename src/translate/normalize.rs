//! Source text normalization and cache fingerprints.
//! OCR output is noisy: stray control characters, line breaks inside bubbles,
//! doubled spaces. Two texts that differ only in that noise share a cache entry.

use std::sync::OnceLock;

use regex::Regex;

use super::BackendKind;

/// 32-byte blake3 digest used as the text cache key.
pub type Fingerprint = [u8; 32];

fn whitespace_run() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

/// Drop non-printable characters, collapse whitespace runs to one space, trim.
pub fn normalize_text(text: &str) -> String {
    let printable: String = text
        .chars()
        .map(|c| if c.is_whitespace() { ' ' } else { c })
        .filter(|c| !c.is_control() && !is_invisible_format(*c))
        .collect();
    whitespace_run()
        .replace_all(&printable, " ")
        .trim()
        .to_string()
}

/// Zero-width and BOM characters that OCR engines sometimes emit.
fn is_invisible_format(c: char) -> bool {
    matches!(c, '\u{200B}'..='\u{200D}' | '\u{2060}' | '\u{FEFF}')
}

/// Fingerprint over (normalized text, target language, backend id).
pub fn fingerprint(normalized_text: &str, target_lang: &str, backend: BackendKind) -> Fingerprint {
    let mut hasher = blake3::Hasher::new();
    hasher.update(backend.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(target_lang.as_bytes());
    hasher.update(b"|");
    hasher.update(normalized_text.as_bytes());
    *hasher.finalize().as_bytes()
}
