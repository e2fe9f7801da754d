use once_cell::sync::Lazy;
use regex::Regex;

/// Cache key used when the code contains no recognizable URL.
pub const UNKNOWN_ORIGIN: &str = "unknown service";

/// Authority runs up to a path, quote, backtick, query, fragment or whitespace.
static URL_ORIGIN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"https?://([^/'"`?#\s]+)"#).expect("origin pattern is valid")
});

/// Derive the credential cache key from the first `http(s)://host[:port]`
/// found in `code`. A port stays part of the key.
pub fn extract_origin(code: &str) -> String {
    URL_ORIGIN_RE
        .captures(code)
        .and_then(|caps| caps.get(1))
        .map(|host| host.as_str().to_string())
        .unwrap_or_else(|| UNKNOWN_ORIGIN.to_string())
}
