//! Origin parsing and the URL comparisons used for prediction accounting and
//! speculation hand-off.

use std::fmt;

use url::Url;

/// A tuple origin (scheme, host, port). Opaque origins are never constructed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Origin(url::Origin);

impl Origin {
    pub fn parse(input: &str) -> Option<Self> {
        let url = Url::parse(input.trim()).ok()?;
        Self::from_url(&url)
    }

    pub fn from_url(url: &Url) -> Option<Self> {
        match url.origin() {
            origin @ url::Origin::Tuple(..) => Some(Self(origin)),
            url::Origin::Opaque(_) => None,
        }
    }

    pub fn serialize(&self) -> String {
        self.0.ascii_serialization()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.ascii_serialization())
    }
}

/// Whether `url` may be speculated or preconnected: http, https, or no scheme
/// at all (`www.example.com`).
pub fn is_speculatable_url(url: &str) -> bool {
    let url = url.trim();
    if url.is_empty() {
        return false;
    }
    match Url::parse(url) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https"),
        Err(url::ParseError::RelativeUrlWithoutBase) => true,
        Err(_) => false,
    }
}

pub fn urls_match(a: &str, b: &str, ignore_fragments: bool) -> bool {
    if !ignore_fragments {
        return a == b;
    }
    match (Url::parse(a), Url::parse(b)) {
        (Ok(mut a), Ok(mut b)) => {
            a.set_fragment(None);
            b.set_fragment(None);
            a == b
        }
        _ => strip_fragment(a) == strip_fragment(b),
    }
}

fn strip_fragment(url: &str) -> &str {
    url.split_once('#').map_or(url, |(head, _)| head)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn schemes_allowed_for_speculation() {
        assert!(is_speculatable_url("https://a.example/x"));
        assert!(is_speculatable_url("http://a.example"));
        assert!(is_speculatable_url("www.example.com"));
        assert!(!is_speculatable_url("javascript:alert(1)"));
        assert!(!is_speculatable_url("file:///etc/passwd"));
        assert!(!is_speculatable_url(""));
    }

    #[test_timeout::timeout]
    fn fragment_insensitive_match_only_when_requested() {
        let a = "https://a.example/x#top";
        let b = "https://a.example/x#bottom";
        assert!(!urls_match(a, b, false));
        assert!(urls_match(a, b, true));
        assert!(!urls_match(a, "https://a.example/y#top", true));
        assert!(urls_match("not a url#one", "not a url#two", true));
    }

    #[test_timeout::timeout]
    fn origin_drops_path_and_keeps_port() {
        let origin = Origin::parse("https://a.example:8443/some/path?q=1").expect("origin");
        assert_eq!(origin.serialize(), "https://a.example:8443");
        assert_eq!(Origin::parse("https://a.example/other"), Origin::parse("https://a.example"));
        assert!(Origin::parse("data:text/plain,hi").is_none());
    }
}
