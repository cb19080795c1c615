use crate::UrlError;
use url::Url;

/// Query parameters that never change which page is served
const TRACKING_PARAMS: &[&str] = &[
    "utm_source",
    "utm_medium",
    "utm_campaign",
    "utm_term",
    "utm_content",
    "fbclid",
    "gclid",
    "mc_eid",
    "ref",
    "source",
];

/// Normalizes a URL into its frontier dedup key
///
/// # Normalization Steps
///
/// 1. Parse the URL; reject if malformed or not http(s)
/// 2. Lowercase the host and strip a `www.` prefix
/// 3. Normalize path:
///    - Remove dot segments (. and ..) and repeated slashes
///    - Remove trailing slash (except for root /)
/// 4. Remove fragment (`#t123` comment anchors point into the same page)
/// 5. Remove tracking query parameters; presentation ones such as `style`
///    select what the server renders and are kept
/// 6. Sort remaining query parameters, drop an empty query
///
/// The scheme is kept as-is: the same archive is never served under both.
///
/// # Examples
///
/// ```
/// use sumi_corpus::url::normalize_url;
///
/// let url = normalize_url("https://WWW.FTM.LIVEJOURNAL.COM/123.html?thread=9#t9").unwrap();
/// assert_eq!(url.as_str(), "https://ftm.livejournal.com/123.html?thread=9");
/// ```
pub fn normalize_url(url_str: &str) -> Result<Url, UrlError> {
    let mut url = Url::parse(url_str.trim()).map_err(|e| UrlError::Parse(e.to_string()))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(UrlError::InvalidScheme(format!(
            "Only HTTP and HTTPS schemes are supported, got: {}",
            url.scheme()
        )));
    }

    let host = url.host_str().ok_or(UrlError::MissingHost)?.to_lowercase();
    if let Some(stripped) = host.strip_prefix("www.") {
        let stripped = stripped.to_string();
        url.set_host(Some(&stripped))
            .map_err(|e| UrlError::Malformed(format!("Failed to set host: {}", e)))?;
    }

    let normalized_path = normalize_path(url.path());
    url.set_path(&normalized_path);

    url.set_fragment(None);

    if url.query().is_some() {
        let params = filter_and_sort_query_params(&url);
        if params.is_empty() {
            url.set_query(None);
        } else {
            url.query_pairs_mut().clear().extend_pairs(params);
        }
    }

    Ok(url)
}

/// Normalizes a URL path by removing dot segments and trailing slashes
fn normalize_path(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();

    for segment in path.split('/') {
        match segment {
            "" | "." => continue,
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    if segments.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", segments.join("/"))
    }
}

/// Filters out tracking parameters and sorts the remaining ones by key, then value
fn filter_and_sort_query_params(url: &Url) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(key, _)| !is_tracking_param(key))
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();

    params.sort();
    params.dedup();
    params
}

/// Returns true if normalization drops this query parameter
pub fn is_tracking_param(key: &str) -> bool {
    TRACKING_PARAMS.contains(&key) || key.starts_with("utm_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scheme_is_preserved() {
        let result = normalize_url("http://example.com/page").unwrap();
        assert_eq!(result.as_str(), "http://example.com/page");
    }

    #[test]
    fn test_remove_www() {
        let result = normalize_url("https://www.example.com/").unwrap();
        assert_eq!(result.as_str(), "https://example.com/");
    }

    #[test]
    fn test_remove_trailing_slash() {
        let result = normalize_url("https://example.com/page/").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }

    #[test]
    fn test_keep_root_slash() {
        let result = normalize_url("https://example.com").unwrap();
        assert_eq!(result.as_str(), "https://example.com/");
    }

    #[test]
    fn test_comment_anchor_removed() {
        let result = normalize_url("https://ftm.livejournal.com/123.html#t456").unwrap();
        assert_eq!(result.as_str(), "https://ftm.livejournal.com/123.html");
    }

    #[test]
    fn test_thread_param_kept() {
        let result =
            normalize_url("https://ftm.livejournal.com/123.html?thread=456&nojs=1").unwrap();
        assert_eq!(
            result.as_str(),
            "https://ftm.livejournal.com/123.html?nojs=1&thread=456"
        );
    }

    #[test]
    fn test_presentation_params_kept() {
        let result =
            normalize_url("https://ftm.livejournal.com/123.html?view=comments&style=mine").unwrap();
        assert_eq!(
            result.as_str(),
            "https://ftm.livejournal.com/123.html?style=mine&view=comments"
        );
    }

    #[test]
    fn test_mixed_query_params() {
        let result = normalize_url(
            "https://example.com/page?keep=yes&utm_medium=email&another=value&fbclid=123",
        )
        .unwrap();
        assert_eq!(
            result.as_str(),
            "https://example.com/page?another=value&keep=yes"
        );
    }

    #[test]
    fn test_equivalent_urls_share_a_key() {
        let a = normalize_url("https://FTM.livejournal.com/a/../123.html?page=2&thread=5").unwrap();
        let b = normalize_url("https://www.ftm.livejournal.com/123.html?thread=5&page=2#x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_normalize_path_with_dots() {
        let result = normalize_url("https://example.com/a/../b/./c").unwrap();
        assert_eq!(result.as_str(), "https://example.com/b/c");
    }

    #[test]
    fn test_multiple_slashes() {
        let result = normalize_url("https://example.com///path//to///page").unwrap();
        assert_eq!(result.as_str(), "https://example.com/path/to/page");
    }

    #[test]
    fn test_invalid_scheme() {
        let result = normalize_url("ftp://example.com/page");
        assert!(matches!(result.unwrap_err(), UrlError::InvalidScheme(_)));
    }

    #[test]
    fn test_malformed_url() {
        assert!(normalize_url("not a url").is_err());
    }

    #[test]
    fn test_custom_utm_param() {
        let result = normalize_url("https://example.com/page?utm_custom=value").unwrap();
        assert_eq!(result.as_str(), "https://example.com/page");
    }
}
