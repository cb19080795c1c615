//! URL handling module for Sumi-Corpus
//!
//! This module provides:
//! - Normalization of URLs into frontier dedup keys
//! - Community membership checks
//! - Recognition of archive URL shapes (index, post, comment thread)
//! - Construction of canonical post and thread URLs

mod normalize;

use crate::config::CommunityConfig;
use crate::state::PageKind;
use url::Url;

pub use normalize::{is_tracking_param, normalize_url};

/// Returns the frontier dedup key for a discovered URL
///
/// Normalization failure degrades to the trimmed raw URL: a link that cannot
/// be canonicalized is still worth fetching once, and redundant work is
/// preferred over losing it.
pub fn dedup_key(raw: &str) -> String {
    match normalize_url(raw) {
        Ok(url) => url.to_string(),
        Err(e) => {
            tracing::warn!("Using raw URL as dedup key for {}: {}", raw, e);
            raw.trim().to_string()
        }
    }
}

/// Compares two host names, ignoring case and a leading `www.`
pub fn same_host(a: &str, b: &str) -> bool {
    fn bare(host: &str) -> String {
        let lower = host.to_ascii_lowercase();
        match lower.strip_prefix("www.") {
            Some(rest) => rest.to_string(),
            None => lower,
        }
    }

    !a.is_empty() && bare(a) == bare(b)
}

/// Returns true if the URL is served from the community's host
pub fn is_community_url(url: &Url, community: &CommunityConfig) -> bool {
    url.host_str()
        .map(|host| same_host(host, &community.host))
        .unwrap_or(false)
}

/// Extracts the numeric post id from a `/<digits>.html` path
///
/// # Examples
///
/// ```
/// use sumi_corpus::url::post_id_from_url;
/// use url::Url;
///
/// let url = Url::parse("https://ftm.livejournal.com/1234.html?thread=5").unwrap();
/// assert_eq!(post_id_from_url(&url), Some("1234".to_string()));
/// ```
pub fn post_id_from_url(url: &Url) -> Option<String> {
    let path = url.path().trim_start_matches('/');
    let id = path.strip_suffix(".html")?;
    if !id.is_empty() && id.chars().all(|c| c.is_ascii_digit()) {
        Some(id.to_string())
    } else {
        None
    }
}

/// Returns the first value of a query parameter
pub fn query_param(url: &Url, key: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.into_owned())
}

/// Guesses the page kind of a URL from its shape
///
/// Post URLs carrying `thread` or `page` parameters are comment-thread pages;
/// any other community URL is treated as an index page.
pub fn classify_page_url(url: &Url) -> PageKind {
    if post_id_from_url(url).is_some() {
        if query_param(url, "thread").is_some() || query_param(url, "page").is_some() {
            PageKind::CommentThread
        } else {
            PageKind::Post
        }
    } else {
        PageKind::Index
    }
}

/// Builds the canonical URL of a post, with the community's entry query appended
pub fn post_url(base: &Url, post_id: &str, community: &CommunityConfig) -> Url {
    let mut url = base.clone();
    url.set_path(&format!("/{}.html", post_id));
    url.set_fragment(None);
    url.set_query(community.entry_query.as_deref());
    url
}

/// Builds the URL of a single comment thread under a post
pub fn thread_url(base: &Url, post_id: &str, thread_id: &str, community: &CommunityConfig) -> Url {
    let mut url = post_url(base, post_id, community);
    url.query_pairs_mut().append_pair("thread", thread_id);
    url
}

#[cfg(test)]
mod tests {
    use super::*;

    fn community() -> CommunityConfig {
        CommunityConfig {
            id: "ftm".to_string(),
            display_name: "FTM".to_string(),
            host: "ftm.livejournal.com".to_string(),
            seeds: vec!["https://ftm.livejournal.com/".to_string()],
            entry_query: Some("nojs=1".to_string()),
        }
    }

    #[test]
    fn test_dedup_key_normalizes() {
        assert_eq!(
            dedup_key("https://www.ftm.livejournal.com/1.html#comments"),
            "https://ftm.livejournal.com/1.html"
        );
    }

    #[test]
    fn test_dedup_key_keeps_entry_query() {
        assert_eq!(
            dedup_key("https://ftm.livejournal.com/1.html?style=mine"),
            "https://ftm.livejournal.com/1.html?style=mine"
        );
    }

    #[test]
    fn test_dedup_key_falls_back_to_raw() {
        assert_eq!(dedup_key("  not a url "), "not a url");
    }

    #[test]
    fn test_same_host() {
        assert!(same_host("FTM.livejournal.com", "ftm.livejournal.com"));
        assert!(same_host("www.ftm.livejournal.com", "ftm.livejournal.com"));
        assert!(!same_host("other.livejournal.com", "ftm.livejournal.com"));
        assert!(!same_host("", "ftm.livejournal.com"));
    }

    #[test]
    fn test_is_community_url() {
        let c = community();
        let inside = Url::parse("https://ftm.livejournal.com/12.html").unwrap();
        let outside = Url::parse("https://www.livejournal.com/12.html").unwrap();
        assert!(is_community_url(&inside, &c));
        assert!(!is_community_url(&outside, &c));
    }

    #[test]
    fn test_post_id_from_url() {
        let post = Url::parse("https://ftm.livejournal.com/98765.html").unwrap();
        assert_eq!(post_id_from_url(&post), Some("98765".to_string()));

        let tag = Url::parse("https://ftm.livejournal.com/tag/news").unwrap();
        assert_eq!(post_id_from_url(&tag), None);

        let odd = Url::parse("https://ftm.livejournal.com/profile.html").unwrap();
        assert_eq!(post_id_from_url(&odd), None);
    }

    #[test]
    fn test_classify_page_url() {
        let index = Url::parse("https://ftm.livejournal.com/?skip=20").unwrap();
        let post = Url::parse("https://ftm.livejournal.com/1.html?nojs=1").unwrap();
        let thread = Url::parse("https://ftm.livejournal.com/1.html?thread=7").unwrap();
        let page = Url::parse("https://ftm.livejournal.com/1.html?page=2").unwrap();

        assert_eq!(classify_page_url(&index), PageKind::Index);
        assert_eq!(classify_page_url(&post), PageKind::Post);
        assert_eq!(classify_page_url(&thread), PageKind::CommentThread);
        assert_eq!(classify_page_url(&page), PageKind::CommentThread);
    }

    #[test]
    fn test_post_and_thread_urls() {
        let c = community();
        let base = Url::parse("https://ftm.livejournal.com/?skip=10").unwrap();

        assert_eq!(
            post_url(&base, "42", &c).as_str(),
            "https://ftm.livejournal.com/42.html?nojs=1"
        );
        assert_eq!(
            thread_url(&base, "42", "100", &c).as_str(),
            "https://ftm.livejournal.com/42.html?nojs=1&thread=100"
        );
    }
}
