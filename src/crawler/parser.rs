//! HTML parser for archive pages
//!
//! This module turns a fetched page into:
//! - Entry fragments (the post and every comment visible on the page)
//! - Links to further pages, tagged with the page kind they are expected to be
//!
//! Community templates differ, so every field is read through a chain of
//! selectors covering the classic and the modern page layouts. Missing
//! markers produce partial fragments rather than errors.

use crate::config::CommunityConfig;
use crate::corpus::{MetadataValue, PartialEntry};
use crate::crawler::dates::parse_date;
use crate::crawler::fetcher::RawPage;
use crate::state::PageKind;
use crate::url::{is_community_url, post_id_from_url, post_url, query_param, thread_url};
use crate::ParseError;
use chrono::{DateTime, Utc};
use scraper::{ElementRef, Html, Selector};
use std::collections::{HashMap, HashSet};
use url::Url;

const COMMENT_WRAPPERS: &str = r#"[id^="ljcmt"], .b-tree-twig"#;

const POST_SUBJECT: &[&str] = &[".entry-title", ".b-singlepost-title", "h1.entry-header"];
const POST_DATE: &[&str] = &["article time", ".b-singlepost-author-date", "time"];
const POST_AUTHOR: &[&str] = &[
    ".entry-text .username b",
    ".b-singlepost-author-userinfo .i-ljuser-username b",
    ".entry-text .ljuser b",
];
const POST_CONTENT: &[&str] = &[
    ".entry-text .entry-content",
    "article.entry-content",
    ".b-singlepost-body",
    ".entry-content",
];

const COMMENT_CONTENT: &[&str] = &[
    ".comment-body",
    ".b-leaf-article",
    ".comment-text",
    ".comment-content",
];
const COMMENT_AUTHOR: &[&str] = &[".i-ljuser-username b", ".ljuser b"];
const COMMENT_SUBJECT: &[&str] = &[".comment-title", ".b-leaf-subject", ".comment-subject"];

const ANONYMOUS: &str = "(Anonymous)";
const DELETED_TEXT: &str = "(Deleted comment)";

/// A link found on a page, with the kind of page it should lead to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredLink {
    /// Absolute URL on the community host
    pub url: String,
    pub kind: PageKind,
}

/// Everything extracted from one page
#[derive(Debug, Clone, Default)]
pub struct ParseResult {
    pub entries: Vec<PartialEntry>,
    pub links: Vec<DiscoveredLink>,
}

impl ParseResult {
    fn push_link(&mut self, seen: &mut HashSet<String>, url: Url, kind: PageKind) {
        let url = url.to_string();
        if seen.insert(url.clone()) {
            self.links.push(DiscoveredLink { url, kind });
        }
    }
}

/// Parses a fetched page of the given kind
///
/// # Extraction by page kind
///
/// | Kind | Entries | Links |
/// |------|---------|-------|
/// | Index | none | posts, older index page |
/// | Post | the post and its visible comments | collapsed threads, comment pages |
/// | CommentThread | comments only | collapsed threads, comment pages |
///
/// # Arguments
///
/// * `page` - The fetched page
/// * `kind` - The kind of page the URL was discovered as
/// * `community` - The community the page belongs to
///
/// # Returns
///
/// * `Ok(ParseResult)` - Fragments and links; off-host links are dropped
/// * `Err(ParseError)` - The page yielded neither entries nor links, or a
///   post page carried no recognizable post id
///
/// # Example
///
/// ```no_run
/// use sumi_corpus::config::CommunityConfig;
/// use sumi_corpus::crawler::{parse_page, RawPage};
/// use sumi_corpus::PageKind;
///
/// let community = CommunityConfig {
///     id: "ftm".to_string(),
///     display_name: "FTM".to_string(),
///     host: "ftm.livejournal.com".to_string(),
///     seeds: vec!["https://ftm.livejournal.com/".to_string()],
///     entry_query: None,
/// };
/// let page = RawPage {
///     url: "https://ftm.livejournal.com/".to_string(),
///     final_url: "https://ftm.livejournal.com/".to_string(),
///     status_code: 200,
///     body: r#"<a href="/1.html">first</a>"#.to_string(),
/// };
/// let parsed = parse_page(&page, PageKind::Index, &community).unwrap();
/// assert_eq!(parsed.links.len(), 1);
/// ```
pub fn parse_page(
    page: &RawPage,
    kind: PageKind,
    community: &CommunityConfig,
) -> Result<ParseResult, ParseError> {
    let error = |message: &str| ParseError {
        url: page.url.clone(),
        kind: kind.to_string(),
        message: message.to_string(),
    };

    let requested = Url::parse(&page.url).map_err(|e| error(&e.to_string()))?;
    let base = Url::parse(&page.final_url).unwrap_or_else(|_| requested.clone());
    let document = Html::parse_document(&page.body);

    let result = match kind {
        PageKind::Index => parse_index(&document, &base, community),
        PageKind::Post | PageKind::CommentThread => {
            let post_id = post_id_from_url(&requested)
                .or_else(|| og_post_id(&document))
                .ok_or_else(|| error("no post id in URL or page metadata"))?;
            parse_entry_page(&document, kind, &requested, &base, &post_id, community)
        }
    };

    if result.entries.is_empty() && result.links.is_empty() {
        return Err(error("no entries or links found"));
    }

    tracing::debug!(
        "Parsed {} as {}: {} entries, {} links",
        page.url,
        kind,
        result.entries.len(),
        result.links.len()
    );

    Ok(result)
}

fn parse_index(document: &Html, base: &Url, community: &CommunityConfig) -> ParseResult {
    let mut result = ParseResult::default();
    let mut seen = HashSet::new();

    if let Ok(anchors) = Selector::parse("a[href]") {
        for anchor in document.select(&anchors) {
            let Some(url) = anchor
                .value()
                .attr("href")
                .and_then(|href| resolve_link(href, base))
            else {
                continue;
            };
            if !is_community_url(&url, community) {
                continue;
            }

            if let Some(post_id) = post_id_from_url(&url) {
                result.push_link(&mut seen, post_url(&url, &post_id, community), PageKind::Post);
            } else if is_older_entries_link(anchor, &url) {
                result.push_link(&mut seen, url, PageKind::Index);
            }
        }
    }

    if let Some(url) = first_attr(document.root_element(), &[".j-page-nav-item-prev a[href]"], "href")
        .and_then(|href| resolve_link(&href, base))
        .filter(|url| is_community_url(url, community))
    {
        result.push_link(&mut seen, url, PageKind::Index);
    }

    result
}

/// Recognizes the link to the next batch of older entries
fn is_older_entries_link(anchor: ElementRef<'_>, url: &Url) -> bool {
    let label = text_of(anchor).to_lowercase();
    matches!(label.as_str(), "earlier" | "previous" | "next 10")
        || label.starts_with("previous ")
        || query_param(url, "skip").is_some()
}

fn og_post_id(document: &Html) -> Option<String> {
    meta_content(document, "og:url")
        .and_then(|raw| Url::parse(&raw).ok())
        .and_then(|url| post_id_from_url(&url))
}

fn parse_entry_page(
    document: &Html,
    kind: PageKind,
    requested: &Url,
    base: &Url,
    post_id: &str,
    community: &CommunityConfig,
) -> ParseResult {
    let mut result = ParseResult::default();
    let mut seen = HashSet::new();

    if kind == PageKind::Post {
        if let Some(post) = parse_post(document, requested, post_id, community) {
            result.entries.push(post);
        }
    }

    let thread_root = query_param(requested, "thread");
    let comments = CommentWalker::new(community, base, post_id, thread_root.as_deref());
    comments.walk(document, &mut result, &mut seen);

    if let Some(url) = first_attr(document.root_element(), &[".comments-pages-next a[href]"], "href")
        .and_then(|href| resolve_link(&href, base))
        .filter(|url| is_community_url(url, community))
    {
        result.push_link(&mut seen, url, PageKind::CommentThread);
    }

    result
}

fn parse_post(
    document: &Html,
    requested: &Url,
    post_id: &str,
    community: &CommunityConfig,
) -> Option<PartialEntry> {
    let root = document.root_element();

    let subject = meta_content(document, "og:title").or_else(|| first_text(root, POST_SUBJECT));
    let date = first_attr(root, &[".entry-text .entry-date abbr[title]"], "title")
        .and_then(|raw| parse_date(&raw))
        .or_else(|| first_attr(root, &["article time[datetime]"], "datetime").and_then(|raw| parse_date(&raw)))
        .or_else(|| first_text(root, POST_DATE).and_then(|raw| parse_date(&raw)))
        .or_else(|| meta_content(document, "article:published_time").and_then(|raw| parse_date(&raw)));
    let content = first_text(root, POST_CONTENT);

    if subject.is_none() && date.is_none() && content.is_none() {
        return None;
    }

    let author = first_text(root, POST_AUTHOR)
        .or_else(|| first_attr(root, &["article dl.author dt"], "lj:user"));
    let tags = meta_contents(document, "article:tag");

    let mut post = PartialEntry::post(&community.id, post_id);
    post.date = date;
    post.content = content;
    if let Some(subject) = subject {
        post.metadata.insert("subject".to_string(), subject.into());
    }
    if let Some(author) = author {
        post.metadata.insert("author".to_string(), author.into());
    }
    if !tags.is_empty() {
        post.metadata.insert("tags".to_string(), tags.join(", ").into());
    }
    post.metadata.insert(
        "url".to_string(),
        post_url(requested, post_id, community).to_string().into(),
    );

    Some(post)
}

/// Where a comment sits relative to the page
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
    /// A top-level comment of the post
    Root,
    Child(String),
    /// The parent is on another page
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CommentState {
    Live,
    Collapsed,
    Deleted,
}

impl CommentState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Collapsed => "collapsed",
            Self::Deleted => "deleted",
        }
    }
}

/// Walks the comment wrappers of a page in document order
struct CommentWalker<'a> {
    community: &'a CommunityConfig,
    base: &'a Url,
    post_id: &'a str,
    /// Comment the page was opened on, for `?thread=` pages
    thread_root: Option<&'a str>,
    /// Open ancestors as (indent, comment id)
    stack: Vec<(u32, String)>,
    /// Thread of every comment seen so far; `None` when it lies off the page
    threads: HashMap<String, Option<String>>,
    placements: HashMap<String, Placement>,
}

impl<'a> CommentWalker<'a> {
    fn new(
        community: &'a CommunityConfig,
        base: &'a Url,
        post_id: &'a str,
        thread_root: Option<&'a str>,
    ) -> Self {
        Self {
            community,
            base,
            post_id,
            thread_root,
            stack: Vec::new(),
            threads: HashMap::new(),
            placements: HashMap::new(),
        }
    }

    fn walk(mut self, document: &Html, result: &mut ParseResult, seen: &mut HashSet<String>) {
        let Ok(wrappers) = Selector::parse(COMMENT_WRAPPERS) else {
            return;
        };

        let candidates: Vec<ElementRef<'_>> = document
            .select(&wrappers)
            .filter(|el| is_comment_wrapper(*el))
            .collect();
        let wrapper_ids: HashSet<_> = candidates.iter().map(|el| el.id()).collect();

        for comment in candidates {
            // Inner elements that happen to match belong to their wrapper
            if comment.ancestors().any(|a| wrapper_ids.contains(&a.id())) {
                continue;
            }
            self.visit(comment, result, seen);
        }
    }

    fn visit(&mut self, comment: ElementRef<'_>, result: &mut ParseResult, seen: &mut HashSet<String>) {
        let id = match comment_id(comment) {
            CommentId::Known(id) => id,
            CommentId::Anonymous => String::new(),
            CommentId::SeeMore(parent) => {
                // Hidden replies are only reachable through their parent's thread
                let url = thread_url(self.base, self.post_id, &parent, self.community);
                result.push_link(seen, url, PageKind::CommentThread);
                return;
            }
        };

        let indent = comment_indent(comment);
        let placement = self.place(comment, &id, indent);
        let state = comment_state(comment);

        let mut entry = PartialEntry::comment(&self.community.id, self.post_id, &id);
        entry.parent_id = match &placement {
            Placement::Child(parent) => Some(parent.clone()),
            Placement::Root | Placement::Unknown => None,
        };
        entry.thread_id = match &placement {
            Placement::Root => (!id.is_empty()).then(|| id.clone()),
            Placement::Child(parent) => self.threads.get(parent).cloned().flatten(),
            Placement::Unknown => None,
        };

        entry
            .metadata
            .insert("state".to_string(), MetadataValue::from(state.as_str()));

        if state == CommentState::Live {
            entry.date = comment_date(comment);
            entry.content = first_text(comment, COMMENT_CONTENT);
            let author = first_text(comment, COMMENT_AUTHOR).unwrap_or_else(|| ANONYMOUS.to_string());
            entry.metadata.insert("author".to_string(), author.into());
            if let Some(subject) = first_text(comment, COMMENT_SUBJECT) {
                entry.metadata.insert("subject".to_string(), subject.into());
            }
        }

        if entry.id.is_empty() {
            entry.ensure_id();
            if placement == Placement::Root {
                entry.thread_id = Some(entry.id.clone());
            }
        }

        if state == CommentState::Collapsed {
            if let Some(target) = self.expansion_target(&entry) {
                let url = thread_url(self.base, self.post_id, &target, self.community);
                result.push_link(seen, url, PageKind::CommentThread);
            }
        }

        self.stack.push((indent, entry.id.clone()));
        self.threads.insert(entry.id.clone(), entry.thread_id.clone());
        self.placements.insert(entry.id.clone(), placement);
        result.entries.push(entry);
    }

    /// Decides where a comment hangs, popping finished siblings off the stack
    fn place(&mut self, comment: ElementRef<'_>, id: &str, indent: u32) -> Placement {
        while self
            .stack
            .last()
            .is_some_and(|(open, _)| *open >= indent)
        {
            self.stack.pop();
        }

        if let Some(parent) = parent_from_link(comment, self.base, self.community) {
            return Placement::Child(parent);
        }
        if !id.is_empty() && self.thread_root == Some(id) {
            return Placement::Unknown;
        }
        if indent == 0 {
            return Placement::Root;
        }
        match self.stack.last() {
            Some((_, parent)) => Placement::Child(parent.clone()),
            None => Placement::Unknown,
        }
    }

    /// Picks the comment whose thread page will reveal a collapsed comment
    fn expansion_target(&self, entry: &PartialEntry) -> Option<String> {
        if entry.id.starts_with("h:") {
            return None;
        }
        match self.thread_root {
            // The page root itself is collapsed: expand from one level up
            Some(root) if root == entry.id => entry.parent_id.clone(),
            Some(_) => Some(entry.id.clone()),
            None => Some(
                entry
                    .thread_id
                    .clone()
                    .filter(|thread| self.placements.contains_key(thread))
                    .unwrap_or_else(|| entry.id.clone()),
            ),
        }
    }
}

enum CommentId {
    Known(String),
    Anonymous,
    /// A placeholder standing in for replies hidden under `parent`
    SeeMore(String),
}

fn is_comment_wrapper(element: ElementRef<'_>) -> bool {
    let value = element.value();
    if value.classes().any(|c| c == "b-tree-twig") {
        return true;
    }
    value
        .id()
        .and_then(|id| id.strip_prefix("ljcmt"))
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

fn comment_id(comment: ElementRef<'_>) -> CommentId {
    let value = comment.value();

    if let Some(tid) = value.attr("data-tid") {
        let id = tid.trim_start_matches('t');
        if !id.is_empty() {
            return CommentId::Known(id.to_string());
        }
        return match first_attr(comment, &[".b-leaf-seemore[data-parent]"], "data-parent") {
            Some(parent) => CommentId::SeeMore(parent.trim_start_matches('t').to_string()),
            None => CommentId::Anonymous,
        };
    }

    match value.id().and_then(|id| id.strip_prefix("ljcmt")) {
        Some(id) if !id.is_empty() => CommentId::Known(id.to_string()),
        _ => CommentId::Anonymous,
    }
}

/// Reads the nesting depth from a `b-tree-twig-N` class or a `margin-left` style
fn comment_indent(comment: ElementRef<'_>) -> u32 {
    let value = comment.value();

    if let Some(level) = value
        .classes()
        .filter_map(|c| c.strip_prefix("b-tree-twig-"))
        .find_map(|n| n.parse::<u32>().ok())
    {
        return level;
    }

    value.attr("style").and_then(margin_left).unwrap_or(0)
}

fn margin_left(style: &str) -> Option<u32> {
    style.split(';').find_map(|declaration| {
        let (name, value) = declaration.split_once(':')?;
        if name.trim() != "margin-left" {
            return None;
        }
        let digits: String = value
            .trim()
            .chars()
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        digits.parse::<f64>().ok().map(|px| px.round() as u32)
    })
}

fn comment_state(comment: ElementRef<'_>) -> CommentState {
    let deleted = comment.value().classes().any(|c| c == "deleted")
        || has_match(comment, ".b-leaf-deleted")
        || text_of(comment) == DELETED_TEXT;
    if deleted {
        return CommentState::Deleted;
    }

    if has_match(comment, ".b-leaf-collapsed")
        || (comment_date(comment).is_none() && first_text(comment, COMMENT_CONTENT).is_none())
    {
        return CommentState::Collapsed;
    }

    CommentState::Live
}

fn comment_date(comment: ElementRef<'_>) -> Option<DateTime<Utc>> {
    comment
        .value()
        .attr("data-updated-ts")
        .and_then(parse_date)
        .or_else(|| first_text(comment, &[".comment-permalink"]).and_then(|raw| parse_date(&raw)))
        .or_else(|| {
            first_attr(comment, &["[data-updated-ts]"], "data-updated-ts")
                .and_then(|raw| parse_date(&raw))
        })
        .or_else(|| first_attr(comment, &["abbr[title]"], "title").and_then(|raw| parse_date(&raw)))
        .or_else(|| first_attr(comment, &["time[datetime]"], "datetime").and_then(|raw| parse_date(&raw)))
        .or_else(|| first_text(comment, &["time"]).and_then(|raw| parse_date(&raw)))
}

/// Finds the id behind a comment's "Parent" link (`…#t<id>`)
fn parent_from_link(comment: ElementRef<'_>, base: &Url, community: &CommunityConfig) -> Option<String> {
    let anchors = Selector::parse("a[href]").ok()?;
    comment
        .select(&anchors)
        .filter(|a| text_of(*a) == "Parent")
        .filter_map(|a| a.value().attr("href").and_then(|href| resolve_link(href, base)))
        .filter(|url| is_community_url(url, community))
        .find_map(|url| {
            url.fragment()
                .and_then(|f| f.strip_prefix('t'))
                .filter(|id| !id.is_empty())
                .map(str::to_string)
        })
}

/// Resolves a link href to an absolute URL
///
/// Returns None if the link should be excluded:
/// - javascript:, mailto:, tel: schemes
/// - data: URIs
/// - fragment-only links
/// - Non-HTTP(S) URLs after resolution
fn resolve_link(href: &str, base: &Url) -> Option<Url> {
    let href = href.trim();

    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    if href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
        || href.starts_with("data:")
    {
        return None;
    }

    base.join(href)
        .ok()
        .filter(|url| url.scheme() == "http" || url.scheme() == "https")
}

fn text_of(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

fn has_match(scope: ElementRef<'_>, css: &str) -> bool {
    Selector::parse(css)
        .map(|selector| scope.select(&selector).next().is_some())
        .unwrap_or(false)
}

/// Text of the first element matching any selector, in selector order
fn first_text(scope: ElementRef<'_>, selectors: &[&str]) -> Option<String> {
    selectors
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .find_map(|selector| {
            scope
                .select(&selector)
                .map(text_of)
                .find(|text| !text.is_empty())
        })
}

fn first_attr(scope: ElementRef<'_>, selectors: &[&str], attr: &str) -> Option<String> {
    selectors
        .iter()
        .filter_map(|css| Selector::parse(css).ok())
        .find_map(|selector| {
            scope
                .select(&selector)
                .filter_map(|el| el.value().attr(attr))
                .map(|v| v.trim().to_string())
                .find(|v| !v.is_empty())
        })
}

fn meta_contents(document: &Html, property: &str) -> Vec<String> {
    let css = format!(r#"meta[property="{}"][content]"#, property);
    let Ok(selector) = Selector::parse(&css) else {
        return Vec::new();
    };
    document
        .select(&selector)
        .filter_map(|el| el.value().attr("content"))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

fn meta_content(document: &Html, property: &str) -> Option<String> {
    meta_contents(document, property).into_iter().next()
}
