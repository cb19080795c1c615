//! Integration tests for the crawler
//!
//! These tests use wiremock to serve a small community archive and run
//! the full crawl cycle end-to-end against a temporary database.

use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sumi_corpus::config::{CommunityConfig, Config, CrawlerConfig, OutputConfig, UserAgentConfig};
use sumi_corpus::corpus::{Assembler, Entry, EntryKind};
use sumi_corpus::crawler::{
    parse_page, Coordinator, Discovery, DispatchQueue, Frontier, RawPage,
};
use sumi_corpus::output::export_entries;
use sumi_corpus::storage::{self, SqliteStorage, Storage};
use sumi_corpus::{dedup_key, FrontierStatus, PageKind};
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

/// Creates a test configuration for one community served by the mock server
fn create_test_config(base_url: &str, seeds: Vec<String>, db_path: &Path) -> Config {
    let host = url::Url::parse(base_url)
        .expect("Failed to parse base URL")
        .host_str()
        .expect("Failed to extract host")
        .to_string();

    Config {
        crawler: CrawlerConfig {
            workers: 2,
            requests_per_second: 20,
            burst: 5,
            max_attempts: 5,
            backoff_base_ms: 10,
            backoff_max_ms: 50,
            jitter: 0.1,
            visibility_timeout_secs: 30,
            stale_after_secs: 60,
            reconcile_interval_secs: 1,
            poll_interval_ms: 20,
            request_timeout_secs: 5,
            cookie: None,
        },
        user_agent: UserAgentConfig {
            crawler_name: "TestBot".to_string(),
            crawler_version: "1.0.0".to_string(),
            contact_url: "https://example.com/contact".to_string(),
            contact_email: "test@example.com".to_string(),
        },
        output: OutputConfig {
            database_path: db_path.to_string_lossy().to_string(),
            export_path: db_path.with_extension("jsonl").to_string_lossy().to_string(),
        },
        communities: vec![CommunityConfig {
            id: "test".to_string(),
            display_name: "Test Community".to_string(),
            host,
            seeds,
            entry_query: None,
        }],
    }
}

fn html(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_string(body)
        .insert_header("content-type", "text/html")
}

fn comment(id: &str, indent: u32, date: &str, text: &str) -> String {
    format!(
        r#"<div id="ljcmt{id}" style="margin-left: {indent}px">
             <a class="comment-permalink">{date}</a>
             <div class="comment-text">{text}</div>
           </div>"#
    )
}

/// Mounts an index, two posts and one expanded comment thread
async fn mount_site(server: &MockServer) {
    let base = server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(
            r#"<html><body>
               <a href="{base}/100.html">First</a>
               <a href="{base}/200.html">Second</a>
               <a href="https://elsewhere.example.com/1.html">Elsewhere</a>
               </body></html>"#
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/100.html"))
        .and(query_param("thread", "501"))
        .respond_with(html(format!(
            "<html><body>{}{}{}{}</body></html>",
            comment("501", 0, "2008-03-01 01:00 pm (UTC)", "Top comment"),
            comment("502", 25, "2008-03-01 02:00 pm (UTC)", "Reply"),
            comment("503", 50, "2008-03-01 03:00 pm (UTC)", "Hidden reply"),
            comment("504", 75, "2008-03-01 04:00 pm (UTC)", "Deep reply"),
        )))
        .with_priority(1)
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/100.html"))
        .respond_with(html(format!(
            r#"<html><head><meta property="og:title" content="First post"></head><body>
               <div class="entry-text">
                 <div class="entry-date"><abbr title="2008-03-01 12:00:00">March 1st</abbr></div>
                 <span class="username"><b>alice</b></span>
                 <div class="entry-content">Post body</div>
               </div>
               {}{}
               <div id="ljcmt503" style="margin-left: 50px"></div>
               </body></html>"#,
            comment("501", 0, "2008-03-01 01:00 pm (UTC)", "Top comment"),
            comment("502", 25, "2008-03-01 02:00 pm (UTC)", "Reply"),
        )))
        .mount(server)
        .await;

    Mock::given(method("GET"))
        .and(path("/200.html"))
        .respond_with(html(
            r#"<html><head><meta property="og:title" content="Earlier post"></head><body>
               <div class="entry-text">
                 <div class="entry-date"><abbr title="2008-02-01 09:30:00">February 1st</abbr></div>
                 <div class="entry-content">Older body</div>
               </div>
               </body></html>"#
                .to_string(),
        ))
        .mount(server)
        .await;
}

fn export_all(db_path: &Path) -> Vec<Entry> {
    let storage = SqliteStorage::new(db_path).expect("Failed to open database");
    let mut out = Vec::new();
    export_entries(&storage, None, &mut out).expect("Export failed");
    String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect()
}

#[tokio::test]
async fn test_full_crawl_assembles_threads() {
    let mock_server = MockServer::start().await;
    mount_site(&mock_server).await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let config = create_test_config(
        &mock_server.uri(),
        vec![format!("{}/", mock_server.uri())],
        &db_path,
    );

    let coordinator = Coordinator::new(config, "test-hash", true).expect("Failed to create coordinator");
    let report = coordinator.run().await.expect("Crawl failed");
    drop(coordinator);

    assert!(!report.interrupted);
    assert_eq!(report.pages_done, 4);
    assert_eq!(report.pages_failed, 0);
    assert_eq!(report.dangling_unresolved, 0);

    let entries = export_all(&db_path);
    let ids: Vec<&str> = entries.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["200", "100", "501", "502", "503", "504"]);

    let post = &entries[1];
    assert_eq!(post.kind, EntryKind::Post);
    assert_eq!(post.content, "Post body");
    assert_eq!(post.metadata["author"].as_text(), Some("alice"));

    for comment in &entries[2..] {
        assert_eq!(comment.kind, EntryKind::Comment);
        assert_eq!(comment.post_id, "100");
        assert_eq!(comment.thread_id, "501", "thread of {}", comment.id);
    }

    // The collapsed placeholder was superseded by its expanded version
    let hidden = &entries[4];
    assert_eq!(hidden.content, "Hidden reply");
    assert_eq!(hidden.parent_id.as_deref(), Some("502"));
    assert_eq!(entries[5].parent_id.as_deref(), Some("503"));

    let storage = SqliteStorage::new(&db_path).unwrap();
    let by_status = storage.count_frontier_by_status().unwrap();
    assert_eq!(by_status.get(&FrontierStatus::Done), Some(&4));
    assert_eq!(storage.count_tasks().unwrap(), 0);
    assert!(storage.list_failures().unwrap().is_empty());
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/300.html"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(3)
        .with_priority(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/300.html"))
        .respond_with(html(
            r#"<html><head><meta property="og:title" content="Flaky"></head><body>
               <div class="entry-text">
                 <div class="entry-date"><abbr title="2008-04-01 10:00:00">April</abbr></div>
                 <div class="entry-content">Eventually served</div>
               </div></body></html>"#
                .to_string(),
        ))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let seed = format!("{}/300.html", base);
    let config = create_test_config(&base, vec![seed.clone()], &db_path);

    let coordinator = Coordinator::new(config, "test-hash", true).unwrap();
    let report = coordinator.run().await.unwrap();
    drop(coordinator);

    assert_eq!(report.retries, 3);
    assert_eq!(report.pages_done, 1);
    assert_eq!(report.pages_failed, 0);

    let entries = export_all(&db_path);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].content, "Eventually served");

    let storage = SqliteStorage::new(&db_path).unwrap();
    let record = storage.get_frontier(&dedup_key(&seed)).unwrap().unwrap();
    assert_eq!(record.status, FrontierStatus::Done);
    assert!(storage.list_failures().unwrap().is_empty());
}

#[tokio::test]
async fn test_permanent_failure_is_recorded() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(html(format!(r#"<a href="{base}/404.html">Gone</a>"#)))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/404.html"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let config = create_test_config(&base, vec![format!("{}/", base)], &db_path);

    let coordinator = Coordinator::new(config, "test-hash", true).unwrap();
    let report = coordinator.run().await.unwrap();
    drop(coordinator);

    assert_eq!(report.pages_done, 1);
    assert_eq!(report.pages_failed, 1);
    assert_eq!(report.retries, 0);

    let storage = SqliteStorage::new(&db_path).unwrap();
    let failures = storage.list_failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_class, "permanent");
    assert_eq!(failures[0].kind, Some(PageKind::Post));
    assert!(failures[0].message.contains("404"));

    let record = storage
        .get_frontier(&dedup_key(&format!("{}/404.html", base)))
        .unwrap()
        .unwrap();
    assert_eq!(record.status, FrontierStatus::FailedPermanent);

    // Only the 404 was requested once; failures are never retried
    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.iter().filter(|r| r.url.path() == "/404.html").count(), 1);
}

#[tokio::test]
async fn test_index_page_enqueues_posts_once() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let shared = storage::share(SqliteStorage::new(&db_path).unwrap());
    let queue = DispatchQueue::new(shared.clone(), Duration::from_secs(60));
    let frontier = Frontier::new(shared.clone(), queue.clone(), Duration::from_secs(300));

    let config = create_test_config("https://idx.example.com", vec![], &db_path);
    let community = &config.communities[0];
    let now = Utc::now();

    let index = "https://idx.example.com/";
    frontier
        .discover(index, PageKind::Index, "seed", &community.id, now)
        .unwrap();
    let task = frontier.lease(1, now).unwrap().pop().unwrap();

    let page = RawPage {
        url: task.url.clone(),
        final_url: task.url.clone(),
        status_code: 200,
        body: r#"<a href="/1.html">one</a> <a href="/2.html#comments">two</a>"#.to_string(),
    };
    let parsed = parse_page(&page, task.kind, community).unwrap();
    assert!(parsed.entries.is_empty());
    assert_eq!(parsed.links.len(), 2);

    for link in &parsed.links {
        let discovery = frontier
            .discover(&link.url, link.kind, &task.url, &community.id, now)
            .unwrap();
        assert!(matches!(discovery, Discovery::New(_)));
    }
    frontier
        .complete(&task.url, sumi_corpus::crawler::Completion::Done, now)
        .unwrap();
    queue.ack(&task).unwrap();

    // Seeing the same page again changes nothing
    for link in &parsed.links {
        let again = frontier
            .discover(&link.url, link.kind, &task.url, &community.id, now)
            .unwrap();
        assert_eq!(again, Discovery::Duplicate);
    }
    assert_eq!(
        frontier.discover(index, PageKind::Index, "seed", &community.id, now).unwrap(),
        Discovery::Duplicate
    );

    assert_eq!(frontier.status(index).unwrap(), Some(FrontierStatus::Done));
    assert_eq!(
        frontier.status("https://idx.example.com/1.html").unwrap(),
        Some(FrontierStatus::Enqueued)
    );
    assert_eq!(
        frontier.status("https://idx.example.com/2.html").unwrap(),
        Some(FrontierStatus::Enqueued)
    );
    assert_eq!(queue.outstanding().unwrap(), 2);
}

#[tokio::test]
async fn test_recrawl_leaves_corpus_unchanged() {
    let mock_server = MockServer::start().await;
    mount_site(&mock_server).await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let seeds = vec![format!("{}/", mock_server.uri())];

    let first = Coordinator::new(
        create_test_config(&mock_server.uri(), seeds.clone(), &db_path),
        "test-hash",
        true,
    )
    .unwrap();
    first.run().await.unwrap();
    drop(first);
    let before = export_all(&db_path);

    // A fresh run redelivers every page against the stored corpus
    let second = Coordinator::new(
        create_test_config(&mock_server.uri(), seeds, &db_path),
        "test-hash",
        true,
    )
    .unwrap();
    let report = second.run().await.unwrap();
    drop(second);

    assert_eq!(report.pages_done, 4);
    assert_eq!(report.entries_changed, 0);
    assert_eq!(export_all(&db_path), before);
}

#[tokio::test]
async fn test_reparse_of_same_page_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let shared = storage::share(SqliteStorage::new(&db_path).unwrap());
    let assembler = Assembler::new(shared.clone());

    let config = create_test_config("https://ftm.example.com", vec![], &db_path);
    let page = RawPage {
        url: "https://ftm.example.com/7.html".to_string(),
        final_url: "https://ftm.example.com/7.html".to_string(),
        status_code: 200,
        body: format!(
            r#"<div class="entry-text"><div class="entry-content">Body</div>
               <div class="entry-date"><abbr title="2008-05-05 05:05:05">May</abbr></div></div>{}{}"#,
            comment("71", 0, "2008-05-05 06:00 am (UTC)", "First"),
            comment("72", 25, "2008-05-05 07:00 am (UTC)", "Second"),
        ),
    };

    let parsed = parse_page(&page, PageKind::Post, &config.communities[0]).unwrap();
    for fragment in &parsed.entries {
        assembler.merge(fragment.clone()).unwrap();
    }
    let first = {
        let store = storage::lock(&shared).unwrap();
        store
            .query_entries(&sumi_corpus::storage::EntryQuery {
                limit: 100,
                ..Default::default()
            })
            .unwrap()
            .entries
    };

    for fragment in &parsed.entries {
        let result = assembler.merge(fragment.clone()).unwrap();
        assert_eq!(result.outcome, sumi_corpus::corpus::MergeOutcome::Unchanged);
    }
    let second = {
        let store = storage::lock(&shared).unwrap();
        store
            .query_entries(&sumi_corpus::storage::EntryQuery {
                limit: 100,
                ..Default::default()
            })
            .unwrap()
            .entries
    };

    assert_eq!(first.len(), 3);
    assert_eq!(first, second);
}

/// Responds with `template`, logging when each request arrived
fn recorded(times: &Arc<Mutex<Vec<Instant>>>, template: ResponseTemplate) -> impl Respond {
    let times = times.clone();
    move |_: &Request| {
        times.lock().unwrap().push(Instant::now());
        template.clone()
    }
}

/// Largest number of instants falling in any span shorter than `span`
fn max_in_span(mut times: Vec<Instant>, span: Duration) -> usize {
    times.sort();
    let mut best = 0;
    let mut start = 0;
    for end in 0..times.len() {
        while times[end].duration_since(times[start]) >= span {
            start += 1;
        }
        best = best.max(end - start + 1);
    }
    best
}

fn simple_post(title: &str, minute: u32) -> String {
    format!(
        r#"<html><head><meta property="og:title" content="{title}"></head><body>
           <div class="entry-text">
             <div class="entry-date"><abbr title="2008-06-01 10:{minute:02}:00">June</abbr></div>
             <div class="entry-content">{title} body</div>
           </div></body></html>"#
    )
}

#[tokio::test]
async fn test_request_rate_holds_across_retries_and_redirects() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();
    let arrivals = Arc::new(Mutex::new(Vec::new()));

    let links: String = (1..=5)
        .chain([7])
        .map(|id| format!(r#"<a href="{base}/{id}.html">post {id}</a>"#))
        .collect();
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(recorded(&arrivals, html(links)))
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/3.html"))
        .respond_with(recorded(&arrivals, ResponseTemplate::new(503)))
        .up_to_n_times(2)
        .with_priority(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/7.html"))
        .respond_with(recorded(
            &arrivals,
            ResponseTemplate::new(302).insert_header("location", "/8.html"),
        ))
        .mount(&mock_server)
        .await;

    for id in [1, 2, 3, 4, 5, 8] {
        Mock::given(method("GET"))
            .and(path(format!("/{}.html", id)))
            .respond_with(recorded(&arrivals, html(simple_post(&format!("Post {}", id), id))))
            .mount(&mock_server)
            .await;
    }

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let mut config = create_test_config(&base, vec![format!("{}/", base)], &db_path);
    config.crawler.workers = 4;
    config.crawler.requests_per_second = 3;
    config.crawler.burst = 1;

    let coordinator = Coordinator::new(config, "test-hash", true).unwrap();
    let report = coordinator.run().await.unwrap();
    drop(coordinator);

    assert_eq!(report.pages_done, 7);
    assert_eq!(report.retries, 2);

    // Index, six posts, two 503s and one redirect hop
    let times = arrivals.lock().unwrap().clone();
    assert_eq!(times.len(), 10);
    // Slightly under a second absorbs delivery jitter between issue and arrival
    assert!(max_in_span(times, Duration::from_millis(900)) <= 3);

    let entries = export_all(&db_path);
    let redirected = entries.iter().find(|e| e.post_id == "7").unwrap();
    assert_eq!(redirected.content, "Post 8 body");
}

#[tokio::test]
async fn test_unresolved_reference_listed_once_across_runs() {
    let mock_server = MockServer::start().await;
    let base = mock_server.uri();

    Mock::given(method("GET"))
        .and(path("/100.html"))
        .respond_with(html(format!(
            r#"<html><body>
               <div class="entry-text">
                 <div class="entry-date"><abbr title="2008-03-01 12:00:00">March</abbr></div>
                 <div class="entry-content">Post body</div>
               </div>
               <div id="ljcmt601" style="margin-left: 25px">
                 <a class="comment-permalink">2008-03-01 01:00 pm (UTC)</a>
                 <div class="comment-text">Reply to a vanished comment</div>
                 <a href="{base}/100.html?thread=999#t999">Parent</a>
               </div>
               </body></html>"#
        )))
        .mount(&mock_server)
        .await;

    let dir = TempDir::new().unwrap();
    let db_path = dir.path().join("corpus.db");
    let seeds = vec![format!("{}/100.html", base)];

    for fresh in [true, false, false] {
        let coordinator = Coordinator::new(
            create_test_config(&base, seeds.clone(), &db_path),
            "test-hash",
            fresh,
        )
        .unwrap();
        let report = coordinator.run().await.unwrap();
        drop(coordinator);
        assert_eq!(report.dangling_unresolved, 1);
    }

    let storage = SqliteStorage::new(&db_path).unwrap();
    let failures = storage.list_failures().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].error_class, "dangling_reference");
    assert_eq!(failures[0].url, "test/100/601");
}
