use crate::config::types::{CommunityConfig, Config, CrawlerConfig, OutputConfig, UserAgentConfig};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_output_config(&config.output)?;
    validate_communities(&config.communities)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.workers < 1 || config.workers > 64 {
        return Err(ConfigError::Validation(format!(
            "workers must be between 1 and 64, got {}",
            config.workers
        )));
    }

    if config.requests_per_second < 1 || config.requests_per_second > 100 {
        return Err(ConfigError::Validation(format!(
            "requests-per-second must be between 1 and 100, got {}",
            config.requests_per_second
        )));
    }

    if config.burst < 1 || config.burst > config.requests_per_second {
        return Err(ConfigError::Validation(format!(
            "burst must be between 1 and requests-per-second ({}), got {}",
            config.requests_per_second, config.burst
        )));
    }

    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max-attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.backoff_max_ms < config.backoff_base_ms {
        return Err(ConfigError::Validation(format!(
            "backoff-max-ms ({}) must be >= backoff-base-ms ({})",
            config.backoff_max_ms, config.backoff_base_ms
        )));
    }

    if !(0.0..=1.0).contains(&config.jitter) {
        return Err(ConfigError::Validation(format!(
            "jitter must be between 0.0 and 1.0, got {}",
            config.jitter
        )));
    }

    if config.visibility_timeout_secs < 1 || config.stale_after_secs < 1 {
        return Err(ConfigError::Validation(
            "visibility-timeout-secs and stale-after-secs must be >= 1".to_string(),
        ));
    }

    if config.stale_after_secs < config.visibility_timeout_secs {
        return Err(ConfigError::Validation(format!(
            "stale-after-secs ({}) must be >= visibility-timeout-secs ({})",
            config.stale_after_secs, config.visibility_timeout_secs
        )));
    }

    if config.reconcile_interval_secs < 1 {
        return Err(ConfigError::Validation(
            "reconcile-interval-secs must be >= 1".to_string(),
        ));
    }

    if config.request_timeout_secs < 1 {
        return Err(ConfigError::Validation(
            "request-timeout-secs must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    // Crawler name: non-empty, alphanumeric + hyphens only
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler-name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler-name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact-url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates output configuration
fn validate_output_config(config: &OutputConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database-path cannot be empty".to_string(),
        ));
    }

    if config.export_path.is_empty() {
        return Err(ConfigError::Validation(
            "export-path cannot be empty".to_string(),
        ));
    }

    Ok(())
}

/// Validates community entries
///
/// Every seed must be an absolute http(s) URL served from the community's
/// own host, and community ids must be unique.
fn validate_communities(communities: &[CommunityConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();

    for community in communities {
        if community.id.is_empty()
            || !community
                .id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::Validation(format!(
                "community id '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                community.id
            )));
        }

        if !seen.insert(community.id.as_str()) {
            return Err(ConfigError::Validation(format!(
                "duplicate community id '{}'",
                community.id
            )));
        }

        validate_host(&community.host)?;

        if community.seeds.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Community '{}' must have at least one seed URL",
                community.id
            )));
        }

        for seed in &community.seeds {
            let url = Url::parse(seed).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed, e))
            })?;

            if url.scheme() != "https" && url.scheme() != "http" {
                return Err(ConfigError::Validation(format!(
                    "Seed URL '{}' must use http or https",
                    seed
                )));
            }

            let seed_host = url.host_str().unwrap_or_default();
            if !crate::url::same_host(seed_host, &community.host) {
                return Err(ConfigError::Validation(format!(
                    "Seed URL '{}' is not on community host '{}'",
                    seed, community.host
                )));
            }
        }

        if let Some(query) = &community.entry_query {
            if query.is_empty() || query.starts_with('?') || query.contains('#') {
                return Err(ConfigError::Validation(format!(
                    "entry-query for '{}' must look like 'key=value', got '{}'",
                    community.id, query
                )));
            }

            let stripped = url::form_urlencoded::parse(query.as_bytes())
                .map(|(key, _)| key)
                .find(|key| crate::url::is_tracking_param(key));
            if let Some(key) = stripped {
                return Err(ConfigError::Validation(format!(
                    "entry-query for '{}' uses '{}', which URL normalization removes",
                    community.id, key
                )));
            }
        }
    }

    Ok(())
}

/// Validates a community host name
fn validate_host(host: &str) -> Result<(), ConfigError> {
    if host.is_empty() {
        return Err(ConfigError::InvalidHost("Host cannot be empty".to_string()));
    }

    if !host
        .chars()
        .all(|c| c.is_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidHost(format!(
            "Host '{}' contains invalid characters",
            host
        )));
    }

    if host.starts_with('.') || host.ends_with('.') || host.starts_with('-') || host.ends_with('-')
    {
        return Err(ConfigError::InvalidHost(format!(
            "Host '{}' cannot start or end with '.' or '-'",
            host
        )));
    }

    if host.contains("..") {
        return Err(ConfigError::InvalidHost(format!(
            "Host '{}' cannot contain consecutive dots",
            host
        )));
    }

    Ok(())
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    let Some((local, domain)) = email.split_once('@') else {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    };

    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !domain.contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn community(host: &str, seed: &str) -> CommunityConfig {
        CommunityConfig {
            id: "ftm".to_string(),
            display_name: "FTM".to_string(),
            host: host.to_string(),
            seeds: vec![seed.to_string()],
            entry_query: None,
        }
    }

    #[test]
    fn test_validate_host() {
        assert!(validate_host("ftm.livejournal.com").is_ok());
        assert!(validate_host("127.0.0.1").is_ok());
        assert!(validate_host("localhost").is_ok());

        assert!(validate_host("").is_err());
        assert!(validate_host(".example.com").is_err());
        assert!(validate_host("example.com.").is_err());
        assert!(validate_host("exa mple.com").is_err());
        assert!(validate_host("a..b").is_err());
    }

    #[test]
    fn test_validate_email() {
        assert!(validate_email("user@example.com").is_ok());
        assert!(validate_email("admin@sub.example.com").is_ok());

        assert!(validate_email("").is_err());
        assert!(validate_email("invalid").is_err());
        assert!(validate_email("@example.com").is_err());
        assert!(validate_email("user@").is_err());
        assert!(validate_email("user@domain").is_err());
        assert!(validate_email("a@b@c.com").is_err());
    }

    #[test]
    fn test_burst_cannot_exceed_rate() {
        let config = CrawlerConfig {
            requests_per_second: 5,
            burst: 6,
            ..CrawlerConfig::default()
        };
        assert!(validate_crawler_config(&config).is_err());

        let config = CrawlerConfig {
            requests_per_second: 5,
            burst: 5,
            ..CrawlerConfig::default()
        };
        assert!(validate_crawler_config(&config).is_ok());
    }

    #[test]
    fn test_jitter_range() {
        let config = CrawlerConfig {
            jitter: 1.5,
            ..CrawlerConfig::default()
        };
        assert!(validate_crawler_config(&config).is_err());
    }

    #[test]
    fn test_seed_must_be_on_community_host() {
        let ok = community("ftm.livejournal.com", "https://ftm.livejournal.com/");
        assert!(validate_communities(&[ok]).is_ok());

        let www = community("ftm.livejournal.com", "https://www.ftm.livejournal.com/");
        assert!(validate_communities(&[www]).is_ok());

        let foreign = community("ftm.livejournal.com", "https://other.livejournal.com/");
        assert!(validate_communities(&[foreign]).is_err());
    }

    #[test]
    fn test_duplicate_community_ids() {
        let a = community("a.example.com", "https://a.example.com/");
        let b = community("a.example.com", "https://a.example.com/?skip=10");
        assert!(validate_communities(&[a, b]).is_err());
    }

    #[test]
    fn test_entry_query_shape() {
        let mut c = community("ftm.livejournal.com", "https://ftm.livejournal.com/");
        c.entry_query = Some("?nojs=1".to_string());
        assert!(validate_communities(&[c]).is_err());
    }

    #[test]
    fn test_entry_query_must_survive_normalization() {
        let mut c = community("ftm.livejournal.com", "https://ftm.livejournal.com/");
        c.entry_query = Some("style=mine&nojs=1".to_string());
        assert!(validate_communities(&[c.clone()]).is_ok());

        c.entry_query = Some("nojs=1&utm_source=feed".to_string());
        let err = validate_communities(&[c]).unwrap_err();
        assert!(err.to_string().contains("utm_source"));
    }
}
