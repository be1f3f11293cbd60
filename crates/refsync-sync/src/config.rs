use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapMode {
    Seed,
    Upstream,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub bind_addr: String,
    pub internal_token: String,
    pub allowed_origins: Vec<String>,
    pub bootstrap_mode: BootstrapMode,
    pub seed_path: PathBuf,
    pub upstream_url: Option<String>,
    pub nightly_enabled: bool,
    pub nightly_cron: String,
    pub http_timeout_secs: u64,
    pub status_ttl: Duration,
    pub auto_migrate: bool,
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim(), "1" | "true" | "TRUE" | "True" | "yes")
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup; unset or unparsable values fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_blank = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            database_url: non_blank("DATABASE_URL"),
            bind_addr: non_blank("REFSYNC_BIND").unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            internal_token: lookup("REFSYNC_INTERNAL_TOKEN").unwrap_or_default(),
            allowed_origins: lookup("REFSYNC_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(str::trim)
                        .filter(|o| !o.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            bootstrap_mode: match lookup("REFSYNC_BOOTSTRAP_MODE").as_deref().map(str::trim) {
                Some("upstream") => BootstrapMode::Upstream,
                _ => BootstrapMode::Seed,
            },
            seed_path: non_blank("REFSYNC_SEED_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./seed/seed-data.json")),
            upstream_url: non_blank("REFSYNC_UPSTREAM_URL"),
            nightly_enabled: lookup("REFSYNC_NIGHTLY_ENABLED")
                .map(|v| parse_flag(&v))
                .unwrap_or(true),
            nightly_cron: non_blank("REFSYNC_NIGHTLY_CRON").unwrap_or_else(|| "0 0 3 * * *".to_string()),
            http_timeout_secs: lookup("REFSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(20),
            status_ttl: Duration::from_millis(
                lookup("REFSYNC_STATUS_TTL_MS")
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(2000),
            ),
            auto_migrate: lookup("REFSYNC_AUTO_MIGRATE")
                .map(|v| parse_flag(&v))
                .unwrap_or(false),
        }
    }

    /// Misconfigurations worth a startup warning. None of them stop the process.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.database_url.is_none() {
            out.push("DATABASE_URL is not set; using the in-memory store".to_string());
        }
        let token = self.internal_token.trim();
        if token.is_empty() {
            out.push("REFSYNC_INTERNAL_TOKEN is empty; /internal endpoints will reject every call".to_string());
        } else if token.to_ascii_lowercase().starts_with("change-me") {
            out.push("REFSYNC_INTERNAL_TOKEN still has its placeholder value".to_string());
        }
        if self.allowed_origins.is_empty() {
            out.push("REFSYNC_ALLOWED_ORIGINS is empty; browsers cannot call the API cross-origin".to_string());
        } else if self.allowed_origins.iter().any(|o| o == "*") {
            out.push("REFSYNC_ALLOWED_ORIGINS contains '*'".to_string());
        }
        if self.bootstrap_mode == BootstrapMode::Upstream && self.upstream_url.is_none() {
            out.push("REFSYNC_BOOTSTRAP_MODE=upstream but REFSYNC_UPSTREAM_URL is not set".to_string());
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> SyncConfig {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SyncConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.database_url, None);
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.bootstrap_mode, BootstrapMode::Seed);
        assert_eq!(config.seed_path, PathBuf::from("./seed/seed-data.json"));
        assert!(config.nightly_enabled);
        assert_eq!(config.nightly_cron, "0 0 3 * * *");
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.status_ttl, Duration::from_millis(2000));
        assert!(!config.auto_migrate);
    }

    #[test]
    fn values_are_parsed_with_fallbacks() {
        let config = config_from(&[
            ("DATABASE_URL", "postgres://refsync@localhost/refsync"),
            ("REFSYNC_ALLOWED_ORIGINS", "https://a.example, ,https://b.example"),
            ("REFSYNC_BOOTSTRAP_MODE", "upstream"),
            ("REFSYNC_NIGHTLY_ENABLED", "false"),
            ("REFSYNC_HTTP_TIMEOUT_SECS", "not-a-number"),
            ("REFSYNC_STATUS_TTL_MS", "250"),
            ("REFSYNC_AUTO_MIGRATE", "1"),
        ]);
        assert!(config.database_url.is_some());
        assert_eq!(config.allowed_origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(config.bootstrap_mode, BootstrapMode::Upstream);
        assert!(!config.nightly_enabled);
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.status_ttl, Duration::from_millis(250));
        assert!(config.auto_migrate);
    }

    #[test]
    fn warnings_flag_unsafe_settings() {
        let warnings = config_from(&[
            ("REFSYNC_INTERNAL_TOKEN", "change-me-please"),
            ("REFSYNC_ALLOWED_ORIGINS", "*"),
        ])
        .warnings();
        assert_eq!(warnings.len(), 3);
        assert!(warnings.iter().any(|w| w.contains("placeholder")));
        assert!(warnings.iter().any(|w| w.contains("'*'")));

        let clean = config_from(&[
            ("DATABASE_URL", "postgres://x"),
            ("REFSYNC_INTERNAL_TOKEN", "s3cret"),
            ("REFSYNC_ALLOWED_ORIGINS", "https://a.example"),
        ]);
        assert!(clean.warnings().is_empty());
    }
}
