use std::{path::PathBuf, time::Duration};

use crate::orchestrator::DEFAULT_CREDENTIAL_KEYWORDS;

const DEFAULT_PORT: u16 = 10000;
const DEFAULT_DOWNLOAD_DIR: &str = "downloads";
const DEFAULT_COOKIE_FILE: &str = "cookies.txt";
const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
const DEFAULT_FILE_EXPIRY_SECONDS: u64 = 2 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 5 * 60;

/// Process configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub cookie_file: PathBuf,
    pub yt_dlp_bin: String,
    pub file_expiry: Duration,
    pub sweep_interval: Duration,
    pub credential_keywords: Vec<String>,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source so tests
    /// never have to mutate the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |name: &str| {
            lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string))
        };
        let read_secs = |name: &str, default: u64| {
            read(name)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
                .map(Duration::from_secs)
                .unwrap_or(Duration::from_secs(default))
        };

        let bind_addr = read("APP_ADDR").unwrap_or_else(|| {
            let port = read("PORT")
                .and_then(|value| value.parse::<u16>().ok())
                .unwrap_or(DEFAULT_PORT);
            format!("0.0.0.0:{port}")
        });

        let credential_keywords = read("CREDENTIAL_KEYWORDS")
            .map(|value| split_list(&value))
            .filter(|keywords| !keywords.is_empty())
            .unwrap_or_else(|| {
                DEFAULT_CREDENTIAL_KEYWORDS
                    .iter()
                    .map(ToString::to_string)
                    .collect()
            });

        Self {
            bind_addr,
            download_dir: PathBuf::from(
                read("DOWNLOAD_DIR").unwrap_or_else(|| DEFAULT_DOWNLOAD_DIR.to_string()),
            ),
            cookie_file: PathBuf::from(
                read("COOKIE_FILE").unwrap_or_else(|| DEFAULT_COOKIE_FILE.to_string()),
            ),
            yt_dlp_bin: read("YT_DLP_BIN").unwrap_or_else(|| DEFAULT_YT_DLP_BIN.to_string()),
            file_expiry: read_secs("FILE_EXPIRY_SECONDS", DEFAULT_FILE_EXPIRY_SECONDS),
            sweep_interval: read_secs("SWEEP_INTERVAL_SECONDS", DEFAULT_SWEEP_INTERVAL_SECONDS),
            credential_keywords,
            allowed_origins: read("ALLOWED_ORIGINS")
                .map(|value| split_list(&value))
                .unwrap_or_default(),
        }
    }

    /// Human readable retention window, echoed to callers as `expires_in`.
    pub fn expiry_label(&self) -> String {
        describe_duration(self.file_expiry)
    }
}

fn describe_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (amount, unit) = if secs % 3600 == 0 {
        (secs / 3600, "hour")
    } else if secs % 60 == 0 {
        (secs / 60, "minute")
    } else {
        (secs, "second")
    };

    if amount == 1 {
        format!("1 {unit}")
    } else {
        format!("{amount} {unit}s")
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToString::to_string)
        .collect()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = config_from(&[]);
        assert_eq!(config.bind_addr, "0.0.0.0:10000");
        assert_eq!(config.download_dir, PathBuf::from("downloads"));
        assert_eq!(config.cookie_file, PathBuf::from("cookies.txt"));
        assert_eq!(config.yt_dlp_bin, "yt-dlp");
        assert_eq!(config.file_expiry, Duration::from_secs(7200));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));
        assert_eq!(config.credential_keywords.len(), DEFAULT_CREDENTIAL_KEYWORDS.len());
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.expiry_label(), "2 hours");
    }

    #[test]
    fn port_selects_listening_port_on_all_interfaces() {
        assert_eq!(config_from(&[("PORT", "8080")]).bind_addr, "0.0.0.0:8080");
        assert_eq!(config_from(&[("PORT", "nope")]).bind_addr, "0.0.0.0:10000");
        assert_eq!(
            config_from(&[("PORT", "8080"), ("APP_ADDR", "127.0.0.1:9000")]).bind_addr,
            "127.0.0.1:9000"
        );
    }

    #[test]
    fn durations_ignore_zero_and_garbage() {
        let config = config_from(&[
            ("FILE_EXPIRY_SECONDS", "0"),
            ("SWEEP_INTERVAL_SECONDS", "soon"),
        ]);
        assert_eq!(config.file_expiry, Duration::from_secs(7200));
        assert_eq!(config.sweep_interval, Duration::from_secs(300));

        let config = config_from(&[("FILE_EXPIRY_SECONDS", "5400")]);
        assert_eq!(config.file_expiry, Duration::from_secs(5400));
        assert_eq!(config.expiry_label(), "90 minutes");
    }

    #[test]
    fn keyword_and_origin_lists_are_comma_separated() {
        let config = config_from(&[
            ("CREDENTIAL_KEYWORDS", " login required , ,captcha"),
            ("ALLOWED_ORIGINS", "https://a.example, https://b.example"),
        ]);
        assert_eq!(config.credential_keywords, vec!["login required", "captcha"]);
        assert_eq!(
            config.allowed_origins,
            vec!["https://a.example", "https://b.example"]
        );

        let config = config_from(&[("CREDENTIAL_KEYWORDS", " , ")]);
        assert_eq!(config.credential_keywords.len(), DEFAULT_CREDENTIAL_KEYWORDS.len());
    }

    #[test]
    fn describe_duration_picks_the_largest_whole_unit() {
        assert_eq!(describe_duration(Duration::from_secs(3600)), "1 hour");
        assert_eq!(describe_duration(Duration::from_secs(60)), "1 minute");
        assert_eq!(describe_duration(Duration::from_secs(45)), "45 seconds");
    }
}
