use std::cmp;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_concurrent_downloads")]
    pub concurrent_downloads: usize,

    #[serde(default = "default_num_writers")]
    pub num_writers: usize,

    #[serde(default = "default_job_buffer")]
    pub job_buffer: usize,

    #[serde(default = "default_handle_sigint")]
    pub handle_sigint: bool,

    #[serde(default = "default_on_dl_error")]
    pub on_dl_error: OnError,

    #[serde(default = "default_on_listing_error")]
    pub on_listing_error: OnError,

    #[serde(default = "default_on_write_error")]
    pub on_write_error: OnError,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            concurrent_downloads: default_concurrent_downloads(),
            num_writers: default_num_writers(),
            job_buffer: default_job_buffer(),
            handle_sigint: default_handle_sigint(),
            on_dl_error: default_on_dl_error(),
            on_listing_error: default_on_listing_error(),
            on_write_error: default_on_write_error(),
        }
    }
}

fn default_user_agent() -> String {
    String::from("websync")
}

fn default_concurrent_downloads() -> usize {
    10
}

fn default_num_writers() -> usize {
    cmp::max(1, num_cpus::get().saturating_sub(2))
}

fn default_job_buffer() -> usize {
    64
}

fn default_handle_sigint() -> bool {
    true
}

fn default_on_dl_error() -> OnError {
    OnError::SkipAndLog
}

fn default_on_listing_error() -> OnError {
    OnError::SkipAndLog
}

fn default_on_write_error() -> OnError {
    OnError::SkipAndLog
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum OnError {
    Fail,
    SkipAndLog,
}

/// One crawl target: a remote listing and the local directory mirroring it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteConfig {
    pub url: String,

    #[serde(default = "default_output")]
    pub output: PathBuf,

    /// Listing entries matching this regex are dropped, directories included.
    #[serde(default)]
    pub exclude: Option<String>,

    /// When set, only files matching this regex are synced.
    /// Directories are still traversed.
    #[serde(default)]
    pub include: Option<String>,
}

fn default_output() -> PathBuf {
    PathBuf::from(".")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_apply_to_empty_yaml_mapping() {
        let conf: SyncConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(conf.user_agent, "websync");
        assert_eq!(conf.concurrent_downloads, 10);
        assert!(conf.handle_sigint);
        assert!(matches!(conf.on_dl_error, OnError::SkipAndLog));
    }

    #[test]
    fn site_config_needs_only_a_url() {
        let site: SiteConfig = serde_yaml::from_str("url: https://example.com/data/").unwrap();
        assert_eq!(site.output, PathBuf::from("."));
        assert!(site.exclude.is_none());
        assert!(site.include.is_none());
    }
}
