use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, io};

use clap::{CommandFactory, Parser};
use clap_complete::{generate, Shell};
use serde::Deserialize;
use tokio::runtime;
use websync_crawler::{sync_site, OnError, SiteConfig, SyncConfig};

/// Mirror remote web listings by modification time
#[derive(Debug, Parser)]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub cmd: SubCommand,
}

#[derive(Debug, clap::Subcommand)]
pub enum SubCommand {
    #[command(name = "sync")]
    Sync(SyncArgs),
    #[command(hide = true)]
    Completion,
}

/// Crawl remote listings and download new or updated files
#[derive(Debug, clap::Args)]
pub struct SyncArgs {
    /// Root url of the listing to mirror
    #[arg(long, short, required_unless_present = "config")]
    pub url: Option<String>,
    /// Local directory receiving the mirror
    #[arg(long, short, default_value = ".")]
    pub output: PathBuf,
    /// Yaml file with crawler settings and a map of sites to sync
    #[arg(env = "WEBSYNC_CONFIG", long, short)]
    pub config: Option<PathBuf>,
    /// Keep only files whose listing name matches this regex
    #[arg(long)]
    pub include: Option<String>,
    /// Drop any listing entry whose name matches this regex
    #[arg(long)]
    pub exclude: Option<String>,
    /// Override the crawler's user agent
    #[arg(long)]
    pub user_agent: Option<String>,
    /// Override the crawler's maximum concurrent downloads
    #[arg(long)]
    pub concurrent_downloads: Option<usize>,
    /// Override the crawler's number of mirror writer threads
    #[arg(long)]
    pub num_writers: Option<usize>,
    /// Override the crawler's write queue capacity
    #[arg(long)]
    pub job_buffer: Option<usize>,
    /// No SIGINT handling, the crawl won't drain cleanly on interrupt
    #[arg(long)]
    pub no_sigint: bool,
    /// Override the crawler's download error handling strategy
    #[arg(value_enum, long)]
    pub on_dl_error: Option<OnError>,
    /// Override the crawler's listing error handling strategy
    #[arg(value_enum, long)]
    pub on_listing_error: Option<OnError>,
    /// Override the crawler's write error handling strategy
    #[arg(value_enum, long)]
    pub on_write_error: Option<OnError>,
    /// When quiet no logs are outputted
    #[arg(long, short)]
    pub quiet: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    #[serde(default)]
    crawler: Option<SyncConfig>,
    #[serde(default)]
    sites: BTreeMap<String, SiteEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteEntry {
    #[serde(flatten)]
    site: SiteConfig,
    /// Commit the mirror after a successful sync, for rolling archives kept
    /// under version control.
    #[serde(default)]
    git_commit: bool,
}

fn apply_overrides(conf: &mut SyncConfig, args: &SyncArgs) {
    if let Some(user_agent) = &args.user_agent {
        conf.user_agent = user_agent.to_string();
    }
    if let Some(concurrent_downloads) = args.concurrent_downloads {
        conf.concurrent_downloads = concurrent_downloads;
    }
    if let Some(num_writers) = args.num_writers {
        conf.num_writers = num_writers;
    }
    if let Some(job_buffer) = args.job_buffer {
        conf.job_buffer = job_buffer;
    }
    if let Some(on_dl_error) = args.on_dl_error {
        conf.on_dl_error = on_dl_error;
    }
    if let Some(on_listing_error) = args.on_listing_error {
        conf.on_listing_error = on_listing_error;
    }
    if let Some(on_write_error) = args.on_write_error {
        conf.on_write_error = on_write_error;
    }
    if args.no_sigint {
        conf.handle_sigint = false;
    }
}

fn gather_sites(
    file_sites: BTreeMap<String, SiteEntry>,
    args: &SyncArgs,
) -> anyhow::Result<Vec<(String, SiteEntry)>> {
    let mut sites: Vec<_> = file_sites.into_iter().collect();
    if let Some(url) = &args.url {
        sites.push((
            url.clone(),
            SiteEntry {
                site: SiteConfig {
                    url: url.clone(),
                    output: args.output.clone(),
                    exclude: args.exclude.clone(),
                    include: args.include.clone(),
                },
                git_commit: false,
            },
        ));
    }
    if sites.is_empty() {
        anyhow::bail!("Missing `url` or a config file with sites");
    }
    Ok(sites)
}

fn commit_mirror(output: &Path) {
    let git = |cmd_args: &[&str]| {
        Command::new("git")
            .args(cmd_args)
            .current_dir(output)
            .status()
    };
    match git(&["add", "-A"]).and_then(|_| git(&["commit", "-m", "websync auto-commit"])) {
        Ok(status) if status.success() => {
            log::info!("Committed mirror changes in {}", output.display());
        }
        Ok(status) => {
            log::warn!("git exited with {status} in {}", output.display());
        }
        Err(e) => {
            log::warn!("Couldn't run git in {}: {e}", output.display());
        }
    }
}

pub fn sync(args: SyncArgs) -> anyhow::Result<()> {
    let file = match &args.config {
        Some(path) => serde_yaml::from_reader(File::open(path)?)?,
        None => ConfigFile::default(),
    };
    let mut conf = file.crawler.unwrap_or_default();
    apply_overrides(&mut conf, &args);
    let sites = gather_sites(file.sites, &args)?;

    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    let mut failures = 0;
    for (name, entry) in &sites {
        log::info!("Syncing {name}");
        match rt.block_on(sync_site(&conf, &entry.site)) {
            Ok(summary) => {
                log::info!(
                    "Finished {name}: {} downloaded, {} up to date, {} failed",
                    summary.downloaded,
                    summary.skipped,
                    summary.failed
                );
                if entry.git_commit {
                    commit_mirror(&entry.site.output);
                }
            }
            Err(e) => {
                log::error!("Sync failed for {name}: {e:#}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        anyhow::bail!("{failures} site(s) failed");
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match args.cmd {
        SubCommand::Sync(args) => {
            if !args.quiet {
                if env::var_os("RUST_LOG").is_none() {
                    env::set_var("RUST_LOG", "websync=info,websync_crawler=info");
                }
                env_logger::init();
            }
            sync(args)
        }
        SubCommand::Completion => {
            generate(Shell::Bash, &mut Args::command(), "websync", &mut io::stdout());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_sync(argv: &[&str]) -> SyncArgs {
        match Args::try_parse_from(argv).unwrap().cmd {
            SubCommand::Sync(args) => args,
            cmd => panic!("Expected a sync command, got {cmd:?}"),
        }
    }

    #[test]
    fn cli_overrides_replace_config_defaults() {
        let args = parse_sync(&[
            "websync",
            "sync",
            "--url",
            "https://example.com/data/",
            "--user-agent",
            "tester",
            "--concurrent-downloads",
            "3",
            "--no-sigint",
        ]);
        let mut conf = SyncConfig::default();
        apply_overrides(&mut conf, &args);

        assert_eq!(conf.user_agent, "tester");
        assert_eq!(conf.concurrent_downloads, 3);
        assert!(!conf.handle_sigint);
    }

    #[test]
    fn config_file_sites_and_crawler_section_are_parsed() {
        let yaml = r#"
crawler:
  userAgent: archive-mirror
  concurrentDownloads: 5
sites:
  gens:
    url: https://ftp.ncep.noaa.gov/data/nccf/com/ens_tracker/prod/
    output: ./mirror
    exclude: '(.*2014.*)'
    gitCommit: true
"#;
        let file: ConfigFile = serde_yaml::from_str(yaml).unwrap();
        let conf = file.crawler.unwrap();
        assert_eq!(conf.user_agent, "archive-mirror");
        assert_eq!(conf.concurrent_downloads, 5);

        let entry = &file.sites["gens"];
        assert!(entry.git_commit);
        assert_eq!(entry.site.output, PathBuf::from("./mirror"));
        assert_eq!(entry.site.exclude.as_deref(), Some("(.*2014.*)"));
    }

    #[test]
    fn an_ad_hoc_url_becomes_a_site() {
        let args = parse_sync(&[
            "websync",
            "sync",
            "--url",
            "https://example.com/data/",
            "--output",
            "/tmp/mirror",
            "--include",
            "(.*grib2)",
        ]);
        let sites = gather_sites(BTreeMap::new(), &args).unwrap();

        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].1.site.url, "https://example.com/data/");
        assert_eq!(sites[0].1.site.output, PathBuf::from("/tmp/mirror"));
        assert_eq!(sites[0].1.site.include.as_deref(), Some("(.*grib2)"));
        assert!(!sites[0].1.git_commit);
    }

    #[test]
    fn sites_are_required_from_somewhere() {
        let args = parse_sync(&["websync", "sync", "--config", "unused.yaml"]);
        assert!(gather_sites(BTreeMap::new(), &args).is_err());
    }
}
