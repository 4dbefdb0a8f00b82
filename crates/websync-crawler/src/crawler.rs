use std::cmp;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Error, Result};
use futures::{future, try_join, Future, StreamExt};
use lazy_static::lazy_static;
use regex::Regex;
use reqwest::header::USER_AGENT;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::config::{OnError, SiteConfig, SyncConfig};
use crate::listing::{Listing, NodeKind, RemoteNode};
use crate::mirror::{self, WriteJob};
use crate::probe;
use crate::sync::{decide, local_mtime, Decision};

lazy_static! {
    static ref HTTP_CLI: reqwest::Client = reqwest::ClientBuilder::new()
        .gzip(true)
        .deflate(true)
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap();
}

/// A discovered file together with its place in the mirror. Consumed exactly
/// once by the downloader pool.
#[derive(Debug)]
pub struct FileTask {
    pub url: url::Url,
    pub dest: PathBuf,
}

/// Counts of terminal task outcomes for one site run.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncSummary {
    pub downloaded: usize,
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
struct CountedTx {
    tx: mpsc::UnboundedSender<FileTask>,
    counter: Arc<AtomicUsize>,
}

impl CountedTx {
    fn new(tx: mpsc::UnboundedSender<FileTask>, counter: Arc<AtomicUsize>) -> Self {
        Self { tx, counter }
    }

    fn send(&self, task: FileTask) {
        match self.tx.send(task) {
            Ok(()) => {
                self.counter.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                log::error!("Couldn't queue task: {e}");
            }
        }
    }
}

struct Filters {
    include: Option<Regex>,
    exclude: Option<Regex>,
}

impl Filters {
    fn new(site: &SiteConfig) -> Result<Self> {
        let include = site
            .include
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("Invalid include pattern")?;
        let exclude = site
            .exclude
            .as_deref()
            .map(Regex::new)
            .transpose()
            .context("Invalid exclude pattern")?;
        Ok(Self { include, exclude })
    }

    fn keep(&self, node: &RemoteNode) -> bool {
        if let Some(exclude) = &self.exclude {
            if exclude.is_match(&node.name) {
                return false;
            }
        }
        match (&self.include, node.kind) {
            (Some(include), NodeKind::File) => include.is_match(&node.name),
            _ => true,
        }
    }
}

fn normalize_root(raw: &str) -> Result<url::Url> {
    let raw = if raw.ends_with('/') {
        raw.to_string()
    } else {
        format!("{raw}/")
    };
    let url = url::Url::parse(&raw).with_context(|| format!("Invalid url: {raw}"))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => bail!("Unsupported scheme `{other}` in {url}, only http(s) listings are supported"),
    }
}

async fn fetch_listing(config: &SyncConfig, url: &url::Url) -> Result<String> {
    let resp = HTTP_CLI
        .get(url.clone())
        .header(USER_AGENT, &config.user_agent)
        .send()
        .await?
        .error_for_status()?;
    Ok(resp.text().await?)
}

enum Synced {
    Queued,
    Skipped,
}

/// Probe, decide, and on a stale or missing local copy fetch the body and
/// hand it to the writer pool.
async fn sync_file(
    config: &SyncConfig,
    task: &FileTask,
    tx_job: &crossbeam_channel::Sender<WriteJob>,
) -> Result<Synced> {
    let remote = probe::last_modified(&HTTP_CLI, &config.user_agent, &task.url)
        .await
        .with_context(|| format!("Couldn't probe {}", task.url))?;
    let local = local_mtime(&task.dest);
    if decide(remote, local) == Decision::Skip {
        log::debug!("Up to date: {}", task.dest.display());
        return Ok(Synced::Skipped);
    }

    let resp = HTTP_CLI
        .get(task.url.clone())
        .header(USER_AGENT, &config.user_agent)
        .send()
        .await
        .and_then(|resp| resp.error_for_status())
        .with_context(|| format!("Couldn't fetch {}", task.url))?;
    // The GET's own header wins, the file may have changed since the probe.
    let mtime = probe::header_mtime(resp.headers()).or(remote);
    let bytes = resp
        .bytes()
        .await
        .with_context(|| format!("Couldn't read body of {}", task.url))?
        .to_vec();

    log::info!("Downloading {} ({} bytes)", task.url, bytes.len());
    tx_job
        .send(WriteJob {
            dest: task.dest.clone(),
            bytes,
            mtime,
        })
        .context("Writer pool is gone")?;
    Ok(Synced::Queued)
}

fn until_err<T, E>(
    err: &mut &mut Result<(), E>,
    item: Result<T, E>,
) -> impl Future<Output = Option<T>> {
    match item {
        Ok(item) => future::ready(Some(item)),
        Err(e) => {
            **err = Err(e);
            future::ready(None)
        }
    }
}

/// Crawl one site and drain every download, returning the outcome counts.
///
/// One traversal task expands directory listings breadth-first; file tasks
/// flow through a bounded concurrent download stream and a fixed pool of
/// writer threads that publish into the mirror.
pub async fn sync_site(config: &SyncConfig, site: &SiteConfig) -> Result<SyncSummary> {
    let filters = Filters::new(site)?;
    let root = normalize_root(&site.url)?;
    let num_writers = cmp::max(1, config.num_writers);
    let concurrent_downloads = cmp::max(1, config.concurrent_downloads);

    let tasks_in = Arc::new(AtomicUsize::new(0));
    let tasks_out = Arc::new(AtomicUsize::new(0));
    let downloaded = Arc::new(AtomicUsize::new(0));
    let skipped = Arc::new(AtomicUsize::new(0));
    let failed = Arc::new(AtomicUsize::new(0));
    let crawl_done = Arc::new(AtomicBool::new(false));
    let stop = Arc::new(AtomicBool::new(false));

    let (tx_stop, rx_stop) = crossbeam_channel::unbounded::<()>();
    let (tx_task, rx_task) = mpsc::unbounded_channel::<FileTask>();
    let (tx_job, rx_job) = crossbeam_channel::bounded::<WriteJob>(config.job_buffer);

    let tx_task = CountedTx::new(tx_task, tasks_in.clone());

    // Writers

    let mut writers = vec![];
    for id in 0..num_writers {
        let rx_stop = rx_stop.clone();
        let rx_job = rx_job.clone();
        let tasks_out = tasks_out.clone();
        let downloaded = downloaded.clone();
        let failed = failed.clone();
        let stop = stop.clone();
        let on_write_error = config.on_write_error;
        let writer = thread::Builder::new()
            .name(format!("writer-{id}"))
            .spawn(move || {
                loop {
                    crossbeam_channel::select! {
                        recv(rx_job) -> job => {
                            let Ok(job) = job else { break };
                            match mirror::publish(&job) {
                                Ok(()) => {
                                    log::info!("Published {}", job.dest.display());
                                    downloaded.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(e) => match on_write_error {
                                    OnError::SkipAndLog => {
                                        log::error!("Skipping write for {}: {e:#}", job.dest.display());
                                        failed.fetch_add(1, Ordering::SeqCst);
                                    }
                                    OnError::Fail => {
                                        stop.store(true, Ordering::SeqCst);
                                        tasks_out.fetch_add(1, Ordering::SeqCst);
                                        return Err(e);
                                    }
                                },
                            }
                            tasks_out.fetch_add(1, Ordering::SeqCst);
                        },
                        recv(rx_stop) -> _ => break,
                    }
                }
                Ok::<(), Error>(())
            })?;
        writers.push(writer);
    }
    let writers = async move {
        tokio::task::spawn_blocking(|| {
            for w in writers {
                w.join().unwrap()?;
            }
            Ok::<(), Error>(())
        })
        .await?
    };

    // Downloader pool

    let pool = {
        let tasks_in = tasks_in.clone();
        let tasks_out = tasks_out.clone();
        let skipped = skipped.clone();
        let failed = failed.clone();
        let stop = stop.clone();
        async move {
            let stream = UnboundedReceiverStream::new(rx_task)
                .map(move |task| {
                    let tx_job = tx_job.clone();
                    let tasks_in = tasks_in.clone();
                    let tasks_out = tasks_out.clone();
                    let skipped = skipped.clone();
                    let failed = failed.clone();
                    let stop = stop.clone();
                    async move {
                        if stop.load(Ordering::SeqCst) {
                            log::debug!("Dropping queued {}", task.url);
                            tasks_in.fetch_sub(1, Ordering::SeqCst);
                            return Ok(());
                        }
                        match sync_file(config, &task, &tx_job).await {
                            Ok(Synced::Queued) => Ok(()),
                            Ok(Synced::Skipped) => {
                                skipped.fetch_add(1, Ordering::SeqCst);
                                tasks_out.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            }
                            Err(e) => {
                                failed.fetch_add(1, Ordering::SeqCst);
                                tasks_in.fetch_sub(1, Ordering::SeqCst);
                                Err(e)
                            }
                        }
                    }
                })
                .buffer_unordered(concurrent_downloads);

            match config.on_dl_error {
                OnError::Fail => {
                    let mut err = Ok::<(), Error>(());
                    stream.scan(&mut err, until_err).collect::<Vec<_>>().await;
                    err
                }
                OnError::SkipAndLog => {
                    stream
                        .filter_map(|res| async move {
                            res.map_err(|e| log::warn!("Skipping file: {e:#}")).ok()
                        })
                        .collect::<Vec<_>>()
                        .await;
                    Ok(())
                }
            }
        }
    };

    // Traversal

    let driver = {
        let crawl_done = crawl_done.clone();
        let stop = stop.clone();
        let filters = &filters;
        let output = &site.output;
        async move {
            let mut frontier = VecDeque::from([root.clone()]);
            let mut visited: HashSet<String> = HashSet::new();
            let mut at_root = true;

            while let Some(dir) = frontier.pop_front() {
                if stop.load(Ordering::SeqCst) {
                    log::warn!("Interrupted, draining in-flight downloads");
                    break;
                }
                if !visited.insert(dir.as_str().to_string()) {
                    continue;
                }
                log::debug!("Expanding {dir}");

                let fetched = fetch_listing(config, &dir).await;
                let first = at_root;
                at_root = false;
                let body = match fetched {
                    Ok(body) => body,
                    Err(e) if first => {
                        return Err(e.context(format!("Couldn't fetch root listing {dir}")))
                    }
                    Err(e) => match config.on_listing_error {
                        OnError::SkipAndLog => {
                            log::warn!("Skipping directory {dir}: {e:#}");
                            continue;
                        }
                        OnError::Fail => return Err(e),
                    },
                };

                let listing = Listing::parse(&body, dir.clone());
                for node in listing.links() {
                    if !filters.keep(&node) {
                        continue;
                    }
                    match node.kind {
                        NodeKind::Directory => frontier.push_back(node.url),
                        NodeKind::File => {
                            if visited.insert(node.url.as_str().to_string()) {
                                let dest = mirror::local_path(output, &node.url);
                                tx_task.send(FileTask { url: node.url, dest });
                            }
                        }
                    }
                }
            }

            crawl_done.store(true, Ordering::SeqCst);
            drop(tx_task);
            Ok::<(), Error>(())
        }
    };

    // Termination watch

    let done = {
        let tasks_in = tasks_in.clone();
        let tasks_out = tasks_out.clone();
        let crawl_done = crawl_done.clone();
        let stop = stop.clone();
        let handle_sigint = config.handle_sigint;
        async move {
            loop {
                if handle_sigint {
                    if timeout(Duration::from_secs(1), tokio::signal::ctrl_c())
                        .await
                        .is_ok()
                    {
                        log::warn!("Interrupted, no further downloads will start");
                        stop.store(true, Ordering::SeqCst);
                    }
                } else {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                if crawl_done.load(Ordering::SeqCst)
                    && tasks_out.load(Ordering::SeqCst) == tasks_in.load(Ordering::SeqCst)
                {
                    for _ in 0..num_writers {
                        tx_stop.send(()).ok();
                    }
                    return Ok::<(), Error>(());
                }
            }
        }
    };

    try_join!(writers, pool, driver, done)?;

    Ok(SyncSummary {
        downloaded: downloaded.load(Ordering::SeqCst),
        skipped: skipped.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(url: &str) -> SiteConfig {
        SiteConfig {
            url: url.to_string(),
            output: PathBuf::from("."),
            exclude: None,
            include: None,
        }
    }

    #[test]
    fn roots_are_normalized_with_a_trailing_slash() {
        let url = normalize_root("https://example.com/data").unwrap();
        assert_eq!(url.as_str(), "https://example.com/data/");
    }

    #[test]
    fn non_http_schemes_are_rejected() {
        assert!(normalize_root("ftp://example.com/data/").is_err());
        assert!(normalize_root("not a url").is_err());
    }

    #[test]
    fn exclude_drops_any_entry_include_keeps_files_only() {
        let base = url::Url::parse("https://example.com/data/").unwrap();
        let mut conf = site("https://example.com/data/");
        conf.exclude = Some("(.*2014.*)".to_string());
        conf.include = Some("(.*AMSR2.*)".to_string());
        let filters = Filters::new(&conf).unwrap();

        let node = |name: &str, kind| RemoteNode {
            url: base.join(name).unwrap(),
            kind,
            name: name.to_string(),
        };

        assert!(!filters.keep(&node("archive.2014.AMSR2.DAT", NodeKind::File)));
        assert!(!filters.keep(&node("2014/", NodeKind::Directory)));
        assert!(filters.keep(&node("1806072011EP02.AMSR2.DAT", NodeKind::File)));
        assert!(!filters.keep(&node("18060818EP0218.DAT", NodeKind::File)));
        assert!(filters.keep(&node("subdir/", NodeKind::Directory)));
    }

    #[test]
    fn invalid_patterns_are_a_configuration_error() {
        let mut conf = site("https://example.com/data/");
        conf.exclude = Some("(".to_string());
        assert!(Filters::new(&conf).is_err());
    }
}
