//! Resumable pad downloads.
//!
//! Each target URL moves `Pending -> Skipped` (resume found its file) or
//! `Pending -> Fetching -> Succeeded | Failed`. A failure is logged and the
//! batch carries on; only environmental problems (unwritable output
//! directory) abort the run.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::config::ToolConfig;
use crate::error::FetchError;
use crate::http::{Clock, HttpSession, Transport};
use crate::index::{EtherpadIndex, url_key};
use crate::pads::{PadTarget, content_digest, digest_from_file_name, url_digest};
use crate::render::{write_atomic, write_json_value};

pub const MANIFEST_FILENAME: &str = "_manifest.json";
pub const ERROR_LOG_FILENAME: &str = "_download_log.json";

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub output_dir: PathBuf,
    pub delay: Duration,
    pub resume: bool,
    /// Recorded in the error log only.
    pub index_path: Option<PathBuf>,
    /// Flush the manifest every N targets; 0 flushes only at the end.
    pub checkpoint_every: usize,
}

impl FetchOptions {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            delay: Duration::from_millis(300),
            resume: false,
            index_path: None,
            checkpoint_every: 25,
        }
    }

    pub fn from_config(output_dir: impl Into<PathBuf>, config: &ToolConfig) -> Self {
        Self {
            delay: Duration::from_millis(config.download.delay_ms),
            checkpoint_every: config.download.checkpoint_every,
            ..Self::new(output_dir)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestFile {
    pub url: String,
    pub file: String,
    pub bytes: u64,
    pub sha256: String,
    /// Found on disk by a resumed run rather than fetched.
    #[serde(default)]
    pub skipped: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchManifest {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub completed_urls: Vec<String>,
    #[serde(default)]
    pub files: Vec<ManifestFile>,
}

impl FetchManifest {
    fn complete(&mut self, file: ManifestFile) {
        if file.skipped {
            self.skipped += 1;
        } else {
            self.succeeded += 1;
        }
        self.completed_urls.push(file.url.clone());
        self.files.push(file);
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchErrorEntry {
    pub url: String,
    pub export_url: Option<String>,
    pub reason: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchErrorLog {
    pub started_at: String,
    pub finished_at: Option<String>,
    pub index_path: Option<String>,
    pub total_urls: usize,
    pub errors: Vec<FetchErrorEntry>,
}

/// Archive every pad in `index` into `options.output_dir`, strictly one
/// request at a time.
pub fn fetch_all<T: Transport, C: Clock>(
    session: &mut HttpSession<T, C>,
    index: &EtherpadIndex,
    options: &FetchOptions,
) -> Result<FetchManifest> {
    let output_dir = options.output_dir.as_path();
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create {}", output_dir.display()))?;

    let urls = index.unique_urls().collect::<Vec<_>>();
    let total = urls.len();
    let mut manifest = FetchManifest {
        total,
        ..FetchManifest::default()
    };
    let mut error_log = FetchErrorLog {
        started_at: timestamp(session),
        index_path: options
            .index_path
            .as_ref()
            .map(|path| path.to_string_lossy().replace('\\', "/")),
        total_urls: total,
        ..FetchErrorLog::default()
    };

    let (existing, prior_files) = if options.resume {
        let prior = load_manifest(output_dir).unwrap_or_else(|error| {
            warn!("ignoring unreadable prior manifest: {error:#}");
            None
        });
        let prior_files = prior
            .map(|manifest| {
                manifest
                    .files
                    .into_iter()
                    .map(|file| (url_key(&file.url), file))
                    .collect::<HashMap<_, _>>()
            })
            .unwrap_or_default();
        (scan_existing_content(output_dir)?, prior_files)
    } else {
        (HashMap::new(), HashMap::new())
    };

    let mut attempted = false;
    for (position, url) in urls.iter().enumerate() {
        let progress = format!("{:>4}/{total}", position + 1);
        match PadTarget::from_url(url) {
            None => {
                warn!("[{progress}] FAIL (no pad name): {url}");
                record_failure(session, &mut manifest, &mut error_log, url, None, FetchError::NoPadName);
            }
            Some(target) => {
                let resumed = existing
                    .get(&url_digest(url))
                    .and_then(|file_name| resumed_file(output_dir, url, file_name, &prior_files));
                if let Some(file) = resumed {
                    info!("[{progress}] EXISTS: {}", target.pad_name);
                    manifest.complete(file);
                } else {
                    if attempted {
                        session.pause(options.delay);
                    }
                    attempted = true;

                    match fetch_one(session, &target, output_dir) {
                        Ok(file) => {
                            info!("[{progress}] OK ({:>7} bytes): {}", file.bytes, target.pad_name);
                            manifest.complete(file);
                        }
                        Err(error) => {
                            warn!("[{progress}] FAIL: {} ({error})", target.pad_name);
                            let export_url = Some(target.export_url.clone());
                            record_failure(session, &mut manifest, &mut error_log, url, export_url, error);
                        }
                    }
                }
            }
        }

        if options.checkpoint_every > 0 && (position + 1) % options.checkpoint_every == 0 {
            write_json_value(&manifest, &output_dir.join(MANIFEST_FILENAME))?;
        }
    }

    error_log.finished_at = Some(timestamp(session));
    write_json_value(&manifest, &output_dir.join(MANIFEST_FILENAME))?;
    write_json_value(&error_log, &output_dir.join(ERROR_LOG_FILENAME))?;
    info!(
        total = manifest.total,
        succeeded = manifest.succeeded,
        failed = manifest.failed,
        skipped = manifest.skipped,
        "download run complete"
    );
    Ok(manifest)
}

pub fn load_manifest(output_dir: &Path) -> Result<Option<FetchManifest>> {
    read_optional_json(&output_dir.join(MANIFEST_FILENAME))
}

pub fn load_error_log(output_dir: &Path) -> Result<Option<FetchErrorLog>> {
    read_optional_json(&output_dir.join(ERROR_LOG_FILENAME))
}

fn read_optional_json<D: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<D>> {
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let parsed = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(Some(parsed))
}

fn fetch_one<T: Transport, C: Clock>(
    session: &mut HttpSession<T, C>,
    target: &PadTarget,
    output_dir: &Path,
) -> Result<ManifestFile, FetchError> {
    let response = session
        .get(&target.export_url, &[])
        .map_err(|error| FetchError::Transport(error.message))?;
    if !response.is_success() {
        return Err(FetchError::Status {
            status: response.status,
        });
    }
    if response.body.trim().is_empty() {
        return Err(FetchError::EmptyBody);
    }

    let path = output_dir.join(&target.file_name);
    write_atomic(&path, response.body.as_bytes())
        .map_err(|error| FetchError::Write(format!("{error:#}")))?;
    Ok(ManifestFile {
        url: target.url.clone(),
        file: target.file_name.clone(),
        bytes: response.body.len() as u64,
        sha256: content_digest(response.body.as_bytes()),
        skipped: false,
    })
}

fn record_failure<T: Transport, C: Clock>(
    session: &HttpSession<T, C>,
    manifest: &mut FetchManifest,
    error_log: &mut FetchErrorLog,
    url: &str,
    export_url: Option<String>,
    error: FetchError,
) {
    manifest.failed += 1;
    error_log.errors.push(FetchErrorEntry {
        url: url.to_string(),
        export_url,
        reason: error.to_string(),
        timestamp: timestamp(session),
    });
}

/// Non-empty content files already in `output_dir`, keyed by URL digest.
fn scan_existing_content(output_dir: &Path) -> Result<HashMap<String, String>> {
    let mut existing = HashMap::new();
    for entry in WalkDir::new(output_dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
    {
        let entry = entry.with_context(|| format!("failed to walk {}", output_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };
        let Some(digest) = digest_from_file_name(file_name) else {
            continue;
        };
        let size = entry
            .metadata()
            .with_context(|| format!("failed to inspect {}", entry.path().display()))?
            .len();
        if size > 0 {
            existing.insert(digest.to_string(), file_name.to_string());
        }
    }
    Ok(existing)
}

/// Manifest entry for a content file already on disk. A prior manifest entry
/// for the same file keeps its classification; an unreadable file yields None
/// so the pad is fetched again.
fn resumed_file(
    output_dir: &Path,
    url: &str,
    file_name: &str,
    prior_files: &HashMap<String, ManifestFile>,
) -> Option<ManifestFile> {
    if let Some(prior) = prior_files.get(&url_key(url))
        && prior.file == file_name
    {
        return Some(prior.clone());
    }
    describe_existing(output_dir, url, file_name)
        .inspect_err(|error| warn!("re-fetching {url}: {error:#}"))
        .ok()
}

fn describe_existing(output_dir: &Path, url: &str, file_name: &str) -> Result<ManifestFile> {
    let path = output_dir.join(file_name);
    let content = fs::read(&path).with_context(|| format!("failed to read {}", path.display()))?;
    Ok(ManifestFile {
        url: url.to_string(),
        file: file_name.to_string(),
        bytes: content.len() as u64,
        sha256: content_digest(&content),
        skipped: true,
    })
}

fn timestamp<T: Transport, C: Clock>(session: &HttpSession<T, C>) -> String {
    session.now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    use tempfile::tempdir;

    use super::{
        FetchManifest, FetchOptions, MANIFEST_FILENAME, fetch_all, load_error_log, load_manifest,
        resumed_file,
    };
    use crate::http::{HttpResponse, HttpSession, Transport, TransportError};
    use crate::index::{EtherpadIndex, IndexSource, LinkRecord};
    use crate::pads::PadTarget;
    use crate::testing::{FakeClock, FakeTransport};

    const PAD_A: &str = "https://etherpad.wikimedia.org/p/alpha";
    const PAD_B: &str = "https://etherpad.wikimedia.org/p/beta";
    const PAD_C: &str = "http://etherpad.wikimedia.org/p/gamma";

    fn index_of(citations: &[(&str, &str)]) -> EtherpadIndex {
        let mut index = EtherpadIndex::new(IndexSource::default());
        for (url, title) in citations {
            index.insert(&LinkRecord {
                etherpad_url: url.to_string(),
                page_title: title.to_string(),
                page_url: format!("https://meta.wikimedia.org/wiki/{title}"),
            });
        }
        index
    }

    fn export_url(url: &str) -> String {
        PadTarget::from_url(url).expect("pad target").export_url
    }

    fn options(dir: &Path, resume: bool) -> FetchOptions {
        FetchOptions {
            delay: Duration::from_millis(250),
            resume,
            checkpoint_every: 0,
            ..FetchOptions::new(dir)
        }
    }

    /// Answers every request with a body and records the manifest on disk at
    /// the moment of the request.
    struct ManifestWatcher {
        dir: PathBuf,
        seen: Vec<Option<FetchManifest>>,
    }

    impl Transport for ManifestWatcher {
        fn get(
            &mut self,
            _url: &str,
            _query: &[(String, String)],
        ) -> Result<HttpResponse, TransportError> {
            self.seen
                .push(load_manifest(&self.dir).expect("read checkpoint"));
            Ok(HttpResponse {
                status: 200,
                body: "pad text".to_string(),
            })
        }
    }

    fn content_files(dir: &Path) -> Vec<String> {
        let mut names = fs::read_dir(dir)
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('_'))
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[test]
    fn one_failed_fetch_is_logged_and_the_rest_complete() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[(PAD_A, "P1"), (PAD_A, "P2"), (PAD_B, "P1")]);
        let mut transport = FakeTransport::default();
        transport.push_text(&export_url(PAD_A), 200, "agenda\n* item\n");
        transport.push_text(&export_url(PAD_B), 500, "oops");
        let mut session = HttpSession::new(transport, FakeClock::default());

        let manifest = fetch_all(&mut session, &index, &options(temp.path(), false)).expect("run");

        assert_eq!(manifest.total, 2);
        assert_eq!(manifest.succeeded, 1);
        assert_eq!(manifest.failed, 1);
        assert_eq!(manifest.skipped, 0);
        assert_eq!(manifest.completed_urls, vec![PAD_A.to_string()]);
        assert_eq!(content_files(temp.path()).len(), 1);

        let log = load_error_log(temp.path()).expect("read log").expect("log");
        assert_eq!(log.errors.len(), 1);
        assert_eq!(log.errors[0].url, PAD_B);
        assert_eq!(log.errors[0].reason, "HTTP 500");
        assert_eq!(log.total_urls, 2);
        assert!(log.finished_at.is_some());

        assert_eq!(load_manifest(temp.path()).expect("read").expect("manifest"), manifest);
    }

    #[test]
    fn failures_never_stop_the_batch() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[
            (PAD_A, "P1"),
            ("https://etherpad.wikimedia.org/", "P1"),
            (PAD_B, "P2"),
            (PAD_C, "P3"),
        ]);
        let mut transport = FakeTransport::default();
        transport.push(&export_url(PAD_A), Err(TransportError::retryable("timed out")));
        transport.push_text(&export_url(PAD_B), 200, "   \n");
        transport.push_text(&export_url(PAD_C), 200, "notes");
        let mut session = HttpSession::new(transport, FakeClock::default());

        let manifest = fetch_all(&mut session, &index, &options(temp.path(), false)).expect("run");

        assert_eq!(manifest.succeeded, 1);
        assert_eq!(manifest.failed, 3);
        assert_eq!(session.request_count(), 3);
        let log = load_error_log(temp.path()).expect("read log").expect("log");
        let reasons = log
            .errors
            .iter()
            .map(|entry| entry.reason.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            reasons,
            vec![
                "request failed: timed out",
                "no pad name in URL",
                "empty response body"
            ]
        );
        assert_eq!(log.errors[1].export_url, None);
        assert_eq!(content_files(temp.path()).len(), 1);
    }

    #[test]
    fn delay_separates_network_attempts_only() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[(PAD_A, "P1"), (PAD_B, "P1"), (PAD_C, "P1")]);
        let mut transport = FakeTransport::default();
        transport.push_text(&export_url(PAD_A), 200, "a");
        transport.push_text(&export_url(PAD_B), 404, "missing");
        transport.push_text(&export_url(PAD_C), 200, "c");
        let mut session = HttpSession::new(transport, FakeClock::default());

        fetch_all(&mut session, &index, &options(temp.path(), false)).expect("run");

        assert_eq!(
            session.clock().sleeps,
            vec![Duration::from_millis(250), Duration::from_millis(250)]
        );
    }

    #[test]
    fn resume_is_idempotent() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[(PAD_A, "P1"), (PAD_A, "P2"), (PAD_B, "P1")]);
        let mut transport = FakeTransport::default();
        transport.push_text(&export_url(PAD_A), 200, "alpha text");
        transport.push_text(&export_url(PAD_B), 200, "beta text");
        let mut session = HttpSession::new(transport, FakeClock::default());
        let first = fetch_all(&mut session, &index, &options(temp.path(), false)).expect("run");
        assert_eq!(first.succeeded, 2);

        let mut session = HttpSession::new(FakeTransport::default(), FakeClock::default());
        let second = fetch_all(&mut session, &index, &options(temp.path(), true)).expect("rerun");

        assert_eq!(session.request_count(), 0);
        assert!(session.clock().sleeps.is_empty());
        assert_eq!(second, first);
        assert_eq!(load_manifest(temp.path()).expect("read").expect("manifest"), first);
    }

    #[test]
    fn resume_retries_only_what_is_missing() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[(PAD_A, "P1"), (PAD_B, "P1")]);
        let mut transport = FakeTransport::default();
        transport.push_text(&export_url(PAD_A), 200, "alpha text");
        transport.push_text(&export_url(PAD_B), 503, "busy");
        let mut session = HttpSession::new(transport, FakeClock::default());
        fetch_all(&mut session, &index, &options(temp.path(), false)).expect("run");

        let mut transport = FakeTransport::default();
        transport.push_text(&export_url(PAD_B), 200, "beta text");
        let mut session = HttpSession::new(transport, FakeClock::default());
        let manifest = fetch_all(&mut session, &index, &options(temp.path(), true)).expect("rerun");

        assert_eq!(session.request_count(), 1);
        assert_eq!(session.transport().requests_to(&export_url(PAD_B)), 1);
        assert_eq!(manifest.succeeded, 2);
        assert_eq!(manifest.failed, 0);
        assert_eq!(manifest.completed_urls, vec![PAD_A.to_string(), PAD_B.to_string()]);
        let log = load_error_log(temp.path()).expect("read log").expect("log");
        assert!(log.errors.is_empty());
    }

    #[test]
    fn files_without_manifest_entry_count_as_skipped() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[(PAD_A, "P1"), (PAD_B, "P1")]);
        let target_a = PadTarget::from_url(PAD_A).expect("target");
        let target_b = PadTarget::from_url(PAD_B).expect("target");
        fs::write(temp.path().join(&target_a.file_name), "kept from an earlier run").expect("write");
        fs::write(temp.path().join(&target_b.file_name), "").expect("write empty");
        let mut transport = FakeTransport::default();
        transport.push_text(&target_b.export_url, 200, "beta text");
        let mut session = HttpSession::new(transport, FakeClock::default());

        let manifest = fetch_all(&mut session, &index, &options(temp.path(), true)).expect("run");

        assert_eq!(manifest.skipped, 1);
        assert_eq!(manifest.succeeded, 1);
        assert_eq!(session.request_count(), 1);
        assert_eq!(manifest.files[0].file, target_a.file_name);
        assert_eq!(manifest.files[0].bytes, 24);
        assert_eq!(
            fs::read_to_string(temp.path().join(&target_b.file_name)).expect("read"),
            "beta text"
        );
    }

    #[test]
    fn without_resume_existing_files_are_fetched_again() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[(PAD_A, "P1")]);
        let target = PadTarget::from_url(PAD_A).expect("target");
        fs::write(temp.path().join(&target.file_name), "stale").expect("write");
        let mut transport = FakeTransport::default();
        transport.push_text(&target.export_url, 200, "fresh");
        let mut session = HttpSession::new(transport, FakeClock::default());

        let manifest = fetch_all(&mut session, &index, &options(temp.path(), false)).expect("run");

        assert_eq!(manifest.succeeded, 1);
        assert_eq!(session.request_count(), 1);
        assert_eq!(
            fs::read_to_string(temp.path().join(&target.file_name)).expect("read"),
            "fresh"
        );
    }

    #[test]
    fn repeated_resume_keeps_skipped_pads_skipped() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[(PAD_A, "P1")]);
        let target = PadTarget::from_url(PAD_A).expect("target");
        fs::write(temp.path().join(&target.file_name), "copied in by hand").expect("write");

        let mut session = HttpSession::new(FakeTransport::default(), FakeClock::default());
        let first = fetch_all(&mut session, &index, &options(temp.path(), true)).expect("run");
        let mut session = HttpSession::new(FakeTransport::default(), FakeClock::default());
        let second = fetch_all(&mut session, &index, &options(temp.path(), true)).expect("rerun");

        assert_eq!(session.request_count(), 0);
        assert_eq!(first.skipped, 1);
        assert_eq!(first.succeeded, 0);
        assert!(first.files[0].skipped);
        assert_eq!(second, first);
    }

    #[test]
    fn checkpoints_land_on_resumed_and_unnamed_targets() {
        let temp = tempdir().expect("tempdir");
        let index = index_of(&[
            (PAD_A, "P1"),
            ("https://etherpad.wikimedia.org/", "P1"),
            (PAD_B, "P2"),
        ]);
        let target = PadTarget::from_url(PAD_A).expect("target");
        fs::write(temp.path().join(&target.file_name), "already here").expect("write");
        let transport = ManifestWatcher {
            dir: temp.path().to_path_buf(),
            seen: Vec::new(),
        };
        let mut session = HttpSession::new(transport, FakeClock::default());
        let options = FetchOptions {
            checkpoint_every: 2,
            ..options(temp.path(), true)
        };

        let manifest = fetch_all(&mut session, &index, &options).expect("run");

        let seen = &session.transport().seen;
        assert_eq!(seen.len(), 1);
        let checkpoint = seen[0].as_ref().expect("checkpoint written before third target");
        assert_eq!(checkpoint.total, 3);
        assert_eq!(checkpoint.skipped, 1);
        assert_eq!(checkpoint.failed, 1);
        assert_eq!(checkpoint.succeeded, 0);
        assert_eq!(manifest.succeeded, 1);
        assert!(temp.path().join(MANIFEST_FILENAME).exists());
    }

    #[test]
    fn unreadable_existing_file_is_fetched_again() {
        let temp = tempdir().expect("tempdir");
        let resumed = resumed_file(temp.path(), PAD_A, "alpha-0000000000000000.txt", &HashMap::new());
        assert_eq!(resumed, None);
    }
}
