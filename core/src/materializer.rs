//! Log materialization: turn an issue's artifact list into a decrypted,
//! unarchived `logs/` tree inside the task workspace.
//!
//! Artifacts are processed sequentially within one task. Archive extraction
//! refuses entries that would escape the workspace, entries above the
//! per-entry cap, and trees above the total uncompressed ceiling.

use crate::config::WorkspaceConfig;
use crate::errors::{MaterializeError, MaterializeResult};
use crate::types::{Issue, LogArtifact};
use crate::workspace::Workspace;
use async_trait::async_trait;
use std::io::Read;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Resolves an artifact's bytes from its opaque fetch token.
#[async_trait]
pub trait ArtifactResolver: Send + Sync {
    async fn fetch(&self, artifact: &LogArtifact) -> MaterializeResult<Vec<u8>>;
}

/// Token-based resolver backed by the producer's HTTP endpoint.
pub struct HttpArtifactResolver {
    client: reqwest::Client,
    base_url: String,
}

impl HttpArtifactResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl ArtifactResolver for HttpArtifactResolver {
    async fn fetch(&self, artifact: &LogArtifact) -> MaterializeResult<Vec<u8>> {
        let token = artifact.token.as_deref().ok_or_else(|| {
            MaterializeError::FetchFailed {
                name: artifact.name.clone(),
                message: "artifact has neither inline payload nor fetch token".to_string(),
            }
        })?;
        let url = format!("{}/{}", self.base_url.trim_end_matches('/'), token);
        let response = self.client.get(&url).send().await.map_err(|e| {
            MaterializeError::FetchFailed {
                name: artifact.name.clone(),
                message: e.to_string(),
            }
        })?;
        if !response.status().is_success() {
            return Err(MaterializeError::FetchFailed {
                name: artifact.name.clone(),
                message: format!("resolver returned {}", response.status()),
            });
        }
        let bytes = response.bytes().await.map_err(|e| MaterializeError::FetchFailed {
            name: artifact.name.clone(),
            message: e.to_string(),
        })?;
        Ok(bytes.to_vec())
    }
}

/// Resolver for deployments without an external artifact endpoint; only
/// inline payloads can be materialized.
pub struct UnconfiguredResolver;

#[async_trait]
impl ArtifactResolver for UnconfiguredResolver {
    async fn fetch(&self, artifact: &LogArtifact) -> MaterializeResult<Vec<u8>> {
        Err(MaterializeError::FetchFailed {
            name: artifact.name.clone(),
            message: "no artifact resolver configured".to_string(),
        })
    }
}

/// The external decryption codec: pure bytes in, bytes out.
///
/// The proprietary container format is out of scope; deployments inject an
/// implementation at the composition root.
pub trait LogCodec: Send + Sync {
    fn decrypt(&self, name: &str, bytes: &[u8]) -> Result<Vec<u8>, String>;
}

/// Codec for deployments whose bundles arrive unencrypted.
pub struct PassthroughCodec;

impl LogCodec for PassthroughCodec {
    fn decrypt(&self, _name: &str, bytes: &[u8]) -> Result<Vec<u8>, String> {
        Ok(bytes.to_vec())
    }
}

/// What materialization produced, for progress messages and the prompt.
#[derive(Debug, Default, Clone)]
pub struct MaterializeSummary {
    pub files_written: usize,
    pub bytes_written: u64,
    pub decrypted: usize,
}

/// Coarse phase reports, forwarded to the progress bus by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializePhase {
    Fetching { index: usize, total: usize },
    Decrypting { index: usize, total: usize },
    Extracting { index: usize, total: usize },
}

pub struct Materializer {
    config: WorkspaceConfig,
    resolver: Arc<dyn ArtifactResolver>,
    codec: Arc<dyn LogCodec>,
    artifact_timeout: Duration,
}

impl Materializer {
    pub fn new(
        config: WorkspaceConfig,
        resolver: Arc<dyn ArtifactResolver>,
        codec: Arc<dyn LogCodec>,
        artifact_timeout: Duration,
    ) -> Self {
        Self {
            config,
            resolver,
            codec,
            artifact_timeout,
        }
    }

    /// Materialize every artifact of `issue` into `workspace`. Fails on the
    /// first bad artifact; the caller classifies the error. Phase reports go
    /// to `phase_tx` when provided.
    pub async fn materialize(
        &self,
        issue: &Issue,
        workspace: &Workspace,
        phase_tx: Option<&tokio::sync::mpsc::UnboundedSender<MaterializePhase>>,
        cancel: &CancellationToken,
    ) -> MaterializeResult<MaterializeSummary> {
        let mut summary = MaterializeSummary::default();
        let mut budget = Budget::new(self.config.max_total_bytes, self.config.max_entry_bytes);
        let total = issue.log_artifacts.len();
        let report = |phase: MaterializePhase| {
            if let Some(tx) = phase_tx {
                let _ = tx.send(phase);
            }
        };

        for (index, artifact) in issue.log_artifacts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(MaterializeError::Timeout("cancelled".to_string()));
            }

            report(MaterializePhase::Fetching { index, total });
            let bytes = tokio::time::timeout(self.artifact_timeout, self.resolve(artifact))
                .await
                .map_err(|_| {
                    MaterializeError::Timeout(format!("fetching artifact '{}'", artifact.name))
                })??;
            debug!(artifact = %artifact.name, bytes = bytes.len(), "Artifact resolved");

            report(MaterializePhase::Decrypting { index, total });
            let (name, bytes) = self.maybe_decrypt(artifact, bytes, &mut summary)?;
            report(MaterializePhase::Extracting { index, total });

            // Extraction is blocking CPU+disk work; keep it off the runtime
            // and under the same per-artifact deadline as the fetch.
            let logs_dir = workspace.logs_dir();
            let extracted = tokio::time::timeout(
                self.artifact_timeout,
                tokio::task::spawn_blocking({
                    let name = name.clone();
                    let mut budget = budget.clone();
                    move || {
                        let stats = extract_payload(&name, &bytes, &logs_dir, &mut budget)?;
                        Ok::<_, MaterializeError>((stats, budget))
                    }
                }),
            )
            .await
            .map_err(|_| MaterializeError::Timeout(format!("extracting '{}'", name)))?
            .map_err(|e| MaterializeError::IoError(std::io::Error::other(e.to_string())))??;

            let (stats, new_budget) = extracted;
            budget = new_budget;
            summary.files_written += stats.files;
            summary.bytes_written += stats.bytes;
        }

        info!(
            files = summary.files_written,
            bytes = summary.bytes_written,
            decrypted = summary.decrypted,
            "Materialization complete"
        );
        Ok(summary)
    }

    async fn resolve(&self, artifact: &LogArtifact) -> MaterializeResult<Vec<u8>> {
        if let Some(local) = &artifact.local_path {
            return std::fs::read(local).map_err(|e| MaterializeError::FetchFailed {
                name: artifact.name.clone(),
                message: format!("inline payload unreadable: {}", e),
            });
        }
        self.resolver.fetch(artifact).await
    }

    /// Run the codec when the artifact carries the encrypted suffix; the
    /// suffix is stripped so extension dispatch sees the inner name.
    fn maybe_decrypt(
        &self,
        artifact: &LogArtifact,
        bytes: Vec<u8>,
        summary: &mut MaterializeSummary,
    ) -> MaterializeResult<(String, Vec<u8>)> {
        let suffix = &self.config.encrypted_suffix;
        if !suffix.is_empty() && artifact.name.ends_with(suffix.as_str()) {
            let decrypted = self.codec.decrypt(&artifact.name, &bytes).map_err(|message| {
                MaterializeError::DecryptFailed {
                    name: artifact.name.clone(),
                    message,
                }
            })?;
            summary.decrypted += 1;
            let inner = artifact.name[..artifact.name.len() - suffix.len()].to_string();
            Ok((inner, decrypted))
        } else {
            Ok((artifact.name.clone(), bytes))
        }
    }

    /// Advisory code mirror for `needs_code` rules. Returns true when the
    /// configured code tree is unavailable (analysis proceeds without it).
    pub fn mirror_code_tree(&self, workspace: &Workspace) -> MaterializeResult<bool> {
        let Some(code_root) = &self.config.code_root else {
            return Ok(true);
        };
        if !code_root.is_dir() {
            warn!(root = %code_root.display(), "Configured code root missing; continuing without code tree");
            return Ok(true);
        }
        copy_tree(code_root, &workspace.code_dir())?;
        Ok(false)
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    for entry in walkdir::WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| std::io::Error::other(e.to_string()))?;
        let rel = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        let target = to.join(rel);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remaining byte allowance for one workspace.
#[derive(Debug, Clone)]
struct Budget {
    remaining_total: u64,
    max_entry: u64,
}

impl Budget {
    fn new(max_total: u64, max_entry: u64) -> Self {
        Self {
            remaining_total: max_total,
            max_entry,
        }
    }

    fn charge(&mut self, name: &str, size: u64) -> MaterializeResult<()> {
        if size > self.max_entry {
            return Err(MaterializeError::EntryTooLarge {
                name: name.to_string(),
                size,
            });
        }
        if size > self.remaining_total {
            return Err(MaterializeError::QuotaExceeded(size));
        }
        self.remaining_total -= size;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct ExtractStats {
    files: usize,
    bytes: u64,
}

/// Dispatch a payload by its (post-decryption) file name.
fn extract_payload(
    name: &str,
    bytes: &[u8],
    logs_dir: &Path,
    budget: &mut Budget,
) -> MaterializeResult<ExtractStats> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".zip") {
        extract_zip(bytes, logs_dir, budget)
    } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
        let inner = gunzip(name, bytes, budget)?;
        extract_tar(&inner, logs_dir, budget)
    } else if lower.ends_with(".tar") {
        extract_tar(bytes, logs_dir, budget)
    } else if lower.ends_with(".gz") {
        let inner = gunzip(name, bytes, budget)?;
        let inner_name = &name[..name.len() - 3];
        write_plain(inner_name, &inner, logs_dir, budget)
    } else {
        write_plain(name, bytes, logs_dir, budget)
    }
}

fn write_plain(
    name: &str,
    bytes: &[u8],
    logs_dir: &Path,
    budget: &mut Budget,
) -> MaterializeResult<ExtractStats> {
    let rel = sanitize_entry_path(Path::new(name))?;
    budget.charge(name, bytes.len() as u64)?;
    let target = logs_dir.join(rel);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&target, bytes)?;
    Ok(ExtractStats {
        files: 1,
        bytes: bytes.len() as u64,
    })
}

fn gunzip(name: &str, bytes: &[u8], budget: &Budget) -> MaterializeResult<Vec<u8>> {
    let cap = budget.max_entry;
    let mut decoder = flate2::read::GzDecoder::new(bytes);
    let mut out = Vec::new();
    // One extra byte past the cap proves the overrun without inflating further.
    decoder
        .by_ref()
        .take(cap + 1)
        .read_to_end(&mut out)
        .map_err(|e| MaterializeError::DecryptFailed {
            name: name.to_string(),
            message: format!("gzip stream: {}", e),
        })?;
    if out.len() as u64 > cap {
        return Err(MaterializeError::EntryTooLarge {
            name: name.to_string(),
            size: out.len() as u64,
        });
    }
    Ok(out)
}

fn extract_zip(bytes: &[u8], logs_dir: &Path, budget: &mut Budget) -> MaterializeResult<ExtractStats> {
    let reader = std::io::Cursor::new(bytes);
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| MaterializeError::UnsupportedFormat(format!("zip: {}", e)))?;

    let mut stats = ExtractStats::default();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| MaterializeError::UnsupportedFormat(format!("zip entry: {}", e)))?;
        if entry.is_dir() {
            continue;
        }
        let raw_name = entry.name().to_string();
        let Some(enclosed) = entry.enclosed_name() else {
            return Err(MaterializeError::PathTraversal(raw_name));
        };
        let rel = sanitize_entry_path(&enclosed)?;
        budget.charge(&raw_name, entry.size())?;

        let target = logs_dir.join(rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        let written = std::io::copy(&mut entry, &mut out)?;
        stats.files += 1;
        stats.bytes += written;
    }
    Ok(stats)
}

fn extract_tar(bytes: &[u8], logs_dir: &Path, budget: &mut Budget) -> MaterializeResult<ExtractStats> {
    let mut archive = tar::Archive::new(std::io::Cursor::new(bytes));
    let mut stats = ExtractStats::default();

    let entries = archive
        .entries()
        .map_err(|e| MaterializeError::UnsupportedFormat(format!("tar: {}", e)))?;
    for entry in entries {
        let mut entry =
            entry.map_err(|e| MaterializeError::UnsupportedFormat(format!("tar entry: {}", e)))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw_path = entry
            .path()
            .map_err(|e| MaterializeError::UnsupportedFormat(format!("tar path: {}", e)))?
            .into_owned();
        let rel = sanitize_entry_path(&raw_path)?;
        budget.charge(&rel.display().to_string(), entry.size())?;

        let target = logs_dir.join(&rel);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        let written = std::io::copy(&mut entry, &mut out)?;
        stats.files += 1;
        stats.bytes += written;
    }
    Ok(stats)
}

/// Normalize an archive entry path to a safe workspace-relative path.
/// Absolute paths, parent traversal, and drive prefixes are rejected.
fn sanitize_entry_path(path: &Path) -> MaterializeResult<PathBuf> {
    let mut clean = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(MaterializeError::PathTraversal(path.display().to_string()));
            }
        }
    }
    if clean.as_os_str().is_empty() {
        return Err(MaterializeError::PathTraversal(path.display().to_string()));
    }
    Ok(clean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn budget() -> Budget {
        Budget::new(10 * 1024 * 1024, 1024 * 1024)
    }

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let options = zip::write::SimpleFileOptions::default();
            for (name, data) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(data).unwrap();
            }
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    fn tar_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        // Writes the raw name bytes directly rather than going through
        // `append_data`/`set_path`, which reject `..` components; tests need
        // to be able to construct malicious archives that real attackers
        // could still hand-craft at the byte level.
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            let name_bytes = name.as_bytes();
            header.as_old_mut().name[..name_bytes.len()].copy_from_slice(name_bytes);
            header.set_cksum();
            builder.append(&header, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_sanitize_rejects_traversal() {
        assert!(sanitize_entry_path(Path::new("../escape.log")).is_err());
        assert!(sanitize_entry_path(Path::new("/etc/passwd")).is_err());
        assert!(sanitize_entry_path(Path::new("a/../../b")).is_err());
        assert_eq!(
            sanitize_entry_path(Path::new("./sub/dir/file.log")).unwrap(),
            PathBuf::from("sub/dir/file.log")
        );
    }

    #[test]
    fn test_extract_zip_preserves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[
            ("device.log", b"alpha\n".as_slice()),
            ("sub/app.log", b"beta\n".as_slice()),
        ]);
        let stats = extract_zip(&bytes, dir.path(), &mut budget()).unwrap();
        assert_eq!(stats.files, 2);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("sub/app.log")).unwrap(),
            "beta\n"
        );
    }

    #[test]
    fn test_extract_zip_rejects_traversal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = zip_bytes(&[("../evil.log", b"x".as_slice())]);
        let err = extract_zip(&bytes, dir.path(), &mut budget()).unwrap_err();
        assert!(matches!(err, MaterializeError::PathTraversal(_)));
        assert!(!dir.path().parent().unwrap().join("evil.log").exists());
    }

    #[test]
    fn test_extract_tar_rejects_traversal_entry() {
        let dir = tempfile::tempdir().unwrap();
        let bytes = tar_bytes(&[("../evil.log", b"x".as_slice())]);
        let err = extract_tar(&bytes, dir.path(), &mut budget()).unwrap_err();
        assert!(matches!(err, MaterializeError::PathTraversal(_)));
    }

    #[test]
    fn test_budget_entry_cap() {
        let mut b = Budget::new(100, 10);
        assert!(matches!(
            b.charge("big.log", 11),
            Err(MaterializeError::EntryTooLarge { .. })
        ));
    }

    #[test]
    fn test_budget_total_cap() {
        let mut b = Budget::new(15, 10);
        b.charge("one.log", 10).unwrap();
        assert!(matches!(
            b.charge("two.log", 10),
            Err(MaterializeError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn test_gunzip_roundtrip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"log line\n").unwrap();
        let gz = encoder.finish().unwrap();
        let out = gunzip("x.gz", &gz, &budget()).unwrap();
        assert_eq!(out, b"log line\n");
    }

    #[test]
    fn test_extract_payload_plain_file() {
        let dir = tempfile::tempdir().unwrap();
        let stats =
            extract_payload("plain.log", b"hello\n", dir.path(), &mut budget()).unwrap();
        assert_eq!(stats.files, 1);
        assert!(dir.path().join("plain.log").is_file());
    }

    #[test]
    fn test_extract_payload_tgz() {
        let dir = tempfile::tempdir().unwrap();
        let tar = tar_bytes(&[("nested/x.log", b"deep\n".as_slice())]);
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar).unwrap();
        let tgz = encoder.finish().unwrap();

        let stats = extract_payload("bundle.tar.gz", &tgz, dir.path(), &mut budget()).unwrap();
        assert_eq!(stats.files, 1);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("nested/x.log")).unwrap(),
            "deep\n"
        );
    }

    struct XorCodec;
    impl LogCodec for XorCodec {
        fn decrypt(&self, _name: &str, bytes: &[u8]) -> Result<Vec<u8>, String> {
            Ok(bytes.iter().map(|b| b ^ 0x5a).collect())
        }
    }

    #[tokio::test]
    async fn test_materialize_decrypts_suffixed_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let payload_dir = tempfile::tempdir().unwrap();
        let plain = b"2024-01-01 boot ok\n";
        let scrambled: Vec<u8> = plain.iter().map(|b| b ^ 0x5a).collect();
        let payload_path = payload_dir.path().join("device.log.enc");
        std::fs::write(&payload_path, &scrambled).unwrap();

        let issue = test_issue(vec![LogArtifact {
            name: "device.log.enc".to_string(),
            token: None,
            local_path: Some(payload_path.display().to_string()),
            size: scrambled.len() as u64,
        }]);

        let ws = Workspace::create(dir.path(), uuid::Uuid::new_v4()).unwrap();
        let materializer = Materializer::new(
            WorkspaceConfig::default(),
            Arc::new(NoResolver),
            Arc::new(XorCodec),
            Duration::from_secs(30),
        );
        let summary = materializer
            .materialize(&issue, &ws, None, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.decrypted, 1);
        assert_eq!(
            std::fs::read(ws.logs_dir().join("device.log")).unwrap(),
            plain
        );
    }

    #[tokio::test]
    async fn test_mirror_code_without_root_is_advisory() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::create(dir.path(), uuid::Uuid::new_v4()).unwrap();
        let materializer = Materializer::new(
            WorkspaceConfig::default(),
            Arc::new(NoResolver),
            Arc::new(PassthroughCodec),
            Duration::from_secs(30),
        );
        let unavailable = materializer.mirror_code_tree(&ws).unwrap();
        assert!(unavailable);
        assert!(!ws.code_dir().exists());
    }

    #[tokio::test]
    async fn test_materialize_reports_phases() {
        let dir = tempfile::tempdir().unwrap();
        let payload_dir = tempfile::tempdir().unwrap();
        let payload_path = payload_dir.path().join("a.log");
        std::fs::write(&payload_path, b"plain\n").unwrap();
        let issue = test_issue(vec![LogArtifact {
            name: "a.log".to_string(),
            token: None,
            local_path: Some(payload_path.display().to_string()),
            size: 6,
        }]);
        let ws = Workspace::create(dir.path(), uuid::Uuid::new_v4()).unwrap();
        let materializer = Materializer::new(
            WorkspaceConfig::default(),
            Arc::new(NoResolver),
            Arc::new(PassthroughCodec),
            Duration::from_secs(30),
        );
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        materializer
            .materialize(&issue, &ws, Some(&tx), &CancellationToken::new())
            .await
            .unwrap();
        drop(tx);
        let mut phases = Vec::new();
        while let Some(phase) = rx.recv().await {
            phases.push(phase);
        }
        assert_eq!(
            phases,
            vec![
                MaterializePhase::Fetching { index: 0, total: 1 },
                MaterializePhase::Decrypting { index: 0, total: 1 },
                MaterializePhase::Extracting { index: 0, total: 1 },
            ]
        );
    }

    struct NoResolver;

    #[async_trait]
    impl ArtifactResolver for NoResolver {
        async fn fetch(&self, artifact: &LogArtifact) -> MaterializeResult<Vec<u8>> {
            Err(MaterializeError::FetchFailed {
                name: artifact.name.clone(),
                message: "no resolver configured".to_string(),
            })
        }
    }

    fn test_issue(artifacts: Vec<LogArtifact>) -> Issue {
        Issue {
            record_id: "REC-1".to_string(),
            description: "test".to_string(),
            priority: Default::default(),
            device_serial: None,
            firmware: None,
            app_version: None,
            platform: None,
            category: None,
            source: Default::default(),
            external_links: vec![],
            created_by: None,
            created_at: chrono::Utc::now(),
            log_artifacts: artifacts,
            event_date: None,
            webhook_url: None,
            soft_deleted: false,
        }
    }
}
