//! Bundle download, verification and extraction.
//!
//! A download allocates a fresh bundle id, registers it as `downloading`,
//! fetches the archive, decrypts and verifies it, extracts it under the
//! bundle's `www/` directory with path-safety checks, and finally runs the
//! optional manifest (delta) pass. Any failure removes the bundle directory
//! and its registry record before the error is re-surfaced.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument, warn};

use crate::api::ManifestEntry;
use crate::config::UpdaterConfig;
use crate::crypto::{self, Crypto};
use crate::error::{Result, UpdateError};
use crate::store::{BundleInfo, BundleStatus, Store, BUNDLES_DIR};

/// Progress callback, invoked with a 0-100 percentage.
pub type ProgressFn = dyn Fn(u8) + Send + Sync;

/// Everything the server told us about one downloadable bundle.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub version: String,
    pub checksum: Option<String>,
    pub session_key: Option<String>,
    pub manifest: Vec<ManifestEntry>,
    /// Known-good tree (the current bundle's `www/`) used for manifest
    /// cache hits.
    pub cache_tree: Option<PathBuf>,
}

/// Downloads and installs bundles below `<userData>/capgo-bundles/`.
pub struct Downloader {
    client: reqwest::Client,
    bundles_dir: PathBuf,
    store: Arc<RwLock<Store>>,
    crypto: Arc<Crypto>,
    auto_delete_failed: bool,
}

impl Downloader {
    pub fn new(
        config: &UpdaterConfig,
        client: reqwest::Client,
        store: Arc<RwLock<Store>>,
        crypto: Arc<Crypto>,
    ) -> Self {
        Self {
            client,
            bundles_dir: config.user_data_dir.join(BUNDLES_DIR),
            store,
            crypto,
            auto_delete_failed: config.auto_delete_failed,
        }
    }

    /// Download, verify and extract one bundle.
    #[instrument(skip(self, request, progress), fields(version = %request.version))]
    pub async fn download_bundle(
        &self,
        request: DownloadRequest,
        progress: Option<&ProgressFn>,
    ) -> Result<BundleInfo> {
        let id = crypto::generate_bundle_id();
        let bundle_dir = self.bundles_dir.join(&id);
        fs::create_dir_all(&bundle_dir).await?;

        {
            let mut store = self.store.write().await;
            store.set_bundle(BundleInfo::new(
                &id,
                &request.version,
                "",
                BundleStatus::Downloading,
            ));
            store.save().await?;
        }
        info!(id = %id, url = %request.url, "Bundle download started");

        match self.run(&id, &request, progress).await {
            Ok(bundle) => {
                info!(id = %id, checksum = %bundle.checksum, "Bundle installed");
                Ok(bundle)
            }
            Err(e) => {
                error!(id = %id, error = %e, "Bundle download failed, cleaning up");
                let _ = fs::remove_dir_all(&bundle_dir).await;
                let mut store = self.store.write().await;
                if self.auto_delete_failed {
                    store.remove_bundle(&id);
                } else {
                    store.set_bundle_status(&id, BundleStatus::Error);
                }
                let _ = store.save().await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        id: &str,
        request: &DownloadRequest,
        progress: Option<&ProgressFn>,
    ) -> Result<BundleInfo> {
        let bundle_dir = self.bundles_dir.join(id);
        let zip_path = bundle_dir.join("bundle.zip");

        self.fetch_to_file(&request.url, &zip_path, progress).await?;

        // Decrypt before verifying: the expected digest covers the bytes the
        // host will actually run.
        if let Some(session_key) = &request.session_key {
            self.crypto.decrypt_file(&zip_path, session_key).await?;
        }

        let checksum = self.resolve_and_verify_checksum(&zip_path, request).await?;

        let www = bundle_dir.join("www");
        fs::create_dir_all(&www).await?;
        extract_zip(&zip_path, &www)?;
        fs::remove_file(&zip_path).await?;

        if !request.manifest.is_empty() {
            self.manifest_pass(
                &www,
                &request.manifest,
                request.cache_tree.as_deref(),
                progress,
            )
            .await?;
        }

        let bundle = BundleInfo::new(id, &request.version, &checksum, BundleStatus::Success);
        let mut store = self.store.write().await;
        store.set_bundle(bundle.clone());
        store.save().await?;
        Ok(bundle)
    }

    /// Resolve the expected digest (decrypting the checksum field when a
    /// session key is present) and verify the archive against it. Without an
    /// expected digest the computed one is recorded instead.
    async fn resolve_and_verify_checksum(
        &self,
        zip_path: &Path,
        request: &DownloadRequest,
    ) -> Result<String> {
        let actual = crypto::hash_file(zip_path).await?;

        let Some(field) = request.checksum.as_deref().filter(|c| !c.is_empty()) else {
            return Ok(actual);
        };

        // On decode failure the field is used verbatim.
        let expected = match &request.session_key {
            Some(session_key) => self
                .crypto
                .decrypt_checksum(field, session_key)
                .unwrap_or_else(|| field.to_string()),
            None => field.to_string(),
        };

        if !crypto::constant_time_eq(actual.as_bytes(), expected.as_bytes()) {
            return Err(UpdateError::ChecksumFailed { expected, actual });
        }
        Ok(expected)
    }

    async fn fetch_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::HttpStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        let total = response.content_length().unwrap_or(0);
        let mut file = fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        let mut downloaded = 0u64;
        let mut last_percent = 0u8;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;
            if total > 0 {
                let percent = ((downloaded as f64 / total as f64) * 100.0) as u8;
                if percent != last_percent {
                    last_percent = percent;
                    if let Some(cb) = progress {
                        cb(percent.min(100));
                    }
                }
            }
        }
        file.flush().await?;
        debug!(url = %url, bytes = downloaded, "Fetched");
        Ok(())
    }

    /// Per-file delta pass: reuse what already matches, fetch the rest.
    async fn manifest_pass(
        &self,
        www: &Path,
        entries: &[ManifestEntry],
        cache_tree: Option<&Path>,
        progress: Option<&ProgressFn>,
    ) -> Result<()> {
        let www_canon = fs::canonicalize(www).await?;
        let total = entries.len();

        for (idx, entry) in entries.iter().enumerate() {
            let rel = safe_entry_path(&entry.file_name)?;
            let target = www_canon.join(&rel);
            if !target.starts_with(&www_canon) {
                return Err(UpdateError::ZipSlip(entry.file_name.clone()));
            }
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent).await?;
            }

            if !self.manifest_cache_hit(&target, &rel, entry, cache_tree).await? {
                self.fetch_manifest_entry(&target, entry).await?;
            }

            if let Some(cb) = progress {
                cb((((idx + 1) * 100) / total) as u8);
            }
        }
        Ok(())
    }

    /// True when the target (or the same path in the known-good tree)
    /// already carries the expected content.
    async fn manifest_cache_hit(
        &self,
        target: &Path,
        rel: &Path,
        entry: &ManifestEntry,
        cache_tree: Option<&Path>,
    ) -> Result<bool> {
        if fs::metadata(target).await.is_ok() {
            let hit = match &entry.file_hash {
                None => true,
                Some(expected) => crypto::verify_file(target, expected).await?,
            };
            if hit {
                debug!(file = %entry.file_name, "Manifest entry already present");
                return Ok(true);
            }
        }

        if let Some(cache) = cache_tree {
            let source = cache.join(rel);
            if fs::metadata(&source).await.is_ok() {
                let usable = match &entry.file_hash {
                    None => true,
                    Some(expected) => crypto::verify_file(&source, expected).await?,
                };
                if usable {
                    fs::copy(&source, target).await?;
                    debug!(file = %entry.file_name, "Manifest cache hit");
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    async fn fetch_manifest_entry(&self, target: &Path, entry: &ManifestEntry) -> Result<()> {
        let response = self.client.get(&entry.download_url).send().await?;
        if !response.status().is_success() {
            return Err(UpdateError::HttpStatus {
                status: response.status().as_u16(),
                url: entry.download_url.clone(),
            });
        }
        let bytes = response.bytes().await?;
        let bytes = crypto::try_decompress_brotli(&bytes);

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = target.with_file_name(format!("{file_name}.tmp"));
        fs::write(&tmp, &bytes).await?;
        fs::rename(&tmp, target).await?;

        if let Some(expected) = &entry.file_hash {
            let actual = crypto::hash_file(target).await?;
            if !crypto::constant_time_eq(actual.as_bytes(), expected.as_bytes()) {
                return Err(UpdateError::HashFailed {
                    file: entry.file_name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(())
    }
}

/// Extract an archive into `www`, refusing any entry that would land
/// outside it. Enforcement happens before any entry bytes are written.
fn extract_zip(zip_path: &Path, www: &Path) -> Result<()> {
    let file = std::fs::File::open(zip_path)?;
    let mut archive = zip::ZipArchive::new(file)?;
    let www_canon = std::fs::canonicalize(www)?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let raw = entry.name().to_string();
        let rel = safe_entry_path(&raw)?;
        let target = www_canon.join(&rel);
        if !target.starts_with(&www_canon) {
            warn!(entry = %raw, "Archive entry escapes extraction directory");
            return Err(UpdateError::ZipSlip(raw));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = std::fs::File::create(&target)?;
            std::io::copy(&mut entry, &mut out)?;
        }
    }
    Ok(())
}

/// Validate an archive or manifest entry name and reduce it to a safe
/// relative path: no absolute paths, no `..` segments, no non-normal
/// components.
fn safe_entry_path(raw: &str) -> Result<PathBuf> {
    let reject = || UpdateError::ZipSlip(raw.to_string());

    if raw.is_empty() || raw.starts_with('/') || raw.starts_with('\\') {
        return Err(reject());
    }
    if raw.split(['/', '\\']).any(|segment| segment == "..") {
        return Err(reject());
    }

    let mut out = PathBuf::new();
    for component in Path::new(raw).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(reject())
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(reject());
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::build_client;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    fn downloader(dir: &TempDir, store: Arc<RwLock<Store>>) -> Downloader {
        let config = UpdaterConfig {
            user_data_dir: dir.path().to_path_buf(),
            response_timeout_secs: 2,
            ..Default::default()
        };
        let client = build_client(&config).unwrap();
        Downloader::new(&config, client, store, Arc::new(Crypto::new(None).unwrap()))
    }

    #[test]
    fn test_safe_entry_path_accepts_normal_names() {
        assert_eq!(
            safe_entry_path("www/index.html").unwrap(),
            PathBuf::from("www/index.html")
        );
        assert_eq!(safe_entry_path("./a/b.js").unwrap(), PathBuf::from("a/b.js"));
    }

    #[test]
    fn test_safe_entry_path_rejects_traversal() {
        for name in [
            "../../evil.sh",
            "a/../b",
            "..",
            "/etc/passwd",
            "\\windows\\evil",
            "a\\..\\b",
            "",
        ] {
            assert!(
                matches!(safe_entry_path(name), Err(UpdateError::ZipSlip(_))),
                "{name} should be rejected"
            );
        }
    }

    #[test]
    fn test_extract_zip_happy_path() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        write_zip(
            &zip_path,
            &[
                ("index.html", b"<html></html>".as_slice()),
                ("js/app.js", b"console.log(1)".as_slice()),
            ],
        );

        let www = dir.path().join("www");
        std::fs::create_dir_all(&www).unwrap();
        extract_zip(&zip_path, &www).unwrap();

        assert!(www.join("index.html").is_file());
        assert!(www.join("js/app.js").is_file());
    }

    #[test]
    fn test_extract_zip_rejects_slip_before_writing() {
        let dir = TempDir::new().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        write_zip(
            &zip_path,
            &[("../../evil.sh", b"#!/bin/sh".as_slice())],
        );

        let www = dir.path().join("sub").join("www");
        std::fs::create_dir_all(&www).unwrap();
        let err = extract_zip(&zip_path, &www).unwrap_err();
        assert!(matches!(err, UpdateError::ZipSlip(_)));
        assert!(!dir.path().join("evil.sh").exists());
        assert!(!dir.path().join("sub").join("evil.sh").exists());
    }

    #[tokio::test]
    async fn test_manifest_cache_hits_skip_fetching() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RwLock::new(Store::open(dir.path()).await));
        let dl = downloader(&dir, store);

        let www = dir.path().join("www");
        fs::create_dir_all(www.join("js")).await.unwrap();
        fs::write(www.join("index.html"), b"<html>").await.unwrap();
        fs::write(www.join("js/app.js"), b"let x = 1;").await.unwrap();

        let cache = dir.path().join("previous");
        fs::create_dir_all(&cache).await.unwrap();
        fs::write(cache.join("style.css"), b"body{}").await.unwrap();

        let entries = vec![
            ManifestEntry {
                file_name: "index.html".to_string(),
                download_url: "http://127.0.0.1:1/unreachable".to_string(),
                file_hash: Some(crypto::hash_file(&www.join("index.html")).await.unwrap()),
            },
            // No hash: presence is enough.
            ManifestEntry {
                file_name: "js/app.js".to_string(),
                download_url: "http://127.0.0.1:1/unreachable".to_string(),
                file_hash: None,
            },
            // Missing locally, present in the known-good tree.
            ManifestEntry {
                file_name: "style.css".to_string(),
                download_url: "http://127.0.0.1:1/unreachable".to_string(),
                file_hash: Some(crypto::hash_file(&cache.join("style.css")).await.unwrap()),
            },
        ];

        dl.manifest_pass(&www, &entries, Some(&cache), None)
            .await
            .unwrap();
        assert_eq!(
            fs::read(www.join("style.css")).await.unwrap(),
            b"body{}".to_vec()
        );
    }

    #[tokio::test]
    async fn test_failed_download_cleans_up() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RwLock::new(Store::open(dir.path()).await));
        let dl = downloader(&dir, store.clone());

        let err = dl
            .download_bundle(
                DownloadRequest {
                    url: "http://127.0.0.1:1/bundle.zip".to_string(),
                    version: "1.0.1".to_string(),
                    checksum: None,
                    session_key: None,
                    manifest: Vec::new(),
                    cache_tree: None,
                },
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::Transport(_)));

        // No orphan record, no orphan directory.
        let store = store.read().await;
        assert!(store.list_bundles().is_empty());
        let bundles_root = dir.path().join(BUNDLES_DIR);
        if bundles_root.exists() {
            assert_eq!(std::fs::read_dir(&bundles_root).unwrap().count(), 0);
        }
    }

    #[tokio::test]
    async fn test_checksum_mismatch_detected() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(RwLock::new(Store::open(dir.path()).await));
        let dl = downloader(&dir, store);

        let zip_path = dir.path().join("bundle.zip");
        fs::write(&zip_path, b"archive bytes").await.unwrap();

        let request = DownloadRequest {
            url: String::new(),
            version: "1.0.1".to_string(),
            checksum: Some("deadbeef".repeat(8)),
            session_key: None,
            manifest: Vec::new(),
            cache_tree: None,
        };
        let err = dl
            .resolve_and_verify_checksum(&zip_path, &request)
            .await
            .unwrap_err();
        assert!(matches!(err, UpdateError::ChecksumFailed { .. }));

        // Without an expected digest the computed one is recorded.
        let request = DownloadRequest {
            checksum: None,
            ..request
        };
        let digest = dl
            .resolve_and_verify_checksum(&zip_path, &request)
            .await
            .unwrap();
        assert_eq!(digest, crypto::hash_file(&zip_path).await.unwrap());
    }
}
