//! Integration tests for the updater.
//!
//! A minimal in-process HTTP server plays the update service so full cycles
//! (check → download → verify → extract → promote → confirm) run against
//! real sockets and a real filesystem.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tempfile::TempDir;

use electron_updater::{
    BundleStatus, HostIntegration, UpdateError, Updater, UpdaterConfig, UpdaterEvent,
};

/// Records reload requests issued to the host.
#[derive(Default)]
struct RecordingHost {
    reloads: Mutex<Vec<PathBuf>>,
}

impl HostIntegration for RecordingHost {
    fn reload(&self, index_path: &Path) {
        self.reloads.lock().unwrap().push(index_path.to_path_buf());
    }
}

/// Serve fixed bodies keyed by request path. The thread is detached and
/// dies with the test process.
fn serve(routes: HashMap<String, Vec<u8>>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { continue };
            let routes = routes.clone();
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                // Read until the end of headers.
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match stream.read(&mut chunk) {
                        Ok(0) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => return,
                    }
                }
                let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
                let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                let content_length = head
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                while buf.len() < head_end + content_length {
                    match stream.read(&mut chunk) {
                        Ok(0) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => return,
                    }
                }

                let path = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or("/")
                    .to_string();

                match routes.get(&path) {
                    Some(body) => {
                        let _ = write!(
                            stream,
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nContent-Type: application/octet-stream\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let _ = stream.write_all(body);
                    }
                    None => {
                        let _ = write!(
                            stream,
                            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                        );
                    }
                }
            });
        }
    });

    format!("http://{addr}")
}

fn make_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        for (name, data) in entries {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

async fn make_updater(
    dir: &TempDir,
    update_url: &str,
) -> (Arc<Updater>, Arc<RecordingHost>) {
    let config = UpdaterConfig {
        app_id: "com.demo.app".to_string(),
        user_data_dir: dir.path().to_path_buf(),
        builtin_path: dir.path().join("builtin").join("index.html"),
        builtin_version: "1.0.0".to_string(),
        update_url: update_url.to_string(),
        stats_url: String::new(),
        auto_update: false,
        response_timeout_secs: 5,
        app_ready_timeout_ms: 10_000,
        ..Default::default()
    };
    let host = Arc::new(RecordingHost::default());
    let updater = Updater::new(config, host.clone()).await.unwrap();
    updater.initialize().await.unwrap();
    (updater, host)
}

#[tokio::test]
async fn test_happy_path_update_cycle() {
    let zip = make_zip(&[
        ("index.html", b"<html>v1.0.1</html>".as_slice()),
        ("js/app.js", b"console.log('hi')".as_slice()),
    ]);
    let checksum = sha256_hex(&zip);

    let mut routes = HashMap::new();
    routes.insert("/b.zip".to_string(), zip);
    let base = serve(routes.clone());
    let update_body = serde_json::json!({
        "version": "1.0.1",
        "url": format!("{base}/b.zip"),
        "checksum": checksum.clone(),
    });
    let mut routes = routes;
    routes.insert(
        "/updates".to_string(),
        serde_json::to_vec(&update_body).unwrap(),
    );
    let base = serve(routes);

    let dir = TempDir::new().unwrap();
    let (updater, host) = make_updater(&dir, &format!("{base}/updates")).await;
    let mut events = updater.events();

    let bundle = updater.check_for_updates().await.unwrap().unwrap();
    assert_eq!(bundle.version, "1.0.1");
    assert_eq!(bundle.checksum, checksum);

    // Gate open: the staged bundle was applied and the host reloaded.
    let current = updater.current().await;
    assert_eq!(current.id, bundle.id);
    let reloaded_to = host.reloads.lock().unwrap().last().unwrap().clone();
    assert!(reloaded_to.ends_with(Path::new(&bundle.id).join("www").join("index.html")));
    assert_eq!(
        std::fs::read(&reloaded_to).unwrap(),
        b"<html>v1.0.1</html>".to_vec()
    );

    let confirmed = updater.notify_app_ready().await.unwrap();
    assert_eq!(confirmed.status, BundleStatus::Success);

    // The builtin descriptor survives alongside the new bundle.
    let all = updater.list(true).await;
    assert!(all.iter().any(|b| b.is_builtin()));
    assert!(all.iter().any(|b| b.id == bundle.id));

    let mut saw_available = false;
    let mut saw_complete = false;
    let mut saw_ready = false;
    while let Ok(event) = events.try_recv() {
        match event {
            UpdaterEvent::UpdateAvailable { version } => {
                assert_eq!(version, "1.0.1");
                saw_available = true;
            }
            UpdaterEvent::DownloadComplete { bundle } => {
                assert_eq!(bundle.version, "1.0.1");
                saw_complete = true;
            }
            UpdaterEvent::AppReady { .. } => saw_ready = true,
            _ => {}
        }
    }
    assert!(saw_available && saw_complete && saw_ready);

    updater.shutdown();
}

#[tokio::test]
async fn test_checksum_mismatch_discards_bundle() {
    let zip = make_zip(&[("index.html", b"<html></html>".as_slice())]);

    let mut routes = HashMap::new();
    routes.insert("/b.zip".to_string(), zip);
    let base = serve(routes.clone());
    let update_body = serde_json::json!({
        "version": "1.0.1",
        "url": format!("{base}/b.zip"),
        "checksum": "deadbeef".repeat(8),
    });
    let mut routes = routes;
    routes.insert(
        "/updates".to_string(),
        serde_json::to_vec(&update_body).unwrap(),
    );
    let base = serve(routes);

    let dir = TempDir::new().unwrap();
    let (updater, _) = make_updater(&dir, &format!("{base}/updates")).await;
    let mut events = updater.events();

    let err = updater.check_for_updates().await.unwrap_err();
    assert!(matches!(err, UpdateError::ChecksumFailed { .. }));

    // Bundle directory and record are gone, current unchanged.
    assert!(updater.current().await.is_builtin());
    assert!(updater.list(false).await.is_empty());

    let mut saw_failed = false;
    while let Ok(event) = events.try_recv() {
        if let UpdaterEvent::DownloadFailed { version } = event {
            assert_eq!(version, "1.0.1");
            saw_failed = true;
        }
    }
    assert!(saw_failed);

    updater.shutdown();
}

#[tokio::test]
async fn test_zip_slip_entry_never_escapes() {
    let zip = make_zip(&[("../../evil.sh", b"#!/bin/sh".as_slice())]);
    let checksum = sha256_hex(&zip);

    let mut routes = HashMap::new();
    routes.insert("/b.zip".to_string(), zip);
    let base = serve(routes.clone());
    let update_body = serde_json::json!({
        "version": "1.0.2",
        "url": format!("{base}/b.zip"),
        "checksum": checksum,
    });
    let mut routes = routes;
    routes.insert(
        "/updates".to_string(),
        serde_json::to_vec(&update_body).unwrap(),
    );
    let base = serve(routes);

    let dir = TempDir::new().unwrap();
    let (updater, _) = make_updater(&dir, &format!("{base}/updates")).await;

    let err = updater.check_for_updates().await.unwrap_err();
    assert!(matches!(err, UpdateError::ZipSlip(_)));

    // Nothing was written outside any bundle's www/ directory.
    assert!(!dir.path().join("evil.sh").exists());
    assert!(!dir.path().join("capgo-bundles").join("evil.sh").exists());
    assert!(updater.list(false).await.is_empty());

    updater.shutdown();
}

#[tokio::test]
async fn test_no_new_version_is_quiet() {
    let mut routes = HashMap::new();
    routes.insert(
        "/updates".to_string(),
        serde_json::to_vec(&serde_json::json!({"error": "no_new_version_available"})).unwrap(),
    );
    let base = serve(routes);

    let dir = TempDir::new().unwrap();
    let (updater, host) = make_updater(&dir, &format!("{base}/updates")).await;
    let mut events = updater.events();

    assert!(updater.check_for_updates().await.unwrap().is_none());
    assert!(host.reloads.lock().unwrap().is_empty());

    let mut saw_quiet = false;
    while let Ok(event) = events.try_recv() {
        if let UpdaterEvent::NoNeedUpdate { bundle } = event {
            assert!(bundle.is_builtin());
            saw_quiet = true;
        }
    }
    assert!(saw_quiet);

    updater.shutdown();
}

#[tokio::test]
async fn test_breaking_update_skips_auto_download() {
    let mut routes = HashMap::new();
    routes.insert(
        "/updates".to_string(),
        serde_json::to_vec(&serde_json::json!({
            "version": "2.0.0",
            "url": "http://unused.invalid/b.zip",
            "breaking": true,
        }))
        .unwrap(),
    );
    let base = serve(routes);

    let dir = TempDir::new().unwrap();
    let (updater, _) = make_updater(&dir, &format!("{base}/updates")).await;
    let mut events = updater.events();

    assert!(updater.check_for_updates().await.unwrap().is_none());
    assert!(updater.list(false).await.is_empty());

    let mut saw_breaking = false;
    let mut saw_major = false;
    while let Ok(event) = events.try_recv() {
        match event {
            UpdaterEvent::BreakingAvailable { version } => {
                assert_eq!(version, "2.0.0");
                saw_breaking = true;
            }
            UpdaterEvent::MajorAvailable { .. } => saw_major = true,
            _ => {}
        }
    }
    assert!(saw_breaking && saw_major);

    updater.shutdown();
}

#[tokio::test]
async fn test_storage_survives_restart() {
    let zip = make_zip(&[("index.html", b"<html>persisted</html>".as_slice())]);
    let checksum = sha256_hex(&zip);

    let mut routes = HashMap::new();
    routes.insert("/b.zip".to_string(), zip);
    let base = serve(routes.clone());
    let update_body = serde_json::json!({
        "version": "3.1.4",
        "url": format!("{base}/b.zip"),
        "checksum": checksum,
    });
    let mut routes = routes;
    routes.insert(
        "/updates".to_string(),
        serde_json::to_vec(&update_body).unwrap(),
    );
    let base = serve(routes);

    let dir = TempDir::new().unwrap();
    let (first_device_id, bundle) = {
        let (updater, _) = make_updater(&dir, &format!("{base}/updates")).await;
        let bundle = updater.check_for_updates().await.unwrap().unwrap();
        updater.notify_app_ready().await.unwrap();
        let device_id = updater.get_device_id().await;
        updater.shutdown();
        (device_id, bundle)
    };

    // Give the first instance a beat to finish persisting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (reopened, _) = make_updater(&dir, &format!("{base}/updates")).await;
    assert_eq!(reopened.get_device_id().await, first_device_id);

    let current = reopened.current().await;
    assert_eq!(current.id, bundle.id);
    assert_eq!(current.version, "3.1.4");
    assert_eq!(current.checksum, bundle.checksum);
    assert_eq!(current.status, BundleStatus::Success);

    reopened.shutdown();
}
