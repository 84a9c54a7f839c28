//! Integration tests for ModelRuntimeManager

mod common;

use std::time::Duration;

use common::*;
use folio_runtime::{DownloadState, RuntimeError, RuntimeEvent};
use sha2::{Digest, Sha256};

// ============================================================================
// Unknown Model Tests
// ============================================================================

#[tokio::test]
async fn test_unknown_model_rejected_everywhere() {
    let h = harness(vec![descriptor("http://127.0.0.1:9", "alpha", b"abc")]);

    assert!(matches!(
        h.manager.download_model("nope").await,
        Err(RuntimeError::UnknownModel(id)) if id == "nope"
    ));
    assert!(matches!(
        h.manager.delete_model("nope").await,
        Err(RuntimeError::UnknownModel(_))
    ));
    assert!(matches!(
        h.manager.set_active_model("nope").await,
        Err(RuntimeError::UnknownModel(_))
    ));
}

// ============================================================================
// Listing Tests
// ============================================================================

#[tokio::test]
async fn test_list_models_initial_state() {
    let h = harness(vec![
        descriptor("http://127.0.0.1:9", "alpha", b"abc"),
        descriptor("http://127.0.0.1:9", "beta", b"defg"),
    ]);

    let models = h.manager.list_models().await;
    let ids: Vec<&str> = models.iter().map(|m| m.id()).collect();
    assert_eq!(ids, vec!["alpha", "beta"]);

    for model in &models {
        assert!(!model.downloaded);
        assert!(!model.active);
        assert_eq!(model.download_state, DownloadState::Idle);
        assert!(model.download_progress.is_none());
        assert!(model.error.is_none());
    }
}

#[tokio::test]
async fn test_file_placed_by_hand_is_detected() {
    let body = weights(64, 1);
    let h = harness(vec![descriptor("http://127.0.0.1:9", "alpha", &body)]);

    let path = h.manager.model_path("alpha").unwrap();
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(&path, &body).unwrap();

    let status = status_of(&h.manager, "alpha").await;
    assert!(status.downloaded);
    assert_eq!(status.download_state, DownloadState::Complete);

    // Wrong size does not count as downloaded
    std::fs::write(&path, &body[..10]).unwrap();
    let status = status_of(&h.manager, "alpha").await;
    assert!(!status.downloaded);
    assert_eq!(status.download_state, DownloadState::Idle);
}

// ============================================================================
// Download Tests
// ============================================================================

#[tokio::test]
async fn test_download_completes() {
    let body = weights(4096, 3);
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let h = harness(vec![descriptor(&server.url(), "alpha", &body)]);
    let status = install(&h.manager, "alpha").await;

    assert!(status.downloaded);
    assert_eq!(status.download_state, DownloadState::Complete);
    assert!(status.download_progress.is_none());

    let path = h.manager.model_path("alpha").unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), body);
    assert!(!path.with_file_name("alpha.gguf.part").exists());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_concurrent_downloads_share_one_transfer() {
    let body = weights(256 * 1024, 5);
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .expect(1)
        .create_async()
        .await;

    let h = harness(vec![descriptor(&server.url(), "alpha", &body)]);

    let (first, second) = tokio::join!(
        h.manager.download_model("alpha"),
        h.manager.download_model("alpha")
    );
    assert!(first.is_ok());
    assert!(second.is_ok());

    wait_for_state(&h.manager, "alpha", DownloadState::Complete).await;

    // Already downloaded: no second transfer
    h.manager.download_model("alpha").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    mock.assert_async().await;
}

#[tokio::test]
async fn test_http_error_sets_error_state_and_retry_recovers() {
    let body = weights(1024, 9);
    let mut server = mockito::Server::new_async().await;
    let failing = server
        .mock("GET", "/alpha.gguf")
        .with_status(500)
        .create_async()
        .await;

    let h = harness(vec![descriptor(&server.url(), "alpha", &body)]);
    h.manager.download_model("alpha").await.unwrap();

    let status = wait_for_state(&h.manager, "alpha", DownloadState::Error).await;
    assert!(!status.downloaded);
    assert!(status.error.as_deref().unwrap().contains("500"));
    assert!(!h.manager.model_path("alpha").unwrap().exists());

    // The error is retained across queries
    let status = status_of(&h.manager, "alpha").await;
    assert_eq!(status.download_state, DownloadState::Error);

    failing.remove_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let status = install(&h.manager, "alpha").await;
    assert!(status.downloaded);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_connection_dropped_mid_download() {
    let base = partial_body_server(10_000, 1_000, false).await;
    let mut entry = descriptor(&base, "alpha", &[]);
    entry.size_bytes = 10_000;

    let h = harness(vec![entry]);
    h.manager.download_model("alpha").await.unwrap();

    let status = wait_for_state(&h.manager, "alpha", DownloadState::Error).await;
    assert!(!status.downloaded);
    assert!(status.error.is_some());

    let path = h.manager.model_path("alpha").unwrap();
    assert!(!path.exists());
    assert!(!path.with_file_name("alpha.gguf.part").exists());
}

#[tokio::test]
async fn test_checksum_mismatch_is_an_error() {
    let body = weights(2048, 11);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let mut entry = descriptor(&server.url(), "alpha", &body);
    entry.sha256 = Some("00".repeat(32));

    let h = harness(vec![entry]);
    h.manager.download_model("alpha").await.unwrap();

    let status = wait_for_state(&h.manager, "alpha", DownloadState::Error).await;
    assert!(status.error.unwrap().contains("checksum mismatch"));
    assert!(!h.manager.model_path("alpha").unwrap().exists());
}

#[tokio::test]
async fn test_matching_checksum_is_accepted() {
    let body = weights(2048, 13);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let mut entry = descriptor(&server.url(), "alpha", &body);
    entry.sha256 = Some(hex::encode(Sha256::digest(&body)).to_uppercase());

    let h = harness(vec![entry]);
    let status = install(&h.manager, "alpha").await;
    assert!(status.downloaded);
}

#[tokio::test]
async fn test_server_size_wins_over_declared_size() {
    let body = weights(3000, 17);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let mut entry = descriptor(&server.url(), "alpha", &body);
    entry.size_bytes = 5000;

    let h = harness(vec![entry]);
    let status = install(&h.manager, "alpha").await;
    assert!(status.downloaded);

    // The recorded size keeps the file valid on later scans
    let status = status_of(&h.manager, "alpha").await;
    assert!(status.downloaded);
}

#[tokio::test]
async fn test_progress_visible_while_downloading() {
    let base = partial_body_server(10_000, 4_000, true).await;
    let mut entry = descriptor(&base, "alpha", &[]);
    entry.size_bytes = 10_000;

    let h = harness(vec![entry]);
    h.manager.download_model("alpha").await.unwrap();

    let progress = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let status = status_of(&h.manager, "alpha").await;
            assert_eq!(status.download_state, DownloadState::Downloading);
            let progress = status.download_progress.expect("progress while downloading");
            if progress.bytes_downloaded == 4_000 {
                return progress;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(progress.bytes_total, 10_000);
    assert!(progress.bytes_downloaded <= progress.bytes_total);
    h.manager.shutdown().await;
}

#[tokio::test]
async fn test_unrecordable_download_is_an_error() {
    let body = weights(3000, 19);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let mut entry = descriptor(&server.url(), "alpha", &body);
    entry.size_bytes = 5000;
    let h = harness(vec![entry]);

    // A directory in place of the manifest makes every manifest write fail
    let blocker = h.dir.path().join("models").join("manifest.json");
    std::fs::create_dir_all(blocker.join("occupied")).unwrap();

    h.manager.download_model("alpha").await.unwrap();
    let status = wait_for_state(&h.manager, "alpha", DownloadState::Error).await;

    assert!(!status.downloaded);
    assert!(status
        .error
        .as_deref()
        .unwrap_or_default()
        .contains("failed to record download"));
    assert!(!h.manager.model_path("alpha").unwrap().exists());

    // The error sticks across scans instead of decaying to a silent Idle
    let status = status_of(&h.manager, "alpha").await;
    assert_eq!(status.download_state, DownloadState::Error);
}

// ============================================================================
// Cancellation Tests
// ============================================================================

#[tokio::test]
async fn test_shutdown_mid_download_leaves_no_model_file() {
    let base = partial_body_server(10_000, 2_000, true).await;
    let mut entry = descriptor(&base, "alpha", &[]);
    entry.size_bytes = 10_000;

    let h = harness(vec![entry]);
    h.manager.download_model("alpha").await.unwrap();

    let path = h.manager.model_path("alpha").unwrap();
    let partial = path.with_file_name("alpha.gguf.part");
    tokio::time::timeout(Duration::from_secs(5), async {
        while !partial.exists() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    h.manager.shutdown().await;

    assert!(!path.exists());
    assert!(!partial.exists());
    let status = status_of(&h.manager, "alpha").await;
    assert!(!status.downloaded);
    assert_eq!(status.download_state, DownloadState::Idle);

    // No new work after shutdown
    assert!(h.manager.download_model("alpha").await.is_err());
}

#[tokio::test]
async fn test_delete_cancels_in_flight_download() {
    let base = partial_body_server(10_000, 2_000, true).await;
    let mut entry = descriptor(&base, "alpha", &[]);
    entry.size_bytes = 10_000;

    let h = harness(vec![entry]);
    h.manager.download_model("alpha").await.unwrap();
    assert_eq!(
        status_of(&h.manager, "alpha").await.download_state,
        DownloadState::Downloading
    );

    h.manager.delete_model("alpha").await.unwrap();

    let status = status_of(&h.manager, "alpha").await;
    assert_eq!(status.download_state, DownloadState::Idle);
    assert!(!status.downloaded);
    let path = h.manager.model_path("alpha").unwrap();
    assert!(!path.exists());
    assert!(!path.with_file_name("alpha.gguf.part").exists());
}

// ============================================================================
// Delete Tests
// ============================================================================

#[tokio::test]
async fn test_download_then_delete_round_trip() {
    let body = weights(512, 19);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let h = harness(vec![descriptor(&server.url(), "alpha", &body)]);
    install(&h.manager, "alpha").await;

    h.manager.delete_model("alpha").await.unwrap();

    let status = status_of(&h.manager, "alpha").await;
    assert!(!status.downloaded);
    assert_eq!(status.download_state, DownloadState::Idle);
    assert!(!h.manager.model_path("alpha").unwrap().exists());
}

#[tokio::test]
async fn test_delete_absent_model_is_noop() {
    let h = harness(vec![descriptor("http://127.0.0.1:9", "alpha", b"abc")]);
    h.manager.delete_model("alpha").await.unwrap();
    h.manager.delete_model("alpha").await.unwrap();
}

#[tokio::test]
async fn test_delete_clears_error_state() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(404)
        .create_async()
        .await;

    let h = harness(vec![descriptor(&server.url(), "alpha", b"abc")]);
    h.manager.download_model("alpha").await.unwrap();
    wait_for_state(&h.manager, "alpha", DownloadState::Error).await;

    h.manager.delete_model("alpha").await.unwrap();
    let status = status_of(&h.manager, "alpha").await;
    assert_eq!(status.download_state, DownloadState::Idle);
    assert!(status.error.is_none());
}

#[tokio::test]
async fn test_delete_active_model_rejected() {
    let body = weights(128, 23);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let h = harness(vec![descriptor(&server.url(), "alpha", &body)]);
    install(&h.manager, "alpha").await;
    h.manager.set_active_model("alpha").await.unwrap();

    assert!(matches!(
        h.manager.delete_model("alpha").await,
        Err(RuntimeError::ModelInUse(id)) if id == "alpha"
    ));
    assert_eq!(h.manager.get_active_model().await.as_deref(), Some("alpha"));
    assert!(h.manager.model_path("alpha").unwrap().exists());

    h.manager.deactivate().await.unwrap();
    h.manager.delete_model("alpha").await.unwrap();
    assert!(!h.manager.model_path("alpha").unwrap().exists());
}

// ============================================================================
// Activation Tests
// ============================================================================

async fn two_installed_models() -> (mockito::ServerGuard, Harness) {
    let alpha = weights(300, 29);
    let beta = weights(400, 31);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(alpha.clone())
        .create_async()
        .await;
    server
        .mock("GET", "/beta.gguf")
        .with_status(200)
        .with_body(beta.clone())
        .create_async()
        .await;

    let h = harness(vec![
        descriptor(&server.url(), "alpha", &alpha),
        descriptor(&server.url(), "beta", &beta),
    ]);
    install(&h.manager, "alpha").await;
    install(&h.manager, "beta").await;
    (server, h)
}

#[tokio::test]
async fn test_status_when_nothing_active() {
    let h = harness(vec![descriptor("http://127.0.0.1:9", "alpha", b"abc")]);

    let status = h.manager.get_status().await;
    assert!(!status.running);
    assert!(status.port.is_none());
    assert!(h.manager.get_port().await.is_none());
    assert!(h.manager.get_active_model().await.is_none());
}

#[tokio::test]
async fn test_set_active_requires_download() {
    let h = harness(vec![descriptor("http://127.0.0.1:9", "alpha", b"abc")]);

    assert!(matches!(
        h.manager.set_active_model("alpha").await,
        Err(RuntimeError::ModelNotDownloaded(id)) if id == "alpha"
    ));
    assert!(h.manager.get_active_model().await.is_none());
    assert_eq!(h.backend.starts(), 0);
}

#[tokio::test]
async fn test_set_active_not_downloaded_keeps_previous() {
    let body = weights(100, 37);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let h = harness(vec![
        descriptor(&server.url(), "alpha", &body),
        descriptor(&server.url(), "beta", b"never"),
    ]);
    install(&h.manager, "alpha").await;
    h.manager.set_active_model("alpha").await.unwrap();

    assert!(matches!(
        h.manager.set_active_model("beta").await,
        Err(RuntimeError::ModelNotDownloaded(_))
    ));
    assert_eq!(h.manager.get_active_model().await.as_deref(), Some("alpha"));
}

#[tokio::test]
async fn test_set_active_model_reports_running() {
    let (_server, h) = two_installed_models().await;

    h.manager.set_active_model("alpha").await.unwrap();

    assert_eq!(h.manager.get_active_model().await.as_deref(), Some("alpha"));
    let port = h.manager.get_port().await.expect("port while running");

    let status = h.manager.get_status().await;
    assert!(status.running);
    assert_eq!(status.port, Some(port));
    assert_eq!(
        status.endpoint.as_deref(),
        Some(format!("http://127.0.0.1:{}", port).as_str())
    );
    assert_eq!(status.active_model.as_deref(), Some("alpha"));
    assert!(status.started_at.is_some());

    let models = h.manager.list_models().await;
    let active: Vec<&str> = models.iter().filter(|m| m.active).map(|m| m.id()).collect();
    assert_eq!(active, vec!["alpha"]);
}

#[tokio::test]
async fn test_set_active_same_model_is_noop() {
    let (_server, h) = two_installed_models().await;

    h.manager.set_active_model("alpha").await.unwrap();
    h.manager.set_active_model("alpha").await.unwrap();
    assert_eq!(h.backend.starts(), 1);
}

#[tokio::test]
async fn test_switching_models_keeps_single_active() {
    let (_server, h) = two_installed_models().await;

    h.manager.set_active_model("alpha").await.unwrap();
    h.manager.set_active_model("beta").await.unwrap();

    assert_eq!(h.manager.get_active_model().await.as_deref(), Some("beta"));
    assert_eq!(h.backend.live(), 1);

    let models = h.manager.list_models().await;
    assert_eq!(models.iter().filter(|m| m.active).count(), 1);
    assert!(models.iter().find(|m| m.id() == "beta").unwrap().active);
}

#[tokio::test]
async fn test_activation_failure_keeps_previous_model() {
    let (_server, h) = two_installed_models().await;

    h.manager.set_active_model("alpha").await.unwrap();
    let port = h.manager.get_port().await;

    h.backend.break_model("beta.gguf");
    assert!(matches!(
        h.manager.set_active_model("beta").await,
        Err(RuntimeError::ActivationFailed { model_id, .. }) if model_id == "beta"
    ));

    assert_eq!(h.manager.get_active_model().await.as_deref(), Some("alpha"));
    assert_eq!(h.manager.get_port().await, port);
    assert!(h.manager.get_status().await.running);
    assert_eq!(h.backend.live(), 1);
}

#[tokio::test]
async fn test_activation_times_out_when_server_never_ready() {
    let (_server, h) = two_installed_models().await;

    h.manager.set_active_model("alpha").await.unwrap();
    let port = h.manager.get_port().await;

    h.backend.stall_model("beta.gguf");
    let started = std::time::Instant::now();
    let result = h.manager.set_active_model("beta").await;
    let elapsed = started.elapsed();

    assert!(matches!(
        result,
        Err(RuntimeError::ActivationFailed { model_id, reason })
            if model_id == "beta" && reason.contains("not healthy")
    ));
    let timeout = Duration::from_secs(h.manager.config().startup_timeout_secs);
    assert!(elapsed >= timeout, "gave up after {:?}", elapsed);
    assert!(elapsed < timeout + Duration::from_secs(3), "took {:?}", elapsed);

    assert_eq!(h.manager.get_active_model().await.as_deref(), Some("alpha"));
    assert_eq!(h.manager.get_port().await, port);
    assert_eq!(h.backend.live(), 1);
}

#[tokio::test]
async fn test_activation_failure_on_fixed_port_restarts_previous() {
    let alpha = weights(300, 41);
    let beta = weights(400, 43);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(alpha.clone())
        .create_async()
        .await;
    server
        .mock("GET", "/beta.gguf")
        .with_status(200)
        .with_body(beta.clone())
        .create_async()
        .await;

    let h = harness_in(
        tempfile::TempDir::new().unwrap(),
        vec![
            descriptor(&server.url(), "alpha", &alpha),
            descriptor(&server.url(), "beta", &beta),
        ],
        |config| folio_runtime::RuntimeConfig {
            port: Some(18_765),
            ..config
        },
    );
    install(&h.manager, "alpha").await;
    install(&h.manager, "beta").await;

    h.manager.set_active_model("alpha").await.unwrap();
    assert_eq!(h.manager.get_port().await, Some(18_765));

    h.backend.break_model("beta.gguf");
    assert!(h.manager.set_active_model("beta").await.is_err());

    assert_eq!(h.manager.get_active_model().await.as_deref(), Some("alpha"));
    assert_eq!(h.manager.get_port().await, Some(18_765));
    assert_eq!(h.backend.live(), 1);
    assert_eq!(h.backend.starts(), 3);
}

#[tokio::test]
async fn test_deactivate_stops_runtime() {
    let (_server, h) = two_installed_models().await;

    h.manager.set_active_model("alpha").await.unwrap();
    h.manager.deactivate().await.unwrap();

    assert!(h.manager.get_active_model().await.is_none());
    assert!(!h.manager.get_status().await.running);
    assert_eq!(h.backend.live(), 0);

    // Nothing active is fine
    h.manager.deactivate().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_stops_runtime() {
    let (_server, h) = two_installed_models().await;

    h.manager.set_active_model("beta").await.unwrap();
    h.manager.shutdown().await;

    assert_eq!(h.backend.live(), 0);
    assert!(h.manager.get_active_model().await.is_none());
}

// ============================================================================
// Persistence Tests
// ============================================================================

#[tokio::test]
async fn test_active_model_restored_on_initialize() {
    let (server, h) = two_installed_models().await;
    h.manager.set_active_model("beta").await.unwrap();
    h.manager.shutdown().await;

    let catalog: Vec<_> = h.manager.catalog().iter().cloned().collect();
    let restarted = harness_in(h.dir, catalog, |config| folio_runtime::RuntimeConfig {
        restore_active_model: true,
        ..config
    });
    restarted.manager.initialize().await.unwrap();

    assert_eq!(
        restarted.manager.get_active_model().await.as_deref(),
        Some("beta")
    );
    drop(server);
}

#[tokio::test]
async fn test_restore_of_missing_model_is_not_fatal() {
    let (server, h) = two_installed_models().await;
    h.manager.set_active_model("beta").await.unwrap();
    h.manager.shutdown().await;
    std::fs::remove_file(h.manager.model_path("beta").unwrap()).unwrap();

    let catalog: Vec<_> = h.manager.catalog().iter().cloned().collect();
    let restarted = harness_in(h.dir, catalog, |config| folio_runtime::RuntimeConfig {
        restore_active_model: true,
        ..config
    });
    restarted.manager.initialize().await.unwrap();

    assert!(restarted.manager.get_active_model().await.is_none());
    drop(server);
}

// ============================================================================
// Event Tests
// ============================================================================

#[tokio::test]
async fn test_events_published_for_download_and_activation() {
    let body = weights(1000, 47);
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/alpha.gguf")
        .with_status(200)
        .with_body(body.clone())
        .create_async()
        .await;

    let h = harness(vec![descriptor(&server.url(), "alpha", &body)]);
    let mut events = h.manager.subscribe();

    install(&h.manager, "alpha").await;
    h.manager.set_active_model("alpha").await.unwrap();

    let mut saw_downloading = false;
    let mut saw_progress = false;
    let mut saw_complete = false;
    let mut saw_active = false;
    while let Ok(event) = events.try_recv() {
        match event {
            RuntimeEvent::DownloadStateChanged { state, .. } if state == DownloadState::Downloading => {
                saw_downloading = true
            }
            RuntimeEvent::DownloadStateChanged { state, downloaded, .. } if state == DownloadState::Complete => {
                assert!(downloaded);
                saw_complete = true
            }
            RuntimeEvent::DownloadProgress { progress, .. } => {
                assert!(progress.bytes_downloaded <= progress.bytes_total);
                saw_progress = true
            }
            RuntimeEvent::ActiveModelChanged { model_id, port } => {
                assert_eq!(model_id.as_deref(), Some("alpha"));
                assert!(port.is_some());
                saw_active = true
            }
            _ => {}
        }
    }

    assert!(saw_downloading);
    assert!(saw_progress);
    assert!(saw_complete);
    assert!(saw_active);
}
