//! Tests for graceful shutdown handling

use super::shutdown::*;
use std::time::Duration;

#[tokio::test]
async fn test_shutdown_channel_triggers_shutdown() {
    let (controller, signal) = shutdown_channel();
    assert!(!signal.is_shutdown());

    controller.shutdown();

    assert!(signal.is_shutdown());
}

#[tokio::test]
async fn test_shutdown_wait_completes_on_signal() {
    let (controller, mut signal) = shutdown_channel();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        controller.shutdown();
    });

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;

    assert!(
        result.is_ok(),
        "wait() should complete when shutdown triggered"
    );
    assert!(signal.is_shutdown());
}

#[tokio::test]
async fn test_shutdown_wait_completes_when_controller_dropped() {
    let (controller, mut signal) = shutdown_channel();
    drop(controller);

    let result = tokio::time::timeout(Duration::from_secs(1), signal.wait()).await;
    assert!(result.is_ok(), "wait() should complete when sender is gone");
}

#[tokio::test]
async fn test_shutdown_signal_clones_share_state() {
    let (controller, signal) = shutdown_channel();
    let clones = [signal.clone(), signal.clone()];

    controller.shutdown();

    assert!(signal.is_shutdown());
    assert!(clones.iter().all(ShutdownSignal::is_shutdown));
}
