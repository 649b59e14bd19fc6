//! Application layer use cases for the device server.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (the device registry and protocol types in `trackrelay_core`) and the
//! infrastructure (sockets, device drivers, files).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil one job (e.g., "mirror this
//!   upstream server's devices into the local registry").
//! - **Depend on abstractions** (the `LocalRegistry` and `DeviceSource`
//!   traits) so tests can substitute mocks.
//!
//! # Sub-modules
//!
//! - **`publish_state`** – Turns registry snapshots into per-session state
//!   updates: everything first, then deltas by revision.
//!
//! - **`pump_local`** – Registers a local device source and forwards its
//!   readings into the registry.
//!
//! - **`relay`** – The relay link: a protocol client of an upstream server
//!   whose devices it re-exports locally.  This is what makes servers
//!   daisy-chainable.

pub mod publish_state;
pub mod pump_local;
pub mod relay;

use tokio::sync::watch;

/// Resolves once `signal` reads `true`, or once its sender is gone.
///
/// Meant for `tokio::select!` branches.  The `watch::Ref` that `wait_for`
/// yields is dropped here, so it never lives across another branch's
/// `.await` and the enclosing task stays `Send`.
pub async fn stop_requested(signal: &mut watch::Receiver<bool>) {
    let _ = signal.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_stop_requested_waits_for_true() {
        // Arrange
        let (stop, mut rx) = watch::channel(false);

        // Act
        let early = tokio::time::timeout(Duration::from_millis(50), stop_requested(&mut rx)).await;
        stop.send_replace(true);
        let late = tokio::time::timeout(Duration::from_secs(5), stop_requested(&mut rx)).await;

        // Assert
        assert!(early.is_err());
        assert!(late.is_ok());
    }

    #[tokio::test]
    async fn test_stop_requested_resolves_when_sender_is_gone() {
        let (stop, mut rx) = watch::channel(false);
        drop(stop);

        tokio::time::timeout(Duration::from_secs(5), stop_requested(&mut rx))
            .await
            .unwrap();
    }

    #[test]
    fn test_stop_requested_future_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let (_stop, mut rx) = watch::channel(false);
        let future = stop_requested(&mut rx);
        assert_send(&future);
    }
}
