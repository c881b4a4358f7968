use async_trait::async_trait;

use crate::error::{ErrorCode, NetError, NetResult};
use crate::lifecycle::LifecycleManager;

/// Unified start/stop contract for clients and servers.
///
/// Implementors supply the protocol-specific pieces (`do_start_impl`,
/// `do_stop_impl`, the optional `on_stopped` hook) and get the common
/// lifecycle algorithm from the provided `do_start`/`do_stop` methods:
///
/// - start fails with `already_exists` when the component is running, and
///   rolls back to stopped when the implementation fails;
/// - stop is idempotent, survives concurrent callers, and invokes
///   `on_stopped` after the state is marked stopped.
#[async_trait]
pub trait Startable: Send + Sync {
    /// Arguments consumed by `do_start_impl` (a port, a host/port pair, …).
    type StartArgs: Send + 'static;

    /// Component identifier used in error messages.
    fn component_name(&self) -> &str;

    fn lifecycle(&self) -> &LifecycleManager;

    async fn do_start_impl(&self, args: Self::StartArgs) -> NetResult<()>;

    async fn do_stop_impl(&self) -> NetResult<()>;

    /// Invoked after the state is marked stopped. Components fire their
    /// disconnect callbacks here.
    async fn on_stopped(&self) {}

    async fn do_start(&self, args: Self::StartArgs) -> NetResult<()> {
        let lifecycle = self.lifecycle();
        if !lifecycle.try_start() {
            return Err(NetError::new(
                ErrorCode::AlreadyExists,
                format!("{} is already running", self.component_name()),
                "startable::do_start",
            )
            .with_context(self.component_name().to_owned()));
        }
        lifecycle.clear_stop_initiated();

        let result = self.do_start_impl(args).await;
        if result.is_err() {
            lifecycle.mark_stopped();
        }
        result
    }

    async fn do_stop(&self) -> NetResult<()> {
        let lifecycle = self.lifecycle();
        if !lifecycle.is_running() {
            return Ok(());
        }
        if !lifecycle.prepare_stop() {
            return Ok(());
        }

        let result = self.do_stop_impl().await;
        lifecycle.mark_stopped();
        self.on_stopped().await;
        result
    }

    fn is_running(&self) -> bool {
        self.lifecycle().is_running()
    }

    async fn wait_for_stop(&self) {
        self.lifecycle().wait_for_stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeComponent {
        lifecycle: LifecycleManager,
        fail_start: bool,
        starts: AtomicUsize,
        stops: AtomicUsize,
        stopped_hooks: AtomicUsize,
    }

    impl FakeComponent {
        fn new(fail_start: bool) -> Self {
            Self {
                lifecycle: LifecycleManager::new(),
                fail_start,
                starts: AtomicUsize::new(0),
                stops: AtomicUsize::new(0),
                stopped_hooks: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Startable for FakeComponent {
        type StartArgs = ();

        fn component_name(&self) -> &str {
            "FakeComponent"
        }

        fn lifecycle(&self) -> &LifecycleManager {
            &self.lifecycle
        }

        async fn do_start_impl(&self, _args: ()) -> NetResult<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start {
                Err(NetError::new(
                    ErrorCode::BindFailed,
                    "simulated bind failure",
                    "test",
                ))
            } else {
                Ok(())
            }
        }

        async fn do_stop_impl(&self) -> NetResult<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn on_stopped(&self) {
            self.stopped_hooks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn double_start_fails_with_already_exists() {
        let component = FakeComponent::new(false);
        component.do_start(()).await.unwrap();

        let err = component.do_start(()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::AlreadyExists);
        assert!(err.message.contains("FakeComponent is already running"));
        // The implementation ran only once.
        assert_eq!(component.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_start_rolls_back_to_stopped() {
        let component = FakeComponent::new(true);
        let err = component.do_start(()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BindFailed);
        assert!(!component.is_running());

        // A later start attempt is allowed again.
        let err = component.do_start(()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::BindFailed);
        assert_eq!(component.starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_runs_hook_once() {
        let component = FakeComponent::new(false);
        component.do_start(()).await.unwrap();

        component.do_stop().await.unwrap();
        component.do_stop().await.unwrap();

        assert_eq!(component.stops.load(Ordering::SeqCst), 1);
        assert_eq!(component.stopped_hooks.load(Ordering::SeqCst), 1);
        assert!(!component.is_running());
    }

    #[tokio::test]
    async fn stop_before_start_is_ok() {
        let component = FakeComponent::new(false);
        component.do_stop().await.unwrap();
        assert_eq!(component.stops.load(Ordering::SeqCst), 0);
    }
}
