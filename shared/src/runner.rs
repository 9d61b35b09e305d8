//! Role-classification entry point shared by both binaries.
//!
//! Neither `server` nor `agent` depends on the other, so the four roles
//! `BootstrapInfo::classify` can produce live in different crates (and two
//! of them live nowhere reachable from a given binary at all). `Runner::run`
//! keeps the classification itself in one place while letting each caller
//! supply its own per-role body as a boxed future — the binary still picks
//! what each role *does*, `shared` only picks *which one runs*.

use std::future::Future;
use std::pin::Pin;

use crate::bootstrap::{BootstrapInfo, Role};
use crate::config::RunnerConfig;

/// A role's once-run body, boxed so the four branches of [`Runner::run`] can
/// share a single return type despite being distinct closures.
pub type RoleFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

pub struct Runner;

impl Runner {
    /// Classify `bootstrap` against `config` and run whichever of the four
    /// callbacks matches the result. Exactly one of them runs.
    pub async fn run<'a>(
        bootstrap: BootstrapInfo,
        config: &RunnerConfig,
        on_controller: impl FnOnce(BootstrapInfo) -> RoleFuture<'a>,
        on_worker: impl FnOnce(BootstrapInfo) -> RoleFuture<'a>,
        on_collective_broker: impl FnOnce(BootstrapInfo) -> RoleFuture<'a>,
        on_collective_worker: impl FnOnce(BootstrapInfo) -> RoleFuture<'a>,
    ) -> anyhow::Result<()> {
        let role = bootstrap.classify(config);
        tracing::info!(rank = bootstrap.rank, ?role, "bootstrap classified rank");
        match role {
            Role::Controller => on_controller(bootstrap).await,
            Role::Worker => on_worker(bootstrap).await,
            Role::CollectiveBroker => on_collective_broker(bootstrap).await,
            Role::CollectiveWorker => on_collective_worker(bootstrap).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn recorder(
        label: &'static str,
        calls: Arc<Mutex<Vec<&'static str>>>,
    ) -> impl FnOnce(BootstrapInfo) -> RoleFuture<'static> {
        move |_info| {
            Box::pin(async move {
                calls.lock().unwrap().push(label);
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn dispatches_to_the_classified_role_only() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let config = RunnerConfig::default();
        let bootstrap = BootstrapInfo::new(0, 2, false);

        Runner::run(
            bootstrap,
            &config,
            recorder("controller", calls.clone()),
            recorder("worker", calls.clone()),
            recorder("broker", calls.clone()),
            recorder("collective_worker", calls.clone()),
        )
        .await
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["controller"]);
    }

    #[tokio::test]
    async fn spawned_rank_dispatches_to_collective_worker_even_at_rank_zero() {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let config = RunnerConfig::default();
        let bootstrap = BootstrapInfo::new(0, 2, true);

        Runner::run(
            bootstrap,
            &config,
            recorder("controller", calls.clone()),
            recorder("worker", calls.clone()),
            recorder("broker", calls.clone()),
            recorder("collective_worker", calls.clone()),
        )
        .await
        .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["collective_worker"]);
    }

    #[tokio::test]
    async fn propagates_the_chosen_callback_error() {
        let config = RunnerConfig {
            nprocs_per_worker: 3,
            ..RunnerConfig::default()
        };
        let bootstrap = BootstrapInfo::new(1, 4, false);

        let err = Runner::run(
            bootstrap,
            &config,
            |_| Box::pin(async { Ok(()) }),
            |_| Box::pin(async { Ok(()) }),
            |_| Box::pin(async { anyhow::bail!("broker blew up") }),
            |_| Box::pin(async { Ok(()) }),
        )
        .await
        .unwrap_err();

        assert_eq!(err.to_string(), "broker blew up");
    }
}
