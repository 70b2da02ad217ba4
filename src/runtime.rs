//! Generic component runtime — shared scaffolding for long-running service
//! parts.
//!
//! A [`Component`] is any independently-runnable unit: the HTTP front, a
//! per-index background worker, etc. Callers construct components with their
//! shared state already captured inside them, then hand them to
//! [`spawn_components`].
//!
//! [`spawn_components`] returns a [`ServiceHandle`] that the caller can
//! `.await` (blocking until all components finish) or hold onto while doing
//! other work. Any component error cancels the shared [`CancellationToken`]
//! so sibling components shut down cleanly.

use std::future::Future;
use std::pin::Pin;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::error::EngineError;

// ── Component ─────────────────────────────────────────────────────────────────

/// A boxed, owned future returned by [`Component::run`].
pub type ComponentFuture =
    Pin<Box<dyn Future<Output = Result<(), EngineError>> + Send + 'static>>;

/// A self-contained, concurrently-runnable unit of the service.
///
/// Implementors capture all shared state (`Arc<SearchEngine>`, shutdown
/// token, …) at construction time. [`Component::run`] is called once by
/// [`spawn_components`] and should run until `shutdown` is cancelled or the
/// component's own work is done.
pub trait Component: Send + 'static {
    /// Stable identifier used in log messages.
    fn id(&self) -> &str;

    /// Consume the component and return its async run-loop as a boxed future.
    ///
    /// The returned future must be `Send + 'static` so it can be spawned on
    /// the Tokio thread pool. Capture the `CancellationToken` inside it to
    /// respect cooperative shutdown.
    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

// ── ServiceHandle ─────────────────────────────────────────────────────────────

/// An opaque handle to a running component set.
///
/// Returned by [`spawn_components`]. The caller can `.await` it to block until
/// all components have exited, or store it and poll it later.
pub struct ServiceHandle {
    inner: JoinHandle<Result<(), EngineError>>,
}

impl ServiceHandle {
    /// Await all components and return the first error, if any.
    pub async fn join(self) -> Result<(), EngineError> {
        match self.inner.await {
            Ok(r) => r,
            Err(e) => Err(EngineError::Task(format!("component task panicked: {e}"))),
        }
    }
}

// ── spawn_components ──────────────────────────────────────────────────────────

/// Spawn each [`Component`] as an independent Tokio task and return a
/// [`ServiceHandle`] that resolves when all components have exited.
///
/// The first component to fail (or panic) cancels `shutdown`, so its
/// siblings wind down cooperatively; that first failure is what the handle
/// eventually reports.
pub fn spawn_components(
    components: Vec<Box<dyn Component>>,
    shutdown: CancellationToken,
) -> ServiceHandle {
    let handle = tokio::spawn(async move {
        let mut set: JoinSet<Result<(), EngineError>> = JoinSet::new();

        for component in components {
            debug!(component = component.id(), "spawning component");
            set.spawn(component.run(shutdown.clone()));
        }

        let mut failure: Option<EngineError> = None;

        while let Some(joined) = set.join_next().await {
            let outcome = joined
                .unwrap_or_else(|e| Err(EngineError::Task(format!("component panicked: {e}"))));
            if let Err(e) = outcome {
                error!("component stopped with error: {e}");
                shutdown.cancel();
                failure.get_or_insert(e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });

    ServiceHandle { inner: handle }
}
