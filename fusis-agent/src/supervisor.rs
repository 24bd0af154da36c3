use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fusis_nat::Apply;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::Discovery;
use crate::metrics::ReconcileMetrics;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Address of the fusis router used as the default gateway.
    pub gateway: String,
    pub label_filter: String,
    pub interval: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Running,
    Stopping,
}

struct Inner {
    phase: Phase,
    /// Bumped on every start so a waiter never resets a newer loop.
    generation: u64,
    cancel: Option<CancellationToken>,
    /// Cancelled when the loop task exits, panics included.
    done: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

/// Periodically feeds the discovered address set into the reconcile engine.
///
/// The loop runs as a single background task. `stop` only takes effect
/// between passes, so an in-flight pass always completes.
pub struct Supervisor<D, A> {
    worker: Arc<Worker<D, A>>,
    inner: Mutex<Inner>,
}

impl<D, A> Supervisor<D, A>
where
    D: Discovery + 'static,
    A: Apply + 'static,
{
    pub fn new(discovery: D, engine: A, settings: Settings) -> Self {
        Self::with_metrics(discovery, engine, settings, ReconcileMetrics::default())
    }

    pub fn with_metrics(
        discovery: D,
        engine: A,
        settings: Settings,
        metrics: ReconcileMetrics,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                discovery,
                engine,
                settings,
                metrics,
                ready: CancellationToken::new(),
            }),
            inner: Mutex::new(Inner {
                phase: Phase::Idle,
                generation: 0,
                cancel: None,
                done: None,
                handle: None,
            }),
        }
    }

    /// Cancelled once the first cycle has completed.
    pub fn readiness(&self) -> CancellationToken {
        self.worker.ready.clone()
    }

    pub fn phase(&self) -> Phase {
        self.lock().phase
    }

    pub fn start(&self) -> Result<()> {
        let mut inner = self.lock();
        if inner.phase != Phase::Idle {
            return Err(Error::AlreadyRunning);
        }
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        let worker = self.worker.clone();
        inner.handle = Some(tokio::spawn(worker.run(cancel.clone(), done.clone())));
        inner.cancel = Some(cancel);
        inner.done = Some(done);
        inner.generation += 1;
        inner.phase = Phase::Running;
        info!(
            interval = ?self.worker.settings.interval,
            label = %self.worker.settings.label_filter,
            "supervisor started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        let mut inner = self.lock();
        if inner.phase != Phase::Running {
            return;
        }
        if let Some(cancel) = &inner.cancel {
            cancel.cancel();
        }
        inner.phase = Phase::Stopping;
        debug!("supervisor stopping");
    }

    /// Waits for the loop task to finish and returns to [`Phase::Idle`].
    ///
    /// Any number of tasks may wait at once. One of them joins the task and
    /// reports a panic; the others wait for the loop to signal completion.
    pub async fn wait(&self) -> Result<()> {
        let (generation, done, handle) = {
            let mut inner = self.lock();
            let Some(done) = inner.done.clone() else {
                return Ok(());
            };
            (inner.generation, done, inner.handle.take())
        };
        let joined = match handle {
            Some(handle) => handle.await.map_err(|e| Error::Task(e.to_string())),
            None => {
                done.cancelled().await;
                Ok(())
            }
        };

        let mut inner = self.lock();
        if inner.generation == generation && inner.phase != Phase::Idle {
            inner.phase = Phase::Idle;
            inner.cancel = None;
            inner.done = None;
        }
        joined
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Worker<D, A> {
    discovery: D,
    engine: A,
    settings: Settings,
    metrics: ReconcileMetrics,
    ready: CancellationToken,
}

impl<D: Discovery, A: Apply> Worker<D, A> {
    async fn run(self: Arc<Self>, cancel: CancellationToken, done: CancellationToken) {
        let _done = done.drop_guard();
        let mut last_known = None;
        loop {
            self.cycle(&mut last_known).await;
            self.ready.cancel();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.settings.interval) => {}
            }
        }
        info!("supervisor loop stopped");
    }

    async fn cycle(&self, last_known: &mut Option<BTreeSet<String>>) {
        match self
            .discovery
            .list_candidate_addresses(&self.settings.label_filter)
            .await
        {
            Ok(addrs) => *last_known = Some(addrs.into_iter().collect()),
            Err(e) => {
                error!("error listing containers: {}", e);
                self.metrics.count_failure(&e);
            }
        }
        let Some(desired) = last_known.as_ref() else {
            warn!("no container addresses known yet, skipping reconcile");
            return;
        };

        let _measure = self.metrics.count_and_measure(desired.len());
        match self.engine.apply(desired, &self.settings.gateway).await {
            Ok(pass) => self.metrics.record_pass(&pass),
            Err(e) => {
                if let Some(pass) = e.partial_pass() {
                    self.metrics.record_pass(pass);
                }
                let e = Error::from(e);
                error!("error reconciling rules: {}", e);
                self.metrics.count_failure(&e);
            }
        }
    }
}
