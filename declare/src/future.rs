//! Deferred closing: a proof is finished by a [`FutureProof`] that may run on
//! a worker, and registered later by merging it back into the registry.

use crate::entry::{CloseMode, ClosedProof, GlobalRef, Opacity};
use crate::error::{DeclareError, Result};
use crate::proof::session::{ProofState, SessionMeta};
use crate::proof::Tactic;
use crate::registry::Registry;
use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

static NEXT_FEEDBACK_ID: AtomicU64 = AtomicU64::new(1);

/// Ties a deferred result to the session it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FeedbackId(u64);

impl FeedbackId {
    pub fn fresh() -> Self {
        FeedbackId(NEXT_FEEDBACK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FeedbackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The captured inputs of a deferred close.
struct Job {
    state: ProofState,
    script: Vec<Box<dyn Tactic>>,
    opacity: Opacity,
    mode: CloseMode,
}

impl Job {
    fn run(mut self) -> Result<ClosedProof> {
        for tactic in &self.script {
            self.state.apply(tactic.as_ref())?;
        }
        self.state.close(self.opacity, self.mode)
    }
}

type Outcome = std::result::Result<ClosedProof, Arc<DeclareError>>;

struct Inner {
    id: FeedbackId,
    job: Mutex<Option<Job>>,
    result: OnceLock<Outcome>,
    cancel: CancellationToken,
}

/// The work half of a deferred proof. Cheap to clone; every clone observes
/// the same, single computation.
#[derive(Clone)]
pub struct FutureProof {
    inner: Arc<Inner>,
}

impl fmt::Debug for FutureProof {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FutureProof")
            .field("id", &self.inner.id)
            .field("forced", &self.is_forced())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl FutureProof {
    pub(crate) fn new(state: ProofState, script: Vec<Box<dyn Tactic>>, opacity: Opacity, mode: CloseMode) -> Self {
        FutureProof {
            inner: Arc::new(Inner {
                id: FeedbackId::fresh(),
                job: Mutex::new(Some(Job {
                    state,
                    script,
                    opacity,
                    mode,
                })),
                result: OnceLock::new(),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> FeedbackId {
        self.inner.id
    }

    pub fn is_forced(&self) -> bool {
        self.inner.result.get().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    fn observe(&self, outcome: &Outcome) -> Result<ClosedProof> {
        outcome.clone().map_err(|source| DeclareError::Deferred {
            id: self.inner.id,
            source,
        })
    }

    /// Run the computation, or return the result of the run that already
    /// happened. Blocks while another thread is running it.
    pub fn force(&self) -> Result<ClosedProof> {
        if let Some(done) = self.inner.result.get() {
            return self.observe(done);
        }
        let mut slot = self.inner.job.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(done) = self.inner.result.get() {
            return self.observe(done);
        }
        if self.inner.cancel.is_cancelled() {
            return Err(DeclareError::Cancelled(self.inner.id));
        }
        let Some(job) = slot.take() else {
            return Err(DeclareError::Cancelled(self.inner.id));
        };

        debug!(id = %self.inner.id, "forcing deferred proof");
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| job.run())) {
            Ok(Ok(closed)) => Ok(closed),
            Ok(Err(err)) => Err(Arc::new(err)),
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(id = %self.inner.id, %message, "deferred proof panicked");
                Err(Arc::new(DeclareError::DeferredPanicked {
                    id: self.inner.id,
                    message,
                }))
            }
        };
        let done = self.inner.result.get_or_init(|| outcome);
        drop(slot);
        self.observe(done)
    }

    /// Force on the blocking pool of `handle`.
    pub fn spawn(&self, handle: &Handle) -> JoinHandle<Result<ClosedProof>> {
        let this = self.clone();
        handle.spawn_blocking(move || this.force())
    }

    /// Give up on the computation. An unforced future drops its captured
    /// state and never runs.
    pub fn cancel(&self) {
        self.inner.cancel.cancel();
        if let Ok(mut slot) = self.inner.job.try_lock() {
            if slot.take().is_some() {
                debug!(id = %self.inner.id, "deferred proof discarded");
            }
        }
    }
}

/// The session half of a deferred proof: what is needed to register the
/// result once it is available.
#[derive(Debug)]
pub struct DeferredProof {
    id: FeedbackId,
    meta: SessionMeta,
    mode: CloseMode,
    future: FutureProof,
}

impl DeferredProof {
    pub(crate) fn new(meta: SessionMeta, mode: CloseMode, future: FutureProof) -> Self {
        DeferredProof {
            id: future.id(),
            meta,
            mode,
            future,
        }
    }

    pub fn id(&self) -> FeedbackId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn mode(&self) -> CloseMode {
        self.mode
    }

    /// A handle on the computation, to be sent to a worker.
    pub fn future(&self) -> FutureProof {
        self.future.clone()
    }

    pub fn merge(self, registry: &mut Registry) -> Result<Vec<GlobalRef>> {
        let future = self.future.clone();
        self.merge_with(registry, future)
    }

    /// Register the result of `future`, which must be this proof's own.
    /// The universe constraints captured when the proof was deferred are
    /// checked again against the current graph before anything is
    /// registered.
    pub fn merge_with(self, registry: &mut Registry, future: FutureProof) -> Result<Vec<GlobalRef>> {
        if future.id() != self.id {
            return Err(DeclareError::FeedbackMismatch {
                expected: self.id,
                got: future.id(),
            });
        }
        let closed = future.force()?;
        registry.validate_universes(&self.meta.info.udecl.union(&closed.universes))?;
        info!(proof = %self.meta.name, id = %self.id, "merging deferred proof");
        match self.mode {
            CloseMode::Complete => self.meta.register(registry, closed),
            CloseMode::Partial => self.meta.admit(registry, closed),
        }
    }

    /// Drop the proof without registering anything.
    pub fn abandon(self) {
        self.future.cancel();
    }
}
