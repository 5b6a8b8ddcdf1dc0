//! Label propagation for CPU time attribution
//!
//! A [`LabelContext`] is an explicit value carrying an ordered set of string
//! labels. Each distinct set is interned to a small numeric id, and the id of
//! the context active on a thread lives in a thread-local slot that the
//! sampling signal handler reads without locking or allocating. Every sample
//! taken while a context is active is therefore tagged with its labels.
//!
//! Contexts are activated three ways:
//!
//! - [`with_label`] / [`with_labels`] derive a context *and* make it active on
//!   the calling thread immediately, so work already running there is
//!   attributed from the next sample on.
//! - [`LabelContext::scope`] / [`LabelContext::enter`] activate a context for
//!   a bounded region and restore the previous one afterwards.
//! - [`LabelContext::instrument`] wraps a future so the context is active for
//!   each poll, whichever thread the executor polls it on.
//!
//! # Example
//!
//! ```
//! use labelprof::labels::{self, LabelContext};
//!
//! let ctx = labels::with_labels(&LabelContext::background(), ["rule1", "rule2"]);
//! assert_eq!(ctx.labels(), ["rule1", "rule2"]);
//!
//! let inner = ctx.with_label("rule3");
//! inner.scope(|| {
//!     assert_eq!(LabelContext::current().labels(), ["rule3"]);
//! });
//! ```

use fnv::FnvHashMap;
use pin_project_lite::pin_project;
use std::cell::Cell;
use std::collections::BTreeMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};

/// Key under which labels appear in a decoded profile sample
pub const LABEL_KEY: &str = "label";

/// Interned identifier of a label set. `0` is the empty set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LabelSetId(u32);

impl LabelSetId {
    /// The empty label set (unattributed work)
    pub const NONE: LabelSetId = LabelSetId(0);

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub(crate) const fn from_u32(val: u32) -> Self {
        LabelSetId(val)
    }
}

thread_local! {
    // Read from the SIGPROF handler: must stay const-initialized with no destructor.
    static CURRENT: Cell<u32> = const { Cell::new(0) };
}

struct Interner {
    ids: FnvHashMap<Arc<[String]>, LabelSetId>,
    sets: Vec<Arc<[String]>>,
}

impl Interner {
    fn new() -> Self {
        let empty: Arc<[String]> = Arc::from(Vec::new());
        let mut ids = FnvHashMap::default();
        ids.insert(empty.clone(), LabelSetId::NONE);
        Self {
            ids,
            sets: vec![empty],
        }
    }

    fn intern(&mut self, labels: &[String]) -> (LabelSetId, Arc<[String]>) {
        if let Some((set, id)) = self.ids.get_key_value(labels) {
            return (*id, set.clone());
        }
        let set: Arc<[String]> = Arc::from(labels.to_vec());
        let id = LabelSetId(self.sets.len() as u32);
        self.sets.push(set.clone());
        self.ids.insert(set.clone(), id);
        (id, set)
    }

    fn resolve(&self, id: LabelSetId) -> Option<Arc<[String]>> {
        self.sets.get(id.0 as usize).cloned()
    }
}

fn interner() -> &'static Mutex<Interner> {
    static INTERNER: OnceLock<Mutex<Interner>> = OnceLock::new();
    INTERNER.get_or_init(|| Mutex::new(Interner::new()))
}

/// Number of distinct label sets interned so far, including the empty set
///
/// Interned sets are never reclaimed: the sampling handler records raw ids,
/// and a snapshot may resolve an id long after the context that produced it
/// was dropped.
pub fn interned_sets() -> usize {
    interner()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .sets
        .len()
}

/// Look up the labels behind an interned id
pub fn resolve(id: LabelSetId) -> Option<Arc<[String]>> {
    interner()
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .resolve(id)
}

/// Label-set id active on the calling thread.
///
/// Async-signal-safe: called from the sampling handler.
pub(crate) fn current_id() -> LabelSetId {
    LabelSetId(CURRENT.try_with(Cell::get).unwrap_or(0))
}

fn swap_current(id: LabelSetId) -> LabelSetId {
    LabelSetId(CURRENT.with(|slot| slot.replace(id.0)))
}

/// An ordered set of labels attached to a unit of work
#[derive(Debug, Clone)]
pub struct LabelContext {
    id: LabelSetId,
    labels: Arc<[String]>,
}

impl PartialEq for LabelContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for LabelContext {}

impl Default for LabelContext {
    fn default() -> Self {
        Self::background()
    }
}

impl LabelContext {
    /// The root context: no labels, samples stay unattributed
    pub fn background() -> Self {
        Self::from_id(LabelSetId::NONE)
    }

    /// The context active on the calling thread
    pub fn current() -> Self {
        Self::from_id(current_id())
    }

    fn from_id(id: LabelSetId) -> Self {
        match resolve(id) {
            Some(labels) => Self { id, labels },
            None => Self {
                id: LabelSetId::NONE,
                labels: Arc::from(Vec::new()),
            },
        }
    }

    fn from_labels(labels: Vec<String>) -> Self {
        let mut unique: Vec<String> = Vec::with_capacity(labels.len());
        for label in labels {
            if !unique.contains(&label) {
                unique.push(label);
            }
        }
        let (id, labels) = interner()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .intern(&unique);
        Self { id, labels }
    }

    pub fn id(&self) -> LabelSetId {
        self.id
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Labels in the shape a decoded profile sample carries them
    pub fn to_sample_labels(&self) -> BTreeMap<String, Vec<String>> {
        let mut map = BTreeMap::new();
        if !self.labels.is_empty() {
            map.insert(LABEL_KEY.to_string(), self.labels.to_vec());
        }
        map
    }

    /// Method form of [`with_label`]
    pub fn with_label(&self, label: impl Into<String>) -> Self {
        with_label(self, label)
    }

    /// Method form of [`with_labels`]
    pub fn with_labels<I, S>(&self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        with_labels(self, labels)
    }

    /// Activate this context on the current thread until the guard drops
    pub fn enter(&self) -> LabelGuard {
        LabelGuard {
            previous: swap_current(self.id),
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this context active, restoring the previous one after
    pub fn scope<F, R>(&self, f: F) -> R
    where
        F: FnOnce() -> R,
    {
        let _guard = self.enter();
        f()
    }

    /// Wrap a future so this context is active whenever it is polled
    pub fn instrument<F: Future>(&self, future: F) -> Labeled<F> {
        Labeled {
            inner: future,
            context: self.clone(),
        }
    }
}

/// Derive a context carrying the single `label` and make it active on the
/// calling thread.
pub fn with_label(ctx: &LabelContext, label: impl Into<String>) -> LabelContext {
    with_labels(ctx, [label.into()])
}

/// Derive a context carrying `labels` and make it active on the calling thread.
///
/// The new set replaces the labels of `ctx`; an empty `labels` leaves `ctx`
/// unchanged. Repeated labels are collapsed, keeping the first occurrence.
///
/// Every distinct set is interned for the life of the process, so labels
/// should name bounded categories (rules, endpoints, tenants) rather than
/// unbounded values such as request ids.
pub fn with_labels<I, S>(ctx: &LabelContext, labels: I) -> LabelContext
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let labels: Vec<String> = labels.into_iter().map(Into::into).collect();
    let derived = if labels.is_empty() {
        ctx.clone()
    } else {
        LabelContext::from_labels(labels)
    };
    swap_current(derived.id);
    derived
}

/// Restores the previously active context when dropped
#[must_use = "the context is deactivated as soon as the guard is dropped"]
pub struct LabelGuard {
    previous: LabelSetId,
    _not_send: PhantomData<*const ()>,
}

impl LabelGuard {
    /// Leave the region, returning the context that was active at exit.
    ///
    /// Differs from the entered context when code inside called
    /// [`with_label`] / [`with_labels`].
    pub fn exit(self) -> LabelSetId {
        current_id()
    }
}

impl Drop for LabelGuard {
    fn drop(&mut self) {
        swap_current(self.previous);
    }
}

pin_project! {
    /// Future wrapper that activates a [`LabelContext`] on every poll.
    ///
    /// Labels applied from inside the future are adopted for later polls.
    pub struct Labeled<F> {
        #[pin]
        inner: F,
        context: LabelContext,
    }
}

impl<F> Labeled<F> {
    pub fn context(&self) -> &LabelContext {
        &self.context
    }
}

impl<F: Future> Future for Labeled<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let guard = this.context.enter();
        let result = this.inner.poll(cx);
        let active = guard.exit();
        if active != this.context.id {
            *this.context = LabelContext::from_id(active);
        }
        result
    }
}
