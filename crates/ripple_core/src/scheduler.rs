//! Job scheduler
//!
//! Invalidated work is collected into three queues and flushed once per
//! coalesced tick:
//!
//! 1. **pre**: drained completely, repeatedly, before anything else
//! 2. **main**: sorted by job order (unordered jobs last), each job isolated
//!    so one failure does not stop its siblings
//! 3. **post**: deduplicated, sorted, nested flushes append to the running
//!    batch
//!
//! The loop repeats until every queue is empty. Every job execution in a
//! flush generation is counted; a job that runs more often than the
//! configured recursion limit aborts the flush.
//!
//! The runtime never defers work on its own. A host installs a flush hook
//! ([`Runtime::set_flush_hook`]) that decides when the requested flush runs,
//! or awaits [`Runtime::next_tick`], or calls [`Runtime::flush`] directly.

use indexmap::IndexSet;
use rustc_hash::FxHashMap;
use std::borrow::Cow;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::effect::Effect;
use crate::error::{ErrorContext, ReactiveError, Result};
use crate::runtime::{Runtime, WeakRuntime};
use crate::target::next_identity;

/// Whether a job may be queued again while it is running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecursionPolicy {
    /// Re-queuing a running job is ignored
    #[default]
    Deny,
    /// A running job may queue itself for a later slot in the same flush
    AllowDeferred,
}

type Callback = Box<dyn FnMut(&Runtime) -> anyhow::Result<()>>;

enum Task {
    Effect(Effect),
    Callback(RefCell<Callback>),
}

struct JobInner {
    uid: u64,
    order: Cell<Option<u64>>,
    policy: Cell<RecursionPolicy>,
    label: Cow<'static, str>,
    task: Task,
}

/// A schedulable unit of work
///
/// Jobs compare by identity: queuing a clone of a queued job is a duplicate.
#[derive(Clone)]
pub struct Job(Rc<JobInner>);

impl Job {
    /// A job running an arbitrary callback
    pub fn new(
        label: impl Into<Cow<'static, str>>,
        callback: impl FnMut(&Runtime) -> anyhow::Result<()> + 'static,
    ) -> Self {
        Self(Rc::new(JobInner {
            uid: next_identity(),
            order: Cell::new(None),
            policy: Cell::new(RecursionPolicy::Deny),
            label: label.into(),
            task: Task::Callback(RefCell::new(Box::new(callback))),
        }))
    }

    pub(crate) fn for_effect(effect: Effect, policy: RecursionPolicy) -> Self {
        Self(Rc::new(JobInner {
            uid: next_identity(),
            order: Cell::new(Some(effect.order())),
            policy: Cell::new(policy),
            label: Cow::Owned(format!("effect#{}", effect.order())),
            task: Task::Effect(effect),
        }))
    }

    /// Position in the main and post queues; unordered jobs run last
    pub fn with_order(self, order: u64) -> Self {
        self.0.order.set(Some(order));
        self
    }

    pub fn with_policy(self, policy: RecursionPolicy) -> Self {
        self.0.policy.set(policy);
        self
    }

    pub fn order(&self) -> Option<u64> {
        self.0.order.get()
    }

    pub fn policy(&self) -> RecursionPolicy {
        self.0.policy.get()
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    pub fn ptr_eq(&self, other: &Job) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    fn allows_recurse(&self) -> bool {
        self.policy() == RecursionPolicy::AllowDeferred
    }

    fn sort_key(&self) -> u64 {
        self.order().unwrap_or(u64::MAX)
    }

    /// Execute the job
    ///
    /// A callback job that is already running further up the stack is
    /// skipped. An effect job does nothing once its effect is stopped.
    pub(crate) fn run(&self, rt: &Runtime) -> Result<()> {
        match &self.0.task {
            Task::Effect(effect) => {
                if !rt.is_effect_active(*effect) {
                    return Ok(());
                }
                rt.run_effect(*effect).map(|_| ())
            }
            Task::Callback(callback) => match callback.try_borrow_mut() {
                Ok(mut callback) => (*callback)(rt)
                    .map_err(|err| ReactiveError::computation(ErrorContext::SchedulerFlush, err)),
                Err(_) => {
                    tracing::trace!(job = self.label(), "skipping re-entrant job");
                    Ok(())
                }
            },
        }
    }
}

impl PartialEq for Job {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Job {}

impl Hash for Job {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.uid.hash(state);
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("label", &self.label())
            .field("order", &self.order())
            .field("policy", &self.policy())
            .finish()
    }
}

type AfterFlush = Box<dyn FnOnce(&Runtime) -> anyhow::Result<()>>;

/// Scheduler queues and flush bookkeeping
#[derive(Default)]
pub(crate) struct SchedulerState {
    is_flushing: bool,
    is_flush_pending: bool,
    /// Main queue; invalidated slots are `None`
    queue: Vec<Option<Job>>,
    flush_index: usize,
    pending_pre: Vec<Job>,
    active_pre: Option<Vec<Job>>,
    pre_index: usize,
    pending_post: Vec<Job>,
    active_post: Option<Vec<Job>>,
    post_index: usize,
    /// The job whose pre-phase flush is running; it may not queue itself
    pre_parent: Option<Job>,
    /// Executions per job uid in the current flush generation
    seen: FxHashMap<u64, u32>,
    flush_count: u64,
    wakers: Vec<Waker>,
    after_flush: Vec<AfterFlush>,
}

impl SchedulerState {
    pub(crate) fn pending_pre_len(&self) -> usize {
        self.pending_pre.len()
    }

    pub(crate) fn queued_main_len(&self) -> usize {
        self.queue.iter().skip(self.flush_index).flatten().count()
    }

    pub(crate) fn pending_post_len(&self) -> usize {
        self.pending_post.len()
    }

    pub(crate) fn flush_count(&self) -> u64 {
        self.flush_count
    }

    fn has_work(&self) -> bool {
        !self.queue.is_empty()
            || !self.pending_pre.is_empty()
            || !self.pending_post.is_empty()
            || !self.after_flush.is_empty()
    }

    /// Whether `job` is already queued in `batch` at or after `index`
    fn batch_contains(batch: Option<&Vec<Job>>, job: &Job, index: usize) -> bool {
        let start = if job.allows_recurse() { index + 1 } else { index };
        batch
            .and_then(|batch| batch.get(start..))
            .is_some_and(|rest| rest.contains(job))
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.flush_index = 0;
        self.pending_pre.clear();
        self.active_pre = None;
        self.pre_index = 0;
        self.pending_post.clear();
        self.active_post = None;
        self.post_index = 0;
        self.pre_parent = None;
    }
}

fn dedup(jobs: Vec<Job>) -> Vec<Job> {
    jobs.into_iter().collect::<IndexSet<_>>().into_iter().collect()
}

/// Handed to the flush hook; running it performs the requested flush
pub struct FlushRequest {
    runtime: WeakRuntime,
}

impl FlushRequest {
    /// Flush if the request is still pending
    ///
    /// Does nothing when the runtime is gone or the flush already happened
    /// (for instance through [`Runtime::next_tick`]). A flush aborted by the
    /// recursion limit is reported to the error handler.
    pub fn run(self) {
        let Some(rt) = self.runtime.upgrade() else {
            return;
        };
        if !rt.inner.scheduler.borrow().is_flush_pending {
            return;
        }
        if let Err(err) = rt.flush() {
            rt.handle_error(err);
        }
    }
}

impl fmt::Debug for FlushRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FlushRequest")
    }
}

impl Runtime {
    // =========================================================================
    // QUEUES
    // =========================================================================

    /// Queue a job for the main phase
    ///
    /// Ignored when the job is already queued at or after the current flush
    /// position (one slot later for [`RecursionPolicy::AllowDeferred`] jobs
    /// while flushing), or when it is the parent of the running pre-phase.
    pub fn enqueue_main(&self, job: Job) {
        let queued = {
            let mut s = self.inner.scheduler.borrow_mut();
            let start = if s.is_flushing && job.allows_recurse() {
                s.flush_index + 1
            } else {
                s.flush_index
            };
            let duplicate = s
                .queue
                .get(start..)
                .is_some_and(|rest| rest.iter().flatten().any(|queued| queued == &job));
            let is_parent = s.pre_parent.as_ref() == Some(&job);
            if duplicate || is_parent {
                false
            } else {
                s.queue.push(Some(job));
                true
            }
        };
        if queued {
            self.request_flush();
        }
    }

    /// Blank out a queued main-phase job so the flush skips it
    pub fn invalidate_job(&self, job: &Job) {
        let mut s = self.inner.scheduler.borrow_mut();
        let start = s.flush_index;
        if let Some(slot) = s
            .queue
            .iter_mut()
            .skip(start)
            .find(|slot| slot.as_ref() == Some(job))
        {
            *slot = None;
        }
    }

    /// Queue a job for the pre phase, deduplicated against the running batch
    pub fn enqueue_pre(&self, job: Job) {
        {
            let mut s = self.inner.scheduler.borrow_mut();
            if !SchedulerState::batch_contains(s.active_pre.as_ref(), &job, s.pre_index) {
                s.pending_pre.push(job);
            }
        }
        self.request_flush();
    }

    /// Queue a job for the post phase, deduplicated against the running batch
    pub fn enqueue_post(&self, job: Job) {
        {
            let mut s = self.inner.scheduler.borrow_mut();
            if !SchedulerState::batch_contains(s.active_post.as_ref(), &job, s.post_index) {
                s.pending_post.push(job);
            }
        }
        self.request_flush();
    }

    /// Queue pre-phase jobs that are already known to be unique
    pub fn enqueue_pre_batch(&self, jobs: impl IntoIterator<Item = Job>) {
        self.inner.scheduler.borrow_mut().pending_pre.extend(jobs);
        self.request_flush();
    }

    /// Queue post-phase jobs that are already known to be unique
    pub fn enqueue_post_batch(&self, jobs: impl IntoIterator<Item = Job>) {
        self.inner.scheduler.borrow_mut().pending_post.extend(jobs);
        self.request_flush();
    }

    /// Install the hook that defers flushes
    ///
    /// The hook is called at most once per coalesced tick and must arrange
    /// for [`FlushRequest::run`] to be called later, outside the current
    /// call stack.
    pub fn set_flush_hook(&self, hook: impl Fn(FlushRequest) + 'static) {
        *self.inner.flush_hook.borrow_mut() = Some(Rc::new(hook));
    }

    /// Ask for a flush; coalesced until the flush starts
    pub fn request_flush(&self) {
        {
            let mut s = self.inner.scheduler.borrow_mut();
            if s.is_flushing || s.is_flush_pending {
                return;
            }
            s.is_flush_pending = true;
        }
        let hook = self.inner.flush_hook.borrow().clone();
        if let Some(hook) = hook {
            hook(FlushRequest {
                runtime: self.downgrade(),
            });
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.inner.scheduler.borrow().is_flushing
    }

    pub fn is_flush_pending(&self) -> bool {
        self.inner.scheduler.borrow().is_flush_pending
    }

    // =========================================================================
    // FLUSH
    // =========================================================================

    /// Run every queued job until all queues are empty
    ///
    /// Calling `flush` while a flush is running does nothing. On
    /// [`ReactiveError::RecursionLimit`] all queues are cleared and the error
    /// is returned; errors from individual jobs go to the error handler.
    pub fn flush(&self) -> Result<()> {
        {
            let mut s = self.inner.scheduler.borrow_mut();
            if s.is_flushing {
                return Ok(());
            }
            s.is_flush_pending = false;
            s.is_flushing = true;
        }
        let generation = self.inner.scheduler.borrow().flush_count;
        tracing::debug!(generation, "flush start");

        let result = self.flush_phases();
        if result.is_err() {
            self.inner.scheduler.borrow_mut().reset();
        }

        let (callbacks, wakers) = {
            let mut s = self.inner.scheduler.borrow_mut();
            s.is_flushing = false;
            s.seen.clear();
            s.flush_count += 1;
            (std::mem::take(&mut s.after_flush), std::mem::take(&mut s.wakers))
        };
        self.prune_graph();
        self.prune_views();
        tracing::debug!(generation, ok = result.is_ok(), "flush end");

        for callback in callbacks {
            if let Err(err) = callback(self) {
                self.handle_error(ReactiveError::computation(ErrorContext::NextTick, err));
            }
        }
        for waker in wakers {
            waker.wake();
        }
        result
    }

    fn flush_phases(&self) -> Result<()> {
        loop {
            self.run_pre_phase(None)?;
            self.run_main_phase()?;
            self.run_post_phase()?;

            let s = self.inner.scheduler.borrow();
            if s.queue.is_empty() && s.pending_pre.is_empty() && s.pending_post.is_empty() {
                return Ok(());
            }
        }
    }

    /// Drain the pre-phase queue now
    ///
    /// `parent` names a main-phase job about to run; it cannot be queued from
    /// inside the pre-phase jobs.
    pub fn flush_pre(&self, parent: Option<&Job>) -> Result<()> {
        let standalone = !self.is_flushing();
        let result = self.run_pre_phase(parent.cloned());
        if standalone {
            self.inner.scheduler.borrow_mut().seen.clear();
        }
        result
    }

    /// Drain the post-phase queue now
    ///
    /// While a post phase is already running the pending jobs are appended
    /// to it instead.
    pub fn flush_post(&self) -> Result<()> {
        let standalone = !self.is_flushing();
        let result = self.run_post_phase();
        if standalone {
            self.inner.scheduler.borrow_mut().seen.clear();
        }
        result
    }

    fn run_pre_phase(&self, parent: Option<Job>) -> Result<()> {
        loop {
            let batch = {
                let mut s = self.inner.scheduler.borrow_mut();
                if s.pending_pre.is_empty() {
                    return Ok(());
                }
                s.pre_parent = parent.clone();
                let batch = dedup(std::mem::take(&mut s.pending_pre));
                s.active_pre = Some(batch.clone());
                batch
            };

            for (index, job) in batch.iter().enumerate() {
                self.inner.scheduler.borrow_mut().pre_index = index;
                self.check_recursion(job)?;
                self.execute(job);
            }

            let mut s = self.inner.scheduler.borrow_mut();
            s.active_pre = None;
            s.pre_index = 0;
            s.pre_parent = None;
        }
    }

    fn run_main_phase(&self) -> Result<()> {
        self.inner
            .scheduler
            .borrow_mut()
            .queue
            .sort_by_key(|slot| slot.as_ref().map_or(u64::MAX, Job::sort_key));

        let mut index = 0;
        loop {
            let job = {
                let mut s = self.inner.scheduler.borrow_mut();
                if index >= s.queue.len() {
                    break;
                }
                s.flush_index = index;
                s.queue[index].clone()
            };
            if let Some(job) = job {
                self.check_recursion(&job)?;
                self.execute(&job);
            }
            index += 1;
        }

        let mut s = self.inner.scheduler.borrow_mut();
        s.flush_index = 0;
        s.queue.clear();
        Ok(())
    }

    fn run_post_phase(&self) -> Result<()> {
        {
            let mut s = self.inner.scheduler.borrow_mut();
            if s.pending_post.is_empty() {
                return Ok(());
            }
            let mut batch = dedup(std::mem::take(&mut s.pending_post));
            if let Some(active) = s.active_post.as_mut() {
                active.extend(batch);
                return Ok(());
            }
            batch.sort_by_key(Job::sort_key);
            s.active_post = Some(batch);
        }

        let mut index = 0;
        loop {
            let job = {
                let mut s = self.inner.scheduler.borrow_mut();
                s.post_index = index;
                s.active_post.as_ref().and_then(|batch| batch.get(index).cloned())
            };
            let Some(job) = job else {
                break;
            };
            self.check_recursion(&job)?;
            self.execute(&job);
            index += 1;
        }

        let mut s = self.inner.scheduler.borrow_mut();
        s.active_post = None;
        s.post_index = 0;
        Ok(())
    }

    fn check_recursion(&self, job: &Job) -> Result<()> {
        let limit = self.inner.config.recursion_limit;
        let mut s = self.inner.scheduler.borrow_mut();
        let count = s.seen.entry(job.0.uid).or_insert(0);
        if *count > limit {
            tracing::warn!(job = job.label(), limit, "maximum recursive updates exceeded");
            return Err(ReactiveError::RecursionLimit {
                limit,
                job: job.label().to_owned(),
            });
        }
        *count += 1;
        Ok(())
    }

    fn execute(&self, job: &Job) {
        tracing::trace!(job = job.label(), "run job");
        if let Err(err) = job.run(self) {
            self.handle_error(err);
        }
    }

    /// Run a job immediately, outside any queue
    pub fn run_job(&self, job: &Job) {
        self.execute(job);
    }

    // =========================================================================
    // NEXT TICK
    // =========================================================================

    /// Resolves once the pending flush (if any) has completed
    ///
    /// Polling runs a pending flush inline. When a flush is already running
    /// the future waits for it to finish; it must not be awaited from inside
    /// a job.
    pub fn next_tick(&self) -> NextTick {
        NextTick {
            runtime: self.downgrade(),
            waiting_on: None,
        }
    }

    /// Run `callback` after the next flush completes
    pub fn next_tick_then(&self, callback: impl FnOnce(&Runtime) -> anyhow::Result<()> + 'static) {
        self.inner
            .scheduler
            .borrow_mut()
            .after_flush
            .push(Box::new(callback));
        self.request_flush();
    }
}

/// Future returned by [`Runtime::next_tick`]
#[must_use = "futures do nothing unless awaited"]
pub struct NextTick {
    runtime: WeakRuntime,
    /// Flush generation being waited on
    waiting_on: Option<u64>,
}

impl Future for NextTick {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Some(rt) = self.runtime.upgrade() else {
            return Poll::Ready(Ok(()));
        };

        let mut s = rt.inner.scheduler.borrow_mut();
        if let Some(generation) = self.waiting_on {
            if s.flush_count > generation {
                return Poll::Ready(Ok(()));
            }
            s.wakers.push(cx.waker().clone());
            return Poll::Pending;
        }

        if s.is_flushing {
            self.waiting_on = Some(s.flush_count);
            s.wakers.push(cx.waker().clone());
            return Poll::Pending;
        }

        if s.is_flush_pending || s.has_work() {
            drop(s);
            return Poll::Ready(rt.flush());
        }
        Poll::Ready(Ok(()))
    }
}

impl fmt::Debug for NextTick {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextTick")
            .field("waiting_on", &self.waiting_on)
            .finish()
    }
}
