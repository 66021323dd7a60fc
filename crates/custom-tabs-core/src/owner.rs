//! Single-threaded executor that owns state which must never be touched
//! concurrently: the speculation slot and the verification tickets.
//!
//! Work is posted as closures. The thread runs a current-thread tokio runtime
//! so that delayed re-posts are plain timers instead of sleeping threads.

use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;
use std::thread::{JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, error, warn};

pub type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum OwnerError {
    #[error("owner thread has stopped")]
    Stopped,
    #[error("blocking call issued from the owner thread itself")]
    Reentrant,
    #[error("owner job panicked")]
    Panicked,
}

enum Message<S> {
    Run(Job<S>),
    RunAfter(Duration, Job<S>),
    Shutdown,
}

/// Runs type-erased tasks on the owner thread without touching its state.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> bool;
}

/// Cloneable posting half of an [`OwnerThread`]. Handed to the state builder so
/// that observers living inside the state can schedule follow-up work.
pub struct OwnerPoster<S> {
    tx: mpsc::UnboundedSender<Message<S>>,
}

impl<S> Clone for OwnerPoster<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<S: 'static> OwnerPoster<S> {
    pub fn post<F>(&self, job: F) -> Result<(), OwnerError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Message::Run(Box::new(job)))
            .map_err(|_| OwnerError::Stopped)
    }

    pub fn post_after<F>(&self, delay: Duration, job: F) -> Result<(), OwnerError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.tx
            .send(Message::RunAfter(delay, Box::new(job)))
            .map_err(|_| OwnerError::Stopped)
    }
}

impl<S: 'static> Executor for OwnerPoster<S> {
    fn execute(&self, task: Box<dyn FnOnce() + Send>) -> bool {
        self.post(move |_| task()).is_ok()
    }
}

/// Handle to a named thread that exclusively owns a value of type `S`.
pub struct OwnerThread<S> {
    name: String,
    poster: OwnerPoster<S>,
    thread_id: ThreadId,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl<S: 'static> OwnerThread<S> {
    /// Spawns the thread and builds the owned state on it.
    pub fn spawn<F>(name: &str, build: F) -> std::io::Result<Self>
    where
        F: FnOnce(OwnerPoster<S>) -> S + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let poster = OwnerPoster { tx };
        let builder_poster = poster.clone();
        let thread_name = name.to_string();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let join = std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let state = Rc::new(RefCell::new(build(builder_poster)));
                let local = LocalSet::new();
                local.block_on(&runtime, run_loop(thread_name, state, rx));
            })?;
        let thread_id = join.thread().id();
        Ok(Self {
            name: name.to_string(),
            poster,
            thread_id,
            join: Mutex::new(Some(join)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn poster(&self) -> OwnerPoster<S> {
        self.poster.clone()
    }

    pub fn is_current(&self) -> bool {
        std::thread::current().id() == self.thread_id
    }

    pub fn post<F>(&self, job: F) -> Result<(), OwnerError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.poster.post(job)
    }

    pub fn post_after<F>(&self, delay: Duration, job: F) -> Result<(), OwnerError>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        self.poster.post_after(delay, job)
    }

    /// Runs `job` on the owner thread and waits for its result.
    pub fn run_blocking<R, F>(&self, job: F) -> Result<R, OwnerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        if self.is_current() {
            return Err(OwnerError::Reentrant);
        }
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.post(move |state| {
            let _ = reply_tx.send(job(state));
        })?;
        // A panicking job drops the sender without replying.
        reply_rx.recv().map_err(|_| OwnerError::Panicked)
    }

    /// Async flavour of [`run_blocking`](Self::run_blocking) for callers already on a runtime.
    pub async fn call<R, F>(&self, job: F) -> Result<R, OwnerError>
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.post(move |state| {
            let _ = reply_tx.send(job(state));
        })?;
        reply_rx.await.map_err(|_| OwnerError::Panicked)
    }

    /// Stops the loop after already-queued jobs have run. Pending delayed jobs are dropped.
    pub fn shutdown(&self) {
        let _ = self.poster.tx.send(Message::Shutdown);
        if self.is_current() {
            return;
        }
        if let Some(join) = self.join.lock().take() {
            if join.join().is_err() {
                error!(thread = %self.name, "owner thread panicked");
            }
        }
    }
}

impl<S> Drop for OwnerThread<S> {
    fn drop(&mut self) {
        let _ = self.poster.tx.send(Message::Shutdown);
    }
}

async fn run_loop<S: 'static>(
    name: String,
    state: Rc<RefCell<S>>,
    mut rx: mpsc::UnboundedReceiver<Message<S>>,
) {
    debug!(thread = %name, "owner loop started");
    while let Some(message) = rx.recv().await {
        match message {
            Message::Run(job) => run_job(&name, &state, job),
            Message::RunAfter(delay, job) => {
                let state = Rc::clone(&state);
                let name = name.clone();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(delay).await;
                    run_job(&name, &state, job);
                });
            }
            Message::Shutdown => break,
        }
    }
    debug!(thread = %name, "owner loop stopped");
}

fn run_job<S>(name: &str, state: &Rc<RefCell<S>>, job: Job<S>) {
    let Ok(mut guard) = state.try_borrow_mut() else {
        warn!(thread = %name, "owner state already borrowed; dropping job");
        return;
    };
    if catch_unwind(AssertUnwindSafe(|| job(&mut *guard))).is_err() {
        error!(thread = %name, "owner job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test_timeout::timeout]
    fn jobs_run_in_post_order() {
        let owner = OwnerThread::spawn("owner-order", |_| Vec::<u32>::new()).expect("spawn");
        for i in 0..5 {
            owner.post(move |log| log.push(i)).expect("post");
        }
        let seen = owner.run_blocking(|log| log.clone()).expect("blocking");
        assert_eq!(seen, vec![0, 1, 2, 3, 4]);
        owner.shutdown();
    }

    #[test_timeout::timeout]
    fn panicking_job_does_not_kill_the_loop() {
        let owner = OwnerThread::spawn("owner-panic", |_| 0u32).expect("spawn");
        assert_eq!(
            owner.run_blocking(|_| -> u32 { panic!("boom") }),
            Err(OwnerError::Panicked)
        );
        owner.post(|n| *n += 1).expect("post");
        assert_eq!(owner.run_blocking(|n| *n), Ok(1));
        owner.shutdown();
    }

    #[test_timeout::timeout]
    fn delayed_jobs_run_after_immediate_ones() {
        let owner = OwnerThread::spawn("owner-delay", |_| Vec::<&'static str>::new()).expect("spawn");
        let done = Arc::new(AtomicUsize::new(0));
        let flag = done.clone();
        owner
            .post_after(Duration::from_millis(20), move |log| {
                log.push("late");
                flag.store(1, Ordering::SeqCst);
            })
            .expect("post_after");
        owner.post(|log| log.push("early")).expect("post");
        while done.load(Ordering::SeqCst) == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(
            owner.run_blocking(|log| log.clone()).expect("blocking"),
            vec!["early", "late"]
        );
        owner.shutdown();
    }

    #[test_timeout::timeout]
    fn executor_tasks_share_the_queue() {
        let owner = OwnerThread::spawn("owner-exec", |_| 0u32).expect("spawn");
        let ran = Arc::new(AtomicUsize::new(0));
        let seen = ran.clone();
        let poster = owner.poster();
        assert!(poster.execute(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        })));
        owner.run_blocking(|_| ()).expect("drain");
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        owner.shutdown();
    }

    #[test_timeout::timeout]
    fn posting_after_shutdown_fails() {
        let owner = OwnerThread::spawn("owner-stop", |_| ()).expect("spawn");
        owner.shutdown();
        assert_eq!(owner.post(|_| {}), Err(OwnerError::Stopped));
        assert_eq!(owner.run_blocking(|_| ()), Err(OwnerError::Stopped));
    }
}
