//! Worker threads and message delivery
//!
//! Each worker is an OS thread running a tokio current-thread runtime inside a
//! `LocalSet`. The worker owns one state value `S` behind `Rc<RefCell<_>>`;
//! nothing outside the thread can reach it except by sending a task through
//! the worker's mailbox.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;
use tokio::task::LocalSet;

use super::RuntimeError;

/// Index of a worker, `0..workers`
pub type WorkerId = usize;

/// One-shot task executed on a worker
pub type Task<S> = Box<dyn FnOnce(&WorkerCx<S>) + Send + 'static>;

/// Task shared by every worker of a broadcast
pub type SharedTask<S> = Arc<dyn Fn(&WorkerCx<S>) + Send + Sync + 'static>;

enum Envelope<S> {
    Run(Task<S>),
    Stop,
}

static NEXT_RUNTIME_ID: AtomicUsize = AtomicUsize::new(1);

thread_local! {
    /// (runtime id, worker id) of the current thread, if it is a worker
    static CURRENT: Cell<Option<(usize, WorkerId)>> = const { Cell::new(None) };
}

/// Worker id of the calling thread, if it is a worker thread
pub fn current_worker() -> Option<WorkerId> {
    CURRENT.with(|c| c.get()).map(|(_, id)| id)
}

/// What to do when a unicast message cannot be delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Discard the task if the target is not running
    FailSilently,
    /// Run the task on the calling worker if the target is not running
    RunLocally,
    /// Run synchronously when the target is the calling worker
    DirectIfSelf,
}

/// Outcome of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BroadcastReport {
    /// Workers that ran the task
    pub sent: usize,
    /// Workers that could not be reached or whose task failed
    pub errors: usize,
}

struct Inner<S> {
    id: usize,
    mailboxes: Vec<mpsc::UnboundedSender<Envelope<S>>>,
    running: Vec<AtomicBool>,
}

/// Cloneable, thread-safe handle for sending tasks to workers
pub struct RuntimeHandle<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for RuntimeHandle<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: 'static> RuntimeHandle<S> {
    /// Number of workers
    pub fn workers(&self) -> usize {
        self.inner.mailboxes.len()
    }

    /// Whether `worker` is still processing its mailbox
    pub fn is_running(&self, worker: WorkerId) -> bool {
        self.inner
            .running
            .get(worker)
            .is_some_and(|r| r.load(Ordering::Acquire))
    }

    /// Whether the calling thread is one of this runtime's workers
    pub fn on_worker(&self) -> Option<WorkerId> {
        CURRENT
            .with(|c| c.get())
            .filter(|(rt, _)| *rt == self.inner.id)
            .map(|(_, id)| id)
    }

    /// Queue `task` on `worker`
    pub fn send<F>(&self, worker: WorkerId, task: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&WorkerCx<S>) + Send + 'static,
    {
        self.deliver(worker, Box::new(task)).map_err(|(e, _)| e)
    }

    /// Queue `task`, handing it back when it could not be queued
    fn deliver(
        &self,
        worker: WorkerId,
        task: Task<S>,
    ) -> Result<(), (RuntimeError, Option<Task<S>>)> {
        let Some(mailbox) = self.inner.mailboxes.get(worker) else {
            return Err((RuntimeError::NoSuchWorker(worker), Some(task)));
        };
        if !self.is_running(worker) {
            return Err((RuntimeError::WorkerNotRunning(worker), Some(task)));
        }

        match mailbox.send(Envelope::Run(task)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(Envelope::Run(task))) => {
                Err((RuntimeError::WorkerNotRunning(worker), Some(task)))
            }
            Err(_) => Err((RuntimeError::WorkerNotRunning(worker), None)),
        }
    }

    /// Queue `task` on every worker without waiting
    pub fn broadcast(&self, task: SharedTask<S>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for worker in 0..self.workers() {
            let task = Arc::clone(&task);
            match self.send(worker, move |cx| task(cx)) {
                Ok(()) => report.sent += 1,
                Err(_) => report.errors += 1,
            }
        }
        report
    }

    /// Run `task` on every worker and block until all of them finished
    ///
    /// Must not be called from a worker of this runtime: the caller would wait
    /// on its own mailbox.
    pub fn broadcast_wait(&self, task: SharedTask<S>) -> Result<BroadcastReport, RuntimeError> {
        if self.on_worker().is_some() {
            return Err(RuntimeError::WouldDeadlock);
        }

        let (ack_tx, ack_rx) = std_mpsc::channel::<()>();
        let mut report = BroadcastReport::default();
        let mut queued = 0;

        for worker in 0..self.workers() {
            let task = Arc::clone(&task);
            let ack = ack_tx.clone();
            let queued_ok = self.send(worker, move |cx| {
                task(cx);
                let _ = ack.send(());
            });
            match queued_ok {
                Ok(()) => queued += 1,
                Err(_) => report.errors += 1,
            }
        }
        drop(ack_tx);

        // A worker that stops before running its task drops the ack sender
        for _ in 0..queued {
            if ack_rx.recv().is_err() {
                break;
            }
            report.sent += 1;
        }
        report.errors += queued - report.sent;

        Ok(report)
    }

    /// Deliver `each` to one worker at a time, threading `acc` through
    ///
    /// `done` runs once, on the thread that finished the chain, with the
    /// accumulator and the delivery counts.
    pub fn broadcast_sequential<A, F, D>(&self, acc: A, each: F, done: D)
    where
        A: Send + 'static,
        F: Fn(&WorkerCx<S>, &mut A) -> crate::Result<()> + Send + Sync + 'static,
        D: FnOnce(A, BroadcastReport) + Send + 'static,
    {
        let chain = Arc::new(Mutex::new(Chain {
            acc: Some(acc),
            report: BroadcastReport::default(),
            next: 0,
            each: Arc::new(each),
            done: Some(Box::new(done)),
        }));
        advance_chain(self.clone(), chain);
    }

    fn stop_all(&self) {
        for mailbox in &self.inner.mailboxes {
            let _ = mailbox.send(Envelope::Stop);
        }
    }
}

type EachFn<S, A> = Arc<dyn Fn(&WorkerCx<S>, &mut A) -> crate::Result<()> + Send + Sync>;
type DoneFn<A> = Box<dyn FnOnce(A, BroadcastReport) + Send>;

struct Chain<S, A> {
    acc: Option<A>,
    report: BroadcastReport,
    next: WorkerId,
    each: EachFn<S, A>,
    done: Option<DoneFn<A>>,
}

fn lock_chain<S, A>(chain: &Mutex<Chain<S, A>>) -> std::sync::MutexGuard<'_, Chain<S, A>> {
    chain.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn advance_chain<S: 'static, A: Send + 'static>(
    handle: RuntimeHandle<S>,
    chain: Arc<Mutex<Chain<S, A>>>,
) {
    loop {
        let target = {
            let mut c = lock_chain(&chain);
            if c.next >= handle.workers() {
                if let (Some(done), Some(acc)) = (c.done.take(), c.acc.take()) {
                    let report = c.report;
                    drop(c);
                    done(acc, report);
                }
                return;
            }
            c.next += 1;
            c.next - 1
        };

        let step = Arc::clone(&chain);
        let next_handle = handle.clone();
        let queued = handle.send(target, move |cx| {
            {
                let mut c = lock_chain(&step);
                let each = Arc::clone(&c.each);
                let result = match c.acc.as_mut() {
                    Some(acc) => each(cx, acc),
                    None => Ok(()),
                };
                match result {
                    Ok(()) => c.report.sent += 1,
                    Err(e) => {
                        tracing::debug!(worker = cx.id(), error = %e, "Sequential broadcast step failed");
                        c.report.errors += 1;
                    }
                }
            }
            advance_chain(next_handle, step);
        });

        match queued {
            Ok(()) => return,
            Err(_) => lock_chain(&chain).report.errors += 1,
        }
    }
}

/// Per-worker execution context handed to every task
pub struct WorkerCx<S> {
    id: WorkerId,
    state: Rc<RefCell<S>>,
    handle: RuntimeHandle<S>,
}

impl<S> Clone for WorkerCx<S> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            state: Rc::clone(&self.state),
            handle: self.handle.clone(),
        }
    }
}

impl<S: 'static> WorkerCx<S> {
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// The state container owned by this worker
    pub fn state(&self) -> &Rc<RefCell<S>> {
        &self.state
    }

    pub fn handle(&self) -> &RuntimeHandle<S> {
        &self.handle
    }

    /// Send `task` to `worker` following the `delivery` policy
    pub fn send<F>(&self, worker: WorkerId, delivery: Delivery, task: F) -> Result<(), RuntimeError>
    where
        F: FnOnce(&WorkerCx<S>) + Send + 'static,
    {
        if delivery == Delivery::DirectIfSelf && worker == self.id {
            task(self);
            return Ok(());
        }

        match self.handle.deliver(worker, Box::new(task)) {
            Ok(()) => Ok(()),
            Err((e, task)) => match delivery {
                Delivery::FailSilently => {
                    tracing::trace!(worker = worker, error = %e, "Dropping undeliverable task");
                    Ok(())
                }
                Delivery::RunLocally => {
                    if let Some(task) = task {
                        task(self);
                    }
                    Ok(())
                }
                Delivery::DirectIfSelf => Err(e),
            },
        }
    }

    /// Queue `task` on every worker, running it directly on this one
    pub fn broadcast(&self, task: SharedTask<S>, skip_self: bool) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for worker in 0..self.handle.workers() {
            if worker == self.id && skip_self {
                continue;
            }
            let task = Arc::clone(&task);
            match self.send(worker, Delivery::DirectIfSelf, move |cx| task(cx)) {
                Ok(()) => report.sent += 1,
                Err(_) => report.errors += 1,
            }
        }
        report
    }
}

/// A fixed set of single-threaded workers
pub struct WorkerRuntime<S: 'static> {
    handle: RuntimeHandle<S>,
    threads: Vec<JoinHandle<()>>,
}

impl<S: 'static> WorkerRuntime<S> {
    /// Spawn `workers` threads; `init` builds each worker's state on its thread
    pub fn start<F>(workers: usize, init: F) -> Result<Self, RuntimeError>
    where
        F: Fn(WorkerId) -> S + Send + Sync + 'static,
    {
        if workers == 0 {
            return Err(RuntimeError::NoWorkers);
        }

        let mut mailboxes = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            mailboxes.push(tx);
            receivers.push(rx);
        }

        let handle = RuntimeHandle {
            inner: Arc::new(Inner {
                id: NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed),
                mailboxes,
                running: (0..workers).map(|_| AtomicBool::new(true)).collect(),
            }),
        };

        let init = Arc::new(init);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let mut runtime = Self {
            handle: handle.clone(),
            threads: Vec::with_capacity(workers),
        };

        for (id, rx) in receivers.into_iter().enumerate() {
            let handle = handle.clone();
            let init = Arc::clone(&init);
            let ready = ready_tx.clone();

            let thread = thread::Builder::new()
                .name(format!("hub-worker-{}", id))
                .spawn(move || worker_main(id, handle, rx, move |id| init(id), ready))
                .map_err(RuntimeError::Spawn)?;
            runtime.threads.push(thread);
        }
        drop(ready_tx);

        for _ in 0..workers {
            match ready_rx.recv() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(RuntimeError::Spawn(e)),
                Err(_) => {
                    return Err(RuntimeError::Spawn(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "worker exited during start-up",
                    )))
                }
            }
        }

        tracing::debug!(workers = workers, "Worker runtime started");
        Ok(runtime)
    }

    pub fn handle(&self) -> &RuntimeHandle<S> {
        &self.handle
    }

    pub fn workers(&self) -> usize {
        self.handle.workers()
    }

    /// Stop every worker and join its thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if self.threads.is_empty() {
            return;
        }
        self.handle.stop_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
        tracing::debug!("Worker runtime stopped");
    }
}

impl<S: 'static> Drop for WorkerRuntime<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_main<S: 'static>(
    id: WorkerId,
    handle: RuntimeHandle<S>,
    mut mailbox: mpsc::UnboundedReceiver<Envelope<S>>,
    init: impl FnOnce(WorkerId) -> S,
    ready: std_mpsc::Sender<std::io::Result<()>>,
) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            handle.inner.running[id].store(false, Ordering::Release);
            let _ = ready.send(Err(e));
            return;
        }
    };

    CURRENT.with(|c| c.set(Some((handle.inner.id, id))));
    let local = LocalSet::new();
    let cx = WorkerCx {
        id,
        state: Rc::new(RefCell::new(init(id))),
        handle: handle.clone(),
    };
    let _ = ready.send(Ok(()));

    local.block_on(&rt, async {
        while let Some(envelope) = mailbox.recv().await {
            match envelope {
                Envelope::Run(task) => task(&cx),
                Envelope::Stop => break,
            }
        }
    });

    handle.inner.running[id].store(false, Ordering::Release);
    tracing::trace!(worker = id, "Worker loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    fn recv<T>(rx: &std_mpsc::Receiver<T>) -> T {
        rx.recv_timeout(Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_task_runs_on_target_worker() {
        let rt = WorkerRuntime::start(3, |_| Counter::default()).unwrap();
        let (tx, rx) = std_mpsc::channel();

        for _ in 0..2 {
            let tx = tx.clone();
            rt.handle()
                .send(2, move |cx| {
                    cx.state().borrow_mut().hits += 1;
                    let _ = tx.send((cx.id(), current_worker(), cx.state().borrow().hits));
                })
                .unwrap();
        }

        assert_eq!(recv(&rx), (2, Some(2), 1));
        assert_eq!(recv(&rx), (2, Some(2), 2));
        rt.shutdown();
    }

    #[test]
    fn test_send_to_unknown_worker() {
        let rt = WorkerRuntime::start(1, |_| Counter::default()).unwrap();
        let result = rt.handle().send(5, |_| {});
        assert!(matches!(result, Err(RuntimeError::NoSuchWorker(5))));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let result = WorkerRuntime::start(0, |_| Counter::default());
        assert!(matches!(result, Err(RuntimeError::NoWorkers)));
    }

    #[test]
    fn test_broadcast_wait_reaches_every_worker() {
        let rt = WorkerRuntime::start(4, |_| Counter::default()).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let report = rt
            .handle()
            .broadcast_wait(Arc::new(move |cx: &WorkerCx<Counter>| {
                sink.lock().unwrap().push(cx.id());
            }))
            .unwrap();

        assert_eq!(report, BroadcastReport { sent: 4, errors: 0 });
        let mut ids = seen.lock().unwrap().clone();
        ids.sort();
        assert_eq!(ids, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_broadcast_wait_from_worker_is_rejected() {
        let rt = WorkerRuntime::start(2, |_| Counter::default()).unwrap();
        let (tx, rx) = std_mpsc::channel();

        rt.handle()
            .send(0, move |cx| {
                let result = cx.handle().broadcast_wait(Arc::new(|_: &WorkerCx<Counter>| {}));
                let _ = tx.send(matches!(result, Err(RuntimeError::WouldDeadlock)));
            })
            .unwrap();

        assert!(recv(&rx));
    }

    #[test]
    fn test_broadcast_sequential_visits_in_order() {
        let rt = WorkerRuntime::start(3, |_| Counter::default()).unwrap();
        let (tx, rx) = std_mpsc::channel();

        rt.handle().broadcast_sequential(
            Vec::new(),
            |cx: &WorkerCx<Counter>, acc: &mut Vec<WorkerId>| {
                acc.push(cx.id());
                Ok(())
            },
            move |acc, report| {
                let _ = tx.send((acc, report));
            },
        );

        let (order, report) = recv(&rx);
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(report, BroadcastReport { sent: 3, errors: 0 });
    }

    #[test]
    fn test_broadcast_sequential_counts_failures() {
        let rt = WorkerRuntime::start(2, |_| Counter::default()).unwrap();
        let (tx, rx) = std_mpsc::channel();

        rt.handle().broadcast_sequential(
            0u32,
            |cx: &WorkerCx<Counter>, acc: &mut u32| {
                *acc += 1;
                if cx.id() == 1 {
                    return Err(crate::Error::Io(std::io::ErrorKind::Other.into()));
                }
                Ok(())
            },
            move |acc, report| {
                let _ = tx.send((acc, report));
            },
        );

        assert_eq!(recv(&rx), (2, BroadcastReport { sent: 1, errors: 1 }));
    }

    #[test]
    fn test_delivery_policies() {
        let rt = WorkerRuntime::start(2, |_| Counter::default()).unwrap();
        let (tx, rx) = std_mpsc::channel();

        rt.handle()
            .send(0, move |cx| {
                // Runs synchronously: the counter is visible right away
                cx.send(0, Delivery::DirectIfSelf, |cx| cx.state().borrow_mut().hits += 1)
                    .unwrap();
                let direct = cx.state().borrow().hits;

                // Unknown target falls back to the calling worker
                cx.send(9, Delivery::RunLocally, |cx| cx.state().borrow_mut().hits += 10)
                    .unwrap();
                let local = cx.state().borrow().hits;

                let silent = cx.send(9, Delivery::FailSilently, |_| {}).is_ok();
                let strict = cx.send(9, Delivery::DirectIfSelf, |_| {}).is_err();

                let _ = tx.send((direct, local, silent, strict));
            })
            .unwrap();

        assert_eq!(recv(&rx), (1, 11, true, true));
    }

    #[test]
    fn test_send_after_shutdown_fails() {
        let rt = WorkerRuntime::start(1, |_| Counter::default()).unwrap();
        let handle = rt.handle().clone();
        rt.shutdown();

        assert!(!handle.is_running(0));
        assert!(matches!(
            handle.send(0, |_| {}),
            Err(RuntimeError::WorkerNotRunning(0))
        ));
        assert_eq!(
            handle.broadcast(Arc::new(|_: &WorkerCx<Counter>| {})),
            BroadcastReport { sent: 0, errors: 1 }
        );
    }
}
