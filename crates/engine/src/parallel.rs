// Copyright The Streamgraph Authors
// SPDX-License-Identifier: Apache-2.0

//! `ParallelPipeline`: runs its inner sub-pipeline across a pool of worker
//! threads while preserving input order at the egress.
//!
//! The specification describes workers as OS processes, chosen there to
//! bypass a shared-memory interpreter lock. This engine has no such lock, so
//! a worker here is an OS thread running a private, independently
//! constructed copy of the inner pipeline — the isolation the spec cares
//! about (no shared node state, a crash on one worker does not corrupt the
//! others) without the cost of a process boundary. See
//! [`crate::error::Error::WorkerDied`] for how a worker crash (a Rust panic,
//! this engine's stand-in for a process dying by signal) is detected and
//! surfaced.
//!
//! Topology: a dispatcher thread tags each incoming object with a
//! monotonically increasing sequence number and sends it on a bounded work
//! queue shared by the workers; each worker runs the inner pipeline on that
//! one object (`transform_stream([object]) -> [object']`, which may fan out
//! to more than one result — see "Inner sources" below) and sends its
//! results back tagged with the same sequence number; a reorder buffer on
//! the consumer's pulling thread releases results strictly in
//! sequence-number order.
//!
//! **Inner sources.** A worker rebuilds its private inner [`Pipeline`] once
//! (via the scope's construction closure) but re-runs `transform_stream`
//! over a fresh singleton input for every object it is handed. A source
//! node inside the inner pipeline therefore restarts and re-emits its full
//! output for every incoming outer object — the fan-out (cartesian product)
//! behavior the specification requires — while any node-level state the
//! inner pipeline's nodes hold in their own fields (as opposed to
//! `before_stream`/`after_stream` bookkeeping) persists across objects for
//! that worker's lifetime, since the `Pipeline`'s `Arc<dyn Node>` instances
//! are reused. See `DESIGN.md` for the tradeoff this implies for
//! `before_stream`/`after_stream` timing.

use crate::builder;
use crate::error::Error;
use crate::node::{self, Node, NodeName, ObjectStream};
use crate::object::Object;
use crate::pipeline::{self, Pipeline};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

/// How often the driver polls for worker liveness while waiting for the
/// next result. Bounds the delay between a worker dying and the stream
/// surfacing a [`Error::WorkerDied`].
const LIVENESS_POLL: Duration = Duration::from_millis(25);

/// How long the driver waits for worker threads to join during cancellation
/// before giving up and detaching them. Threads that are blocked on
/// unrelated work (not cooperating with the cancellation flag) are leaked
/// at the OS level at that point, exactly as a killed-but-unreaped process
/// would be; this bound keeps a stuck worker from hanging the consumer.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Farms its inner sub-pipeline out to `num_workers` worker threads while
/// preserving input order at the egress. See the module documentation for
/// the topology and failure semantics.
pub struct ParallelPipeline {
    name: NodeName,
    num_workers: usize,
    factory: Arc<dyn Fn() -> Pipeline + Send + Sync>,
}

impl ParallelPipeline {
    /// Enters a nested scope, runs `f` to construct the inner sub-pipeline,
    /// and registers the resulting scope as one node of the enclosing
    /// pipeline. `f` is kept around and replayed once per worker thread, so
    /// that each worker gets its own independently constructed copy of the
    /// inner pipeline rather than sharing node state.
    ///
    /// # Errors
    /// [`Error::InvalidWorkerCount`] if `num_workers` is zero. A port `f`
    /// reads without an ancestor node having bound it is checked eagerly
    /// here (and not only when a worker thread first replays `f`), so a bad
    /// inner pipeline fails at construction rather than on the first
    /// dispatched object.
    pub fn build(
        num_workers: usize,
        f: impl Fn() + Send + Sync + 'static,
    ) -> Result<Arc<ParallelPipeline>, Error> {
        if num_workers == 0 {
            return Err(Error::InvalidWorkerCount);
        }
        let name: NodeName = Arc::from("ParallelPipeline");
        // `f` is replayed later, lazily, once per worker thread — after
        // this scope has been exited and on threads that never had it on
        // their stack to begin with — so it cannot rely on the live builder
        // stack to see what the enclosing scope bound. Seed it explicitly
        // with a snapshot taken now, while the enclosing scope is still on
        // the stack.
        let seed = builder::current_bound_ports();
        let factory: Arc<dyn Fn() -> Pipeline + Send + Sync> = {
            let f = Arc::new(f);
            let seed = seed.clone();
            Arc::new(move || pipeline::build_nested_seeded(seed.clone(), &*f))
        };
        // Run the inner scope once now so an unbound-port error in `f`
        // surfaces synchronously from `build`, not from the first object
        // dispatched to a worker.
        factory();
        let node = Arc::new(ParallelPipeline {
            name,
            num_workers,
            factory,
        });
        builder::register(node.clone());
        Ok(node)
    }
}

impl Node for ParallelPipeline {
    fn name(&self) -> NodeName {
        self.name.clone()
    }

    fn transform_stream(self: Arc<Self>, input: ObjectStream) -> ObjectStream {
        let body = ParallelStream::new(self.clone(), input);
        node::wrap_with_lifecycle(
            Arc::new(NoopLifecycle {
                name: self.name.clone(),
            }),
            body,
        )
    }
}

struct NoopLifecycle {
    name: NodeName,
}

impl Node for NoopLifecycle {
    fn name(&self) -> NodeName {
        self.name.clone()
    }
}

/// A single worker's record of the sequence number it is currently running,
/// if any. Set just before the worker runs the inner pipeline on an object
/// and cleared just after; if a worker thread dies (panics) while this is
/// `Some`, the driver knows exactly which sequence slot to fail.
#[derive(Default)]
struct WorkerSlot {
    current_seq: Mutex<Option<u64>>,
}

struct WorkerHandle {
    join: JoinHandle<()>,
    slot: Arc<WorkerSlot>,
    /// Becomes true once the driver has already synthesized a
    /// [`Error::WorkerDied`] for this worker, so a second liveness check
    /// does not double-report it.
    reported_dead: bool,
}

type WorkMsg = (u64, Object);
type ResultMsg = (u64, Result<Vec<Object>, Error>);

/// Drives the dispatcher and worker pool lazily, on first pull, and
/// presents results to the consumer strictly in sequence-number order.
struct ParallelStream {
    scope: Arc<ParallelPipeline>,
    input: Option<ObjectStream>,
    started: bool,
    finished: bool,
    cancel: Arc<AtomicBool>,
    dispatcher: Option<JoinHandle<()>>,
    workers: Vec<WorkerHandle>,
    result_rx: Option<flume::Receiver<ResultMsg>>,
    /// Results that have arrived out of order, keyed by sequence number,
    /// waiting for their turn.
    pending: std::collections::BTreeMap<u64, Result<Vec<Object>, Error>>,
    /// Objects from an already-released, possibly-fanned-out result,
    /// waiting to be handed to the consumer one at a time.
    ready: std::collections::VecDeque<Result<Object, Error>>,
    next_seq: u64,
}

impl ParallelStream {
    fn new(scope: Arc<ParallelPipeline>, input: ObjectStream) -> Self {
        ParallelStream {
            scope,
            input: Some(input),
            started: false,
            finished: false,
            cancel: Arc::new(AtomicBool::new(false)),
            dispatcher: None,
            workers: Vec::new(),
            result_rx: None,
            pending: std::collections::BTreeMap::new(),
            ready: std::collections::VecDeque::new(),
            next_seq: 0,
        }
    }

    fn start(&mut self) {
        self.started = true;
        let input = self.input.take().expect("start called twice");

        tracing::debug!(
            node = %self.scope.name,
            num_workers = self.scope.num_workers,
            "starting ParallelPipeline worker pool"
        );

        let (work_tx, work_rx) = flume::bounded::<WorkMsg>(self.scope.num_workers * 2);
        let (result_tx, result_rx) = flume::bounded::<ResultMsg>(self.scope.num_workers * 2);

        for idx in 0..self.scope.num_workers {
            let factory = self.scope.factory.clone();
            let work_rx = work_rx.clone();
            let result_tx = result_tx.clone();
            let slot = Arc::new(WorkerSlot::default());
            let cancel = self.cancel.clone();
            let join = std::thread::Builder::new()
                .name(format!("parallel-pipeline-worker-{idx}"))
                .spawn({
                    let slot = slot.clone();
                    move || worker_loop(factory, work_rx, result_tx, slot, cancel)
                })
                .expect("failed to spawn ParallelPipeline worker thread");
            self.workers.push(WorkerHandle {
                join,
                slot,
                reported_dead: false,
            });
        }
        let cancel = self.cancel.clone();
        let dispatcher_result_tx = result_tx.clone();
        self.dispatcher = Some(
            std::thread::Builder::new()
                .name("parallel-pipeline-dispatcher".to_string())
                .spawn(move || dispatch_loop(input, work_tx, dispatcher_result_tx, cancel))
                .expect("failed to spawn ParallelPipeline dispatcher thread"),
        );
        // Drop our own clone of the result sender so the channel closes
        // once the dispatcher's and every worker's clone is also dropped
        // (i.e. dispatch has ended and every worker has exited), letting the
        // driver observe `Disconnected` rather than blocking forever.
        drop(result_tx);
        self.result_rx = Some(result_rx);
    }

    /// Cancels dispatch and worker threads, discards in-flight results, and
    /// joins everyone within a bounded timeout. Idempotent.
    fn cancel(&mut self) {
        tracing::debug!(node = %self.scope.name, "cancelling ParallelPipeline worker pool");
        self.cancel.store(true, Ordering::Release);
        if let Some(handle) = self.dispatcher.take() {
            let _ = join_with_timeout(handle, JOIN_TIMEOUT);
        }
        // Drain the result channel so workers blocked on a full channel can
        // make progress and observe the cancellation flag.
        if let Some(rx) = &self.result_rx {
            while rx.try_recv().is_ok() {}
        }
        for worker in self.workers.drain(..) {
            let _ = join_with_timeout(worker.join, JOIN_TIMEOUT);
        }
        self.result_rx = None;
        self.pending.clear();
    }

    /// Checks whether any worker thread has terminated while it still held
    /// an outstanding sequence number — a crash, this engine's stand-in for
    /// a worker process dying by signal — and if so synthesizes the
    /// corresponding [`Error::WorkerDied`] into `self.pending`.
    fn detect_worker_deaths(&mut self) {
        for (idx, worker) in self.workers.iter_mut().enumerate() {
            if worker.reported_dead || !worker.join.is_finished() {
                continue;
            }
            let outstanding = worker.slot.current_seq.lock().take();
            if let Some(seq) = outstanding {
                worker.reported_dead = true;
                tracing::warn!(
                    node = %self.scope.name,
                    worker = idx,
                    seq,
                    "worker thread terminated while holding outstanding work"
                );
                self.pending.entry(seq).or_insert_with(|| {
                    Err(Error::WorkerDied {
                        index: idx,
                        cause: "thread terminated without reporting a result".to_string(),
                    })
                });
            } else {
                // Finished cleanly (drained its sentinel) with no
                // outstanding work; nothing to report.
                worker.reported_dead = true;
            }
        }
    }

    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.cancel();
        }
    }
}

impl Iterator for ParallelStream {
    type Item = Result<Object, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        if !self.started {
            self.start();
        }
        loop {
            if let Some(item) = self.ready.pop_front() {
                return Some(item);
            }
            if let Some(result) = self.pending.remove(&self.next_seq) {
                self.next_seq += 1;
                match result {
                    Ok(objects) => {
                        self.ready.extend(objects.into_iter().map(Ok));
                        continue;
                    }
                    Err(err) => {
                        self.finish();
                        return Some(Err(err));
                    }
                }
            }

            let rx = match &self.result_rx {
                Some(rx) => rx.clone(),
                None => {
                    self.finish();
                    return None;
                }
            };
            match rx.recv_timeout(LIVENESS_POLL) {
                Ok((seq, result)) => {
                    self.pending.insert(seq, result);
                }
                Err(flume::RecvTimeoutError::Timeout) => {
                    self.detect_worker_deaths();
                }
                Err(flume::RecvTimeoutError::Disconnected) => {
                    self.detect_worker_deaths();
                    if self.pending.contains_key(&self.next_seq) {
                        continue;
                    }
                    // Every worker exited and nothing more is coming for
                    // `next_seq`: the stream is exhausted.
                    self.finish();
                    return None;
                }
            }
        }
    }
}

impl Drop for ParallelStream {
    fn drop(&mut self) {
        self.finish();
    }
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> Result<(), ()> {
    // `std::thread::JoinHandle` has no built-in timed join; a worker that
    // cooperates with the cancellation flag or drains quickly returns well
    // within `timeout`, so the common case is a direct `join`. We approximate
    // the bound by polling `is_finished` before committing to the
    // (potentially blocking) `join` call.
    let deadline = std::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if std::time::Instant::now() >= deadline {
            // Detach: we cannot forcibly kill an OS thread from safe Rust.
            // The thread is left to finish on its own; its handles
            // (channels) have already been dropped or disconnected, so it
            // will observe that and exit shortly after.
            drop(handle);
            return Err(());
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let _ = handle.join();
    Ok(())
}

/// Sends `msg` on `tx`, retrying a full queue until it fits, the channel
/// disconnects, or `cancel` is set. Used instead of a plain blocking `send`
/// so that a dispatcher or worker stuck on a full queue still notices
/// cancellation within about one [`LIVENESS_POLL`] tick rather than hanging
/// until a receiver drains it.
fn send_cancelable<T>(tx: &flume::Sender<T>, mut msg: T, cancel: &AtomicBool) -> bool {
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        match tx.try_send(msg) {
            Ok(()) => return true,
            Err(flume::TrySendError::Full(m)) => {
                msg = m;
                std::thread::sleep(LIVENESS_POLL);
            }
            Err(flume::TrySendError::Disconnected(_)) => return false,
        }
    }
}

fn dispatch_loop(
    input: ObjectStream,
    work_tx: flume::Sender<WorkMsg>,
    result_tx: flume::Sender<ResultMsg>,
    cancel: Arc<AtomicBool>,
) {
    let mut seq: u64 = 0;
    for item in input {
        if cancel.load(Ordering::Acquire) {
            return;
        }
        match item {
            Ok(object) => {
                if !send_cancelable(&work_tx, (seq, object), &cancel) {
                    // Every worker is gone (or the driver dropped its
                    // receivers), or cancellation was requested while
                    // blocked on a full queue: nothing left to dispatch to.
                    return;
                }
                seq += 1;
            }
            Err(err) => {
                // Upstream (outer) error: stop enqueueing more work and hand
                // the error straight to the result channel in this
                // sequence's slot, bypassing the workers entirely, so the
                // reorder buffer releases it in the correct position once
                // every smaller sequence number has been drained.
                let _ = send_cancelable(&result_tx, (seq, Err(err)), &cancel);
                return;
            }
        }
    }
    // Input exhausted: dropping `work_tx` and `result_tx` here (end of
    // function) lets every worker's `work_rx.recv` and the driver's
    // `result_rx.recv` eventually observe disconnect once the queue drains,
    // taking the place of an explicit per-worker sentinel.
}

fn worker_loop(
    factory: Arc<dyn Fn() -> Pipeline + Send + Sync>,
    work_rx: flume::Receiver<WorkMsg>,
    result_tx: flume::Sender<ResultMsg>,
    slot: Arc<WorkerSlot>,
    cancel: Arc<AtomicBool>,
) {
    let inner = factory();
    loop {
        if cancel.load(Ordering::Acquire) {
            return;
        }
        match work_rx.recv_timeout(LIVENESS_POLL) {
            Ok((seq, object)) => {
                *slot.current_seq.lock() = Some(seq);
                let result = run_one(&inner, object);
                *slot.current_seq.lock() = None;
                if !send_cancelable(&result_tx, (seq, result), &cancel) {
                    return;
                }
            }
            Err(flume::RecvTimeoutError::Timeout) => continue,
            Err(flume::RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Runs the inner pipeline on a single incoming object, as
/// `transform_stream([object]) -> [object']`. A source inside the inner
/// pipeline may fan the one input out to many results (see the module
/// documentation); the first error aborts and discards whatever this object
/// had already produced, since a partial result for one outer object is not
/// a well-defined egress.
fn run_one(inner: &Pipeline, object: Object) -> Result<Vec<Object>, Error> {
    let stream = inner.transform_stream_from(Box::new(std::iter::once(Ok(object))));
    let mut out = Vec::new();
    for item in stream {
        out.push(item?);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::Port;
    use crate::testutil::ListSource;
    use std::fmt;
    use std::sync::atomic::AtomicUsize;

    /// A 1:1 node that sleeps briefly on every object, local to this test
    /// module so it does not need to depend on `streamgraph-nodes`' `Sleep`
    /// (which depends on this crate).
    struct Delay(Duration);

    impl Node for Delay {
        fn name(&self) -> NodeName {
            Arc::from("Delay")
        }

        fn transform(&self, object: Object) -> Result<Object, Error> {
            std::thread::sleep(self.0);
            Ok(object)
        }
    }

    struct CountingDelay {
        counter: Arc<AtomicUsize>,
        delay: Duration,
    }

    impl Node for CountingDelay {
        fn name(&self) -> NodeName {
            Arc::from("CountingDelay")
        }

        fn transform(&self, object: Object) -> Result<Object, Error> {
            self.counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            Ok(object)
        }
    }

    #[derive(Debug)]
    struct BoomError(String);

    impl fmt::Display for BoomError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for BoomError {}

    struct Boom(String);

    impl Node for Boom {
        fn name(&self) -> NodeName {
            Arc::from("Boom")
        }

        fn transform(&self, _object: Object) -> Result<Object, Error> {
            Err(Error::node(self.name(), BoomError(self.0.clone())))
        }
    }

    struct Suicide;

    impl Node for Suicide {
        fn name(&self) -> NodeName {
            Arc::from("Suicide")
        }

        fn transform(&self, _object: Object) -> Result<Object, Error> {
            panic!("Suicide node terminated its worker");
        }
    }

    struct AlwaysFail;

    impl Node for AlwaysFail {
        fn name(&self) -> NodeName {
            Arc::from("AlwaysFail")
        }

        fn transform(&self, _object: Object) -> Result<Object, Error> {
            Err(Error::node(self.name(), BoomError("upstream exploded".into())))
        }
    }

    /// §8 scenario 3 / universal invariant: for any `num_workers` the
    /// cartesian product of two nested sources comes out in the same order
    /// as running the same graph with a single worker (itself compared
    /// against a fully sequential reference with no `ParallelPipeline` at
    /// all, since `num_workers=1` is just this engine's degenerate case of
    /// the same code path).
    fn sequential_reference(n1: i64, n2: i64) -> Vec<(i64, i64)> {
        let level1 = Port::new("level1");
        let level2 = Port::new("level2");
        let l1_out = level1.clone();
        let l2_out = level2.clone();
        let pipeline = Pipeline::build(move || {
            ListSource::build(level1, (0..n1).collect());
            ListSource::build(level2, (0..n2).collect());
        });
        pipeline
            .transform_stream()
            .map(|r| {
                let o = r.unwrap();
                (
                    *o.get::<i64>(&l1_out).unwrap(),
                    *o.get::<i64>(&l2_out).unwrap(),
                )
            })
            .collect()
    }

    fn parallel_result(n1: i64, n2: i64, num_workers: usize) -> Vec<(i64, i64)> {
        let level1 = Port::new("level1");
        let level2 = Port::new("level2");
        let l1_out = level1.clone();
        let l2_out = level2.clone();
        let l2_for_inner = level2.clone();
        let pipeline = Pipeline::build(move || {
            ListSource::build(level1, (0..n1).collect());
            ParallelPipeline::build(num_workers, move || {
                ListSource::build(l2_for_inner.clone(), (0..n2).collect());
                builder::register(Arc::new(Delay(Duration::from_micros(200))));
            })
            .unwrap();
        });
        pipeline
            .transform_stream()
            .map(|r| {
                let o = r.unwrap();
                (
                    *o.get::<i64>(&l1_out).unwrap(),
                    *o.get::<i64>(&l2_out).unwrap(),
                )
            })
            .collect()
    }

    #[test]
    fn parallel_output_matches_sequential_for_every_worker_count() {
        let expected = sequential_reference(31, 31);
        for &workers in &[1usize, 2, 3, 4] {
            let got = parallel_result(31, 31, workers);
            assert_eq!(got, expected, "num_workers={workers}");
        }
    }

    #[test]
    fn worker_raise_propagates_the_message_and_tears_down_the_pool() {
        let pipeline = Pipeline::build(|| {
            ListSource::build(Port::new("n"), (0..5i64).collect());
            ParallelPipeline::build(2, || {
                builder::register(Arc::new(Boom("foo".to_string())));
            })
            .unwrap();
        });
        let err = pipeline.run().unwrap_err();
        assert!(format!("{err}").contains("foo"));
    }

    #[test]
    fn worker_death_is_reported_with_the_worker_index() {
        let pipeline = Pipeline::build(|| {
            ListSource::build(Port::new("n"), (0..5i64).collect());
            ParallelPipeline::build(2, || {
                builder::register(Arc::new(Suicide));
            })
            .unwrap();
        });
        let err = pipeline.run().unwrap_err();
        assert!(matches!(err, Error::WorkerDied { .. }), "got: {err:?}");
    }

    #[test]
    fn upstream_error_before_the_parallel_scope_propagates() {
        let pipeline = Pipeline::build(|| {
            ListSource::build(Port::new("n"), (0..5i64).collect());
            builder::register(Arc::new(AlwaysFail));
            ParallelPipeline::build(2, || {
                builder::register(Arc::new(Delay(Duration::from_micros(100))));
            })
            .unwrap();
        });
        let err = pipeline.run().unwrap_err();
        assert!(format!("{err}").contains("upstream exploded"));
    }

    #[test]
    fn zero_workers_is_rejected_at_construction() {
        let mut captured = None;
        Pipeline::build(|| {
            captured = Some(matches!(
                ParallelPipeline::build(0, || {}),
                Err(Error::InvalidWorkerCount)
            ));
        });
        assert_eq!(captured, Some(true));
    }

    #[test]
    fn dropping_the_stream_early_stops_workers_from_making_further_progress() {
        // No source inside the inner pipeline here: each worker's `run_one`
        // covers exactly the one outer object it was handed (no fan-out), so
        // a result comes back every `delay` rather than `run_one` burying an
        // entire fanned-out batch behind one long call — letting
        // cancellation take effect within a couple of in-flight items
        // instead of however long the whole next batch takes to finish.
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_for_inner = counter.clone();
        let pipeline = Pipeline::build(move || {
            ListSource::build(Port::new("level1"), (0..1000i64).collect());
            ParallelPipeline::build(2, move || {
                builder::register(Arc::new(CountingDelay {
                    counter: counter_for_inner.clone(),
                    delay: Duration::from_millis(2),
                }));
            })
            .unwrap();
        });

        {
            let mut stream = pipeline.transform_stream();
            for _ in 0..3 {
                stream.next().unwrap().unwrap();
            }
            // `stream` drops here, which must cancel and join every worker
            // before returning control to this scope.
        }

        let after_drop = counter.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        let settled = counter.load(Ordering::SeqCst);
        assert_eq!(
            after_drop, settled,
            "a worker kept processing objects after the stream was dropped"
        );
    }
}
