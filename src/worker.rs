// Copyright 2022 Ryan Seipp
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The worker pool: a bounded queue of ready connections and the threads
//! that serve them.
//!
//! Workers are designed to run alongside each other, taking connections
//! waiting to be processed from a channel, delivered by the server tick.
//! A worker that pops a connection owns it exclusively until it either
//! returns it to the manager (keep-alive) or closes it.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, TrySendError};

use crate::connection::Connection;
use crate::gateway::Gateway;
use crate::manager::ConnectionManager;
use crate::resizer::PoolMetrics;
use crate::server::{ServerConfig, ServerStats};

/// Unit of work delivered to worker threads.
enum Work {
    /// A connection with a servable request.
    Conn(Connection),
    /// Sentinel telling exactly one worker to exit.
    Stop,
}

/// Per-worker counters, aggregated read-only by the server statistics.
#[derive(Debug, Default)]
pub struct WorkerStats {
    requests: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    work_time_micros: AtomicU64,
}

impl WorkerStats {
    /// Requests this worker served.
    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Bytes this worker read from peers.
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    /// Bytes this worker wrote to peers.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Time this worker spent inside `communicate`.
    pub fn work_time(&self) -> Duration {
        Duration::from_micros(self.work_time_micros.load(Ordering::Relaxed))
    }
}

/// Aggregated pool counters.
#[derive(Debug, Default, Clone)]
pub struct PoolTotals {
    /// Requests served across all workers, living and retired.
    pub requests: u64,
    /// Bytes read across all workers.
    pub bytes_read: u64,
    /// Bytes written across all workers.
    pub bytes_written: u64,
    /// Accumulated time spent serving.
    pub work_time: Duration,
}

struct WorkerHandle {
    thread: JoinHandle<()>,
    stats: Arc<WorkerStats>,
}

/// Pool of worker threads fed from a FIFO queue of ready connections.
pub struct WorkerPool {
    tx: Sender<Work>,
    rx: Receiver<Work>,
    config: Arc<ServerConfig>,
    stats: Arc<ServerStats>,
    gateway: Arc<dyn Gateway>,
    manager: Arc<ConnectionManager>,
    idle: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    worker_seq: AtomicU64,
    workers: Mutex<Vec<WorkerHandle>>,
    retired: Mutex<Vec<Arc<WorkerStats>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("size", &self.live.load(Ordering::Relaxed))
            .field("idle", &self.idle.load(Ordering::Relaxed))
            .field("qsize", &self.rx.len())
            .finish()
    }
}

impl WorkerPool {
    pub(crate) fn new(
        config: Arc<ServerConfig>,
        stats: Arc<ServerStats>,
        gateway: Arc<dyn Gateway>,
        manager: Arc<ConnectionManager>,
    ) -> Self {
        let (tx, rx) = match config.accepted_queue_size {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };
        Self {
            tx,
            rx,
            config,
            stats,
            gateway,
            manager,
            idle: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            stopping: Arc::new(AtomicBool::new(false)),
            worker_seq: AtomicU64::new(0),
            workers: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the initial complement of workers.
    pub(crate) fn start(&self) {
        self.grow(self.config.min_threads);
    }

    /// Hand a ready connection to the workers.
    ///
    /// Never blocks the caller past the configured put-timeout; a full
    /// queue (or a stopping pool) hands the connection back so the acceptor
    /// can close it instead of stalling.
    pub(crate) fn put(&self, conn: Connection) -> Result<(), Connection> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(conn);
        }
        let timeout = self.config.accepted_queue_timeout;
        if timeout.is_zero() {
            match self.tx.try_send(Work::Conn(conn)) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(Work::Conn(conn)))
                | Err(TrySendError::Disconnected(Work::Conn(conn))) => Err(conn),
                Err(_) => unreachable!("only connections are enqueued by put"),
            }
        } else {
            match self.tx.send_timeout(Work::Conn(conn), timeout) {
                Ok(()) => Ok(()),
                Err(err) => match err.into_inner() {
                    Work::Conn(conn) => Err(conn),
                    Work::Stop => unreachable!("only connections are enqueued by put"),
                },
            }
        }
    }

    /// Ready connections waiting for a worker.
    pub fn qsize(&self) -> usize {
        self.rx.len()
    }

    /// Live worker threads.
    pub fn size(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Workers currently blocked on the queue.
    pub fn idle_count(&self) -> usize {
        self.idle.load(Ordering::Relaxed)
    }

    /// Sum the per-worker counters, including exited workers.
    pub fn totals(&self) -> PoolTotals {
        let mut totals = PoolTotals::default();
        let workers = self.workers.lock().expect("worker list lock poisoned");
        let retired = self.retired.lock().expect("retired list lock poisoned");
        for stats in workers.iter().map(|w| &w.stats).chain(retired.iter()) {
            totals.requests += stats.requests();
            totals.bytes_read += stats.bytes_read();
            totals.bytes_written += stats.bytes_written();
            totals.work_time += stats.work_time();
        }
        totals
    }

    fn spawn_worker(&self) {
        let worker_stats = Arc::new(WorkerStats::default());
        let id = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let rx = self.rx.clone();
        let gateway = self.gateway.clone();
        let manager = self.manager.clone();
        let server_stats = self.stats.clone();
        let idle = self.idle.clone();
        let live = self.live.clone();
        let stats = worker_stats.clone();

        live.fetch_add(1, Ordering::SeqCst);
        let spawned = std::thread::Builder::new()
            .name(format!("stoker-worker-{id}"))
            .spawn(move || {
                worker_loop(rx, gateway, manager, server_stats, stats, idle);
                live.fetch_sub(1, Ordering::SeqCst);
            });
        match spawned {
            Ok(thread) => {
                self.workers
                    .lock()
                    .expect("worker list lock poisoned")
                    .push(WorkerHandle {
                        thread,
                        stats: worker_stats,
                    });
            }
            Err(err) => {
                self.live.fetch_sub(1, Ordering::SeqCst);
                tracing::error!(error = %err, "failed to spawn worker thread");
            }
        }
        self.reap();
    }

    /// Drop join handles of workers that already exited, keeping their
    /// counters for aggregation.
    fn reap(&self) {
        let mut workers = self.workers.lock().expect("worker list lock poisoned");
        let mut retired = self.retired.lock().expect("retired list lock poisoned");
        let mut i = 0;
        while i < workers.len() {
            if workers[i].thread.is_finished() {
                let handle = workers.swap_remove(i);
                retired.push(handle.stats.clone());
                let _ = handle.thread.join();
            } else {
                i += 1;
            }
        }
    }

    /// Spawn up to `n` additional workers, bounded by `max_threads`.
    pub fn grow(&self, n: usize) {
        if self.stopping.load(Ordering::SeqCst) {
            return;
        }
        let max = self.config.max_threads;
        for _ in 0..n {
            if max >= 0 && self.size() >= max as usize {
                break;
            }
            self.spawn_worker();
        }
    }

    /// Ask `n` workers to exit once they reach the front of the queue.
    pub fn shrink(&self, n: usize) {
        for _ in 0..n {
            if self.tx.try_send(Work::Stop).is_err() {
                // queue full means the pool is busy, not oversized
                return;
            }
        }
    }

    /// Graceful stop: one sentinel per worker, then join until the
    /// deadline. Stragglers are abandoned to finish on their own.
    pub(crate) fn stop(&self, timeout: Duration) {
        self.stopping.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + timeout;
        for _ in 0..self.size() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if self.tx.send_timeout(Work::Stop, remaining).is_err() {
                break;
            }
        }
        while self.size() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        self.reap();
        let stragglers = self.size();
        if stragglers > 0 {
            tracing::warn!(stragglers, "worker threads still busy after shutdown timeout");
        }
    }
}

impl PoolMetrics for WorkerPool {
    fn size(&self) -> usize {
        WorkerPool::size(self)
    }

    fn idle(&self) -> usize {
        self.idle_count()
    }

    fn qsize(&self) -> usize {
        WorkerPool::qsize(self)
    }

    fn min(&self) -> usize {
        self.config.min_threads
    }

    fn max(&self) -> isize {
        self.config.max_threads
    }

    fn grow(&self, n: usize) {
        WorkerPool::grow(self, n);
    }

    fn shrink(&self, n: usize) {
        WorkerPool::shrink(self, n);
    }
}

fn worker_loop(
    rx: Receiver<Work>,
    gateway: Arc<dyn Gateway>,
    manager: Arc<ConnectionManager>,
    server_stats: Arc<ServerStats>,
    stats: Arc<WorkerStats>,
    idle: Arc<AtomicUsize>,
) {
    loop {
        idle.fetch_add(1, Ordering::SeqCst);
        let msg = rx.recv();
        idle.fetch_sub(1, Ordering::SeqCst);

        match msg {
            Ok(Work::Conn(mut conn)) => {
                let started = Instant::now();
                let read_before = conn.bytes_read();
                let written_before = conn.bytes_written();

                let keep =
                    conn.communicate(gateway.as_ref(), manager.can_add_keepalive_connection());

                if server_stats.is_enabled() {
                    stats.requests.fetch_add(1, Ordering::Relaxed);
                    stats
                        .bytes_read
                        .fetch_add(conn.bytes_read() - read_before, Ordering::Relaxed);
                    stats
                        .bytes_written
                        .fetch_add(conn.bytes_written() - written_before, Ordering::Relaxed);
                    stats
                        .work_time_micros
                        .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
                }

                if keep {
                    manager.put(conn);
                } else {
                    conn.close();
                }
            }
            // a sentinel, or the pool itself went away
            Ok(Work::Stop) | Err(_) => return,
        }
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::WorkerPool;
    use crate::errors::Result;
    use crate::gateway::Gateway;
    use crate::manager::ConnectionManager;
    use crate::request::Request;
    use crate::resizer::PoolMetrics;
    use crate::server::{ServerConfig, ServerStats};

    struct NoopGateway;

    impl Gateway for NoopGateway {
        fn respond(&self, req: &mut Request<'_>) -> Result<()> {
            req.set_status(b"204 No Content")?;
            req.send_headers()
        }
    }

    fn pool(config: ServerConfig) -> WorkerPool {
        let config = Arc::new(config);
        let stats = Arc::new(ServerStats::default());
        let manager =
            Arc::new(ConnectionManager::new(config.clone(), stats.clone(), None).unwrap());
        WorkerPool::new(config, stats, Arc::new(NoopGateway), manager)
    }

    fn await_idle(pool: &WorkerPool, expected: usize) {
        for _ in 0..200 {
            if pool.idle_count() == expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!(
            "pool never settled at {expected} idle workers (size={}, idle={})",
            pool.size(),
            pool.idle_count()
        );
    }

    #[test]
    fn start_spawns_min_threads() {
        let mut config = ServerConfig::default();
        config.min_threads = 3;
        let p = pool(config);
        p.start();
        await_idle(&p, 3);
        assert_eq!(3, p.size());
        p.stop(Duration::from_secs(2));
        assert_eq!(0, p.size());
    }

    #[test]
    fn grow_respects_max_threads() {
        let mut config = ServerConfig::default();
        config.min_threads = 1;
        config.max_threads = 2;
        let p = pool(config);
        p.start();
        p.grow(10);
        await_idle(&p, 2);
        assert_eq!(2, p.size());
        p.stop(Duration::from_secs(2));
    }

    #[test]
    fn shrink_retires_idle_workers() {
        let mut config = ServerConfig::default();
        config.min_threads = 4;
        let p = pool(config);
        p.start();
        await_idle(&p, 4);
        p.shrink(2);
        for _ in 0..200 {
            if p.size() == 2 {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(2, p.size());
        p.stop(Duration::from_secs(2));
    }

    #[test]
    fn stop_is_idempotent() {
        let mut config = ServerConfig::default();
        config.min_threads = 2;
        let p = pool(config);
        p.start();
        p.stop(Duration::from_secs(2));
        p.stop(Duration::from_secs(2));
        assert_eq!(0, p.size());
    }

    #[test]
    fn pool_metrics_reflect_configuration() {
        let mut config = ServerConfig::default();
        config.min_threads = 2;
        config.max_threads = 8;
        let p = pool(config);
        assert_eq!(2, PoolMetrics::min(&p));
        assert_eq!(8, PoolMetrics::max(&p));
        assert_eq!(0, PoolMetrics::qsize(&p));
    }
}
