// Copyright 2022 jmjoy
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

//! The worker pool: spawns, scales, selects and retires workers under
//! one of three scheduling policies.
//!
//! Every policy runs the same 1-second maintenance tick. The tick first
//! reaps workers that stopped on their own (max-requests recycle, engine
//! panic), then applies the policy branch: static refills to
//! max-children, dynamic keeps the idle count within the spare bounds,
//! on-demand retires workers idle past the configured timeout.

use crate::{
    config::{PoolConfig, ProcessManager},
    engine::EngineFactory,
    handler::RequestHandler,
    request::FcgiRequest,
    worker::{Conn, Job, Worker, WorkerConfig, WorkerCounters, WorkerState},
};
use chrono::{DateTime, Utc};
use std::{
    sync::{
        Arc, Mutex, RwLock,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background tick of the scaler / reaper / maintenance loop.
pub const TICK: Duration = Duration::from_secs(1);
/// Bound on waiting for a retiring worker's loop to exit.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of dispatching one request to the pool.
pub enum Dispatched {
    /// The request completed; the connection is handed back
    Completed(Conn),
    /// No worker could take the request; the caller owns the 500
    Rejected(Conn),
    /// The serving worker went away together with the connection
    Lost,
}

/// Counters behind the status endpoint, updated under the stats lock.
#[derive(Debug)]
struct StatsInner {
    accepted_conn: u64,
    listen_queue: u64,
    max_listen_queue: u64,
    max_active_processes: u64,
    max_children_reached: u64,
    start_time: DateTime<Utc>,
}

/// A point-in-time copy of the pool counters.
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    /// Total accepted requests
    pub accepted_conn: u64,
    /// Requests accepted but not yet assigned to a worker
    pub listen_queue: u64,
    /// High-water mark of `listen_queue`
    pub max_listen_queue: u64,
    /// High-water mark of concurrently busy workers
    pub max_active_processes: u64,
    /// Times a request found the pool at its max-children limit
    pub max_children_reached: u64,
    /// Requests that hit the terminate deadline
    pub slow_requests: u64,
    /// Pool start time
    pub start_time: DateTime<Utc>,
    /// Workers currently idle
    pub idle_processes: u64,
    /// Workers currently busy
    pub active_processes: u64,
    /// Workers in the pool
    pub total_processes: u64,
}

pub struct WorkerPool {
    config: PoolConfig,
    handler: Arc<RequestHandler>,
    engine_factory: EngineFactory,
    workers: RwLock<Vec<Arc<Worker>>>,
    next_id: AtomicU64,
    stop: CancellationToken,
    maintenance: Mutex<Option<tokio::task::JoinHandle<()>>>,
    counters: Arc<WorkerCounters>,
    stats: Mutex<StatsInner>,
}

impl WorkerPool {
    /// Creates a pool; no workers exist until [`start`](Self::start).
    pub fn new(
        config: PoolConfig, engine_factory: EngineFactory, handler: Arc<RequestHandler>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            handler,
            engine_factory,
            workers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            stop: CancellationToken::new(),
            maintenance: Mutex::new(None),
            counters: Arc::new(WorkerCounters::default()),
            stats: Mutex::new(StatsInner {
                accepted_conn: 0,
                listen_queue: 0,
                max_listen_queue: 0,
                max_active_processes: 0,
                max_children_reached: 0,
                start_time: Utc::now(),
            }),
        })
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Spawns the initial worker set per policy and launches the
    /// background loop.
    pub fn start(self: &Arc<Self>) {
        self.stats.lock().unwrap().start_time = Utc::now();

        let initial = match self.config.pm {
            ProcessManager::Static => self.config.max_children,
            ProcessManager::Dynamic => self.config.start_servers,
            ProcessManager::OnDemand => 0,
        };
        for _ in 0..initial {
            self.spawn_worker();
        }
        info!(
            pool = %self.config.name,
            pm = %self.config.pm,
            workers = initial,
            "Pool started."
        );

        let pool = Arc::clone(self);
        let handle = tokio::spawn(pool.maintenance_loop());
        *self.maintenance.lock().unwrap() = Some(handle);
    }

    /// Dispatches one assembled request to an available worker.
    pub async fn handle_request(&self, conn: Conn, request: FcgiRequest) -> Dispatched {
        {
            let mut stats = self.stats.lock().unwrap();
            stats.accepted_conn += 1;
            stats.listen_queue += 1;
            stats.max_listen_queue = stats.max_listen_queue.max(stats.listen_queue);
        }
        let dispatched = self.dispatch(conn, request).await;
        self.stats.lock().unwrap().listen_queue -= 1;
        dispatched
    }

    async fn dispatch(&self, conn: Conn, request: FcgiRequest) -> Dispatched {
        let id = request.id;
        let (done, receipt) = oneshot::channel();
        let mut job = Job {
            conn,
            request,
            done,
        };

        // One retry covers the race where the selected worker went busy
        // between the scan and the submit.
        for _ in 0..2 {
            let worker = match self.select_worker() {
                Some(worker) => worker,
                None => break,
            };
            match worker.submit(job) {
                Ok(()) => {
                    self.note_active();
                    return match receipt.await {
                        Ok(conn) => Dispatched::Completed(conn),
                        Err(_) => {
                            warn!(pool = %self.config.name, id, "Worker lost mid-request.");
                            Dispatched::Lost
                        }
                    };
                }
                Err(returned) => job = returned,
            }
        }

        if self.total_processes() >= self.config.max_children as u64 {
            self.stats.lock().unwrap().max_children_reached += 1;
        }
        warn!(pool = %self.config.name, id, "No available workers.");
        Dispatched::Rejected(job.conn)
    }

    /// Scans for an idle worker; under on-demand, spawns one when the
    /// pool is below max-children.
    fn select_worker(&self) -> Option<Arc<Worker>> {
        let total = {
            let workers = self.workers.read().unwrap();
            if let Some(worker) = workers.iter().find(|w| w.state() == WorkerState::Idle) {
                return Some(Arc::clone(worker));
            }
            workers.len()
        };

        if self.config.pm == ProcessManager::OnDemand && total < self.config.max_children {
            return Some(self.spawn_worker());
        }
        None
    }

    fn spawn_worker(&self) -> Arc<Worker> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let worker = Worker::spawn(
            id,
            WorkerConfig {
                max_requests: self.config.max_requests,
                request_terminate_timeout: self.config.request_terminate_timeout,
            },
            (self.engine_factory)(),
            Arc::clone(&self.handler),
            Arc::clone(&self.counters),
        );
        self.workers.write().unwrap().push(Arc::clone(&worker));
        info!(pool = %self.config.name, worker = id, "Spawned worker.");
        worker
    }

    async fn retire_worker(&self, worker: Arc<Worker>) {
        worker.stop();
        worker.join(JOIN_TIMEOUT).await;
        self.workers
            .write()
            .unwrap()
            .retain(|w| w.id() != worker.id());
        info!(
            pool = %self.config.name,
            worker = worker.id(),
            served = worker.requests_served(),
            "Retired worker."
        );
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = tick.tick() => self.maintain().await,
            }
        }
        debug!(pool = %self.config.name, "Maintenance loop exited.");
    }

    async fn maintain(&self) {
        // Reap workers that stopped on their own.
        let stopped: Vec<Arc<Worker>> = {
            let workers = self.workers.read().unwrap();
            workers
                .iter()
                .filter(|w| w.state() == WorkerState::Stopping)
                .cloned()
                .collect()
        };
        for worker in stopped {
            self.retire_worker(worker).await;
        }

        match self.config.pm {
            ProcessManager::Static => self.refill_static(),
            ProcessManager::Dynamic => self.scale_dynamic().await,
            ProcessManager::OnDemand => self.reap_idle().await,
        }
    }

    /// Static policy: the worker count is pinned to max-children.
    fn refill_static(&self) {
        let total = self.workers.read().unwrap().len();
        for _ in total..self.config.max_children {
            self.spawn_worker();
        }
    }

    /// Dynamic policy: keep the idle count within the spare bounds,
    /// never exceeding max-children.
    async fn scale_dynamic(&self) {
        let (idle, total) = {
            let workers = self.workers.read().unwrap();
            let idle = workers
                .iter()
                .filter(|w| w.state() == WorkerState::Idle)
                .count();
            (idle, workers.len())
        };

        if idle < self.config.min_spare_servers && total < self.config.max_children {
            let want = self.config.min_spare_servers - idle;
            let room = self.config.max_children - total;
            for _ in 0..want.min(room) {
                self.spawn_worker();
            }
        } else if idle > self.config.max_spare_servers {
            let surplus = idle - self.config.max_spare_servers;
            for worker in self.idle_workers_by_id(surplus) {
                self.retire_worker(worker).await;
            }
        }
    }

    /// On-demand policy: retire workers idle past the configured
    /// timeout.
    async fn reap_idle(&self) {
        let timeout = self.config.process_idle_timeout;
        let expired: Vec<Arc<Worker>> = {
            let workers = self.workers.read().unwrap();
            workers
                .iter()
                .filter(|w| w.idle_time() > timeout)
                .cloned()
                .collect()
        };
        for worker in expired {
            self.retire_worker(worker).await;
        }
    }

    /// Lowest-id idle workers, used as the deterministic retire order.
    fn idle_workers_by_id(&self, count: usize) -> Vec<Arc<Worker>> {
        let workers = self.workers.read().unwrap();
        let mut idle: Vec<Arc<Worker>> = workers
            .iter()
            .filter(|w| w.state() == WorkerState::Idle)
            .cloned()
            .collect();
        idle.sort_by_key(|w| w.id());
        idle.truncate(count);
        idle
    }

    fn note_active(&self) {
        let active = self.active_processes();
        let mut stats = self.stats.lock().unwrap();
        stats.max_active_processes = stats.max_active_processes.max(active);
    }

    /// Workers currently in the pool.
    pub fn total_processes(&self) -> u64 {
        self.workers.read().unwrap().len() as u64
    }

    /// Workers currently idle.
    pub fn idle_processes(&self) -> u64 {
        self.workers
            .read()
            .unwrap()
            .iter()
            .filter(|w| w.state() == WorkerState::Idle)
            .count() as u64
    }

    /// Workers currently serving a request.
    pub fn active_processes(&self) -> u64 {
        self.workers
            .read()
            .unwrap()
            .iter()
            .filter(|w| w.state() == WorkerState::Busy)
            .count() as u64
    }

    /// Copies the counters and live worker counts.
    pub fn stats(&self) -> StatsSnapshot {
        let stats = self.stats.lock().unwrap();
        StatsSnapshot {
            accepted_conn: stats.accepted_conn,
            listen_queue: stats.listen_queue,
            max_listen_queue: stats.max_listen_queue,
            max_active_processes: stats.max_active_processes,
            max_children_reached: stats.max_children_reached,
            slow_requests: self.counters.slow_requests.load(Ordering::Relaxed),
            start_time: stats.start_time,
            idle_processes: self.idle_processes(),
            active_processes: self.active_processes(),
            total_processes: self.total_processes(),
        }
    }

    /// Stops the background loop and every worker, then clears the list.
    /// Does not wait for in-flight requests beyond each worker's join
    /// bound.
    pub async fn stop(&self) {
        self.stop.cancel();
        let handle = self.maintenance.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let workers: Vec<Arc<Worker>> = self.workers.write().unwrap().drain(..).collect();
        for worker in &workers {
            worker.stop();
        }
        for worker in &workers {
            worker.join(JOIN_TIMEOUT).await;
        }
        info!(pool = %self.config.name, "Pool stopped.");
    }
}
