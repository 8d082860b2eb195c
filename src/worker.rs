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

//! A worker: one long-lived execution slot owning one engine instance.
//!
//! The run loop blocks on (stop | mailbox). The mailbox holds at most
//! one pending (connection, request) pair; submitting reserves the slot
//! by flipping the worker Idle -> Busy, so two dispatchers can never
//! queue onto the same worker.

use crate::{
    conn::FcgiConnection,
    engine::ScriptEngine,
    handler::RequestHandler,
    net::Stream,
    request::FcgiRequest,
};
use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio::sync::{
    mpsc::{self, error::TrySendError},
    oneshot,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The connection type flowing through worker mailboxes.
pub type Conn = FcgiConnection<Stream>;

/// One dispatched request: the connection it arrived on and the channel
/// the connection is handed back through once END_REQUEST is written.
pub struct Job {
    /// The connection, owned by the worker while serving
    pub conn: Conn,
    /// The assembled request
    pub request: FcgiRequest,
    /// Returns the connection to the accept-side task
    pub done: oneshot::Sender<Conn>,
}

const STATE_IDLE: u8 = 0;
const STATE_BUSY: u8 = 1;
const STATE_STOPPING: u8 = 2;

/// Worker lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Ready to take a request
    Idle,
    /// Serving a request
    Busy,
    /// Stop requested or max-requests reached
    Stopping,
}

/// Per-worker slice of the pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Recycle after this many requests; 0 = unlimited
    pub max_requests: u64,
    /// Per-request deadline; zero = unlimited
    pub request_terminate_timeout: Duration,
}

/// Counters the worker feeds back into the pool stats.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    /// Requests that hit the terminate deadline
    pub slow_requests: AtomicU64,
}

pub struct Worker {
    id: u64,
    config: WorkerConfig,
    state: AtomicU8,
    requests_served: AtomicU64,
    last_used: Mutex<Instant>,
    mailbox: mpsc::Sender<Job>,
    stop: CancellationToken,
    handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
    counters: Arc<WorkerCounters>,
}

impl Worker {
    /// Creates the worker and starts its run loop.
    pub fn spawn(
        id: u64, config: WorkerConfig, engine: Box<dyn ScriptEngine>,
        handler: Arc<RequestHandler>, counters: Arc<WorkerCounters>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        let worker = Arc::new(Self {
            id,
            config,
            state: AtomicU8::new(STATE_IDLE),
            requests_served: AtomicU64::new(0),
            last_used: Mutex::new(Instant::now()),
            mailbox: tx,
            stop: CancellationToken::new(),
            handle: Mutex::new(None),
            counters,
        });

        let handle = tokio::spawn(Worker::run(Arc::clone(&worker), rx, engine, handler));
        *worker.handle.lock().unwrap() = Some(handle);
        worker
    }

    /// The worker's monotonic id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// The current lifecycle state.
    pub fn state(&self) -> WorkerState {
        match self.state.load(Ordering::SeqCst) {
            STATE_IDLE => WorkerState::Idle,
            STATE_BUSY => WorkerState::Busy,
            _ => WorkerState::Stopping,
        }
    }

    /// Requests served so far.
    pub fn requests_served(&self) -> u64 {
        self.requests_served.load(Ordering::SeqCst)
    }

    /// Zero unless idle; otherwise the time since the last request
    /// completed (or since spawn).
    pub fn idle_time(&self) -> Duration {
        if self.state() != WorkerState::Idle {
            return Duration::ZERO;
        }
        self.last_used.lock().unwrap().elapsed()
    }

    /// Non-blocking submit. Succeeds only when the worker is idle; the
    /// job is handed back otherwise.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        if self
            .state
            .compare_exchange(STATE_IDLE, STATE_BUSY, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(job);
        }
        match self.mailbox.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(job)) => {
                // Run loop is gone; the maintenance tick will reap us.
                self.state.store(STATE_STOPPING, Ordering::SeqCst);
                Err(job)
            }
            Err(TrySendError::Full(job)) => {
                let _ = self.state.compare_exchange(
                    STATE_BUSY,
                    STATE_IDLE,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                Err(job)
            }
        }
    }

    /// Signals the run loop to exit on its next wake.
    pub fn stop(&self) {
        self.state.store(STATE_STOPPING, Ordering::SeqCst);
        self.stop.cancel();
    }

    /// Waits for the run loop to exit, bounded by `timeout`; on timeout
    /// the handle is abandoned and the in-flight request left to finish.
    pub async fn join(&self, timeout: Duration) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!(worker = self.id, "Worker did not stop in time, abandoning.");
            }
        }
    }

    async fn run(
        self: Arc<Self>, mut mailbox: mpsc::Receiver<Job>, mut engine: Box<dyn ScriptEngine>,
        handler: Arc<RequestHandler>,
    ) {
        debug!(worker = self.id, "Worker started.");
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                job = mailbox.recv() => match job {
                    Some(job) => self.serve(job, engine.as_mut(), &handler).await,
                    None => break,
                },
            }
        }
        debug!(worker = self.id, "Worker stopped.");
    }

    async fn serve(&self, job: Job, engine: &mut dyn ScriptEngine, handler: &RequestHandler) {
        *self.last_used.lock().unwrap() = Instant::now();

        let cancel = CancellationToken::new();
        let deadline = self.config.request_terminate_timeout;
        let guard = (!deadline.is_zero()).then(|| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                cancel.cancel();
            })
        });

        let Job {
            mut conn,
            request,
            done,
        } = job;
        let outcome = handler
            .handle(&mut conn, &request, engine, cancel.clone())
            .await;

        if let Some(guard) = guard {
            guard.abort();
        }
        if cancel.is_cancelled() {
            self.counters.slow_requests.fetch_add(1, Ordering::Relaxed);
            warn!(
                worker = self.id,
                id = request.id,
                "Request hit the terminate deadline."
            );
        }

        let served = self.requests_served.fetch_add(1, Ordering::SeqCst) + 1;
        let mut stopping = false;
        match outcome {
            Ok(handled) if handled.engine_panicked => stopping = true,
            Ok(_) => {}
            Err(err) => debug!(worker = self.id, %err, "Response write failed."),
        }
        if self.config.max_requests > 0 && served >= self.config.max_requests {
            debug!(worker = self.id, served, "Max requests reached, recycling.");
            stopping = true;
        }

        *self.last_used.lock().unwrap() = Instant::now();
        if stopping {
            self.stop();
        } else {
            // Do not resurrect a worker the pool marked Stopping mid-serve.
            let _ = self.state.compare_exchange(
                STATE_BUSY,
                STATE_IDLE,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        let _ = done.send(conn);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EchoEngine;
    use crate::meta::{Header, RecordType, Role};
    use tokio::io::AsyncWriteExt;
    use tokio::net::{TcpListener, TcpStream};

    async fn tcp_pair() -> (TcpStream, Stream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) =
            tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), Stream::Tcp(accepted.unwrap().0))
    }

    fn script(content: &[u8], tag: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("fpm-worker-{}-{tag}", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    fn request_for(path: &std::path::Path) -> FcgiRequest {
        FcgiRequest {
            id: 1,
            role: Some(Role::Responder),
            flags: 0,
            params: [("SCRIPT_FILENAME".to_owned(), path.display().to_string())]
                .into_iter()
                .collect(),
            stdin: bytes::Bytes::new(),
        }
    }

    fn test_worker(max_requests: u64) -> Arc<Worker> {
        Worker::spawn(
            1,
            WorkerConfig {
                max_requests,
                request_terminate_timeout: Duration::ZERO,
            },
            Box::new(EchoEngine),
            Arc::new(RequestHandler::new()),
            Arc::new(WorkerCounters::default()),
        )
    }

    #[tokio::test]
    async fn serves_and_returns_to_idle() {
        let path = script(b"hello", "idle");
        let worker = test_worker(0);
        let (mut client, server) = tcp_pair().await;

        let (tx, rx) = oneshot::channel();
        worker
            .submit(Job {
                conn: FcgiConnection::new(server),
                request: request_for(&path),
                done: tx,
            })
            .unwrap_or_else(|_| panic!("submit refused"));

        let _conn = rx.await.unwrap();
        assert_eq!(worker.state(), WorkerState::Idle);
        assert_eq!(worker.requests_served(), 1);

        // The response is on the wire.
        let header = Header::new_from_stream(&mut client).await.unwrap();
        assert_eq!(header.r#type, RecordType::Stdout);

        client.shutdown().await.unwrap();
        std::fs::remove_file(path).unwrap();
        worker.stop();
        worker.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn busy_worker_refuses_submit() {
        let worker = test_worker(0);
        // Reserve the slot by hand, as a racing dispatcher would.
        assert_eq!(
            worker
                .state
                .compare_exchange(STATE_IDLE, STATE_BUSY, Ordering::SeqCst, Ordering::SeqCst),
            Ok(STATE_IDLE)
        );

        let (_client, server) = tcp_pair().await;
        let (tx, _rx) = oneshot::channel();
        let refused = worker.submit(Job {
            conn: FcgiConnection::new(server),
            request: request_for(std::path::Path::new("/tmp/x")),
            done: tx,
        });
        assert!(refused.is_err());

        worker.stop();
        worker.join(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn max_requests_stops_worker() {
        let path = script(b"bye", "recycle");
        let worker = test_worker(1);
        let (_client, server) = tcp_pair().await;

        let (tx, rx) = oneshot::channel();
        worker
            .submit(Job {
                conn: FcgiConnection::new(server),
                request: request_for(&path),
                done: tx,
            })
            .unwrap_or_else(|_| panic!("submit refused"));
        let _conn = rx.await.unwrap();

        assert_eq!(worker.state(), WorkerState::Stopping);
        worker.join(Duration::from_secs(1)).await;

        // A stopping worker refuses further work.
        let (_client2, server2) = tcp_pair().await;
        let (tx, _rx) = oneshot::channel();
        assert!(
            worker
                .submit(Job {
                    conn: FcgiConnection::new(server2),
                    request: request_for(&path),
                    done: tx,
                })
                .is_err()
        );
        std::fs::remove_file(path).unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn deadline_counts_slow_request() {
        struct SleepyEngine;
        impl ScriptEngine for SleepyEngine {
            fn compile(
                &mut self, _path: &std::path::Path, source: &[u8],
            ) -> Result<crate::engine::CompiledScript, Vec<String>> {
                Ok(crate::engine::CompiledScript::new(source.to_vec()))
            }
            fn execute(
                &mut self, _script: &crate::engine::CompiledScript,
                ctx: &mut crate::engine::ExecContext,
            ) -> Result<(), String> {
                // A cooperative engine polls for cancellation; this one
                // spins on the clock to simulate a slow script.
                let begin = Instant::now();
                while begin.elapsed() < Duration::from_millis(80) {
                    if ctx.is_cancelled() {
                        return Err("terminated".to_owned());
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
        }

        let path = script(b"slow", "slow");
        let counters = Arc::new(WorkerCounters::default());
        let worker = Worker::spawn(
            9,
            WorkerConfig {
                max_requests: 0,
                request_terminate_timeout: Duration::from_millis(20),
            },
            Box::new(SleepyEngine),
            Arc::new(RequestHandler::new()),
            Arc::clone(&counters),
        );

        let (_client, server) = tcp_pair().await;
        let (tx, rx) = oneshot::channel();
        worker
            .submit(Job {
                conn: FcgiConnection::new(server),
                request: request_for(&path),
                done: tx,
            })
            .unwrap_or_else(|_| panic!("submit refused"));
        let _conn = rx.await.unwrap();

        assert_eq!(counters.slow_requests.load(Ordering::Relaxed), 1);
        std::fs::remove_file(path).unwrap();
        worker.stop();
        worker.join(Duration::from_secs(1)).await;
    }
}
