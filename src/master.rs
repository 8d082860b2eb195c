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

//! The master control plane: listener, accept loop, signal handling and
//! graceful shutdown for one pool.
//!
//! Every accepted connection runs on its own task. Within a connection
//! requests are strictly serialized: the next read starts only after the
//! previous END_REQUEST came back from the pool.

use crate::{
    cgi::ResponseHeaders,
    config::{GlobalConfig, PoolConfig},
    conn::FcgiConnection,
    engine::EngineFactory,
    error::{ServerError, ServerResult},
    handler::RequestHandler,
    net::{Listener, Stream},
    pool::{Dispatched, WorkerPool},
    status::StatusSnapshot,
};
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

pub struct Master {
    global: GlobalConfig,
    pool: Arc<WorkerPool>,
    stop: CancellationToken,
    tracker: TaskTracker,
    shutdown_started: AtomicBool,
    bound: std::sync::Mutex<Option<String>>,
}

impl Master {
    /// Builds the master and its pool. Nothing listens until
    /// [`start`](Self::start).
    pub fn new(
        global: GlobalConfig, pool_config: PoolConfig, engine_factory: EngineFactory,
    ) -> Arc<Self> {
        Self::with_handler(global, pool_config, engine_factory, RequestHandler::new())
    }

    /// Same as [`new`](Self::new) with a pre-configured handler (e.g.
    /// carrying registered process-wide variables).
    pub fn with_handler(
        global: GlobalConfig, pool_config: PoolConfig, engine_factory: EngineFactory,
        handler: RequestHandler,
    ) -> Arc<Self> {
        let pool = WorkerPool::new(pool_config, engine_factory, Arc::new(handler));
        Arc::new(Self {
            global,
            pool,
            stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shutdown_started: AtomicBool::new(false),
            bound: std::sync::Mutex::new(None),
        })
    }

    /// The bound listen address, available after [`start`](Self::start).
    pub fn local_addr(&self) -> Option<String> {
        self.bound.lock().unwrap().clone()
    }

    /// The pool owned by this master.
    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Captures the pool statistics for the status endpoint.
    pub fn status(&self) -> StatusSnapshot {
        StatusSnapshot::capture(&self.pool)
    }

    /// Binds the listener, writes the PID file, starts the pool and
    /// spawns the accept and signal loops.
    pub async fn start(self: &Arc<Self>) -> ServerResult<()> {
        let listener = Listener::bind(&self.pool.config().listen).await?;
        let bound = listener.local_desc();
        info!(pool = %self.pool.config().name, listen = %bound, "Listening.");
        *self.bound.lock().unwrap() = Some(bound);

        if let Some(path) = &self.global.pid {
            std::fs::write(path, std::process::id().to_string()).map_err(|source| {
                ServerError::PidWriteFail {
                    path: path.clone(),
                    source,
                }
            })?;
        }

        self.pool.start();

        let master = Arc::clone(self);
        self.tracker.spawn(master.signal_loop());
        let master = Arc::clone(self);
        self.tracker.spawn(master.accept_loop(listener));
        self.tracker.close();
        Ok(())
    }

    /// Blocks until every task has torn down after shutdown.
    pub async fn wait(&self) {
        self.tracker.wait().await;
    }

    /// Starts the master and waits for its full teardown.
    pub async fn run(self: &Arc<Self>) -> ServerResult<()> {
        self.start().await?;
        self.wait().await;
        Ok(())
    }

    /// Graceful shutdown, effective once: raises the stop signal (which
    /// unblocks accept), stops the pool, removes the PID file.
    pub async fn shutdown(&self) {
        if self.shutdown_started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(pool = %self.pool.config().name, "Shutting down.");
        self.stop.cancel();
        self.pool.stop().await;
        if let Some(path) = &self.global.pid {
            let _ = std::fs::remove_file(path);
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: Listener) {
        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "Accepted connection.");
                        let master = Arc::clone(&self);
                        self.tracker.spawn(master.handle_connection(stream));
                    }
                    Err(err) => {
                        if self.stop.is_cancelled() {
                            break;
                        }
                        warn!(%err, "Accept failed.");
                    }
                },
            }
        }
        debug!(pool = %self.pool.config().name, "Accept loop exited.");
    }

    async fn handle_connection(self: Arc<Self>, stream: Stream) {
        let mut conn = FcgiConnection::new(stream);
        conn.set_max_conns(self.pool.config().max_children);

        loop {
            let request = tokio::select! {
                _ = self.stop.cancelled() => break,
                request = conn.read_request() => match request {
                    Ok(Some(request)) => request,
                    Ok(None) => break,
                    Err(ServerError::RequestAborted { id }) => {
                        debug!(id, "Request aborted by peer.");
                        continue;
                    }
                    Err(err) => {
                        debug!(%err, "Closing connection.");
                        break;
                    }
                },
            };

            let id = request.id;
            let keep_conn = request.keep_conn();

            conn = match self.pool.handle_request(conn, request).await {
                Dispatched::Completed(conn) => conn,
                Dispatched::Rejected(mut conn) => {
                    let mut headers = ResponseHeaders::default();
                    headers.set_status(500);
                    let stderr = format!(
                        "no available workers in pool `{}`\n",
                        self.pool.config().name
                    );
                    if conn
                        .send_response(id, &headers.format(), stderr.as_bytes(), 1)
                        .await
                        .is_err()
                    {
                        return;
                    }
                    conn
                }
                Dispatched::Lost => return,
            };

            if !keep_conn {
                break;
            }
        }
    }

    async fn signal_loop(self: Arc<Self>) {
        use tokio::signal::unix::{SignalKind, signal};

        let signals = (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
            signal(SignalKind::quit()),
            signal(SignalKind::user_defined1()),
            signal(SignalKind::user_defined2()),
        );
        let (Ok(mut term), Ok(mut int), Ok(mut quit), Ok(mut usr1), Ok(mut usr2)) = signals
        else {
            warn!("Signal registration failed; running without signal handling.");
            return;
        };

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = term.recv() => {
                    info!("Received SIGTERM.");
                    self.shutdown().await;
                    break;
                }
                _ = int.recv() => {
                    info!("Received SIGINT.");
                    self.shutdown().await;
                    break;
                }
                _ = quit.recv() => {
                    info!("Received SIGQUIT.");
                    self.shutdown().await;
                    break;
                }
                _ = usr1.recv() => info!("Received SIGUSR1; log reopen is a no-op."),
                _ = usr2.recv() => info!("Received SIGUSR2; config reload is a no-op."),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::ProcessManager, engine::EchoEngine, net::ListenAddr};
    use std::time::Duration;

    fn test_config(listen: ListenAddr) -> PoolConfig {
        let mut pool = PoolConfig::named("test");
        pool.listen = listen;
        pool.pm = ProcessManager::Static;
        pool.max_children = 1;
        pool
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_wait_completes() {
        let master = Master::new(
            GlobalConfig::default(),
            test_config(ListenAddr::Tcp("127.0.0.1:0".to_owned())),
            EchoEngine::factory(),
        );
        master.start().await.unwrap();

        master.shutdown().await;
        master.shutdown().await;
        tokio::time::timeout(Duration::from_secs(5), master.wait())
            .await
            .expect("teardown did not complete");
    }

    #[tokio::test]
    async fn pid_file_written_and_removed() {
        let pid_path =
            std::env::temp_dir().join(format!("fpm-master-test-{}.pid", std::process::id()));
        let global = GlobalConfig {
            pid: Some(pid_path.clone()),
            ..GlobalConfig::default()
        };
        let master = Master::new(
            global,
            test_config(ListenAddr::Tcp("127.0.0.1:0".to_owned())),
            EchoEngine::factory(),
        );
        master.start().await.unwrap();
        let written = std::fs::read_to_string(&pid_path).unwrap();
        assert_eq!(written, std::process::id().to_string());

        master.shutdown().await;
        master.wait().await;
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let master = Master::new(
            GlobalConfig::default(),
            test_config(ListenAddr::Tcp("256.0.0.1:0".to_owned())),
            EchoEngine::factory(),
        );
        match master.start().await {
            Err(ServerError::BindFail { .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }
}
