//! Concurrent process runner with graceful shutdown.
//!
//! Spawns long-running processes, cancels them all when any one fails or a
//! SIGTERM/SIGINT arrives, then runs cleanup closers under a timeout.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A long-running process. Receives a cancellation token and is expected
/// to return promptly once it fires.
pub type AppProcess = Box<
    dyn FnOnce(CancellationToken) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send,
>;

/// A cleanup function, executed after all processes have stopped.
pub type Closer = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>> + Send>;

pub struct Runner {
    app_processes: Vec<AppProcess>,
    closers: Vec<Closer>,
    closer_timeout: Duration,
    cancellation_token: CancellationToken,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            app_processes: Vec::new(),
            closers: Vec::new(),
            closer_timeout: Duration::from_secs(10),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Adds a process. Processes run concurrently; the first error cancels
    /// the rest.
    pub fn with_app_process<F, Fut>(mut self, process: F) -> Self
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.app_processes.push(Box::new(|token| Box::pin(process(token))));
        self
    }

    /// Adds an already-boxed process, as produced by the worker assembly
    /// types.
    pub fn with_boxed_processes(mut self, processes: Vec<AppProcess>) -> Self {
        self.app_processes.extend(processes);
        self
    }

    /// Adds a cleanup function. Closers run after every process has
    /// stopped, regardless of outcome.
    pub fn with_closer<F, Fut>(mut self, closer: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.closers.push(Box::new(|| Box::pin(closer())));
        self
    }

    pub fn with_closer_timeout(mut self, timeout: Duration) -> Self {
        self.closer_timeout = timeout;
        self
    }

    /// Uses an externally controlled cancellation token.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancellation_token = token;
        self
    }

    /// Runs everything to completion, then exits the process with code 0
    /// on clean shutdown or 1 when any process failed.
    pub async fn run(self) {
        let token = Arc::new(self.cancellation_token);
        let mut join_set = JoinSet::new();
        let closer_timeout = self.closer_timeout;
        let closers = self.closers;

        for process in self.app_processes {
            let process_token = token.clone();
            join_set.spawn(async move { process((*process_token).clone()).await });
        }

        let signal_token = token.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("Received shutdown signal");
                    signal_token.cancel();
                }
                Err(err) => {
                    tracing::error!("Error setting up signal handler: {}", err);
                }
            }
        });

        #[cfg(unix)]
        {
            let sigterm_token = token.clone();
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM signal");
                        sigterm_token.cancel();
                    }
                    Err(err) => {
                        tracing::error!("Error setting up SIGTERM handler: {}", err);
                    }
                }
            });
        }

        let mut first_error = None;
        while let Some(result) = join_set.join_next().await {
            match result {
                Ok(Ok(())) => {
                    tracing::debug!("App process completed");
                }
                Ok(Err(err)) => {
                    if !token.is_cancelled() {
                        tracing::error!("App process error: {:#}", err);
                        first_error = Some(err);
                        token.cancel();
                    }
                }
                Err(err) => {
                    tracing::error!("App process panicked: {}", err);
                    if !token.is_cancelled() {
                        token.cancel();
                    }
                }
            }

            if token.is_cancelled() {
                break;
            }
        }

        join_set.shutdown().await;

        if !closers.is_empty() {
            tracing::info!("Running closers with timeout of {:?}", closer_timeout);
            let closer_result =
                tokio::time::timeout(closer_timeout, Self::run_closers(closers)).await;
            match closer_result {
                Ok(()) => tracing::info!("All closers completed"),
                Err(_) => tracing::error!("Closers timed out after {:?}", closer_timeout),
            }
        }

        if let Some(err) = first_error {
            tracing::error!("Application exiting with error: {:#}", err);
            std::process::exit(1);
        }
        std::process::exit(0);
    }

    async fn run_closers(closers: Vec<Closer>) {
        for closer in closers {
            if let Err(err) = closer().await {
                tracing::error!("Closer error: {:#}", err);
            }
        }
    }
}
