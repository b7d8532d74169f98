//! Start and stop of a built server.
//!
//! [`Lifecycle::start`] binds the listener, moves the state to `Serving` and
//! runs the serve future on a background task; it returns as soon as the
//! listener is bound. [`Lifecycle::stop`] signals shutdown and, on a network
//! listener, waits for in-flight calls to drain up to the given deadline. On
//! an in-memory listener there is nothing to drain: the task is aborted and
//! `stop` returns at once.

use crate::server::listener::{InMemoryAcceptor, ListenerMode};
use ferrule_core::state::ServerState;
use ferrule_core::{Error, Result};
use parking_lot::Mutex;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// Listener handed to the serve closure once bound.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(TcpListener),
    InMemory(InMemoryAcceptor),
}

pub struct Lifecycle {
    name: &'static str,
    mode: ListenerMode,
    state: watch::Sender<ServerState>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Lifecycle {
    /// `name` only labels log records.
    pub fn new(name: &'static str, mode: ListenerMode) -> Self {
        let (state, _) = watch::channel(ServerState::NotStarted);
        Self {
            name,
            mode,
            state,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    pub fn mode(&self) -> &ListenerMode {
        &self.mode
    }

    /// Bound socket address, once a network listener is serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Binds the listener and spawns `serve` on it.
    ///
    /// `serve` receives the bound listener and a future resolving when
    /// shutdown is requested. A bind failure is logged and returned, and the
    /// server stays `NotStarted`.
    pub async fn start<F, Fut>(&self, serve: F) -> Result<()>
    where
        F: FnOnce(BoundListener, WaitForCancellationFutureOwned) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let current = self.state();
        if !current.can_transition_to(ServerState::Serving) {
            return Err(Error::InvalidTransition {
                from: current,
                to: ServerState::Serving,
            });
        }

        let bound = match &self.mode {
            ListenerMode::Network { addr } => {
                let listener = TcpListener::bind(addr).await.map_err(|source| {
                    tracing::error!(server = self.name, %addr, error = %source, "failed to listen");
                    Error::Bind {
                        addr: addr.to_string(),
                        source,
                    }
                })?;
                let local = listener.local_addr().map_err(|source| Error::Bind {
                    addr: addr.to_string(),
                    source,
                })?;
                *self.local_addr.lock() = Some(local);
                tracing::info!(server = self.name, addr = %local, "listening");
                BoundListener::Tcp(listener)
            }
            ListenerMode::InMemory(listener) => {
                let acceptor = listener.acceptor()?;
                tracing::info!(
                    server = self.name,
                    buffer_size = listener.buffer_size(),
                    "listening in memory"
                );
                BoundListener::InMemory(acceptor)
            }
        };

        let mut from = current;
        let serving = self.state.send_if_modified(|state| {
            from = *state;
            let allowed = state.can_transition_to(ServerState::Serving);
            if allowed {
                *state = ServerState::Serving;
            }
            allowed
        });
        if !serving {
            return Err(Error::InvalidTransition {
                from,
                to: ServerState::Serving,
            });
        }

        let name = self.name;
        let fut = serve(bound, self.shutdown.clone().cancelled_owned());
        let handle = tokio::spawn(async move {
            let result = fut.await;
            if let Err(err) = &result {
                tracing::error!(server = name, error = %err, "failed to serve");
            }
            result
        });
        *self.task.lock() = Some(handle);
        Ok(())
    }

    /// Stops the server, waiting at most `deadline` for in-flight calls.
    ///
    /// Stopping a server that never started moves it straight to
    /// `Stopped`. A stop issued while another one drains waits, within its
    /// own deadline, for that drain to finish; once stopped it is a no-op.
    pub async fn stop(&self, deadline: Duration) -> Result<()> {
        let mut previous = ServerState::Stopped;
        self.state.send_if_modified(|state| {
            previous = *state;
            let next = match *state {
                ServerState::NotStarted => ServerState::Stopped,
                ServerState::Serving => ServerState::Stopping,
                _ => return false,
            };
            *state = next;
            true
        });
        self.shutdown.cancel();

        match previous {
            ServerState::Serving => {}
            ServerState::Stopping => return self.wait_stopped(deadline).await,
            _ => return Ok(()),
        }

        let handle = self.task.lock().take();
        let result = match handle {
            None => Ok(()),
            Some(handle) if self.mode.is_in_memory() => {
                handle.abort();
                Ok(())
            }
            Some(mut handle) => {
                tracing::info!(server = self.name, ?deadline, "draining in-flight calls");
                match tokio::time::timeout(deadline, &mut handle).await {
                    Ok(Ok(served)) => served,
                    Ok(Err(join)) => Err(Error::Serve(join.to_string())),
                    Err(_) => {
                        handle.abort();
                        tracing::warn!(server = self.name, ?deadline, "drain deadline elapsed");
                        Err(Error::DrainTimeout(deadline))
                    }
                }
            }
        };

        self.state.send_replace(ServerState::Stopped);
        tracing::info!(server = self.name, "stopped");
        result
    }

    async fn wait_stopped(&self, deadline: Duration) -> Result<()> {
        let mut states = self.state.subscribe();
        let stopped = states.wait_for(|state| *state == ServerState::Stopped);
        match tokio::time::timeout(deadline, stopped).await {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::DrainTimeout(deadline)),
        }
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("name", &self.name)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.task.get_mut().take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::listener::InMemoryListener;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::time::Instant;

    fn ephemeral() -> ListenerMode {
        ListenerMode::Network {
            addr: "127.0.0.1:0".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn in_memory_stop_skips_the_drain() {
        let lifecycle = Lifecycle::new("test", ListenerMode::InMemory(InMemoryListener::new(0)));
        lifecycle
            .start(|bound, _shutdown| async move {
                assert!(matches!(bound, BoundListener::InMemory(_)));
                std::future::pending::<()>().await;
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(lifecycle.state(), ServerState::Serving);
        assert!(lifecycle.local_addr().is_none());

        let started = Instant::now();
        lifecycle.stop(Duration::from_secs(30)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn network_stop_waits_for_the_drain() {
        let lifecycle = Lifecycle::new("test", ephemeral());
        let drained = Arc::new(AtomicBool::new(false));
        let flag = drained.clone();
        lifecycle
            .start(move |_bound, shutdown| async move {
                shutdown.await;
                tokio::time::sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert!(lifecycle.local_addr().is_some_and(|a| a.port() != 0));

        let mut states = lifecycle.subscribe();
        lifecycle.stop(Duration::from_secs(5)).await.unwrap();
        assert!(drained.load(Ordering::SeqCst));
        assert_eq!(*states.borrow_and_update(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn stop_never_outlives_the_deadline() {
        let lifecycle = Lifecycle::new("test", ephemeral());
        lifecycle
            .start(|_bound, _shutdown| async move {
                std::future::pending::<()>().await;
                Ok(())
            })
            .await
            .unwrap();

        let err = lifecycle.stop(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::DrainTimeout(_)));
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    async fn start_slow_drain(lifecycle: &Lifecycle, drain: Duration) {
        lifecycle
            .start(move |_bound, shutdown| async move {
                shutdown.await;
                tokio::time::sleep(drain).await;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn concurrent_stop_waits_for_the_running_drain() {
        let lifecycle = Arc::new(Lifecycle::new("test", ephemeral()));
        start_slow_drain(&lifecycle, Duration::from_millis(200)).await;

        let first = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.stop(Duration::from_secs(5)).await })
        };
        lifecycle
            .subscribe()
            .wait_for(|state| *state == ServerState::Stopping)
            .await
            .unwrap();

        let started = Instant::now();
        lifecycle.stop(Duration::from_secs(5)).await.unwrap();
        assert_eq!(lifecycle.state(), ServerState::Stopped);
        assert!(started.elapsed() >= Duration::from_millis(100));
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn concurrent_stop_keeps_its_own_deadline() {
        let lifecycle = Arc::new(Lifecycle::new("test", ephemeral()));
        start_slow_drain(&lifecycle, Duration::from_millis(500)).await;

        let first = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { lifecycle.stop(Duration::from_secs(5)).await })
        };
        lifecycle
            .subscribe()
            .wait_for(|state| *state == ServerState::Stopping)
            .await
            .unwrap();

        let err = lifecycle.stop(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, Error::DrainTimeout(_)));
        assert_eq!(lifecycle.state(), ServerState::Stopping);

        first.await.unwrap().unwrap();
        assert_eq!(lifecycle.state(), ServerState::Stopped);
    }

    #[tokio::test]
    async fn restart_after_stop_is_rejected() {
        let lifecycle = Lifecycle::new("test", ephemeral());
        lifecycle
            .start(|_bound, shutdown| async move {
                shutdown.await;
                Ok(())
            })
            .await
            .unwrap();
        lifecycle.stop(Duration::from_secs(5)).await.unwrap();

        let err = lifecycle
            .start(|_bound, _shutdown| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: ServerState::Stopped,
                to: ServerState::Serving
            }
        ));
    }

    #[tokio::test]
    async fn stop_before_start_is_terminal() {
        let lifecycle = Lifecycle::new("test", ephemeral());
        lifecycle.stop(Duration::from_secs(1)).await.unwrap();
        assert_eq!(lifecycle.state(), ServerState::Stopped);
        assert!(lifecycle
            .start(|_bound, _shutdown| async move { Ok(()) })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn bind_failure_leaves_the_server_not_started() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = taken.local_addr().unwrap();
        let lifecycle = Lifecycle::new("test", ListenerMode::Network { addr });

        let err = lifecycle
            .start(|_bound, _shutdown| async move { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(lifecycle.state(), ServerState::NotStarted);
    }
}
