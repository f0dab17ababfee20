//! A tokio runtime on its own named thread, serving one bound listener.
//!
//! The listener is bound synchronously so bind errors surface to the caller
//! and the local address is known before `spawn` returns. Stopping signals
//! the serve loop through a watch channel and joins the thread.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tickbridge_common::{BridgeError, Result};
use tokio::net::TcpListener;
use tokio::sync::watch;

const RUNTIME_WORKERS: usize = 2;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct ServerThread {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl ServerThread {
    pub(crate) fn spawn<F, Fut>(name: String, addr: SocketAddr, serve: F) -> Result<Self>
    where
        F: FnOnce(TcpListener, watch::Receiver<bool>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| BridgeError::Transport(format!("Failed to bind to {}: {}", addr, e)))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(RUNTIME_WORKERS)
            .thread_name(format!("{}-io", name))
            .enable_all()
            .build()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();

        let handle = std::thread::Builder::new().name(name).spawn(move || {
            runtime.block_on(async move {
                match TcpListener::from_std(listener) {
                    Ok(listener) => serve(listener, shutdown_rx).await,
                    Err(e) => tracing::error!(addr = %local_addr, "Failed to register listener: {}", e),
                }
            });
            runtime.shutdown_timeout(SHUTDOWN_GRACE);
            thread_running.store(false, Ordering::Release);
        })?;

        Ok(Self {
            local_addr,
            shutdown,
            handle: Mutex::new(Some(handle)),
            running,
        })
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Signals the serve loop and waits for the thread. Idempotent.
    pub(crate) fn stop(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!(addr = %self.local_addr, "Server thread panicked");
            }
            self.running.store(false, Ordering::Release);
        }
    }
}

impl Drop for ServerThread {
    fn drop(&mut self) {
        self.stop();
    }
}
