use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::TransportBackend;

enum Loops {
    Portable(Option<Runtime>),
    PerCore {
        handles: Vec<Handle>,
        stops: Vec<oneshot::Sender<()>>,
        next: AtomicUsize,
    },
    /// Spawn onto a runtime owned by someone else.
    Borrowed(Handle),
}

pub struct EventLoopGroup {
    loops: Loops,
    name: &'static str,
}

impl EventLoopGroup {
    pub fn new(backend: TransportBackend, threads: usize) -> io::Result<Self> {
        let threads = threads.max(1);
        let group = match resolve(backend) {
            TransportBackend::PerCore => Self::per_core(threads)?,
            _ => Self::portable(threads)?,
        };
        info!(
            "Using {} transport with {} event loop thread(s)",
            group.name, threads
        );
        Ok(group)
    }

    /// Use the runtime the caller is already running on.
    pub fn current() -> Self {
        Self {
            loops: Loops::Borrowed(Handle::current()),
            name: "current",
        }
    }

    fn portable(threads: usize) -> io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads)
            .thread_name("lodestone-io")
            .enable_all()
            .build()?;
        Ok(Self {
            loops: Loops::Portable(Some(runtime)),
            name: "portable",
        })
    }

    fn per_core(threads: usize) -> io::Result<Self> {
        let mut handles = Vec::with_capacity(threads);
        let mut stops = Vec::with_capacity(threads);
        for i in 0..threads {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            handles.push(runtime.handle().clone());
            let (stop_tx, stop_rx) = oneshot::channel::<()>();
            stops.push(stop_tx);
            thread::Builder::new()
                .name(format!("lodestone-io-{}", i))
                .spawn(move || {
                    let _ = runtime.block_on(stop_rx);
                    debug!("Event loop {} stopped", i);
                })?;
        }
        Ok(Self {
            loops: Loops::PerCore {
                handles,
                stops,
                next: AtomicUsize::new(0),
            },
            name: "per-core",
        })
    }

    pub fn backend_name(&self) -> &'static str {
        self.name
    }

    /// The handle the next connection should run on.
    pub fn next_handle(&self) -> Handle {
        match &self.loops {
            Loops::Portable(Some(runtime)) => runtime.handle().clone(),
            Loops::Portable(None) => Handle::current(),
            Loops::PerCore { handles, next, .. } => {
                let i = next.fetch_add(1, Ordering::Relaxed) % handles.len();
                handles[i].clone()
            }
            Loops::Borrowed(handle) => handle.clone(),
        }
    }

    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.next_handle().spawn(future)
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        match &mut self.loops {
            Loops::Portable(runtime) => {
                if let Some(runtime) = runtime.take() {
                    runtime.shutdown_background();
                }
            }
            Loops::PerCore { stops, .. } => {
                for stop in stops.drain(..) {
                    let _ = stop.send(());
                }
            }
            Loops::Borrowed(_) => {}
        }
    }
}

fn resolve(backend: TransportBackend) -> TransportBackend {
    match backend {
        TransportBackend::Auto if cfg!(target_os = "linux") => TransportBackend::PerCore,
        TransportBackend::Auto => TransportBackend::Portable,
        other => other,
    }
}
