//! Implements [`RuntimeRef`], which manages the process-wide state of a native backend.

use std::ptr;

use futures::executor::block_on;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Process-wide initialisation and teardown of a native backend.
///
/// Native inference libraries commonly keep global state (thread pools, device handles, log
/// hooks) that must be set up once before any model is loaded and torn down after the last one
/// is freed.
pub trait NativeRuntime: Send + Sync {
    /// Initialises the native backend.
    fn init(&self);

    /// Frees the native backend.
    fn shutdown(&self);
}

/// The currently initialised runtime, if any, alongside a reference count used for
/// initialisation and freeing.
static RUNTIME: Mutex<Option<(&'static dyn NativeRuntime, usize)>> = Mutex::const_new(None);

/// A "reference" to [`RUNTIME`].
///
/// Initialises the runtime if none is active. If there are no other references, this shuts the
/// runtime down upon getting itself dropped.
pub(crate) struct RuntimeRef {
    runtime: &'static dyn NativeRuntime,
}

impl RuntimeRef {
    /// Creates a new reference, initialising `runtime` if necessary.
    pub(crate) async fn new(runtime: &'static dyn NativeRuntime) -> Self {
        let mut lock = RUNTIME.lock().await;
        if let Some((active, count)) = lock.as_mut() {
            if !same_runtime(*active, runtime) {
                warn!("A different native runtime is already active; sharing it");
            }
            *count += 1;
        } else {
            info!("Initialising native runtime");
            runtime.init();
            let _ = lock.insert((runtime, 1));
        }

        Self { runtime }
    }

    /// Blocking version of [`RuntimeRef::new`].
    pub(crate) fn acquire(runtime: &'static dyn NativeRuntime) -> Self {
        block_on(Self::new(runtime))
    }
}

impl Drop for RuntimeRef {
    fn drop(&mut self) {
        block_on(async move {
            let mut lock = RUNTIME.lock().await;
            if let Some((active, count)) = lock.as_mut() {
                *count -= 1;

                if *count == 0 {
                    info!("Shutting down native runtime");
                    active.shutdown();
                    lock.take();
                }
            } else {
                error!("Native runtime has already been shut down, this should never happen")
            }
        });
    }
}

impl Clone for RuntimeRef {
    fn clone(&self) -> Self {
        Self::acquire(self.runtime)
    }
}

fn same_runtime(a: &'static dyn NativeRuntime, b: &'static dyn NativeRuntime) -> bool {
    ptr::eq(
        a as *const dyn NativeRuntime as *const (),
        b as *const dyn NativeRuntime as *const (),
    )
}
