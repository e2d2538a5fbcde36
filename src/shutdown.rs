use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use signal_hook::consts::{SIGINT, SIGTERM};

/// Cooperative stop request, checked between messages and folders.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    requested: Arc<AtomicBool>,
    announced: Arc<AtomicBool>,
}

impl Shutdown {
    /// A flag that only reacts to [`Shutdown::request`].
    pub fn new() -> Self {
        Self::default()
    }

    /// A flag that is also raised by SIGINT and SIGTERM.
    pub fn install() -> io::Result<Self> {
        let shutdown = Self::new();
        for signal in [SIGINT, SIGTERM] {
            signal_hook::flag::register(signal, Arc::clone(&shutdown.requested))?;
        }
        Ok(shutdown)
    }

    pub fn request(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        if !self.requested.load(Ordering::SeqCst) {
            return false;
        }
        if !self.announced.swap(true, Ordering::SeqCst) {
            log::info!("shutdown signaled");
        }
        true
    }
}
