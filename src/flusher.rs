use std::{
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{Result, translog::Shared};

#[derive(Debug, Clone, Copy)]
pub(crate) enum ShutdownState {
    Running,
    ShuttingDown,
    ShutDown,
}

impl ShutdownState {
    const fn is_running(self) -> bool {
        matches!(self, ShutdownState::Running)
    }

    const fn is_shutdown(self) -> bool {
        matches!(self, ShutdownState::ShutDown)
    }
}

/// A background thread that makes the log durable every `flush_every_ms`.
#[derive(Debug)]
pub(crate) struct Flusher {
    shutdown: Arc<Mutex<ShutdownState>>,
    sc: Arc<Condvar>,
    join_handle: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Flusher {
    /// Spawns a thread that periodically flushes the log until dropped.
    pub(crate) fn new(
        name: String,
        shared: Arc<Shared>,
        flush_every_ms: u64,
    ) -> Result<Flusher> {
        let shutdown = Arc::new(Mutex::new(ShutdownState::Running));
        let sc = Arc::new(Condvar::new());

        let join_handle = thread::Builder::new().name(name).spawn({
            let shutdown = shutdown.clone();
            let sc = sc.clone();
            move || run(&shutdown, &sc, &shared, flush_every_ms)
        })?;

        Ok(Flusher { shutdown, sc, join_handle: Mutex::new(Some(join_handle)) })
    }
}

fn run(
    shutdown: &Arc<Mutex<ShutdownState>>,
    sc: &Arc<Condvar>,
    shared: &Arc<Shared>,
    flush_every_ms: u64,
) {
    let flush_every = Duration::from_millis(flush_every_ms);
    let mut shutdown = shutdown.lock();
    let mut wrote_data = false;
    while shutdown.is_running() || wrote_data {
        let before = Instant::now();
        let flushed_before = shared.flushed();

        match shared.flush_all() {
            Ok(()) => {
                wrote_data = shared.flushed() > flushed_before;
                if !shutdown.is_running() {
                    if wrote_data {
                        // flush again right away while shutting
                        // down, in case writers raced us.
                        continue;
                    }
                    break;
                }
            }
            Err(e) => {
                log::error!("failed to flush from periodic flush thread: {}", e);

                *shutdown = ShutdownState::ShutDown;

                // having held the mutex makes this linearized
                // with the notify below.
                drop(shutdown);

                let _notified = sc.notify_all();
                return;
            }
        }

        let sleep_duration = flush_every
            .checked_sub(before.elapsed())
            .unwrap_or_else(|| Duration::from_millis(1));

        if shutdown.is_running() {
            // only sleep before the next flush if we are
            // running normally. if we're shutting down,
            // flush faster.
            sc.wait_for(&mut shutdown, sleep_duration);
        }
    }

    *shutdown = ShutdownState::ShutDown;

    // having held the mutex makes this linearized
    // with the notify below.
    drop(shutdown);

    let _notified = sc.notify_all();
}

impl Drop for Flusher {
    fn drop(&mut self) {
        let mut shutdown = self.shutdown.lock();
        if shutdown.is_running() {
            *shutdown = ShutdownState::ShuttingDown;
            let _notified = self.sc.notify_all();
        }

        while !shutdown.is_shutdown() {
            let _timed_out = self.sc.wait_for(&mut shutdown, Duration::from_millis(100));
        }
        drop(shutdown);

        let mut join_handle_opt = self.join_handle.lock();
        if let Some(join_handle) = join_handle_opt.take() {
            if let Err(e) = join_handle.join() {
                log::error!("error joining flusher thread: {:?}", e);
            }
        }
    }
}
