use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use arc_swap::ArcSwap;
use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{debug, info, warn};

use crate::hosts::HostsTable;

const RELOAD_RETRIES: u32 = 3;
const RELOAD_BACKOFF: Duration = Duration::from_millis(50);

enum Signal {
    Changed(notify::Result<Event>),
    Stop,
}

/// Reloads a hosts table on file change. Dropping it stops the watcher and
/// joins the reload thread.
pub struct HostsWatcher {
    watcher: Option<RecommendedWatcher>,
    stop: Sender<Signal>,
    thread: Option<JoinHandle<()>>,
    path: PathBuf,
}

impl HostsWatcher {
    pub fn spawn(path: PathBuf, hosts: Arc<ArcSwap<HostsTable>>) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let events = tx.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = events.send(Signal::Changed(res));
            },
            Config::default(),
        )?;
        watcher.watch(&path, RecursiveMode::NonRecursive)?;

        let reload_path = path.clone();
        let thread = thread::Builder::new()
            .name("rrcache-hosts".into())
            .spawn(move || reload_loop(&reload_path, &hosts, rx))
            .map_err(notify::Error::io)?;

        info!(target = "watcher", path = %path.display(), "hosts watcher started");
        Ok(Self {
            watcher: Some(watcher),
            stop: tx,
            thread: Some(thread),
            path,
        })
    }
}

impl Drop for HostsWatcher {
    fn drop(&mut self) {
        // no more events once the watcher is gone
        drop(self.watcher.take());
        let _ = self.stop.send(Signal::Stop);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(target = "watcher", path = %self.path.display(), "hosts watcher stopped");
    }
}

fn reload_loop(path: &Path, hosts: &ArcSwap<HostsTable>, rx: Receiver<Signal>) {
    for signal in rx {
        match signal {
            Signal::Stop => break,
            Signal::Changed(Ok(event)) if event.kind.is_access() => {}
            Signal::Changed(Ok(_)) => reload(path, hosts),
            Signal::Changed(Err(err)) => {
                warn!(target = "watcher", error = %err, "watcher event error");
            }
        }
    }
}

fn reload(path: &Path, hosts: &ArcSwap<HostsTable>) {
    // an editor may still be writing the file
    for attempt in 1..=RELOAD_RETRIES {
        match HostsTable::load(path) {
            Ok(table) => {
                let entries = table.len();
                hosts.store(Arc::new(table));
                info!(target = "watcher", path = %path.display(), entries, "hosts reloaded");
                return;
            }
            Err(err) if attempt == RELOAD_RETRIES => {
                warn!(
                    target = "watcher",
                    path = %path.display(),
                    error = %err,
                    "hosts reload failed, keeping old table"
                );
            }
            Err(_) => thread::sleep(RELOAD_BACKOFF),
        }
    }
}
