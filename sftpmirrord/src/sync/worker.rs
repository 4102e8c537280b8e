use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sftpmirror_core::{EntryKind, RemoteConnector, RemoteSession};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::cache::DirectoryCache;
use super::paths::{ancestor_chain, join_dir, normalize_remote_path, parent_directory};
use super::queue::{RetryPolicy, UploadRequest};

const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_QUEUE_CAPACITY: usize = 10;
const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct SyncOptions {
    pub refresh_interval: Duration,
    pub queue_capacity: usize,
    pub max_attempts: u32,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

pub struct SyncService;

impl SyncService {
    /// Spawns the sync worker. The worker starts even when the first
    /// connect fails; the periodic refresh keeps retrying, so a server
    /// that is down at boot is picked up later.
    pub fn start<C: RemoteConnector>(connector: C, options: SyncOptions) -> SyncHandle {
        let (request_tx, request_rx) = mpsc::channel(options.queue_capacity.max(1));
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let connected = Arc::new(AtomicBool::new(false));
        let policy = RetryPolicy::new(options.max_attempts);

        let worker = Worker {
            connector,
            session: None,
            cache: DirectoryCache::default(),
            request_rx,
            request_tx: request_tx.clone(),
            stop_rx,
            connected: Arc::clone(&connected),
            policy,
            refresh_interval: options.refresh_interval,
        };
        let task = tokio::spawn(worker.run());

        SyncHandle {
            request_tx,
            stop_tx,
            connected,
            policy,
            task,
        }
    }
}

/// Thread-safe entry points into the running worker. Dropping the
/// handle without calling `stop` aborts scheduling of future work but
/// skips the final drain.
pub struct SyncHandle {
    request_tx: mpsc::Sender<UploadRequest>,
    stop_tx: mpsc::Sender<()>,
    connected: Arc<AtomicBool>,
    policy: RetryPolicy,
    task: JoinHandle<()>,
}

impl SyncHandle {
    /// Queues an upload. `true` means queued, not delivered. Rejected
    /// while no connection is believed live, or when the bounded queue
    /// is full (fail-fast backpressure rather than blocking the
    /// producer).
    pub fn submit(&self, local: impl Into<PathBuf>, remote: impl Into<String>) -> bool {
        offer(
            &self.policy,
            &self.connected,
            &self.request_tx,
            UploadRequest::new(local, remote),
        )
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Signals the worker to drain already-queued requests and exit,
    /// then waits for it.
    pub async fn stop(self) {
        let _ = self.stop_tx.send(()).await;
        let _ = self.task.await;
    }
}

/// Shared accept/reject decision for fresh submissions and requeues.
/// Mirrors the upload path's own view of the connection: while no
/// session is believed live there is no point buffering work.
fn offer(
    policy: &RetryPolicy,
    connected: &AtomicBool,
    tx: &mpsc::Sender<UploadRequest>,
    request: UploadRequest,
) -> bool {
    if !policy.allows(request.attempt) {
        eprintln!(
            "[sftpmirrord] giving up on {} -> {} after {} attempts",
            request.local.display(),
            request.remote,
            request.attempt
        );
        return false;
    }
    if !connected.load(Ordering::SeqCst) {
        return false;
    }
    tx.try_send(request).is_ok()
}

/// Owns the connection handle and the directory cache exclusively.
/// Every mutation of either happens on this task, so no locking is
/// needed; producers only reach it through the bounded queue.
struct Worker<C: RemoteConnector> {
    connector: C,
    session: Option<C::Session>,
    cache: DirectoryCache,
    request_rx: mpsc::Receiver<UploadRequest>,
    request_tx: mpsc::Sender<UploadRequest>,
    stop_rx: mpsc::Receiver<()>,
    connected: Arc<AtomicBool>,
    policy: RetryPolicy,
    refresh_interval: Duration,
}

impl<C: RemoteConnector> Worker<C> {
    async fn run(mut self) {
        self.refresh().await;

        let mut tick = tokio::time::interval(self.refresh_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tick.tick().await;

        loop {
            tokio::select! {
                _ = tick.tick() => self.refresh().await,
                request = self.request_rx.recv() => match request {
                    Some(request) => self.put(request).await,
                    None => break,
                },
                _ = self.stop_rx.recv() => break,
            }
        }

        // Final flush: process what is already buffered, without
        // waiting for new arrivals.
        while let Ok(request) = self.request_rx.try_recv() {
            self.put(request).await;
        }

        self.connected.store(false, Ordering::SeqCst);
        if let Some(mut session) = self.session.take() {
            session.close().await;
        }
        eprintln!("[sftpmirrord] sync worker stopped");
    }

    /// Health check plus full cache rebuild. Reconnects if the session
    /// is absent; a failed probe discards the session until the next
    /// tick or inline reconnect.
    async fn refresh(&mut self) {
        if !self.ensure_session().await {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Err(err) = session.noop().await {
            eprintln!("[sftpmirrord] connection probe failed: {err}");
            self.drop_session();
            return;
        }
        self.rebuild_cache().await;
    }

    /// Walks the remote tree from the root with an explicit stack and
    /// replaces the cache with the result. A directory already in the
    /// set being built is not pushed again, which also bounds walks
    /// over cyclic-by-misconfiguration trees. A listing error aborts
    /// that branch only, unless it is connection-level; partial
    /// results are kept either way.
    async fn rebuild_cache(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let mut known = DirectoryCache::default();
        let mut pending = vec![String::from("/")];
        let mut session_broken = false;
        while let Some(dir) = pending.pop() {
            let entries = match session.list_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => {
                    eprintln!("[sftpmirrord] list {dir} failed: {err}");
                    if err.is_connection_level() {
                        session_broken = true;
                        break;
                    }
                    continue;
                }
            };
            for entry in entries {
                if entry.kind != EntryKind::Dir {
                    continue;
                }
                let child = join_dir(&dir, &entry.name);
                if known.mark_present(child.clone()) {
                    pending.push(child);
                }
            }
        }

        self.cache = known;
        if session_broken {
            self.drop_session();
        }
        eprintln!(
            "[sftpmirrord] refreshed remote directory cache: {} directories",
            self.cache.len()
        );
    }

    /// The upload path. Failures route through the retry policy with
    /// the attempt bumped, except malformed remote paths and unreadable
    /// local files, which are dropped permanently.
    async fn put(&mut self, request: UploadRequest) {
        let normalized = normalize_remote_path(&request.remote);
        if normalized.is_empty() {
            eprintln!(
                "[sftpmirrord] dropping {}: malformed remote path {:?}",
                request.local.display(),
                request.remote
            );
            return;
        }

        if !self.ensure_session().await {
            eprintln!(
                "[sftpmirrord] sync {} failed: no connection",
                request.local.display()
            );
            self.requeue(request);
            return;
        }

        if let Some(dir) = parent_directory(&normalized) {
            if !self.ensure_dir_chain(&dir).await {
                self.requeue(request);
                return;
            }
        }

        let mut source = match tokio::fs::File::open(&request.local).await {
            Ok(file) => file,
            Err(err) => {
                eprintln!(
                    "[sftpmirrord] open {} failed, dropping: {err}",
                    request.local.display()
                );
                return;
            }
        };

        let target = format!("/{normalized}");
        let Some(session) = self.session.as_mut() else {
            self.requeue(request);
            return;
        };
        match session.store(&target, &mut source).await {
            Ok(()) => {
                eprintln!(
                    "[sftpmirrord] synced {} to {target}",
                    request.local.display()
                );
            }
            Err(err) => {
                eprintln!("[sftpmirrord] store {target} failed: {err}");
                if err.is_connection_level() {
                    self.drop_session();
                }
                self.requeue(request);
            }
        }
    }

    /// Creates the missing ancestors of `dir` root-to-leaf, marking
    /// each created component in the cache as it goes. Stops at the
    /// first failure, leaving only truly-created paths marked.
    async fn ensure_dir_chain(&mut self, dir: &str) -> bool {
        if self.cache.contains(dir) {
            return true;
        }
        for ancestor in ancestor_chain(dir) {
            if self.cache.contains(&ancestor) {
                continue;
            }
            let Some(session) = self.session.as_mut() else {
                return false;
            };
            match session.make_dir(&ancestor).await {
                Ok(()) => {
                    eprintln!("[sftpmirrord] mkdir {ancestor}");
                    self.cache.mark_present(ancestor);
                }
                Err(err) => {
                    eprintln!("[sftpmirrord] mkdir {ancestor} failed: {err}");
                    if err.is_connection_level() {
                        self.drop_session();
                    }
                    return false;
                }
            }
        }
        true
    }

    /// Inline reconnect for requests arriving while disconnected.
    async fn ensure_session(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }
        match self.connector.connect().await {
            Ok(session) => {
                self.session = Some(session);
                self.connected.store(true, Ordering::SeqCst);
                eprintln!("[sftpmirrord] connected to remote server");
                true
            }
            Err(err) => {
                eprintln!("[sftpmirrord] connect failed: {err}");
                false
            }
        }
    }

    fn drop_session(&mut self) {
        self.session = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Retry-by-requeue: a failed request goes to the back of the
    /// queue with the attempt bumped, so later distinct requests may
    /// overtake it. A rejected requeue (cap reached, disconnected, or
    /// full queue) loses this attempt.
    fn requeue(&self, failed: UploadRequest) {
        offer(
            &self.policy,
            &self.connected,
            &self.request_tx,
            failed.next_attempt(),
        );
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
