use super::*;
use async_trait::async_trait;
use sftpmirror_core::{RemoteEntry, RemoteError};
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Default)]
struct FakeState {
    tree: BTreeMap<String, Vec<RemoteEntry>>,
    connects: u32,
    connect_failures: u32,
    noop_failures: u32,
    fail_mkdir: BTreeSet<String>,
    fail_list: BTreeSet<String>,
    fail_list_connection: BTreeSet<String>,
    fail_stores: bool,
    mkdirs: Vec<String>,
    store_attempts: u32,
    stores: Vec<(String, Vec<u8>)>,
    closed: bool,
}

#[derive(Clone, Default)]
struct FakeConnector {
    state: Arc<Mutex<FakeState>>,
}

impl FakeConnector {
    fn with_tree(dirs: &[(&str, &[RemoteEntry])]) -> Self {
        let connector = Self::default();
        {
            let mut state = connector.state.lock().unwrap();
            for (path, entries) in dirs {
                state.tree.insert((*path).to_string(), entries.to_vec());
            }
        }
        connector
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }
}

struct FakeSession {
    state: Arc<Mutex<FakeState>>,
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    type Session = FakeSession;

    async fn connect(&self) -> Result<FakeSession, RemoteError> {
        let mut state = self.state.lock().unwrap();
        state.connects += 1;
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(RemoteError::Other("scripted connect failure".into()));
        }
        Ok(FakeSession {
            state: Arc::clone(&self.state),
        })
    }
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn noop(&mut self) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.noop_failures > 0 {
            state.noop_failures -= 1;
            return Err(RemoteError::Other("scripted probe failure".into()));
        }
        Ok(())
    }

    async fn list_dir(&mut self, path: &str) -> Result<Vec<RemoteEntry>, RemoteError> {
        let state = self.state.lock().unwrap();
        if state.fail_list_connection.contains(path) {
            return Err(RemoteError::from(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "scripted connection loss",
            )));
        }
        if state.fail_list.contains(path) {
            return Err(RemoteError::Other("scripted listing failure".into()));
        }
        state
            .tree
            .get(path)
            .cloned()
            .ok_or_else(|| RemoteError::Other(format!("no such directory: {path}")))
    }

    async fn make_dir(&mut self, path: &str) -> Result<(), RemoteError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_mkdir.contains(path) {
            return Err(RemoteError::Other("scripted mkdir failure".into()));
        }
        state.mkdirs.push(path.to_string());
        Ok(())
    }

    async fn store(
        &mut self,
        remote_path: &str,
        source: &mut (dyn AsyncRead + Send + Unpin),
    ) -> Result<(), RemoteError> {
        {
            let mut state = self.state.lock().unwrap();
            state.store_attempts += 1;
            if state.fail_stores {
                return Err(RemoteError::Other("scripted store failure".into()));
            }
        }
        let mut data = Vec::new();
        source.read_to_end(&mut data).await?;
        self.state
            .lock()
            .unwrap()
            .stores
            .push((remote_path.to_string(), data));
        Ok(())
    }

    async fn close(&mut self) {
        self.state.lock().unwrap().closed = true;
    }
}

struct TestRig {
    worker: Worker<FakeConnector>,
    request_tx: mpsc::Sender<UploadRequest>,
    stop_tx: mpsc::Sender<()>,
}

fn make_worker(connector: FakeConnector) -> TestRig {
    let (request_tx, request_rx) = mpsc::channel(10);
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let worker = Worker {
        connector,
        session: None,
        cache: DirectoryCache::default(),
        request_rx,
        request_tx: request_tx.clone(),
        stop_rx,
        connected: Arc::new(AtomicBool::new(false)),
        policy: RetryPolicy::default(),
        refresh_interval: Duration::from_secs(10),
    };
    TestRig {
        worker,
        request_tx,
        stop_tx,
    }
}

fn local_file(dir: &tempfile::TempDir, name: &str, contents: &[u8]) -> std::path::PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

#[tokio::test]
async fn refresh_builds_cache_from_remote_tree() {
    let connector = FakeConnector::with_tree(&[
        (
            "/",
            &[RemoteEntry::dir("docs"), RemoteEntry::file("readme.txt")],
        ),
        ("/docs", &[RemoteEntry::dir("img")]),
        ("/docs/img", &[]),
    ]);
    let mut rig = make_worker(connector.clone());

    rig.worker.refresh().await;

    assert_eq!(rig.worker.cache.len(), 2);
    assert!(rig.worker.cache.contains("/docs"));
    assert!(rig.worker.cache.contains("/docs/img"));
    assert!(rig.worker.connected.load(Ordering::SeqCst));
    assert_eq!(connector.state().connects, 1);
}

#[tokio::test]
async fn listing_error_aborts_branch_but_keeps_siblings() {
    let connector = FakeConnector::with_tree(&[
        ("/", &[RemoteEntry::dir("good"), RemoteEntry::dir("broken")]),
        ("/good", &[RemoteEntry::dir("inner")]),
        ("/good/inner", &[]),
    ]);
    connector.state().fail_list.insert("/broken".into());
    let mut rig = make_worker(connector);

    rig.worker.refresh().await;

    // "/broken" itself was observed as a child of the root; only its
    // subtree is lost.
    assert!(rig.worker.cache.contains("/good"));
    assert!(rig.worker.cache.contains("/good/inner"));
    assert!(rig.worker.cache.contains("/broken"));
    assert_eq!(rig.worker.cache.len(), 3);
    assert!(rig.worker.session.is_some());
}

#[tokio::test]
async fn connection_level_listing_error_discards_session() {
    let connector = FakeConnector::with_tree(&[(
        "/",
        &[RemoteEntry::dir("kept")],
    )]);
    connector.state().fail_list_connection.insert("/kept".into());
    let mut rig = make_worker(connector);

    rig.worker.refresh().await;

    assert!(rig.worker.session.is_none());
    assert!(!rig.worker.connected.load(Ordering::SeqCst));
    // Partial results from before the break survive.
    assert!(rig.worker.cache.contains("/kept"));
}

#[tokio::test]
async fn probe_failure_discards_session_and_keeps_stale_cache() {
    let connector = FakeConnector::with_tree(&[("/", &[RemoteEntry::dir("pub")]), ("/pub", &[])]);
    let mut rig = make_worker(connector.clone());

    rig.worker.refresh().await;
    assert!(rig.worker.cache.contains("/pub"));

    connector.state().noop_failures = 1;
    rig.worker.refresh().await;

    assert!(rig.worker.session.is_none());
    assert!(!rig.worker.connected.load(Ordering::SeqCst));
    assert!(rig.worker.cache.contains("/pub"));
}

#[tokio::test]
async fn put_creates_missing_ancestors_and_stores() {
    let connector = FakeConnector::with_tree(&[("/", &[])]);
    let mut rig = make_worker(connector.clone());
    rig.worker.refresh().await;

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, "a.txt", b"payload");
    rig.worker
        .put(UploadRequest::new(&local, "/pub/x/a.txt"))
        .await;

    let state = connector.state();
    assert_eq!(state.mkdirs, vec!["/pub".to_string(), "/pub/x".into()]);
    assert_eq!(
        state.stores,
        vec![("/pub/x/a.txt".to_string(), b"payload".to_vec())]
    );
    drop(state);
    assert!(rig.worker.cache.contains("/pub"));
    assert!(rig.worker.cache.contains("/pub/x"));
    assert!(rig.worker.request_rx.try_recv().is_err());
}

#[tokio::test]
async fn put_skips_mkdir_for_cached_directories() {
    let connector = FakeConnector::with_tree(&[
        ("/", &[RemoteEntry::dir("pub")]),
        ("/pub", &[RemoteEntry::dir("x")]),
        ("/pub/x", &[]),
    ]);
    let mut rig = make_worker(connector.clone());
    rig.worker.refresh().await;

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, "a.txt", b"data");
    rig.worker
        .put(UploadRequest::new(&local, "/pub/x/a.txt"))
        .await;

    let state = connector.state();
    assert!(state.mkdirs.is_empty());
    assert_eq!(state.stores.len(), 1);
}

#[tokio::test]
async fn failed_reconnect_requeues_with_attempt_one() {
    let connector = FakeConnector::default();
    connector.state().connect_failures = 1;
    let mut rig = make_worker(connector.clone());
    // The worker believes a connection exists until the inline
    // reconnect proves otherwise.
    rig.worker.connected.store(true, Ordering::SeqCst);

    rig.worker
        .put(UploadRequest::new("/tmp/a.txt", "/pub/a.txt"))
        .await;

    let retry = rig.worker.request_rx.try_recv().unwrap();
    assert_eq!(retry.attempt, 1);
    assert_eq!(retry.remote, "/pub/a.txt");
    let state = connector.state();
    assert!(state.mkdirs.is_empty());
    assert_eq!(state.store_attempts, 0);
}

#[tokio::test]
async fn malformed_remote_path_is_dropped_permanently() {
    let connector = FakeConnector::with_tree(&[("/", &[])]);
    let mut rig = make_worker(connector.clone());
    rig.worker.refresh().await;

    rig.worker
        .put(UploadRequest::new("/tmp/a.txt", "/"))
        .await;

    let state = connector.state();
    assert!(state.mkdirs.is_empty());
    assert_eq!(state.store_attempts, 0);
    drop(state);
    assert!(rig.worker.request_rx.try_recv().is_err());
}

#[tokio::test]
async fn unreadable_local_file_is_dropped_permanently() {
    let connector = FakeConnector::with_tree(&[("/", &[])]);
    let mut rig = make_worker(connector.clone());
    rig.worker.refresh().await;

    rig.worker
        .put(UploadRequest::new("/no/such/file.txt", "a.txt"))
        .await;

    assert_eq!(connector.state().store_attempts, 0);
    assert!(rig.worker.request_rx.try_recv().is_err());
}

#[tokio::test]
async fn dir_chain_stops_at_first_failing_component() {
    let connector = FakeConnector::with_tree(&[("/", &[])]);
    connector.state().fail_mkdir.insert("/a/b".into());
    let mut rig = make_worker(connector.clone());
    rig.worker.refresh().await;

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, "f.txt", b"x");
    rig.worker
        .put(UploadRequest::new(&local, "/a/b/c/f.txt"))
        .await;

    let state = connector.state();
    assert_eq!(state.mkdirs, vec!["/a".to_string()]);
    assert_eq!(state.store_attempts, 0);
    drop(state);
    assert!(rig.worker.cache.contains("/a"));
    assert!(!rig.worker.cache.contains("/a/b"));
    assert!(!rig.worker.cache.contains("/a/b/c"));
    // The failed request routes through the retry policy.
    assert_eq!(rig.worker.request_rx.try_recv().unwrap().attempt, 1);
}

#[tokio::test]
async fn repeated_store_failures_exhaust_the_attempt_cap() {
    let connector = FakeConnector::with_tree(&[("/", &[RemoteEntry::dir("pub")]), ("/pub", &[])]);
    connector.state().fail_stores = true;
    let mut rig = make_worker(connector.clone());
    rig.worker.refresh().await;

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, "a.txt", b"x");
    let mut request = UploadRequest::new(&local, "/pub/a.txt");
    let mut attempts_seen = Vec::new();
    loop {
        rig.worker.put(request).await;
        match rig.worker.request_rx.try_recv() {
            Ok(retry) => {
                attempts_seen.push(retry.attempt);
                request = retry;
            }
            Err(_) => break,
        }
    }

    // Requeued with attempt 1, 2, 3; the fourth evaluation drops.
    assert_eq!(attempts_seen, vec![1, 2, 3]);
    assert_eq!(connector.state().store_attempts, 4);
}

#[tokio::test]
async fn offer_rejects_past_cap_disconnected_and_full_queue() {
    let policy = RetryPolicy::default();
    let connected = AtomicBool::new(true);
    let (tx, mut rx) = mpsc::channel(1);

    let over_cap = UploadRequest {
        local: "/tmp/a.txt".into(),
        remote: "a.txt".into(),
        attempt: 4,
    };
    assert!(!offer(&policy, &connected, &tx, over_cap));

    connected.store(false, Ordering::SeqCst);
    assert!(!offer(
        &policy,
        &connected,
        &tx,
        UploadRequest::new("/tmp/a.txt", "a.txt")
    ));

    connected.store(true, Ordering::SeqCst);
    assert!(offer(
        &policy,
        &connected,
        &tx,
        UploadRequest::new("/tmp/a.txt", "a.txt")
    ));
    // Queue is full now; fail fast instead of blocking the producer.
    assert!(!offer(
        &policy,
        &connected,
        &tx,
        UploadRequest::new("/tmp/b.txt", "b.txt")
    ));
    assert_eq!(rx.try_recv().unwrap().remote, "a.txt");
}

#[tokio::test]
async fn stop_drains_buffered_requests_before_teardown() {
    let connector = FakeConnector::with_tree(&[("/", &[])]);
    let rig = make_worker(connector.clone());

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, "a.txt", b"late");
    rig.request_tx
        .try_send(UploadRequest::new(&local, "a.txt"))
        .unwrap();
    rig.stop_tx.try_send(()).unwrap();

    rig.worker.run().await;

    let state = connector.state();
    assert_eq!(state.stores, vec![("/a.txt".to_string(), b"late".to_vec())]);
    assert!(state.closed);
}

#[tokio::test]
async fn service_round_trip_submits_and_stops() {
    let connector = FakeConnector::with_tree(&[("/", &[])]);
    let handle = SyncService::start(connector.clone(), SyncOptions::default());

    let mut connected = false;
    for _ in 0..200 {
        if handle.is_connected() {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(connected, "worker never connected");

    let dir = tempfile::tempdir().unwrap();
    let local = local_file(&dir, "a.txt", b"hello");
    assert!(handle.submit(&local, "/pub/a.txt"));
    handle.stop().await;

    let state = connector.state();
    assert_eq!(
        state.stores,
        vec![("/pub/a.txt".to_string(), b"hello".to_vec())]
    );
    assert!(state.closed);
}

#[tokio::test]
async fn submit_is_rejected_before_first_connect() {
    let connector = FakeConnector::default();
    connector.state().connect_failures = u32::MAX;
    let handle = SyncService::start(connector, SyncOptions::default());
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!handle.submit("/tmp/a.txt", "/pub/a.txt"));
    handle.stop().await;
}
