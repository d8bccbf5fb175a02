//! End-to-end pipeline tests over in-memory endpoints: dispatch, worker,
//! store, and broadcast wired together the way the daemon wires them.

use std::io::{Cursor, Read, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relaysync::broadcast::{Broadcaster, Event};
use relaysync::dispatch::{Dispatcher, TransferRequest};
use relaysync::error::{Result, TransferError};
use relaysync::job::{JobStatus, JobStore};
use relaysync::reconcile::Reconciler;
use relaysync::ssh::{CommandOutput, EndpointFactory, RemoteEndpoint};
use relaysync::strategy::StrategyKind;
use relaysync::worker::{TaskRegistry, Worker};

/// Endpoint that serves one fixed payload as the staged archive and captures
/// whatever gets written to it. Size queries answer with the payload length;
/// every other command succeeds silently.
struct MockEndpoint {
    name: String,
    payload: Arc<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
}

impl RemoteEndpoint for MockEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&mut self, command: &str) -> Result<CommandOutput> {
        let stdout = if command.starts_with("du -sb") || command.starts_with("stat -c%s") {
            format!("{}\n", self.payload.len())
        } else {
            String::new()
        };
        Ok(CommandOutput {
            stdout,
            stderr: String::new(),
            exit_status: 0,
        })
    }

    fn open_read(&mut self, _path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(Cursor::new(self.payload.as_ref().clone())))
    }

    fn open_write(&mut self, _path: &str) -> Result<Box<dyn Write + Send>> {
        Ok(Box::new(SharedWriter(Arc::clone(&self.written))))
    }

    fn close(&mut self) {}
}

struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct MockFactory {
    payload: Arc<Vec<u8>>,
    written: Arc<Mutex<Vec<u8>>>,
    fail_connect: bool,
}

impl MockFactory {
    fn new(payload: Vec<u8>) -> Self {
        MockFactory {
            payload: Arc::new(payload),
            written: Arc::new(Mutex::new(Vec::new())),
            fail_connect: false,
        }
    }
}

impl EndpointFactory for MockFactory {
    fn connect(&self, name: &str) -> Result<Box<dyn RemoteEndpoint>> {
        if self.fail_connect {
            return Err(TransferError::Connection {
                host: name.to_string(),
                detail: "host unreachable".into(),
            });
        }
        Ok(Box::new(MockEndpoint {
            name: name.to_string(),
            payload: Arc::clone(&self.payload),
            written: Arc::clone(&self.written),
        }))
    }
}

struct Pipeline {
    store: Arc<JobStore>,
    registry: Arc<TaskRegistry>,
    broadcaster: Arc<Broadcaster>,
    dispatcher: Dispatcher,
    worker: Worker,
    written: Arc<Mutex<Vec<u8>>>,
}

fn pipeline(factory: MockFactory) -> (Pipeline, tokio::sync::mpsc::Receiver<relaysync::worker::JobAssignment>) {
    let store = Arc::new(JobStore::in_memory());
    let registry = Arc::new(TaskRegistry::new());
    let broadcaster = Arc::new(Broadcaster::new());
    let written = Arc::clone(&factory.written);
    let connector: Arc<dyn EndpointFactory> = Arc::new(factory);

    let (tx, rx) = tokio::sync::mpsc::channel(4);
    let dispatcher = Dispatcher::new(Arc::clone(&store), tx, StrategyKind::ArchiveCopy);
    let worker = Worker::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&broadcaster),
        connector,
        "lab",
        "vault",
        1024,
        Duration::ZERO,
    );
    (
        Pipeline {
            store,
            registry,
            broadcaster,
            dispatcher,
            worker,
            written,
        },
        rx,
    )
}

fn request() -> TransferRequest {
    TransferRequest {
        source: "/data/in".into(),
        dest: "/data/out".into(),
        description: Some("nightly sync".into()),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn archive_job_runs_to_completion() {
    let payload: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
    let (p, rx) = pipeline(MockFactory::new(payload.clone()));
    let (_conn, mut events) = p.broadcaster.register(7);

    let job = p.dispatcher.submit(request(), 7).unwrap();
    assert_eq!(job.status, JobStatus::InProgress);

    // close the queue so the worker loop drains and exits
    drop(p.dispatcher);
    p.worker.run(rx).await;

    let stored = p.store.get(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert!(stored.error.is_none());

    // the archive bytes arrived at the destination intact
    assert_eq!(*p.written.lock().unwrap(), payload);

    // finished task no longer occupies the registry
    assert!(p.registry.get(stored.task_id.as_deref().unwrap()).is_none());

    let mut progress_events = Vec::new();
    while let Ok(ev) = events.try_recv() {
        if let Event::TransferProgress { .. } = ev {
            progress_events.push(ev);
        }
    }
    assert!(progress_events.len() >= 2, "expected streaming progress");
    match progress_events.last().unwrap() {
        Event::TransferProgress {
            progress,
            current_file,
            bytes_transferred,
            estimated_time_remaining,
            error,
            ..
        } => {
            assert_eq!(*progress, 100);
            assert_eq!(current_file.as_deref(), Some("Complete"));
            assert_eq!(*bytes_transferred, Some(payload.len() as u64));
            assert_eq!(*estimated_time_remaining, Some(0));
            assert!(error.is_none());
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unreachable_endpoint_fails_the_job() {
    let mut factory = MockFactory::new(Vec::new());
    factory.fail_connect = true;
    let (p, rx) = pipeline(factory);
    let (_conn, mut events) = p.broadcaster.register(7);

    let job = p.dispatcher.submit(request(), 7).unwrap();
    drop(p.dispatcher);
    p.worker.run(rx).await;

    let stored = p.store.get(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    let detail = stored.error.expect("failed job carries error detail");
    assert!(detail.contains("unreachable"), "got {detail:?}");

    match events.try_recv().unwrap() {
        Event::TransferProgress {
            progress, error, ..
        } => {
            assert_eq!(progress, -1);
            assert_eq!(error.as_deref(), Some(detail.as_str()));
        }
        other => panic!("unexpected event {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn reconciler_announces_completion_after_the_worker_finishes() {
    let payload = vec![1u8; 2048];
    let (p, rx) = pipeline(MockFactory::new(payload));
    let (_conn, mut events) = p.broadcaster.register(7);

    let job = p.dispatcher.submit(request(), 7).unwrap();
    let reconciler = Reconciler::new(
        Arc::clone(&p.store),
        Arc::clone(&p.registry),
        Arc::clone(&p.broadcaster),
        Duration::from_secs(1),
    );

    // first pass sees the dispatched job while it is still queued
    let mut seen = Default::default();
    let mut owners = Default::default();
    reconciler.tick(&mut seen, &mut owners);

    drop(p.dispatcher);
    p.worker.run(rx).await;
    assert_eq!(p.store.get(job.id).unwrap().status, JobStatus::Completed);

    // next pass finds nothing in flight and closes out the owner
    reconciler.tick(&mut seen, &mut owners);
    let mut saw_completion = false;
    while let Ok(ev) = events.try_recv() {
        if ev == Event::completion() {
            saw_completion = true;
        }
    }
    assert!(saw_completion, "expected a job_completion event");

    // a further idle pass stays silent
    reconciler.tick(&mut seen, &mut owners);
    assert!(events.try_recv().is_err());
}
