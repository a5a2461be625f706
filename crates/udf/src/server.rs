//! Duplex server mediating one UDF worker.
//!
//! Exactly one writer task serializes outbound frames (control requests
//! and data) and exactly one reader task dispatches inbound responses:
//! control replies go to single-slot per-RPC channels, data reassembles
//! into engine messages on the output channel. A reply nobody is waiting
//! for is logged and dropped.
//!
//! Supervision is a two-phase watchdog: if the worker stays silent past
//! the keepalive timeout the abort hook runs (cooperative stop); if the
//! process is still alive after the grace period the kill hook runs.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use strom_core::{BeginBatch, BufferedBatch, FieldValue, Message, Point};

use crate::convert;
use crate::error::UdfError;
use crate::frame::{write_frame, FrameReader};
use crate::proto;

/// Server configuration for one worker session.
#[derive(Debug, Clone)]
pub struct UdfConfig {
    pub task_id: String,
    pub node_id: String,
    /// Keepalive timeout; zero disables supervision.
    pub keepalive: Duration,
    /// Capacity of the data output channel.
    pub output_capacity: usize,
}

impl UdfConfig {
    pub fn new(task_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            node_id: node_id.into(),
            keepalive: Duration::ZERO,
            output_capacity: 64,
        }
    }

    pub fn with_keepalive(mut self, keepalive: Duration) -> Self {
        self.keepalive = keepalive;
        self
    }
}

/// Supervision callbacks and the worker's termination signal.
pub struct Hooks {
    /// Cooperative stop: invoked once when the server aborts.
    pub on_abort: Box<dyn FnOnce() + Send>,
    /// Hard stop: invoked if the worker outlives the abort grace period.
    pub on_kill: Box<dyn FnOnce() + Send>,
    /// Becomes true when the worker process has exited. `None` for
    /// workers the host cannot observe (sockets).
    pub terminated: Option<watch::Receiver<bool>>,
}

impl Hooks {
    /// Hooks that do nothing; for tests and socket workers without
    /// process control.
    pub fn none() -> Self {
        Self {
            on_abort: Box::new(|| {}),
            on_kill: Box::new(|| {}),
            terminated: None,
        }
    }
}

enum Outbound {
    Req(proto::Request),
    Close,
}

struct Shared {
    first_err: std::sync::Mutex<Option<String>>,
    on_abort: std::sync::Mutex<Option<Box<dyn FnOnce() + Send>>>,
    cancel: CancellationToken,
    started: Instant,
    /// Nanoseconds since `started` of the last inbound response.
    last_response: AtomicU64,
}

impl Shared {
    fn touch(&self) {
        self.last_response
            .store(self.started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    }

    fn silence(&self) -> Duration {
        let last = Duration::from_nanos(self.last_response.load(Ordering::Relaxed));
        self.started.elapsed().saturating_sub(last)
    }

    /// Record the first error, stop IO, and run the abort hook once.
    fn abort(&self, reason: String) {
        {
            let mut err = self.first_err.lock().unwrap();
            if err.is_none() {
                *err = Some(reason);
            }
        }
        self.cancel.cancel();
        if let Some(hook) = self.on_abort.lock().unwrap().take() {
            hook();
        }
    }
}

/// Host side of one UDF worker session.
pub struct UdfServer {
    config: UdfConfig,
    out_tx: mpsc::Sender<Outbound>,
    info_rx: Mutex<mpsc::Receiver<proto::InfoResponse>>,
    init_rx: Mutex<mpsc::Receiver<proto::InitResponse>>,
    snapshot_rx: Mutex<mpsc::Receiver<proto::SnapshotResponse>>,
    restore_rx: Mutex<mpsc::Receiver<proto::RestoreResponse>>,
    data_rx: std::sync::Mutex<Option<mpsc::Receiver<Message>>>,
    shared: Arc<Shared>,
}

impl UdfServer {
    /// Start the IO and supervision tasks over the given byte stream.
    pub fn start<R, W>(config: UdfConfig, reader: R, writer: W, hooks: Hooks) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            first_err: std::sync::Mutex::new(None),
            on_abort: std::sync::Mutex::new(Some(hooks.on_abort)),
            cancel: CancellationToken::new(),
            started: Instant::now(),
            last_response: AtomicU64::new(0),
        });
        shared.touch();

        let (out_tx, out_rx) = mpsc::channel::<Outbound>(64);
        let (info_tx, info_rx) = mpsc::channel(1);
        let (init_tx, init_rx) = mpsc::channel(1);
        let (snapshot_tx, snapshot_rx) = mpsc::channel(1);
        let (restore_tx, restore_rx) = mpsc::channel(1);
        let (data_tx, data_rx) = mpsc::channel(config.output_capacity.max(1));

        tokio::spawn(write_loop(writer, out_rx, Arc::clone(&shared)));
        tokio::spawn(read_loop(
            reader,
            ReaderSlots {
                info_tx,
                init_tx,
                snapshot_tx,
                restore_tx,
                data_tx,
            },
            Arc::clone(&shared),
        ));

        if !config.keepalive.is_zero() {
            tokio::spawn(keepalive_loop(
                config.keepalive,
                out_tx.clone(),
                Arc::clone(&shared),
            ));
            tokio::spawn(watchdog_loop(
                config.keepalive,
                hooks.on_kill,
                hooks.terminated,
                Arc::clone(&shared),
            ));
        }

        Self {
            config,
            out_tx,
            info_rx: Mutex::new(info_rx),
            init_rx: Mutex::new(init_rx),
            snapshot_rx: Mutex::new(snapshot_rx),
            restore_rx: Mutex::new(restore_rx),
            data_rx: std::sync::Mutex::new(Some(data_rx)),
            shared,
        }
    }

    /// Take the data output channel. Yields worker data as engine
    /// messages; closes when the worker stream ends or the server aborts.
    pub fn take_output(&self) -> Option<mpsc::Receiver<Message>> {
        self.data_rx.lock().unwrap().take()
    }

    /// First recorded error, if the server has aborted.
    pub fn first_error(&self) -> Option<String> {
        self.shared.first_err.lock().unwrap().clone()
    }

    /// Abort the session: record the reason, stop IO, run the abort hook.
    pub fn abort(&self, reason: impl Into<String>) {
        self.shared.abort(reason.into());
    }

    fn abort_error(&self) -> UdfError {
        match self.first_error() {
            Some(msg) => UdfError::Worker(msg),
            None => UdfError::Aborted,
        }
    }

    async fn send(&self, msg: proto::request::Msg) -> Result<(), UdfError> {
        self.out_tx
            .send(Outbound::Req(proto::Request::of(msg)))
            .await
            .map_err(|_| self.abort_error())
    }

    async fn recv_slot<T>(&self, slot: &Mutex<mpsc::Receiver<T>>) -> Result<T, UdfError> {
        let mut rx = slot.lock().await;
        tokio::select! {
            _ = self.shared.cancel.cancelled() => Err(self.abort_error()),
            resp = rx.recv() => resp.ok_or_else(|| self.abort_error()),
        }
    }

    /// Discover what the worker wants, provides, and accepts as options.
    pub async fn info(&self) -> Result<proto::InfoResponse, UdfError> {
        self.send(proto::request::Msg::Info(proto::InfoRequest {}))
            .await?;
        self.recv_slot(&self.info_rx).await
    }

    /// Initialize the worker with typed option values. Data may flow
    /// only after this succeeds.
    pub async fn init(
        &self,
        options: &BTreeMap<String, Vec<FieldValue>>,
    ) -> Result<(), UdfError> {
        let req = proto::InitRequest {
            options: options
                .iter()
                .map(|(name, values)| proto::UdfOption {
                    name: name.clone(),
                    values: values.iter().map(option_value).collect(),
                })
                .collect(),
            task_id: self.config.task_id.clone(),
            node_id: self.config.node_id.clone(),
        };
        self.send(proto::request::Msg::Init(req)).await?;
        let resp = self.recv_slot(&self.init_rx).await?;
        if resp.success {
            Ok(())
        } else {
            Err(UdfError::Worker(format!("init failed: {}", resp.error)))
        }
    }

    /// Ask the worker for an opaque state blob.
    pub async fn snapshot(&self) -> Result<Vec<u8>, UdfError> {
        self.send(proto::request::Msg::Snapshot(proto::SnapshotRequest {}))
            .await?;
        Ok(self.recv_slot(&self.snapshot_rx).await?.snapshot)
    }

    /// Replay a previously captured state blob.
    pub async fn restore(&self, snapshot: Vec<u8>) -> Result<(), UdfError> {
        self.send(proto::request::Msg::Restore(proto::RestoreRequest {
            snapshot,
        }))
        .await?;
        let resp = self.recv_slot(&self.restore_rx).await?;
        if resp.success {
            Ok(())
        } else {
            Err(UdfError::Worker(format!("restore failed: {}", resp.error)))
        }
    }

    pub async fn send_point(&self, p: &Point) -> Result<(), UdfError> {
        self.send(proto::request::Msg::Point(convert::point_to_proto(p)))
            .await
    }

    /// Send a whole batch as begin, points, end.
    pub async fn send_batch(&self, batch: &BufferedBatch) -> Result<(), UdfError> {
        self.send_begin(&batch.begin).await?;
        let group = batch.begin.group_id().clone();
        for p in &batch.points {
            self.send(proto::request::Msg::Point(convert::batch_point_to_proto(
                p, &group,
            )))
            .await?;
        }
        self.send_end(&batch.begin).await
    }

    pub async fn send_begin(&self, b: &BeginBatch) -> Result<(), UdfError> {
        self.send(proto::request::Msg::Begin(convert::begin_to_proto(b)))
            .await
    }

    pub async fn send_end(&self, b: &BeginBatch) -> Result<(), UdfError> {
        self.send(proto::request::Msg::End(convert::end_to_proto(b)))
            .await
    }

    /// Signal end of input: the writer shuts the stream down so the
    /// worker can flush and exit.
    pub async fn close_input(&self) {
        let _ = self.out_tx.send(Outbound::Close).await;
    }
}

fn option_value(v: &FieldValue) -> proto::OptionValue {
    use proto::option_value::Value;
    let (value_type, value) = match v {
        FieldValue::Bool(b) => (proto::ValueType::Bool, Value::Bool(*b)),
        FieldValue::Int(i) => (proto::ValueType::Int, Value::Int(*i)),
        FieldValue::Float(f) => (proto::ValueType::Double, Value::Double(*f)),
        FieldValue::Str(s) => (proto::ValueType::String, Value::String(s.clone())),
    };
    proto::OptionValue {
        value_type: value_type as i32,
        value: Some(value),
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut out_rx: mpsc::Receiver<Outbound>,
    shared: Arc<Shared>,
) {
    loop {
        let out = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            out = out_rx.recv() => match out {
                Some(out) => out,
                None => break,
            },
        };
        match out {
            Outbound::Req(req) => {
                if let Err(e) = write_frame(&mut writer, &req).await {
                    shared.abort(format!("writing to worker failed: {e}"));
                    break;
                }
            }
            Outbound::Close => {
                let _ = writer.shutdown().await;
                break;
            }
        }
    }
}

struct ReaderSlots {
    info_tx: mpsc::Sender<proto::InfoResponse>,
    init_tx: mpsc::Sender<proto::InitResponse>,
    snapshot_tx: mpsc::Sender<proto::SnapshotResponse>,
    restore_tx: mpsc::Sender<proto::RestoreResponse>,
    data_tx: mpsc::Sender<Message>,
}

async fn read_loop<R: AsyncRead + Unpin>(
    reader: R,
    slots: ReaderSlots,
    shared: Arc<Shared>,
) {
    let mut frames = FrameReader::new(reader);
    // The batch currently being reassembled from begin/point/end frames.
    let mut open: Option<BufferedBatch> = None;

    loop {
        let frame = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            frame = frames.read_frame::<proto::Response>() => frame,
        };
        let resp = match frame {
            Ok(Some(resp)) => resp,
            Ok(None) => break,
            Err(e) => {
                shared.abort(format!("reading from worker failed: {e}"));
                break;
            }
        };
        shared.touch();

        let Some(msg) = resp.msg else {
            shared.abort("worker sent an empty response".into());
            break;
        };
        use proto::response::Msg;
        match msg {
            Msg::Info(info) => {
                if slots.info_tx.try_send(info).is_err() {
                    warn!("dropping info response nobody is waiting for");
                }
            }
            Msg::Init(init) => {
                if slots.init_tx.try_send(init).is_err() {
                    warn!("dropping init response nobody is waiting for");
                }
            }
            Msg::Snapshot(snapshot) => {
                if slots.snapshot_tx.try_send(snapshot).is_err() {
                    warn!("dropping snapshot response nobody is waiting for");
                }
            }
            Msg::Restore(restore) => {
                if slots.restore_tx.try_send(restore).is_err() {
                    warn!("dropping restore response nobody is waiting for");
                }
            }
            Msg::Keepalive(_) => {
                // Any response feeds the watchdog; nothing else to do.
                debug!("keepalive response");
            }
            Msg::Error(e) => {
                shared.abort(e.error);
                break;
            }
            Msg::Begin(begin) => {
                if open.is_some() {
                    shared.abort("worker began a batch inside a batch".into());
                    break;
                }
                open = Some(BufferedBatch::new(convert::begin_from_proto(&begin), vec![]));
            }
            Msg::Point(point) => match open.as_mut() {
                Some(batch) => batch.push(convert::batch_point_from_proto(&point)),
                None => {
                    let p = convert::point_from_proto(&point);
                    if slots.data_tx.send(Message::Point(p)).await.is_err() {
                        break;
                    }
                }
            },
            Msg::End(end) => match open.take() {
                Some(mut batch) => {
                    batch.begin.tmax = chrono::TimeZone::timestamp_nanos(&chrono::Utc, end.tmax);
                    if slots
                        .data_tx
                        .send(Message::BufferedBatch(batch))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                None => {
                    shared.abort("worker ended a batch that was never begun".into());
                    break;
                }
            },
        }
    }
}

async fn keepalive_loop(keepalive: Duration, out_tx: mpsc::Sender<Outbound>, shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(keepalive / 2);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // immediate first tick
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let req = proto::Request::of(proto::request::Msg::Keepalive(
                    proto::KeepaliveRequest {
                        time: chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default(),
                    },
                ));
                if out_tx.send(Outbound::Req(req)).await.is_err() {
                    break;
                }
            }
        }
    }
}

async fn watchdog_loop(
    keepalive: Duration,
    on_kill: Box<dyn FnOnce() + Send>,
    terminated: Option<watch::Receiver<bool>>,
    shared: Arc<Shared>,
) {
    let mut ticker = tokio::time::interval(keepalive / 4);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = ticker.tick() => {
                if shared.silence() > keepalive {
                    break;
                }
            }
        }
    }

    warn!(timeout = ?keepalive, "worker missed keepalive deadline, aborting");
    shared.abort(UdfError::KeepaliveTimeout(keepalive).to_string());

    // Escalate: give the worker a grace period to exit, then kill it.
    let grace = (keepalive * 2).max(Duration::from_secs(1));
    match terminated {
        Some(mut rx) => {
            let exited = tokio::time::timeout(grace, async {
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await;
            if exited.is_err() {
                warn!("worker did not exit within the grace period, killing");
                on_kill();
            }
        }
        None => {
            tokio::time::sleep(grace).await;
            on_kill();
        }
    }
}
