use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::Duration,
};

use chrono::{DateTime, Utc};
use flume::{Receiver, RecvTimeoutError, Sender};
use indexmap::IndexMap;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::{
    MAX_SCALE, VodConfig, VodError,
    fanout::PlayerFanout,
    pacing::Pacer,
    producer::BlockProducer,
    queue::{Broadcaster, DeliveryQueue, PacketSink},
    sdp::{AUDIO_SLOTS, TrackSet},
    storage::{BlockMeta, BlockStore, ExecutionRef},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopped,
}

/// What a client asked to play.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VodRequest {
    pub id: String,
    pub path: String,
    pub execution: ExecutionRef,
    /// Playback start, in seconds on the recording's time axis.
    pub start_time: i64,
}

impl VodRequest {
    pub fn new(
        id: impl Into<String>,
        path: impl Into<String>,
        execution: ExecutionRef,
        start_time: i64,
    ) -> Self {
        Self {
            id: id.into(),
            path: path.into(),
            execution,
            start_time,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub path: String,
    pub execution: ExecutionRef,
    pub start_block: BlockMeta,
    pub sdp_raw: String,
    pub tracks: TrackSet,
}

impl SessionInfo {
    pub fn source(&self) -> String {
        format!(
            "record://{}/{}",
            self.execution.task_id, self.execution.execute_id
        )
    }
}

type StopCallback = Box<dyn FnOnce() + Send>;

enum Command {
    Stop,
    SetScale(i32),
    OnStop(StopCallback),
}

/// Cloneable control surface of a running session.
///
/// Every request is handled by the session's actor thread, in the order sent.
#[derive(Clone)]
pub struct SessionHandle {
    id: String,
    commands: Sender<Command>,
    // `true` while stop callbacks are accepted; held for reading across each `OnStop` send
    accepting: Arc<RwLock<bool>>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Requests a stop. Returns without waiting for the pipeline to wind down.
    pub fn stop(&self) {
        if self.commands.send(Command::Stop).is_err() {
            warn!(id = %self.id, "VOD stop may be called twice");
        }
    }

    pub fn set_scale(&self, scale: i32) -> Result<(), VodError> {
        if !(-MAX_SCALE..=MAX_SCALE).contains(&scale) {
            return Err(VodError::ScaleOutOfRange(scale));
        }

        self.commands
            .send(Command::SetScale(scale))
            .map_err(|_| VodError::SessionStopped(self.id.clone()))
    }

    /// Registers `callback` to run once the session has fully stopped.
    ///
    /// Callbacks run on the session's actor thread in registration order and must not
    /// wait for the same session to stop.
    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), VodError> {
        let accepting = self.accepting.read();
        if !*accepting {
            return Err(VodError::SessionStopped(self.id.clone()));
        }

        self.commands
            .send(Command::OnStop(Box::new(callback)))
            .map_err(|_| VodError::SessionStopped(self.id.clone()))
    }
}

/// A resolved session that has not started yet.
pub struct PendingSession {
    info: SessionInfo,
    store: Arc<dyn BlockStore>,
    config: VodConfig,
    sink: Option<Arc<dyn PacketSink>>,
    players: Option<Arc<PlayerFanout>>,
}

impl PendingSession {
    /// Looks up the start block and session description of the requested execution.
    pub fn resolve(
        request: VodRequest,
        store: Arc<dyn BlockStore>,
        config: VodConfig,
    ) -> Result<Self, VodError> {
        config.validate()?;

        let VodRequest {
            id,
            path,
            execution,
            start_time,
        } = request;

        let start_block = store.block_at(&execution, start_time)?;
        let sdp_raw = store.execution(&execution)?.sdp_raw;

        let tracks = TrackSet::from_sdp(&sdp_raw).inspect_err(|e| {
            error!(id = %id, sdp = %sdp_raw, "New VOD: {e}");
        })?;

        Ok(Self {
            info: SessionInfo {
                id,
                path,
                execution,
                start_block,
                sdp_raw,
                tracks,
            },
            store,
            config,
            sink: None,
            players: None,
        })
    }

    /// Delivers forwarded packets to `sink` instead of a [`PlayerFanout`].
    pub fn with_sink(mut self, sink: Arc<dyn PacketSink>) -> Self {
        self.sink = Some(sink);
        self.players = None;
        self
    }

    /// Delivers forwarded packets to an existing fan-out, so players can attach before
    /// the first packet is paced.
    pub fn with_players(mut self, players: Arc<PlayerFanout>) -> Self {
        self.players = Some(players);
        self.sink = None;
        self
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn start(self) -> Session {
        let Self {
            info,
            store,
            config,
            sink,
            players,
        } = self;

        let id = info.id.clone();
        let start_at = Utc::now();

        let (command_tx, command_rx) = flume::bounded(config.command_queue_length);
        let (stop_tx, stop_rx) = flume::bounded::<()>(0);
        let (blocks_tx, blocks_rx) = flume::bounded(1);
        let (done_tx, done_rx) = flume::bounded(0);
        let (state_tx, state_rx) = watch::channel(SessionState::Running);
        let (scale_tx, scale_rx) = watch::channel(0);

        let accepting = Arc::new(RwLock::new(true));
        let handle = SessionHandle {
            id: id.clone(),
            commands: command_tx,
            accepting: accepting.clone(),
        };

        let (players, sink) = match sink {
            Some(sink) => (None, sink),
            None => {
                let fanout = players
                    .unwrap_or_else(|| Arc::new(PlayerFanout::new(config.player_queue_length)));
                (Some(fanout.clone()), fanout as Arc<dyn PacketSink>)
            }
        };
        let (queue, queue_rx) = DeliveryQueue::bounded(id.clone(), config.send_queue_length);

        let mut tasks = IndexMap::new();

        let producer = BlockProducer {
            id: id.clone(),
            store,
            start: info.start_block.clone(),
            blocks_tx,
            blocks_drain: blocks_rx.clone(),
            stop_rx: stop_rx.clone(),
            session: handle.clone(),
        };
        spawn_task(&mut tasks, &id, "read-block", move || producer.run());

        let mut rules = config.pacing_rules();
        if let Some(clock_rate) = info.tracks.video_clock_rate() {
            rules.video_clock_rate = clock_rate;
        }

        let pacer = Pacer {
            id: id.clone(),
            blocks_rx,
            queue,
            scale_rx: scale_rx.clone(),
            stop_rx: stop_rx.clone(),
            rules,
            tick_period: config.tick_period(),
            session: handle.clone(),
        };
        spawn_task(&mut tasks, &id, "send-control", move || pacer.run());

        let broadcaster = Broadcaster {
            id: id.clone(),
            rx: queue_rx,
            sink,
        };
        spawn_task(&mut tasks, &id, "broadcast", move || broadcaster.run());

        let actor = SessionActor {
            id: id.clone(),
            commands: command_rx,
            accepting,
            stop_tx,
            tasks,
            state_tx,
            scale_tx,
            callbacks: vec![],
            _done: done_tx,
        };
        spawn_traced(&id, "actor", move || actor.run());

        info!(
            id = %id,
            source = %info.source(),
            block_id = info.start_block.id,
            "VOD started"
        );

        Session {
            info,
            start_at,
            handle,
            state_rx,
            scale_rx,
            done_rx,
            players,
        }
    }
}

fn spawn_traced(id: &str, name: &str, launch: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    let dispatcher = tracing::dispatcher::get_default(|d| d.clone());
    let span = tracing::error_span!("vod", id = %id, task = name);

    thread::Builder::new()
        .name(format!("vod-{name}"))
        .spawn(move || tracing::dispatcher::with_default(&dispatcher, || span.in_scope(launch)))
        .expect("Failed to spawn VOD thread")
}

fn spawn_task(
    tasks: &mut IndexMap<String, JoinHandle<()>>,
    id: &str,
    name: &str,
    launch: impl FnOnce() + Send + 'static,
) {
    let join_handle = spawn_traced(id, name, launch);
    tasks.insert(name.to_string(), join_handle);
}

/// Owns the mutable state of one session and performs the stop transition.
struct SessionActor {
    id: String,
    commands: Receiver<Command>,
    accepting: Arc<RwLock<bool>>,
    stop_tx: Sender<()>,
    tasks: IndexMap<String, JoinHandle<()>>,
    state_tx: watch::Sender<SessionState>,
    scale_tx: watch::Sender<i32>,
    callbacks: Vec<StopCallback>,
    // disconnects waiters in `Session::wait_stopped` when the actor exits
    _done: Sender<()>,
}

impl SessionActor {
    fn run(mut self) {
        while let Ok(command) = self.commands.recv() {
            match command {
                Command::Stop => break,
                Command::SetScale(scale) => {
                    let previous = self.scale_tx.send_replace(scale);
                    info!(id = %self.id, previous, scale, "VOD scale changed");
                }
                Command::OnStop(callback) => self.callbacks.push(callback),
            }
        }

        // reached on Stop, or once every handle has been dropped
        self.stop();
    }

    fn stop(self) {
        let Self {
            id,
            commands,
            accepting,
            stop_tx,
            tasks,
            state_tx,
            scale_tx: _,
            mut callbacks,
            _done,
        } = self;

        if *state_tx.borrow() != SessionState::Running {
            return;
        }

        close_commands(&commands, &accepting, &mut callbacks);
        drop(commands);

        // disconnecting wakes both the producer and a pacer waiting on a tick
        drop(stop_tx);

        for (name, task) in tasks {
            if task.join().is_err() {
                error!(id = %id, task = %name, "VOD task panicked");
            }
        }

        state_tx.send_replace(SessionState::Stopped);
        info!(id = %id, callbacks = callbacks.len(), "VOD stopped");

        for callback in callbacks {
            callback();
        }
    }
}

/// Stops accepting callbacks and collects every `OnStop` already queued.
///
/// A registration holds the read side of `accepting` for the whole send, so once the write
/// side has been taken no accepted callback can still be in flight. The queue is drained
/// while waiting for it, since a registration may be blocked on a full queue.
fn close_commands(
    commands: &Receiver<Command>,
    accepting: &RwLock<bool>,
    callbacks: &mut Vec<StopCallback>,
) {
    let mut keep_callbacks = || {
        for command in commands.drain() {
            if let Command::OnStop(callback) = command {
                callbacks.push(callback);
            }
        }
    };

    loop {
        keep_callbacks();
        if let Some(mut open) = accepting.try_write_for(Duration::from_millis(1)) {
            *open = false;
            break;
        }
    }
    keep_callbacks();
}

/// A running (or finished) VOD session.
///
/// A session whose handles have all been dropped stops on its own once the recording is
/// exhausted.
pub struct Session {
    info: SessionInfo,
    start_at: DateTime<Utc>,
    handle: SessionHandle,
    state_rx: watch::Receiver<SessionState>,
    scale_rx: watch::Receiver<i32>,
    done_rx: Receiver<()>,
    players: Option<Arc<PlayerFanout>>,
}

impl Session {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn path(&self) -> &str {
        &self.info.path
    }

    pub fn source(&self) -> String {
        self.info.source()
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn execution(&self) -> &ExecutionRef {
        &self.info.execution
    }

    pub fn sdp_raw(&self) -> &str {
        &self.info.sdp_raw
    }

    pub fn tracks(&self) -> &TrackSet {
        &self.info.tracks
    }

    pub fn v_control(&self) -> &str {
        self.info.tracks.video_control()
    }

    pub fn v_codec(&self) -> &str {
        self.info.tracks.video_codec()
    }

    pub fn a_control(&self) -> [&str; AUDIO_SLOTS] {
        self.info.tracks.audio_controls()
    }

    pub fn a_codec(&self) -> [&str; AUDIO_SLOTS] {
        self.info.tracks.audio_codecs()
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        self.start_at
    }

    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn scale(&self) -> i32 {
        *self.scale_rx.borrow()
    }

    /// The session's fan-out, unless it was started with a custom sink.
    pub fn players(&self) -> Option<&Arc<PlayerFanout>> {
        self.players.as_ref()
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    pub fn stop(&self) {
        self.handle.stop();
    }

    pub fn set_scale(&self, scale: i32) -> Result<(), VodError> {
        self.handle.set_scale(scale)
    }

    pub fn on_stop(&self, callback: impl FnOnce() + Send + 'static) -> Result<(), VodError> {
        self.handle.on_stop(callback)
    }

    /// Blocks until the session has stopped and every stop callback has returned.
    pub fn wait_stopped(&self) {
        let _ = self.done_rx.recv();
    }

    /// Like [`Session::wait_stopped`], returning `false` if `timeout` elapsed first.
    pub fn wait_stopped_timeout(&self, timeout: Duration) -> bool {
        matches!(
            self.done_rx.recv_timeout(timeout),
            Err(RecvTimeoutError::Disconnected)
        )
    }
}
