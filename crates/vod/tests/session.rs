use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use parking_lot::Mutex;
use replay_rtp::{PacketKind, RtpPacketBuilder, encode_block, encode_record};
use replay_vod::{
    ExecutionRef, MemoryBlockStore, PacketSink, PendingSession, PlayerFanout, RtpPacket, Session,
    SessionState, VodConfig, VodError, VodRequest,
};

mod test_utils {
    use std::sync::Once;

    static INIT: Once = Once::new();

    pub fn init_tracing() {
        INIT.call_once(|| {
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive(tracing::Level::DEBUG.into()),
                )
                .with_test_writer()
                .try_init()
                .ok();
        });
    }
}

const SDP: &str = "v=0\r\n\
    o=- 0 0 IN IP4 127.0.0.1\r\n\
    s=recording\r\n\
    t=0 0\r\n\
    m=video 0 RTP/AVP 96\r\n\
    a=rtpmap:96 H264/90000\r\n\
    a=control:trackID=0\r\n\
    m=audio 0 RTP/AVP 8\r\n\
    a=control:trackID=1\r\n";

const VIDEO_FRAME: u32 = 3600;

fn execution() -> ExecutionRef {
    ExecutionRef::new("task", 7)
}

fn video(seq: u16, ts: u32) -> (PacketKind, Vec<u8>) {
    let rtp = RtpPacketBuilder::new(96, 0x1111)
        .sequence_number(seq)
        .timestamp(ts)
        .marker(true)
        .build(&[0x65, seq as u8]);
    (PacketKind::Video, rtp)
}

fn audio(seq: u16, ts: u32) -> (PacketKind, Vec<u8>) {
    let rtp = RtpPacketBuilder::new(8, 0x2222)
        .sequence_number(seq)
        .timestamp(ts)
        .build(&[0xd5; 4]);
    (PacketKind::Audio, rtp)
}

fn block(packets: &[(PacketKind, Vec<u8>)]) -> Vec<u8> {
    let mut records = Vec::new();
    for (kind, rtp) in packets {
        encode_record(&mut records, *kind, rtp);
    }
    encode_block(&records)
}

fn store_with(sdp: &str, blocks: Vec<Vec<u8>>) -> Arc<MemoryBlockStore> {
    let store = Arc::new(MemoryBlockStore::new());
    store.insert_execution(execution(), sdp);
    for (i, data) in blocks.into_iter().enumerate() {
        store.push_block(&execution(), i as i64 * 10, data);
    }
    store
}

fn config() -> VodConfig {
    VodConfig::default().with_tick_period(Duration::from_millis(5))
}

fn request(start_time: i64) -> VodRequest {
    VodRequest::new("vod-1", "/vod/task/7/0/1", execution(), start_time)
}

#[derive(Default)]
struct RecordingSink {
    packets: Mutex<Vec<(Instant, RtpPacket)>>,
}

impl RecordingSink {
    fn seqs(&self) -> Vec<u16> {
        self.packets
            .lock()
            .iter()
            .map(|(_, p)| p.info.sequence_number)
            .collect()
    }

    fn delivered_at(&self, seq: u16) -> Option<Instant> {
        self.packets
            .lock()
            .iter()
            .find(|(_, p)| p.info.sequence_number == seq)
            .map(|(at, _)| *at)
    }

    fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.packets.lock().len() >= count {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        false
    }
}

impl PacketSink for RecordingSink {
    fn deliver(&self, packet: RtpPacket) {
        self.packets.lock().push((Instant::now(), packet));
    }
}

fn start(store: Arc<MemoryBlockStore>, sink: Arc<RecordingSink>) -> Session {
    PendingSession::resolve(request(0), store, config())
        .expect("session resolves")
        .with_sink(sink)
        .start()
}

#[test]
fn blocks_are_forwarded_in_order() {
    test_utils::init_tracing();

    let blocks = (0..3u16)
        .map(|b| {
            let frames = (0..5u16)
                .map(|f| {
                    let seq = b * 5 + f;
                    video(seq, 1000 + u32::from(seq) * VIDEO_FRAME)
                })
                .collect::<Vec<_>>();
            block(&frames)
        })
        .collect();

    let sink = Arc::new(RecordingSink::default());
    let session = start(store_with(SDP, blocks), sink.clone());

    assert!(sink.wait_for(15, Duration::from_secs(5)));
    assert_eq!(sink.seqs(), (0..15).collect::<Vec<_>>());

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
    assert_eq!(session.state(), SessionState::Stopped);
}

#[test]
fn second_video_second_waits_one_second() {
    test_utils::init_tracing();

    let store = store_with(SDP, vec![block(&[video(0, 1000), video(1, 91_000)])]);
    let sink = Arc::new(RecordingSink::default());

    let before = Instant::now();
    let session = start(store, sink.clone());

    assert!(sink.wait_for(2, Duration::from_secs(5)));
    let first = sink.delivered_at(0).unwrap().duration_since(before);
    let second = sink.delivered_at(1).unwrap().duration_since(before);

    assert!(first < Duration::from_millis(500), "first after {first:?}");
    assert!(second >= Duration::from_secs(1), "second after {second:?}");
    assert!(second < Duration::from_secs(3), "second after {second:?}");

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn positive_scale_speeds_up_playback() {
    test_utils::init_tracing();

    // four seconds of media
    let store = store_with(
        SDP,
        vec![block(&[video(0, 1000), video(1, 1000 + 4 * 90_000)])],
    );
    let sink = Arc::new(RecordingSink::default());

    let before = Instant::now();
    let session = start(store, sink.clone());
    session.set_scale(2).unwrap();

    assert!(sink.wait_for(2, Duration::from_secs(5)));
    let second = sink.delivered_at(1).unwrap().duration_since(before);

    assert!(second >= Duration::from_secs(1), "second after {second:?}");
    assert!(second < Duration::from_secs(3), "second after {second:?}");
    assert_eq!(session.scale(), 2);

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn scale_outside_bounds_is_rejected() {
    test_utils::init_tracing();

    let store = store_with(SDP, vec![block(&[video(0, 1000)])]);
    let session = start(store, Arc::new(RecordingSink::default()));

    assert!(matches!(
        session.set_scale(17),
        Err(VodError::ScaleOutOfRange(17))
    ));
    assert!(matches!(
        session.set_scale(-17),
        Err(VodError::ScaleOutOfRange(-17))
    ));
    assert!(session.set_scale(-16).is_ok());

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn audio_bypasses_the_gate_but_not_before_first_video() {
    test_utils::init_tracing();

    let store = store_with(
        SDP,
        vec![block(&[
            audio(0, 0),
            audio(1, 160),
            video(2, 1000),
            audio(3, u32::MAX),
            video(4, 91_000),
            audio(5, 320),
        ])],
    );
    let sink = Arc::new(RecordingSink::default());

    let before = Instant::now();
    let session = start(store, sink.clone());

    assert!(sink.wait_for(4, Duration::from_secs(5)));
    assert_eq!(sink.seqs(), vec![2, 3, 4, 5]);

    let audio_at = sink.delivered_at(3).unwrap().duration_since(before);
    assert!(audio_at < Duration::from_millis(500), "audio after {audio_at:?}");

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn stop_fires_callbacks_once_in_order() {
    test_utils::init_tracing();

    // five seconds of playback, one frame every 100ms
    let blocks = (0..50u16)
        .map(|i| block(&[video(i, 1000 + u32::from(i) * 9000)]))
        .collect();
    let sink = Arc::new(RecordingSink::default());
    let session = start(store_with(SDP, blocks), sink.clone());

    let fired = Arc::new(Mutex::new(vec![]));
    for n in 1..=3 {
        let fired = fired.clone();
        session.on_stop(move || fired.lock().push(n)).unwrap();
    }

    thread::sleep(Duration::from_millis(300));
    session.stop();
    session.stop();

    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(*fired.lock(), vec![1, 2, 3]);

    session.stop();
    assert_eq!(*fired.lock(), vec![1, 2, 3]);

    assert!(matches!(
        session.on_stop(|| {}),
        Err(VodError::SessionStopped(_))
    ));
    assert!(matches!(
        session.set_scale(1),
        Err(VodError::SessionStopped(_))
    ));

    let delivered = sink.seqs();
    assert!(delivered.len() < 50, "delivered {}", delivered.len());
    assert!(delivered.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn stop_interrupts_a_long_media_gap() {
    test_utils::init_tracing();

    // a minute of media between two frames of the same block
    let store = store_with(
        SDP,
        vec![block(&[video(0, 1000), video(1, 1000 + 60 * 90_000)])],
    );
    let sink = Arc::new(RecordingSink::default());
    let session = start(store, sink.clone());

    assert!(sink.wait_for(1, Duration::from_secs(5)));
    thread::sleep(Duration::from_millis(200));

    let stopping = Instant::now();
    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(2)));
    assert!(stopping.elapsed() < Duration::from_secs(2));
    assert_eq!(session.state(), SessionState::Stopped);
    assert_eq!(sink.seqs(), vec![0]);
}

#[test]
fn callbacks_registered_while_stopping_fire_or_are_rejected() {
    test_utils::init_tracing();

    for _ in 0..200 {
        let store = store_with(
            SDP,
            vec![block(&[video(0, 1000), video(1, 1000 + 60 * 90_000)])],
        );
        let session = start(store, Arc::new(RecordingSink::default()));
        let handle = session.handle();
        let fired = Arc::new(AtomicUsize::new(0));

        let registering = {
            let fired = fired.clone();
            thread::spawn(move || {
                let mut accepted = 0usize;
                for _ in 0..50 {
                    let fired = fired.clone();
                    let registered = handle.on_stop(move || {
                        fired.fetch_add(1, Ordering::SeqCst);
                    });
                    if registered.is_ok() {
                        accepted += 1;
                    }
                }
                accepted
            })
        };

        session.stop();
        let accepted = registering.join().unwrap();
        assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
        assert_eq!(fired.load(Ordering::SeqCst), accepted);
    }
}

#[test]
fn description_clock_rate_drives_pacing() {
    test_utils::init_tracing();

    let sdp = SDP.replace("H264/90000", "H264/45000");
    let store = store_with(&sdp, vec![block(&[video(0, 0), video(1, 45_000)])]);
    let sink = Arc::new(RecordingSink::default());

    let before = Instant::now();
    let session = start(store, sink.clone());

    assert!(sink.wait_for(2, Duration::from_secs(5)));
    let second = sink.delivered_at(1).unwrap().duration_since(before);
    assert!(second >= Duration::from_secs(1), "second after {second:?}");

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[derive(Default)]
struct ThreadNameSink(Mutex<Option<String>>);

impl PacketSink for ThreadNameSink {
    fn deliver(&self, _packet: RtpPacket) {
        *self.0.lock() = thread::current().name().map(str::to_owned);
    }
}

#[test]
fn pipeline_threads_are_named() {
    test_utils::init_tracing();

    let sink = Arc::new(ThreadNameSink::default());
    let store = store_with(SDP, vec![block(&[video(0, 1000)])]);
    let session = PendingSession::resolve(request(0), store, config())
        .expect("session resolves")
        .with_sink(sink.clone())
        .start();

    let deadline = Instant::now() + Duration::from_secs(5);
    while sink.0.lock().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(sink.0.lock().as_deref(), Some("vod-broadcast"));

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn read_failure_stops_the_session() {
    test_utils::init_tracing();

    let store = store_with(
        SDP,
        vec![
            block(&[video(0, 1000)]),
            block(&[video(1, 1000 + VIDEO_FRAME)]),
            block(&[video(2, 1000 + 2 * VIDEO_FRAME)]),
        ],
    );
    store.fail_reads(&execution(), 1);

    let sink = Arc::new(RecordingSink::default());
    let session = start(store, sink.clone());

    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
    assert_eq!(session.state(), SessionState::Stopped);

    let delivered = sink.seqs();
    assert!(!delivered.contains(&1));
    assert!(!delivered.contains(&2));
}

#[test]
fn exhausted_recording_keeps_the_session_running() {
    test_utils::init_tracing();

    let store = store_with(SDP, vec![block(&[video(0, 1000), audio(1, 0)])]);
    let sink = Arc::new(RecordingSink::default());
    let session = start(store, sink.clone());

    assert!(sink.wait_for(2, Duration::from_secs(5)));
    assert!(!session.wait_stopped_timeout(Duration::from_millis(200)));
    assert_eq!(session.state(), SessionState::Running);

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn decode_error_skips_the_rest_of_the_block() {
    test_utils::init_tracing();

    let (kind, rtp) = video(0, 1000);
    let mut records = Vec::new();
    encode_record(&mut records, kind, &rtp);
    // declares far more than the block holds
    records.extend_from_slice(&4096u32.to_le_bytes());
    records.extend_from_slice(&[1, 0x80]);
    let corrupt = encode_block(&records);

    let store = store_with(SDP, vec![corrupt, block(&[video(1, 1000 + VIDEO_FRAME)])]);
    let sink = Arc::new(RecordingSink::default());
    let session = start(store, sink.clone());

    assert!(sink.wait_for(2, Duration::from_secs(5)));
    assert_eq!(sink.seqs(), vec![0, 1]);
    assert_eq!(session.state(), SessionState::Running);

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn playback_starts_at_the_covering_block() {
    test_utils::init_tracing();

    // blocks start at 0, 10 and 20 seconds
    let store = store_with(
        SDP,
        vec![
            block(&[video(0, 1000)]),
            block(&[video(1, 1000 + VIDEO_FRAME)]),
            block(&[video(2, 1000 + 2 * VIDEO_FRAME)]),
        ],
    );
    let sink = Arc::new(RecordingSink::default());
    let session = PendingSession::resolve(request(15), store, config())
        .unwrap()
        .with_sink(sink.clone())
        .start();

    assert_eq!(session.info().start_block.id, 1);
    assert!(sink.wait_for(2, Duration::from_secs(5)));
    assert_eq!(sink.seqs(), vec![1, 2]);

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn session_exposes_tracks_and_source() {
    test_utils::init_tracing();

    let store = store_with(SDP, vec![block(&[video(0, 1000)])]);
    let session = PendingSession::resolve(request(0), store, config())
        .unwrap()
        .start();

    assert_eq!(session.id(), "vod-1");
    assert_eq!(session.path(), "/vod/task/7/0/1");
    assert_eq!(session.source(), "record://task/7");
    assert_eq!(session.sdp_raw(), SDP);
    assert_eq!(session.v_control(), "trackID=0");
    assert_eq!(session.v_codec(), "H264");
    assert_eq!(session.a_control(), ["trackID=1", "not set up audio 02"]);
    assert_eq!(session.a_codec(), ["PCMA", "invalid codec"]);
    assert_eq!(session.scale(), 0);

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn players_receive_forwarded_packets() {
    test_utils::init_tracing();

    let store = store_with(
        SDP,
        vec![block(&[video(0, 1000), audio(1, 0), video(2, 1000 + VIDEO_FRAME)])],
    );
    let players = Arc::new(PlayerFanout::new(16));
    let player = players.add_player("player-1");

    let session = PendingSession::resolve(request(0), store, config())
        .unwrap()
        .with_players(players.clone())
        .start();
    assert!(Arc::ptr_eq(session.players().unwrap(), &players));

    let seqs = (0..3)
        .map(|_| {
            player
                .recv_timeout(Duration::from_secs(5))
                .map(|p| p.info.sequence_number)
        })
        .collect::<Result<Vec<_>, _>>()
        .expect("three packets");
    assert_eq!(seqs, vec![0, 1, 2]);

    session.stop();
    assert!(session.wait_stopped_timeout(Duration::from_secs(5)));
}

#[test]
fn malformed_description_is_rejected() {
    test_utils::init_tracing();

    let store = store_with("this is not a session description", vec![block(&[])]);
    let result = PendingSession::resolve(request(0), store, config());

    assert!(matches!(result, Err(VodError::SdpMalformed(_))));
}

#[test]
fn missing_execution_is_a_storage_error() {
    test_utils::init_tracing();

    let store = Arc::new(MemoryBlockStore::new());
    let result = PendingSession::resolve(request(0), store, config());

    assert!(matches!(result, Err(VodError::Storage(_))));
}
