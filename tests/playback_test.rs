use std::io::{ErrorKind, Read, Write};
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use pcm_multi::{
    ClientId, ClientState, MultiConfig, MultiError, MultiState, PcmFormat, PcmMode, PcmMulti,
    TransportPcm, TransportSignal, Volume,
};

const CHANNELS: u8 = 2;
const PERIOD_FRAMES: usize = 64;
const TRANSFER_SAMPLES: usize = PERIOD_FRAMES * CHANNELS as usize;
const PERIOD_BYTES: usize = TRANSFER_SAMPLES * 2;

fn sink(config: MultiConfig) -> (Arc<PcmMulti>, Receiver<TransportSignal>) {
    pcm_multi::init_tracing();
    let (transport, signals) = TransportPcm::new(PcmMode::Sink, PcmFormat::S16Le, CHANNELS, 48_000);
    let multi = PcmMulti::create(Arc::new(transport), config).expect("create multi");
    (Arc::new(multi), signals)
}

fn initialized_sink() -> (Arc<PcmMulti>, Receiver<TransportSignal>) {
    let (multi, signals) = sink(MultiConfig::default());
    multi.init(TRANSFER_SAMPLES).expect("init multi");
    (multi, signals)
}

struct TestClient {
    id: ClientId,
    audio: UnixStream,
    control: UnixStream,
}

impl TestClient {
    fn connect(multi: &PcmMulti) -> Self {
        let (audio, audio_peer) = UnixStream::pair().unwrap();
        let (control, control_peer) = UnixStream::pair().unwrap();
        let id = multi
            .add_client(OwnedFd::from(audio_peer), OwnedFd::from(control_peer))
            .expect("add client");
        control
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        Self { id, audio, control }
    }

    fn send(&mut self, token: &[u8]) -> Vec<u8> {
        self.control.write_all(token).unwrap();
        let mut reply = [0u8; 16];
        let len = self.control.read(&mut reply).expect("control reply");
        reply[..len].to_vec()
    }

    fn write_periods(&mut self, periods: usize, first_sample: usize) {
        let samples: Vec<u8> = (first_sample..first_sample + periods * TRANSFER_SAMPLES)
            .flat_map(|n| ramp_sample(n).to_le_bytes())
            .collect();
        self.audio.write_all(&samples).unwrap();
    }

    fn state(&self, multi: &PcmMulti) -> Option<ClientState> {
        multi.status().client(self.id).map(|client| client.state)
    }
}

/// Never zero, so leading silence can be told apart from client audio.
fn ramp_sample(n: usize) -> i16 {
    (n % 20_000) as i16 + 1
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Drains the mix the way a transport thread would, until stopped.
struct Reader {
    stop: Arc<AtomicBool>,
    samples: Arc<AtomicUsize>,
    handle: JoinHandle<Vec<i16>>,
}

impl Reader {
    fn spawn(multi: &Arc<PcmMulti>) -> Self {
        let multi = Arc::clone(multi);
        let stop = Arc::new(AtomicBool::new(false));
        let samples = Arc::new(AtomicUsize::new(0));
        let handle = {
            let stop = Arc::clone(&stop);
            let samples = Arc::clone(&samples);
            thread::spawn(move || {
                let mut collected = Vec::new();
                let mut buffer = vec![0u8; PERIOD_BYTES];
                while !stop.load(Ordering::Relaxed) {
                    match multi.read(&mut buffer, TRANSFER_SAMPLES) {
                        Ok(0) => break,
                        Ok(read) => {
                            collected.extend(
                                buffer[..read * 2]
                                    .chunks_exact(2)
                                    .map(|raw| i16::from_le_bytes([raw[0], raw[1]])),
                            );
                            samples.fetch_add(read, Ordering::Relaxed);
                        }
                        Err(MultiError::TryAgain) => thread::sleep(Duration::from_millis(1)),
                        Err(err) => panic!("read failed: {err}"),
                    }
                }
                collected
            })
        };
        Self {
            stop,
            samples,
            handle,
        }
    }

    fn samples(&self) -> usize {
        self.samples.load(Ordering::Relaxed)
    }

    fn finish(self) -> Vec<i16> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.join().unwrap()
    }
}

#[test]
fn client_joins_mix_after_threshold() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);

    // Exactly the threshold is not enough.
    client.write_periods(2, 0);
    assert!(wait_until(Duration::from_secs(1), || {
        multi.status().client(client.id).map(|c| c.buffered_bytes) == Some(2 * PERIOD_BYTES)
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(client.state(&multi), Some(ClientState::Idle));
    assert_eq!(multi.status().active_count, 0);

    client.audio.write_all(&[1]).unwrap();
    assert!(wait_until(Duration::from_secs(1), || {
        client.state(&multi) == Some(ClientState::Running)
    }));
    assert_eq!(multi.status().active_count, 1);
}

#[test]
fn mixed_audio_reaches_transport_in_order() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);
    client.write_periods(16, 0);

    let reader = Reader::spawn(&multi);
    // The tail stays below the start threshold, so only a prefix comes out.
    let expected_min = 8 * TRANSFER_SAMPLES;
    assert!(wait_until(Duration::from_secs(2), || {
        reader.samples() >= expected_min + 2 * TRANSFER_SAMPLES
    }));
    thread::sleep(Duration::from_millis(50));
    let collected = reader.finish();

    let audio: Vec<i16> = collected.into_iter().skip_while(|&s| s == 0).collect();
    assert!(
        audio.len() >= expected_min,
        "only {} samples reached the transport",
        audio.len()
    );
    let expected: Vec<i16> = (0..audio.len()).map(ramp_sample).collect();
    assert_eq!(audio, expected);
}

#[test]
fn drain_completes_within_timeout() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);
    client.write_periods(8, 0);
    assert!(wait_until(Duration::from_secs(1), || {
        client.state(&multi) == Some(ClientState::Running)
    }));

    // Nothing is read from the mix yet, so the reply has to wait.
    let started = Instant::now();
    client.control.write_all(b"Drain").unwrap();
    thread::sleep(Duration::from_millis(20));
    client.control.set_nonblocking(true).unwrap();
    let mut reply = [0u8; 16];
    let pending = client.control.read(&mut reply).unwrap_err();
    assert_eq!(pending.kind(), ErrorKind::WouldBlock);
    client.control.set_nonblocking(false).unwrap();

    let reader = Reader::spawn(&multi);
    let len = client.control.read(&mut reply).expect("drain reply");
    assert_eq!(&reply[..len], b"OK");
    let elapsed = started.elapsed();
    assert!(elapsed < Duration::from_millis(900), "drain took {elapsed:?}");
    assert_eq!(client.state(&multi), Some(ClientState::Idle));
    assert_eq!(multi.status().active_count, 0);
    reader.finish();
}

#[test]
fn drain_of_idle_client_replies_at_once() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);
    let started = Instant::now();
    assert_eq!(client.send(b"Drain"), b"OK");
    assert!(started.elapsed() < Duration::from_millis(300));
}

#[test]
fn pause_and_resume_keep_client_session() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);
    client.write_periods(3, 0);
    assert!(wait_until(Duration::from_secs(1), || {
        client.state(&multi) == Some(ClientState::Running)
    }));

    assert_eq!(client.send(b"Pause"), b"OK");
    let status = multi.status();
    let paused = status.client(client.id).unwrap();
    assert_eq!(paused.state, ClientState::Paused);
    assert!(!paused.watching);
    assert_eq!(status.active_count, 0);

    assert_eq!(client.send(b"Resume"), b"OK");
    assert_eq!(client.state(&multi), Some(ClientState::Running));
    assert_eq!(multi.status().active_count, 1);
}

#[test]
fn paused_client_holds_its_place_in_the_mix() {
    // A high start threshold keeps the mix filling while nobody reads it.
    let (multi, _signals) = sink(MultiConfig {
        mix_threshold: 12,
        ..MultiConfig::default()
    });
    multi.init(TRANSFER_SAMPLES).unwrap();
    let mut client = TestClient::connect(&multi);
    client.write_periods(3, 0);
    assert!(wait_until(Duration::from_secs(1), || {
        client.state(&multi) == Some(ClientState::Running) && multi.status().mix_avail > 0
    }));

    assert_eq!(client.send(b"Pause"), b"OK");
    client.write_periods(3, 3 * TRANSFER_SAMPLES);
    let before = multi.status();
    let before_delay = before.client(client.id).unwrap().mix_delay;
    thread::sleep(Duration::from_millis(100));
    let after = multi.status();
    assert_eq!(after.mix_avail, before.mix_avail);
    assert_eq!(after.client(client.id).unwrap().mix_delay, before_delay);

    assert_eq!(client.send(b"Resume"), b"OK");
    assert!(wait_until(Duration::from_secs(1), || {
        multi.status().mix_avail > before.mix_avail
    }));
}

#[test]
fn drop_discards_buffered_audio() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);
    client.write_periods(6, 0);
    assert!(wait_until(Duration::from_secs(1), || {
        client.state(&multi) == Some(ClientState::Running)
    }));

    assert_eq!(client.send(b"Drop"), b"OK");
    let status = multi.status();
    let dropped = status.client(client.id).unwrap();
    assert_eq!(dropped.state, ClientState::Idle);
    assert_eq!(dropped.buffered_bytes, 0);
    assert!(!dropped.watching);

    assert_eq!(client.send(b"Resume"), b"OK");
    assert!(multi.status().client(client.id).unwrap().watching);
}

#[test]
fn unknown_command_is_rejected() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);
    assert_eq!(client.send(b"Bogus"), b"Invalid");
    assert_eq!(client.send(b"Pause"), b"OK");
}

#[test]
fn last_disconnect_finishes_multi() {
    let (multi, signals) = initialized_sink();
    let first = TestClient::connect(&multi);
    let second = TestClient::connect(&multi);
    assert_eq!(signals.recv_timeout(Duration::from_secs(1)), Ok(TransportSignal::PcmOpen));
    assert_eq!(multi.client_count(), 2);

    drop(first);
    assert!(wait_until(Duration::from_secs(1), || multi.client_count() == 1));
    assert_ne!(multi.state(), MultiState::Finished);

    drop(second);
    assert!(wait_until(Duration::from_secs(1), || multi.client_count() == 0));
    assert!(wait_until(Duration::from_secs(1), || {
        multi.state() == MultiState::Finished
    }));
    assert_eq!(signals.recv_timeout(Duration::from_secs(1)), Ok(TransportSignal::PcmClose));

    let mut buffer = [0u8; PERIOD_BYTES];
    assert_eq!(multi.read(&mut buffer, TRANSFER_SAMPLES).unwrap(), 0);

    // A new client brings the multi back.
    let _third = TestClient::connect(&multi);
    assert_eq!(multi.state(), MultiState::Init);
    assert!(matches!(
        multi.read(&mut buffer, TRANSFER_SAMPLES),
        Err(MultiError::TryAgain)
    ));
}

#[test]
fn client_limit_is_enforced() {
    let (multi, _signals) = sink(MultiConfig {
        max_clients: 2,
        ..MultiConfig::default()
    });
    let _a = TestClient::connect(&multi);
    let _b = TestClient::connect(&multi);
    let (_, audio) = UnixStream::pair().unwrap();
    let (_, control) = UnixStream::pair().unwrap();
    assert!(matches!(
        multi.add_client(OwnedFd::from(audio), OwnedFd::from(control)),
        Err(MultiError::TooManyClients(2))
    ));
}

#[test]
fn concurrent_adds_respect_client_limit() {
    let (multi, _signals) = sink(MultiConfig {
        max_clients: 2,
        ..MultiConfig::default()
    });
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let multi = Arc::clone(&multi);
            thread::spawn(move || {
                let (audio, audio_peer) = UnixStream::pair().unwrap();
                let (control, control_peer) = UnixStream::pair().unwrap();
                let added = multi
                    .add_client(OwnedFd::from(audio_peer), OwnedFd::from(control_peer))
                    .is_ok();
                (added, audio, control)
            })
        })
        .collect();
    let results: Vec<_> = workers
        .into_iter()
        .map(|worker| worker.join().unwrap())
        .collect();

    let added = results.iter().filter(|(added, _, _)| *added).count();
    assert_eq!(added, 2);
    assert_eq!(multi.client_count(), 2);
}

#[test]
fn clients_added_early_start_on_init() {
    let (multi, _signals) = sink(MultiConfig::default());
    assert!(matches!(
        multi.init(1),
        Err(MultiError::InvalidParameters(_))
    ));

    let client = TestClient::connect(&multi);
    let early = multi.status();
    assert!(!early.client(client.id).unwrap().watching);

    multi.init(TRANSFER_SAMPLES).unwrap();
    let status = multi.status();
    let ready = status.client(client.id).unwrap();
    assert_eq!(ready.state, ClientState::Idle);
    assert!(ready.watching);
}

#[test]
fn reset_closes_every_client() {
    let (multi, _signals) = initialized_sink();
    let mut client = TestClient::connect(&multi);
    multi.reset();
    assert_eq!(multi.client_count(), 0);
    assert_eq!(multi.state(), MultiState::Init);

    let mut reply = [0u8; 4];
    assert_eq!(client.control.read(&mut reply).unwrap(), 0);
}

#[test]
fn muted_transport_reads_silence() {
    let (multi, _signals) = initialized_sink();
    for channel in 0..CHANNELS as usize {
        multi.transport().set_volume(
            channel,
            Volume {
                level: 0,
                muted: true,
            },
        );
    }
    let mut client = TestClient::connect(&multi);
    client.write_periods(8, 0);

    let reader = Reader::spawn(&multi);
    assert!(wait_until(Duration::from_secs(2), || {
        reader.samples() >= 4 * TRANSFER_SAMPLES
    }));
    assert!(multi.transport().delay() > 0);
    let collected = reader.finish();
    assert!(collected.iter().all(|&sample| sample == 0));
}
