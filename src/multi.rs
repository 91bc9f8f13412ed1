//! Multi-client aggregator for one transport PCM.
//!
//! A [`PcmMulti`] owns the clients of a transport PCM and a worker thread that
//! services them. In playback mode the thread mixes client audio into a
//! [`MixBuffer`] which the transport thread drains with [`PcmMulti::read`]. In
//! capture mode the transport thread hands every decoded buffer to
//! [`PcmMulti::write`], which queues a copy for each client, and the thread
//! writes those copies out.
//!
//! The transport-facing entry points never block on client I/O. They share a
//! single mutex with the worker thread, which only ever performs non-blocking
//! descriptor operations while holding it.

use std::collections::HashMap;
use std::os::fd::{BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

use nix::sys::epoll::{EpollEvent, EpollFlags};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::MultiError;
use crate::client::{ClientParams, ClientState, PcmClient, Session};
use crate::config::MultiConfig;
use crate::control::status::MultiStatus;
use crate::event::{ClientId, DataReady, EventToken, Poller, WakeChannel, WakeMessage};
use crate::mix::MixBuffer;
use crate::transport::{PcmMode, TransportPcm, TransportSignal};

/// Aggregator state.
///
/// Playback moves `Init → Running → Init` as the mix fills and runs low.
/// Capture moves `Init → Running ⇄ Paused`. Both end in `Finished` when the
/// last client leaves or the worker thread is shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MultiState {
    /// Waiting for enough audio, or for the first client.
    Init = 0,
    /// Audio is flowing to or from the transport.
    Running = 1,
    /// No capture client is consuming audio.
    Paused = 2,
    /// The worker thread has stopped.
    Finished = 3,
}

impl MultiState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => MultiState::Init,
            1 => MultiState::Running,
            2 => MultiState::Paused,
            _ => MultiState::Finished,
        }
    }
}

struct Inner {
    clients: HashMap<ClientId, PcmClient>,
    next_client_id: u32,
    active_count: usize,
    mix: Option<MixBuffer>,
    params: Option<ClientParams>,
    period_frames: usize,
    start_threshold: usize,
    delay: u32,
}

impl Inner {
    fn split<'a>(
        &'a mut self,
        poller: &'a Poller,
    ) -> (&'a mut HashMap<ClientId, PcmClient>, Session<'a>) {
        (
            &mut self.clients,
            Session {
                poller,
                mix: self.mix.as_mut(),
                active_count: &mut self.active_count,
            },
        )
    }

    /// Close and drop one client. Returns the number of clients remaining.
    fn remove_client(&mut self, id: ClientId, poller: &Poller) -> usize {
        let (clients, mut session) = self.split(poller);
        if let Some(mut client) = clients.remove(&id) {
            client.finish(&mut session);
            debug!(client = %id, total = clients.len(), "Removed client");
        }
        self.clients.len()
    }

    /// Remove every finished client. Returns whether any were removed.
    fn reap(&mut self, poller: &Poller) -> bool {
        let finished: Vec<ClientId> = self
            .clients
            .values()
            .filter(|client| client.state() == ClientState::Finished)
            .map(PcmClient::id)
            .collect();
        for id in &finished {
            self.remove_client(*id, poller);
        }
        !finished.is_empty()
    }

    fn init_clients(&mut self, params: ClientParams, poller: &Poller) {
        let (clients, mut session) = self.split(poller);
        let mut failed = Vec::new();
        for client in clients.values_mut() {
            if !client.is_initialized() && client.init(params, &mut session).is_err() {
                failed.push(client.id());
            }
        }
        for id in failed {
            self.remove_client(id, poller);
        }
    }

    fn update_mix(&mut self, poller: &Poller) {
        let (clients, mut session) = self.split(poller);
        for client in clients.values_mut() {
            client.deliver(&mut session);
        }
    }

    fn mix_ready(&self) -> bool {
        self.mix
            .as_ref()
            .is_some_and(|mix| mix.avail() > self.start_threshold)
    }
}

struct Shared {
    transport: Arc<TransportPcm>,
    config: MultiConfig,
    poller: Poller,
    wake: WakeChannel,
    data_ready: DataReady,
    state: AtomicU8,
    inner: Mutex<Inner>,
}

impl Shared {
    fn state(&self) -> MultiState {
        MultiState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: MultiState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn is_playback(&self) -> bool {
        self.transport.mode() == PcmMode::Sink
    }

    fn event_buffer(&self) -> Vec<EpollEvent> {
        vec![EpollEvent::empty(); 1 + self.config.max_clients * 3]
    }

    /// Called with the lock held once a removal has left no clients. The
    /// worker thread exits afterwards.
    fn last_client_gone(&self) {
        debug!("Last client removed");
        self.set_state(MultiState::Finished);
        self.transport.send_signal(TransportSignal::PcmClose);
    }

    fn update_delay(&self, inner: &mut Inner) {
        let Some(mix) = inner.mix.as_ref() else {
            return;
        };
        let frames = if self.state() == MultiState::Running {
            // Clients sit at different fill levels, so only an overall
            // approximation is possible once mixing is under way.
            inner.period_frames * (self.config.mix_threshold + self.config.client_threshold)
        } else {
            // Before the mix starts, count what is actually buffered so the
            // reported delay does not jump when the first client starts.
            let newest = inner.clients.values().max_by_key(|client| client.id());
            mix.avail() / mix.channels()
                + newest.map_or(0, |client| client.buffered_bytes() / mix.frame_size())
        };
        let rate = u64::from(self.transport.sampling_rate().max(1));
        let delay = u32::try_from(frames as u64 * 10_000 / rate).unwrap_or(u32::MAX);
        inner.delay = delay;
        self.transport.set_delay(delay);
    }

    fn run_mix(&self) {
        debug!("Starting PCM mix loop");
        let mut events = self.event_buffer();

        'poll: loop {
            let count = match self.poller.wait(&mut events) {
                Ok(count) => count,
                Err(err) => {
                    error!("PCM mix epoll wait failed: {err}");
                    break;
                }
            };

            for event in &events[..count] {
                match EventToken::decode(event.data()) {
                    Some(EventToken::MultiWake) => {
                        if self.wake.take() == Some(WakeMessage::Shutdown) {
                            break 'poll;
                        }
                        let mut inner = self.inner.lock();
                        inner.update_mix(&self.poller);
                        if inner.reap(&self.poller) {
                            if inner.clients.is_empty() {
                                self.last_client_gone();
                                break 'poll;
                            }
                            // The rest of this batch may refer to removed clients.
                            break;
                        }
                    }
                    Some(EventToken::Client(id, kind)) => {
                        let mut inner = self.inner.lock();
                        let (clients, mut session) = inner.split(&self.poller);
                        let Some(client) = clients.get_mut(&id) else {
                            continue;
                        };
                        client.handle_event(kind, false, &mut session);
                        if client.state() == ClientState::Finished {
                            if inner.remove_client(id, &self.poller) == 0 {
                                self.last_client_gone();
                                break 'poll;
                            }
                            break;
                        }
                    }
                    None => {}
                }
            }

            let mut inner = self.inner.lock();
            if inner.clients.is_empty() {
                continue;
            }
            match self.state() {
                MultiState::Running => {
                    if inner.mix_ready() {
                        self.data_ready.raise();
                    } else {
                        debug!("PCM mix running low");
                        self.set_state(MultiState::Init);
                    }
                }
                MultiState::Init => {
                    inner.update_mix(&self.poller);
                    if inner.mix_ready() {
                        self.set_state(MultiState::Running);
                        self.update_delay(&mut inner);
                        self.data_ready.raise();
                    } else {
                        self.update_delay(&mut inner);
                    }
                }
                _ => {}
            }
        }

        self.set_state(MultiState::Finished);
        self.data_ready.raise();
        debug!("PCM mix loop terminated");
    }

    fn run_snoop(&self) {
        debug!("Starting PCM snoop loop");
        let mut events = self.event_buffer();

        'poll: loop {
            let count = match self.poller.wait(&mut events) {
                Ok(count) => count,
                Err(err) => {
                    error!("PCM snoop epoll wait failed: {err}");
                    break;
                }
            };

            for event in &events[..count] {
                match EventToken::decode(event.data()) {
                    Some(EventToken::MultiWake) => {
                        if self.wake.take() == Some(WakeMessage::Shutdown) {
                            break 'poll;
                        }
                        let mut inner = self.inner.lock();
                        let (clients, mut session) = inner.split(&self.poller);
                        for client in clients.values_mut() {
                            if client.state() == ClientState::Running {
                                client.flush(&mut session);
                            }
                        }
                        let removed = inner.reap(&self.poller);
                        if removed && inner.clients.is_empty() {
                            self.last_client_gone();
                            break 'poll;
                        }
                        if inner.active_count == 0 && self.state() == MultiState::Running {
                            self.set_state(MultiState::Paused);
                            self.transport.send_signal(TransportSignal::PcmPause);
                        }
                        if removed {
                            break;
                        }
                    }
                    Some(EventToken::Client(id, kind)) => {
                        let hangup = event
                            .events()
                            .intersects(EpollFlags::EPOLLHUP | EpollFlags::EPOLLERR);
                        let mut inner = self.inner.lock();
                        let (clients, mut session) = inner.split(&self.poller);
                        let Some(client) = clients.get_mut(&id) else {
                            continue;
                        };
                        client.handle_event(kind, hangup, &mut session);
                        if client.state() == ClientState::Finished {
                            if inner.remove_client(id, &self.poller) == 0 {
                                self.last_client_gone();
                                break 'poll;
                            }
                            break;
                        }
                        if self.state() == MultiState::Paused && inner.active_count > 0 {
                            self.set_state(MultiState::Running);
                            self.transport.send_signal(TransportSignal::PcmResume);
                        }
                    }
                    None => {}
                }
            }
        }

        self.set_state(MultiState::Finished);
        debug!("PCM snoop loop terminated");
    }
}

/// Multi-client support for one transport PCM.
pub struct PcmMulti {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PcmMulti {
    /// Create multi-client support for a transport PCM. No thread is started
    /// until the first client is added.
    pub fn create(transport: Arc<TransportPcm>, config: MultiConfig) -> Result<Self, MultiError> {
        config.validate()?;

        let poller = Poller::new()?;
        let wake = WakeChannel::new()?;
        poller.register(wake.as_fd(), EpollFlags::EPOLLIN, EventToken::MultiWake)?;
        let data_ready = DataReady::new()?;

        Ok(Self {
            shared: Arc::new(Shared {
                transport,
                config,
                poller,
                wake,
                data_ready,
                state: AtomicU8::new(MultiState::Init as u8),
                inner: Mutex::new(Inner {
                    clients: HashMap::new(),
                    next_client_id: 1,
                    active_count: 0,
                    mix: None,
                    params: None,
                    period_frames: 0,
                    start_threshold: 0,
                    delay: 0,
                }),
            }),
            thread: Mutex::new(None),
        })
    }

    /// Set up buffering once the transport's stream parameters are final.
    ///
    /// `transfer_samples` is the largest number of samples passed between the
    /// transport thread and the multi in one call. Clients added before this
    /// point are initialized now; any that fail are dropped.
    pub fn init(&self, transfer_samples: usize) -> Result<(), MultiError> {
        debug!("Initializing multi client support");
        let shared = &self.shared;
        let transport = &shared.transport;
        let channels = transport.channels() as usize;
        if channels == 0 {
            return Err(MultiError::InvalidParameters("channel count is zero"));
        }
        let period_frames = transfer_samples / channels;
        if period_frames == 0 {
            return Err(MultiError::InvalidParameters(
                "transfer must hold at least one frame",
            ));
        }
        let period_bytes = period_frames * transport.frame_bytes();

        let mut inner = shared.inner.lock();
        if shared.is_playback() {
            inner.mix = Some(MixBuffer::new(
                transport.format(),
                transport.channels(),
                shared.config.buffer_periods * period_frames,
                period_frames,
            )?);
        }
        inner.period_frames = period_frames;
        inner.start_threshold = shared.config.mix_threshold * period_frames * channels;

        let params = ClientParams {
            period_bytes,
            client_threshold: shared.config.client_threshold,
            prebuffer: shared.config.client_threshold * period_frames * channels,
            drain_timeout: shared.config.drain_timeout,
        };
        inner.params = Some(params);
        debug!(
            period_bytes,
            start_threshold = inner.start_threshold,
            "Multi client buffers sized"
        );

        inner.init_clients(params, &shared.poller);
        Ok(())
    }

    /// Stop the worker thread and drop every client. Buffer configuration is
    /// kept, so clients can be added again straight away.
    pub fn reset(&self) {
        if let Some(handle) = self.thread.lock().take() {
            self.shared.wake.post(WakeMessage::Shutdown);
            if handle.join().is_err() {
                error!("PCM multi thread panicked");
            }
            self.shared.wake.rearm();
        }

        let mut inner = self.shared.inner.lock();
        if let Some(mix) = inner.mix.as_mut() {
            mix.reset();
        }
        let ids: Vec<ClientId> = inner.clients.keys().copied().collect();
        for id in ids {
            inner.remove_client(id, &self.shared.poller);
        }
        inner.active_count = 0;
        inner.delay = 0;
        self.shared.set_state(MultiState::Init);
    }

    fn start(&self) -> Result<(), MultiError> {
        let mut thread = self.thread.lock();
        if thread.is_some() {
            return Ok(());
        }

        let shared = Arc::clone(&self.shared);
        let playback = shared.is_playback();
        let name = if playback { "ba-pcm-mix" } else { "ba-pcm-snoop" };
        let body: fn(&Shared) = if playback {
            Shared::run_mix
        } else {
            Shared::run_snoop
        };
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(&shared))
            .map_err(|err| {
                error!("Cannot create PCM multi thread: {err}");
                MultiError::Thread(err)
            })?;
        *thread = Some(handle);
        Ok(())
    }

    /// Accept a new client connection. Ownership of both descriptors passes
    /// to the multi, which closes them when the client is removed.
    pub fn add_client(&self, audio: OwnedFd, control: OwnedFd) -> Result<ClientId, MultiError> {
        let shared = &self.shared;

        // The worker exits under the lock once its last client is gone, so a
        // state checked while holding the lock is final.
        let mut inner = loop {
            if shared.state() == MultiState::Finished {
                // Clean up the stopped thread before starting a new one.
                self.reset();
            }
            self.start()?;
            let inner = shared.inner.lock();
            if shared.state() != MultiState::Finished {
                break inner;
            }
        };
        let max_clients = shared.config.max_clients;
        if inner.clients.len() >= max_clients {
            return Err(MultiError::TooManyClients(max_clients));
        }
        let id = ClientId(inner.next_client_id);
        inner.next_client_id = inner.next_client_id.wrapping_add(1);

        let mut client = PcmClient::new(id, shared.transport.mode(), audio, control, &shared.poller)?;
        if let Some(params) = inner.params {
            let (_, mut session) = inner.split(&shared.poller);
            if let Err(err) = client.init(params, &mut session) {
                client.finish(&mut session);
                return Err(err);
            }
        }
        inner.clients.insert(id, client);

        match (shared.is_playback(), shared.state()) {
            (false, MultiState::Init) => shared.set_state(MultiState::Running),
            (false, MultiState::Paused) if inner.active_count > 0 => {
                shared.set_state(MultiState::Running);
                shared.transport.send_signal(TransportSignal::PcmResume);
            }
            _ => {}
        }

        if inner.clients.len() == 1 {
            shared.transport.send_signal(TransportSignal::PcmOpen);
        }
        debug!(client = %id, total = inner.clients.len(), "New client");
        Ok(id)
    }

    /// Read mixed audio for the transport. Playback only.
    ///
    /// Returns the number of samples written to `dest`, `Ok(0)` once the multi
    /// has finished, or [`MultiError::TryAgain`] when no mixed audio is ready.
    /// Never blocks on client I/O.
    pub fn read(&self, dest: &mut [u8], max_samples: usize) -> Result<usize, MultiError> {
        // Read without the lock; the worker thread may change state at any time
        // and a stale value only costs one extra retry.
        let state = self.shared.state();
        self.shared.data_ready.clear();

        match state {
            MultiState::Finished => return Ok(0),
            MultiState::Running => {}
            _ => return Err(MultiError::TryAgain),
        }

        let scale = self.shared.transport.volume_scale();
        let samples = {
            let mut inner = self.shared.inner.lock();
            let Some(mix) = inner.mix.as_mut() else {
                return Err(MultiError::TryAgain);
            };
            if mix.is_empty() {
                return Err(MultiError::TryAgain);
            }
            mix.read(dest, max_samples, &scale)
        };

        // Let the worker refill the mix.
        self.shared.wake.post(WakeMessage::Data(1));
        Ok(samples)
    }

    /// Hand decoded transport audio to every running capture client. Never
    /// blocks on client I/O.
    pub fn write(&self, data: &[u8], samples: usize) {
        let len = (samples * self.shared.transport.format().sample_bytes()).min(data.len());
        {
            let mut inner = self.shared.inner.lock();
            for client in inner.clients.values_mut() {
                if client.state() == ClientState::Running {
                    client.fan_out(&data[..len]);
                }
            }
        }
        self.shared.wake.post(WakeMessage::Data(1));
    }

    /// Descriptor that becomes readable when mixed audio is ready, or when the
    /// multi has finished.
    pub fn data_ready_fd(&self) -> BorrowedFd<'_> {
        self.shared.data_ready.as_fd()
    }

    /// Current aggregator state.
    pub fn state(&self) -> MultiState {
        self.shared.state()
    }

    /// The transport PCM this multi serves.
    pub fn transport(&self) -> &Arc<TransportPcm> {
        &self.shared.transport
    }

    /// Number of connected clients.
    pub fn client_count(&self) -> usize {
        self.shared.inner.lock().clients.len()
    }

    /// Snapshot of the aggregator and every client.
    pub fn status(&self) -> MultiStatus {
        let inner = self.shared.inner.lock();
        let mix = inner.mix.as_ref();
        let mut clients: Vec<_> = inner
            .clients
            .values()
            .map(|client| client.status(mix))
            .collect();
        clients.sort_by_key(|client| client.id);
        MultiStatus {
            state: self.shared.state(),
            client_count: inner.clients.len(),
            active_count: inner.active_count,
            mix_avail: mix.map_or(0, MixBuffer::avail),
            delay: inner.delay,
            clients,
        }
    }
}

impl Drop for PcmMulti {
    fn drop(&mut self) {
        self.reset();
    }
}
