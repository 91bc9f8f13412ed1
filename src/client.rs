//! A single connected application and its session state machine.
//!
//! Playback clients write audio into a FIFO which is buffered locally and
//! handed to the mix by the multi thread. Capture clients receive a copy of
//! every transport buffer, queued locally and written out as their FIFO
//! accepts it.

use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Duration;

use nix::fcntl::{FcntlArg, OFlag, fcntl};
use nix::sys::epoll::EpollFlags;
use nix::sys::time::TimeSpec;
use nix::sys::timerfd::{ClockId, Expiration, TimerFd, TimerFlags, TimerSetTimeFlags};
use tracing::{debug, error, warn};

use crate::MultiError;
use crate::control::command::{ControlCommand, MAX_COMMAND_LEN, REPLY_INVALID, REPLY_OK};
use crate::control::status::ClientStatus;
use crate::event::{ClientId, EventKind, EventToken, Poller};
use crate::mix::{MixBuffer, RingPosition};
use crate::transport::PcmMode;

/// Upper bound on FIFO bytes thrown away by a Drop request.
const DROP_DISCARD_LIMIT: usize = 32 * 1024;

/// Session state of a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Connected but not contributing audio.
    Idle,
    /// Transferring audio.
    Running,
    /// Paused by the client; the stream position is kept.
    Paused,
    /// Waiting for buffered audio to play out before acknowledging a drain.
    Draining,
    /// Disconnected or failed. The client is about to be removed.
    Finished,
}

impl ClientState {
    /// Whether a client in this state counts towards the multi's active clients.
    pub fn is_active(self) -> bool {
        matches!(self, ClientState::Running | ClientState::Draining)
    }
}

/// Buffer geometry handed to clients once the stream parameters are known.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ClientParams {
    pub(crate) period_bytes: usize,
    pub(crate) client_threshold: usize,
    /// Samples of lead-in before a fresh playback client's audio.
    pub(crate) prebuffer: usize,
    pub(crate) drain_timeout: Duration,
}

/// Multi-owned state a client touches while handling an event.
pub(crate) struct Session<'a> {
    pub(crate) poller: &'a Poller,
    pub(crate) mix: Option<&'a mut MixBuffer>,
    pub(crate) active_count: &'a mut usize,
}

enum Role {
    Playback {
        position: RingPosition,
        drain_timer: TimerFd,
    },
    Capture {
        out_offset: usize,
    },
}

enum Fill {
    Read,
    Full,
    Empty,
    Closed,
}

fn set_nonblocking(fd: BorrowedFd<'_>) -> nix::Result<()> {
    let flags = OFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFL)?);
    fcntl(fd, FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
    Ok(())
}

pub(crate) struct PcmClient {
    id: ClientId,
    state: ClientState,
    role: Role,
    audio: Option<File>,
    control: Option<File>,
    buffer: Vec<u8>,
    in_offset: usize,
    watch: bool,
    params: Option<ClientParams>,
}

impl PcmClient {
    /// Take ownership of a client's descriptors and register them for events.
    /// The audio descriptor is not watched until the client is initialized.
    pub(crate) fn new(
        id: ClientId,
        mode: PcmMode,
        audio: OwnedFd,
        control: OwnedFd,
        poller: &Poller,
    ) -> Result<Self, MultiError> {
        set_nonblocking(audio.as_fd())?;
        set_nonblocking(control.as_fd())?;

        poller.register(
            &control,
            EpollFlags::EPOLLIN,
            EventToken::Client(id, EventKind::Control),
        )?;

        let role = match mode {
            PcmMode::Sink => {
                let timer = TimerFd::new(
                    ClockId::CLOCK_MONOTONIC,
                    TimerFlags::TFD_NONBLOCK | TimerFlags::TFD_CLOEXEC,
                )
                .and_then(|timer| {
                    poller.register(
                        &timer,
                        EpollFlags::EPOLLIN,
                        EventToken::Client(id, EventKind::Drain),
                    )?;
                    Ok(timer)
                });
                match timer {
                    Ok(drain_timer) => Role::Playback {
                        position: RingPosition::AheadOfCursor(0),
                        drain_timer,
                    },
                    Err(err) => {
                        error!(client = %id, "Unable to init client drain timer: {err}");
                        poller.deregister(&control);
                        return Err(err.into());
                    }
                }
            }
            PcmMode::Source => Role::Capture { out_offset: 0 },
        };

        Ok(Self {
            id,
            state: ClientState::Idle,
            role,
            audio: Some(File::from(audio)),
            control: Some(File::from(control)),
            buffer: Vec::new(),
            in_offset: 0,
            watch: false,
            params: None,
        })
    }

    pub(crate) fn id(&self) -> ClientId {
        self.id
    }

    pub(crate) fn state(&self) -> ClientState {
        self.state
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.params.is_some()
    }

    pub(crate) fn is_playback(&self) -> bool {
        matches!(self.role, Role::Playback { .. })
    }

    pub(crate) fn buffered_bytes(&self) -> usize {
        match self.role {
            Role::Playback { .. } => self.in_offset,
            Role::Capture { out_offset } => self.in_offset - out_offset,
        }
    }

    fn position(&self) -> Option<RingPosition> {
        match self.role {
            Role::Playback { position, .. } => Some(position),
            Role::Capture { .. } => None,
        }
    }

    fn set_position(&mut self, new_position: RingPosition) {
        if let Role::Playback { position, .. } = &mut self.role {
            *position = new_position;
        }
    }

    fn prebuffer(&self) -> RingPosition {
        RingPosition::AheadOfCursor(self.params.map_or(0, |params| params.prebuffer))
    }

    /// Allocate the local buffer and enter the initial state.
    pub(crate) fn init(
        &mut self,
        params: ClientParams,
        session: &mut Session<'_>,
    ) -> Result<(), MultiError> {
        let size = (params.client_threshold + 1) * params.period_bytes;
        let mut buffer = Vec::new();
        if let Err(err) = buffer.try_reserve_exact(size) {
            error!(client = %self.id, "Unable to allocate client buffer: {err}");
            return Err(err.into());
        }
        buffer.resize(size, 0);
        self.buffer = buffer;
        self.in_offset = 0;
        self.params = Some(params);

        match self.role {
            Role::Playback { .. } => {
                self.set_position(self.prebuffer());
                self.set_state(ClientState::Idle, session.active_count);
                self.watch(true, session.poller);
            }
            Role::Capture { .. } => {
                // Capture clients are active immediately.
                self.set_state(ClientState::Running, session.active_count);
            }
        }
        Ok(())
    }

    fn set_state(&mut self, state: ClientState, active_count: &mut usize) {
        if state == self.state {
            return;
        }
        match (self.state.is_active(), state.is_active()) {
            (true, false) => *active_count = active_count.saturating_sub(1),
            (false, true) => *active_count += 1,
            _ => {}
        }
        self.state = state;
    }

    /// Start or stop watching the audio descriptor for readiness.
    fn watch(&mut self, enabled: bool, poller: &Poller) {
        if self.watch == enabled {
            return;
        }
        let Some(audio) = &self.audio else {
            return;
        };
        if enabled {
            let flags = match self.role {
                Role::Playback { .. } => EpollFlags::EPOLLIN,
                Role::Capture { .. } => EpollFlags::EPOLLOUT,
            };
            let token = EventToken::Client(self.id, EventKind::Audio);
            if let Err(err) = poller.register(audio, flags, token) {
                warn!(client = %self.id, "Unable to watch client PCM: {err}");
                return;
            }
        } else {
            poller.deregister(audio);
        }
        self.watch = enabled;
    }

    fn arm_drain_timer(&self, timeout: Option<Duration>) -> nix::Result<()> {
        let Role::Playback { drain_timer, .. } = &self.role else {
            return Ok(());
        };
        match timeout {
            Some(timeout) => drain_timer.set(
                Expiration::OneShot(TimeSpec::from_duration(timeout)),
                TimerSetTimeFlags::empty(),
            ),
            None => drain_timer.unset(),
        }
    }

    /// Deregister and close every descriptor, then mark the client finished.
    pub(crate) fn finish(&mut self, session: &mut Session<'_>) {
        if let Some(audio) = self.audio.take() {
            if self.watch {
                session.poller.deregister(&audio);
            }
            self.watch = false;
        }
        if let Some(control) = self.control.take() {
            session.poller.deregister(&control);
        }
        if let Role::Playback { drain_timer, .. } = &self.role {
            session.poller.deregister(drain_timer);
        }
        self.set_state(ClientState::Finished, session.active_count);
    }

    fn reply(&mut self, response: &[u8]) {
        let Some(control) = &mut self.control else {
            return;
        };
        if let Err(err) = control.write_all(response) {
            error!(client = %self.id, "Client control response failed: {err}");
        }
    }

    /// Pull bytes from the playback FIFO into the local buffer.
    fn fill(&mut self) -> Fill {
        let Some(audio) = &mut self.audio else {
            return Fill::Closed;
        };
        if self.in_offset == self.buffer.len() {
            return Fill::Full;
        }
        loop {
            match audio.read(&mut self.buffer[self.in_offset..]) {
                Ok(0) => return Fill::Closed,
                Ok(bytes) => {
                    self.in_offset += bytes;
                    return Fill::Read;
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return Fill::Empty,
                Err(err) => {
                    debug!(client = %self.id, "Client PCM read failed: {err}");
                    return Fill::Closed;
                }
            }
        }
    }

    /// Dispatch a readiness event on one of this client's descriptors.
    pub(crate) fn handle_event(&mut self, kind: EventKind, hangup: bool, session: &mut Session<'_>) {
        if hangup && !self.is_playback() {
            self.finish(session);
            return;
        }
        match kind {
            EventKind::Audio => match self.role {
                Role::Playback { .. } => self.handle_playback_audio(session),
                Role::Capture { .. } => self.flush(session),
            },
            EventKind::Control => self.handle_control(session),
            EventKind::Drain => self.handle_drain_timer(session),
        }
    }

    fn handle_playback_audio(&mut self, session: &mut Session<'_>) {
        match self.fill() {
            Fill::Closed => {
                self.finish(session);
                return;
            }
            Fill::Full => self.watch(false, session.poller),
            Fill::Read if self.in_offset == self.buffer.len() => {
                // Backpressure the writer until the mix takes some of it.
                self.watch(false, session.poller);
            }
            Fill::Read | Fill::Empty => {}
        }

        let Some(params) = self.params else {
            return;
        };
        if self.state == ClientState::Idle
            && self.in_offset > params.client_threshold * params.period_bytes
        {
            debug!(client = %self.id, buffered = self.in_offset, "Client joining mix");
            self.set_state(ClientState::Running, session.active_count);
        }
    }

    /// Hand locally buffered playback audio to the mix.
    pub(crate) fn deliver(&mut self, session: &mut Session<'_>) {
        if !self.state.is_active() {
            return;
        }
        let Some(mut position) = self.position() else {
            return;
        };
        let Some(mix) = session.mix.as_deref_mut() else {
            return;
        };

        if self.state == ClientState::Draining {
            match self.fill() {
                Fill::Closed => {
                    self.finish(session);
                    return;
                }
                Fill::Empty if self.in_offset == 0 && mix.position_delay(position) == 0 => {
                    // Everything this client sent has been read from the mix.
                    self.complete_drain(session);
                    return;
                }
                _ => {}
            }
        }

        if self.in_offset == 0 {
            return;
        }
        let delivered = mix.add(&mut position, &self.buffer[..self.in_offset]);
        self.set_position(position);
        if delivered > 0 {
            self.buffer.copy_within(delivered..self.in_offset, 0);
            self.in_offset -= delivered;
            let threshold = self
                .params
                .map_or(0, |params| params.client_threshold * params.period_bytes);
            if self.in_offset <= threshold {
                // Back under the threshold, so the writer may continue.
                self.watch(true, session.poller);
            }
        }
    }

    /// Queue a copy of transport audio for a capture client. Called with the
    /// multi lock held, on the transport thread.
    pub(crate) fn fan_out(&mut self, data: &[u8]) {
        if self.state != ClientState::Running || self.buffer.is_empty() {
            return;
        }
        let Role::Capture { out_offset } = &mut self.role else {
            return;
        };

        let capacity = self.buffer.len();
        let incoming = if data.len() > capacity {
            &data[data.len() - capacity..]
        } else {
            data
        };

        let pending = self.in_offset - *out_offset;
        let free = capacity - pending;
        if incoming.len() > free {
            let dropped = incoming.len() - free;
            warn!(client = %self.id, bytes = dropped, "Dropping PCM frames: PCM overrun");
            *out_offset += dropped;
        }

        if *out_offset > 0 {
            self.buffer.copy_within(*out_offset..self.in_offset, 0);
            self.in_offset -= *out_offset;
            *out_offset = 0;
        }

        self.buffer[self.in_offset..self.in_offset + incoming.len()].copy_from_slice(incoming);
        self.in_offset += incoming.len();
    }

    /// Write queued capture audio to the client FIFO without blocking.
    pub(crate) fn flush(&mut self, session: &mut Session<'_>) {
        let Role::Capture { out_offset } = self.role else {
            return;
        };
        let Some(audio) = &mut self.audio else {
            return;
        };

        let mut sent = out_offset;
        while sent < self.in_offset {
            match audio.write(&self.buffer[sent..self.in_offset]) {
                Ok(0) => break,
                Ok(bytes) => sent += bytes,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    debug!(client = %self.id, "Client PCM write failed: {err}");
                    self.finish(session);
                    return;
                }
            }
        }

        if sent == self.in_offset {
            self.in_offset = 0;
            self.role = Role::Capture { out_offset: 0 };
            self.watch(false, session.poller);
        } else {
            self.role = Role::Capture { out_offset: sent };
            self.watch(true, session.poller);
        }
    }

    fn handle_control(&mut self, session: &mut Session<'_>) {
        let Some(control) = &mut self.control else {
            return;
        };
        let mut command = [0u8; MAX_COMMAND_LEN];
        let len = loop {
            match control.read(&mut command) {
                Ok(len) => break len,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => return,
                Err(err) => {
                    debug!(client = %self.id, "Client control read failed: {err}");
                    break 0;
                }
            }
        };
        if len == 0 {
            self.finish(session);
            return;
        }

        // A well-behaved client blocks while draining. Complete the pending
        // drain before acting on anything else.
        if self.state == ClientState::Draining {
            self.complete_drain(session);
        }

        match ControlCommand::parse(&command[..len]) {
            Some(ControlCommand::Drain) => self.begin_drain(session),
            Some(ControlCommand::Drop) => {
                self.drop_audio(session);
                self.reply(REPLY_OK);
            }
            Some(ControlCommand::Pause) => {
                self.pause(session);
                self.reply(REPLY_OK);
            }
            Some(ControlCommand::Resume) => {
                self.resume(session);
                self.reply(REPLY_OK);
            }
            None => {
                warn!(
                    client = %self.id,
                    "Invalid PCM control command: {}",
                    String::from_utf8_lossy(&command[..len])
                );
                self.reply(REPLY_INVALID);
            }
        }
    }

    fn begin_drain(&mut self, session: &mut Session<'_>) {
        debug!(client = %self.id, "Drain");
        if !(self.is_playback() && self.state == ClientState::Running) {
            self.reply(REPLY_OK);
            return;
        }
        let timeout = self.params.map(|params| params.drain_timeout);
        self.set_state(ClientState::Draining, session.active_count);
        if let Err(err) = self.arm_drain_timer(timeout) {
            error!(client = %self.id, "Unable to arm drain timer: {err}");
            self.complete_drain(session);
        }
    }

    fn handle_drain_timer(&mut self, session: &mut Session<'_>) {
        if let Role::Playback { drain_timer, .. } = &self.role {
            // Consume the expiration; EAGAIN means it was already disarmed.
            let _ = drain_timer.wait();
        }
        self.complete_drain(session);
    }

    fn complete_drain(&mut self, session: &mut Session<'_>) {
        if self.state != ClientState::Draining {
            return;
        }
        debug!(client = %self.id, "Drain complete");
        if let Err(err) = self.arm_drain_timer(None) {
            warn!(client = %self.id, "Unable to disarm drain timer: {err}");
        }
        self.set_state(ClientState::Idle, session.active_count);
        self.in_offset = 0;
        self.set_position(self.prebuffer());
        self.watch(true, session.poller);
        self.reply(REPLY_OK);
    }

    fn drop_audio(&mut self, session: &mut Session<'_>) {
        debug!(client = %self.id, "Drop");
        if !self.is_playback() {
            return;
        }
        if let Err(err) = self.arm_drain_timer(None) {
            warn!(client = %self.id, "Unable to disarm drain timer: {err}");
        }
        if let Some(audio) = &mut self.audio {
            let mut scratch = [0u8; 4096];
            let mut discarded = 0;
            while discarded < DROP_DISCARD_LIMIT {
                match audio.read(&mut scratch) {
                    Ok(0) => break,
                    Ok(bytes) => discarded += bytes,
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
        }
        self.in_offset = 0;
        self.set_position(self.prebuffer());
        self.set_state(ClientState::Idle, session.active_count);
        self.watch(false, session.poller);
    }

    fn pause(&mut self, session: &mut Session<'_>) {
        debug!(client = %self.id, "Pause");
        self.set_state(ClientState::Paused, session.active_count);
        self.watch(false, session.poller);
        if let (Some(position), Some(mix)) = (self.position(), session.mix.as_deref()) {
            // Keep the place relative to the reader so resume neither
            // replays nor skips audio.
            self.set_position(RingPosition::AheadOfCursor(mix.position_delay(position)));
        }
    }

    fn resume(&mut self, session: &mut Session<'_>) {
        debug!(client = %self.id, "Resume");
        match (self.is_playback(), self.state) {
            (true, ClientState::Idle) => {
                self.set_position(self.prebuffer());
                self.watch(true, session.poller);
            }
            (true, ClientState::Paused) => {
                self.set_state(ClientState::Running, session.active_count);
                self.watch(true, session.poller);
            }
            (false, ClientState::Idle | ClientState::Paused) => {
                self.set_state(ClientState::Running, session.active_count);
                let pending = self.buffered_bytes() > 0;
                self.watch(pending, session.poller);
            }
            _ => {}
        }
    }

    pub(crate) fn status(&self, mix: Option<&MixBuffer>) -> ClientStatus {
        let mix_delay = match (self.position(), mix) {
            (Some(position), Some(mix)) => mix.position_delay(position),
            _ => 0,
        };
        ClientStatus {
            id: self.id,
            state: self.state,
            buffered_bytes: self.buffered_bytes(),
            mix_delay,
            watching: self.watch,
        }
    }
}
