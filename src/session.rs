//! Client and server session state machines.
//!
//! A session caches connection state between two endpoints so that repeated
//! RPCs skip connection setup. Each session multiplexes several channels,
//! each carrying one RPC at a time; channel state machines drive the inbound
//! and outbound messages and enforce per-channel RPC ordering by rpc id.
//!
//! Sessions live in pooled tables addressed by compact hints that ride in
//! every packet header; a random per-session token guards against stale
//! hints after a slot has been recycled.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, warn};

use crate::buffer::Buffer;
use crate::config::TransportConfig;
use crate::driver::{Address, Driver, Received};
use crate::error::Result;
use crate::message::{ChannelCtx, InboundMessage, OutboundMessage};
use crate::packet::{Direction, Header, PayloadType, SessionOpenResponse, HEADER_SIZE};
use crate::timing::{TimerQueue, TimerTask};

/// Hint value meaning "no session"; only legal on session open requests.
pub(crate) const INVALID_HINT: u32 = u32::MAX;

/// Token value meaning "no session"; never generated for a live session.
pub(crate) const INVALID_TOKEN: u64 = 0;

/// Channel rpc id before any RPC has run; the first real RPC is id 0.
const INVALID_RPC_ID: u32 = u32::MAX;

/// Collaborators a session needs to process a packet or a timer: the
/// driver, protocol constants, the timer queue, and the current time.
pub(crate) struct DispatchCtx<'a> {
    pub driver: &'a Rc<dyn Driver>,
    pub config: &'a TransportConfig,
    pub timers: &'a mut TimerQueue,
    pub now: u64,
}

impl DispatchCtx<'_> {
    /// Narrow to a per-channel context with the peer and header identity
    /// filled in.
    pub(crate) fn channel_ctx(&mut self, peer: Address, template: Header) -> ChannelCtx<'_> {
        ChannelCtx {
            driver: self.driver,
            config: self.config,
            timers: &mut *self.timers,
            now: self.now,
            peer,
            template,
        }
    }
}

/// Completion state of a client RPC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RpcStatus {
    InProgress,
    Completed,
    Aborted,
}

/// State shared between a ClientRpc handle and the channel servicing it.
///
/// The request buffer moves into the channel's outbound message while
/// sending and is restored on completion or requeue; the response buffer
/// moves into the inbound message while receiving.
pub(crate) struct RpcState {
    pub request: Option<Buffer>,
    pub response: Option<Buffer>,
    pub status: RpcStatus,
}

pub(crate) type RpcHandle = Rc<RefCell<RpcState>>;

/// A completed inbound request awaiting service by the application.
pub struct ServerRpc {
    /// The reassembled request.
    pub recv_payload: Buffer,
    /// The reply under construction; filled by the application before
    /// `send_reply`.
    pub reply_payload: Buffer,
    pub(crate) session_hint: u32,
    pub(crate) channel_id: u8,
    pub(crate) rpc_id: u32,
}

// ---------------------------------------------------------------------------
// Session table

/// Slot value meaning "this session is busy, not on the free list".
pub(crate) const TABLE_NONE: u32 = u32::MAX;

/// Slot value terminating the free list.
pub(crate) const TABLE_TAIL: u32 = u32::MAX - 1;

/// Implemented by session types pooled in a [`SessionTable`].
pub(crate) trait TableSlot {
    fn next_free(&self) -> u32;
    fn set_next_free(&mut self, next_free: u32);
    fn last_activity_time(&self) -> u64;
}

/// A grow-on-demand pool of sessions with stable indices.
///
/// Free slots are threaded through each session's `next_free` field. Hints
/// handed to peers are plain indices; a reused slot is detected by token
/// mismatch, not by the hint itself.
pub(crate) struct SessionTable<T> {
    sessions: Vec<T>,
    first_free: u32,
    last_cleaned_index: u32,
}

impl<T: TableSlot> SessionTable<T> {
    pub fn new() -> Self {
        Self {
            sessions: Vec::new(),
            first_free: TABLE_TAIL,
            last_cleaned_index: 0,
        }
    }

    #[inline]
    pub fn size(&self) -> u32 {
        self.sessions.len() as u32
    }

    pub fn get_mut(&mut self, hint: u32) -> Option<&mut T> {
        self.sessions.get_mut(hint as usize)
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.sessions.iter_mut()
    }

    /// Return the hint of a free session, preferably reused; `make` builds
    /// a fresh session when the table must grow.
    pub fn get_with(&mut self, make: impl FnOnce(u32) -> T) -> u32 {
        let mut hint = self.first_free;
        if hint >= self.size() {
            hint = self.size();
            let mut session = make(hint);
            session.set_next_free(TABLE_TAIL);
            self.sessions.push(session);
        }
        let session = &mut self.sessions[hint as usize];
        self.first_free = session.next_free();
        session.set_next_free(TABLE_NONE);
        hint
    }

    /// Return a session to the free list.
    pub fn put(&mut self, hint: u32) {
        self.sessions[hint as usize].set_next_free(self.first_free);
        self.first_free = hint;
    }

    /// Probe a few sessions for expiry, returning reclaimed ones to the
    /// free list. `try_expire` closes the session and reports whether it
    /// could be reclaimed.
    pub fn expire_with(
        &mut self,
        now: u64,
        session_timeout: u64,
        mut try_expire: impl FnMut(&mut T) -> bool,
    ) {
        const SESSIONS_TO_CHECK: u32 = 5;
        for _ in 0..SESSIONS_TO_CHECK {
            self.last_cleaned_index += 1;
            if self.last_cleaned_index >= self.size() {
                self.last_cleaned_index = 0;
                if self.sessions.is_empty() {
                    break;
                }
            }
            let index = self.last_cleaned_index;
            let reclaimed = {
                let session = &mut self.sessions[index as usize];
                session.next_free() == TABLE_NONE
                    && session.last_activity_time().saturating_add(session_timeout) <= now
                    && try_expire(session)
            };
            if reclaimed {
                self.put(index);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Client session

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ClientChannelState {
    /// Not handling an RPC.
    Idle,
    /// Request transmitting; moves to Receiving on the first response
    /// packet.
    Sending,
    /// Response being reassembled.
    Receiving,
}

pub(crate) struct ClientChannel {
    pub rpc_id: u32,
    pub state: ClientChannelState,
    pub current_rpc: Option<RpcHandle>,
    pub inbound: InboundMessage,
    pub outbound: OutboundMessage,
}

impl ClientChannel {
    fn new(session_id: u32, channel_id: u8) -> Self {
        Self {
            rpc_id: 0,
            state: ClientChannelState::Idle,
            current_rpc: None,
            inbound: InboundMessage::new(
                true,
                TimerTask::InboundActivity {
                    session: session_id,
                    channel: channel_id,
                },
            ),
            outbound: OutboundMessage::new(
                true,
                TimerTask::OutboundRetransmit {
                    session: session_id,
                    channel: channel_id,
                },
            ),
        }
    }
}

/// Client half of a session: owns the open handshake, the channel pool,
/// and the queue of RPCs waiting for a free channel.
pub(crate) struct ClientSession {
    pub id: u32,
    pub next_free: u32,
    pub token: u64,
    pub server_session_hint: u32,
    pub server_address: Option<Address>,
    pub last_activity_time: u64,
    pub channels: Vec<ClientChannel>,
    channel_queue: VecDeque<RpcHandle>,
    session_open_in_flight: bool,
    /// Deadline of the armed session open retry timer; 0 when disarmed.
    pub open_timer_deadline: u64,
    /// Cloned into every SessionRef; the slot may only be reclaimed when
    /// this is the sole remaining strong count.
    pub ref_token: Rc<()>,
}

impl TableSlot for ClientSession {
    fn next_free(&self) -> u32 {
        self.next_free
    }
    fn set_next_free(&mut self, next_free: u32) {
        self.next_free = next_free;
    }
    fn last_activity_time(&self) -> u64 {
        self.last_activity_time
    }
}

impl ClientSession {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            next_free: TABLE_NONE,
            token: INVALID_TOKEN,
            server_session_hint: INVALID_HINT,
            server_address: None,
            last_activity_time: 0,
            channels: Vec::new(),
            channel_queue: VecDeque::new(),
            session_open_in_flight: false,
            open_timer_deadline: 0,
            ref_token: Rc::new(()),
        }
    }

    /// Bind the session to a server address; the handshake itself runs
    /// lazily on the first send.
    pub fn init(&mut self, address: Address) {
        self.server_address = Some(address);
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        !self.channels.is_empty()
    }

    /// Header identity for packets on one of this session's channels.
    fn fill_header(&self, channel_id: u8) -> Header {
        let mut header = Header::new();
        header.rpc_id = self.channels[channel_id as usize].rpc_id;
        header.channel_id = channel_id;
        header.set_direction(Direction::ClientToServer);
        header.client_session_hint = self.id;
        header.server_session_hint = self.server_session_hint;
        header.session_token = self.token;
        header
    }

    fn peer(&self) -> Address {
        self.server_address.clone().expect("session has no address")
    }

    /// Start an RPC: run it on an idle channel right away, or queue it
    /// until a channel frees up (opening the session first if necessary).
    pub fn client_send(&mut self, dctx: &mut DispatchCtx, rpc: RpcHandle) -> Result<()> {
        self.last_activity_time = dctx.now;
        if !self.is_connected() {
            self.connect(dctx);
            debug!("queueing RPC on unconnected session {}", self.id);
            self.channel_queue.push_back(rpc);
            return Ok(());
        }
        match self.available_channel() {
            Some(channel_id) => self.start_rpc_on_channel(dctx, channel_id, rpc),
            None => {
                debug!("queueing RPC, no idle channel on session {}", self.id);
                self.channel_queue.push_back(rpc);
                Ok(())
            }
        }
    }

    /// Send a session open request unless one is already outstanding.
    pub fn connect(&mut self, dctx: &mut DispatchCtx) {
        if !self.session_open_in_flight {
            self.send_session_open_request(dctx);
        }
    }

    /// Transmit a session open request and arm its retry timer.
    pub fn send_session_open_request(&mut self, dctx: &mut DispatchCtx) {
        let mut header = Header::new();
        header.set_direction(Direction::ClientToServer);
        header.client_session_hint = self.id;
        header.server_session_hint = self.server_session_hint;
        header.session_token = self.token;
        header.set_payload_type(PayloadType::SessionOpen);

        let peer = self.peer();
        if let Err(e) = dctx.driver.send_packet(&peer, &header.to_bytes(), None) {
            warn!("failed to send session open request: {}", e);
        }
        // Activity tracks the peer and new work, not our own retries;
        // otherwise an unanswered handshake would never hit the session
        // timeout.
        self.session_open_in_flight = true;

        self.open_timer_deadline = dctx.now + dctx.config.timeout_cycles;
        dctx.timers.schedule(
            self.open_timer_deadline,
            TimerTask::SessionOpen { session: self.id },
        );
    }

    /// Abort all ongoing and queued RPCs and return the session to a
    /// reusable state.
    pub fn close(&mut self, driver: &dyn Driver) {
        debug!("closing client session {}", self.id);
        for channel in &mut self.channels {
            if let Some(rpc) = channel.current_rpc.take() {
                rpc.borrow_mut().status = RpcStatus::Aborted;
            }
        }
        for rpc in self.channel_queue.drain(..) {
            rpc.borrow_mut().status = RpcStatus::Aborted;
        }
        self.reset_channels(driver);
        self.server_session_hint = INVALID_HINT;
        self.token = INVALID_TOKEN;
        self.session_open_in_flight = false;
        self.open_timer_deadline = 0;
    }

    /// Close the session if nothing references or runs on it. Returns
    /// whether the slot may be reused.
    pub fn expire(&mut self, driver: &dyn Driver) -> bool {
        if Rc::strong_count(&self.ref_token) > 1 {
            return false;
        }
        if self.channels.iter().any(|c| c.current_rpc.is_some()) {
            return false;
        }
        if !self.channel_queue.is_empty() {
            return false;
        }
        self.close(driver);
        true
    }

    fn reset_channels(&mut self, driver: &dyn Driver) {
        for channel in &mut self.channels {
            channel.inbound.reset(driver);
            channel.outbound.reset();
        }
        self.channels.clear();
    }

    fn available_channel(&self) -> Option<u8> {
        self.channels
            .iter()
            .position(|c| c.state == ClientChannelState::Idle)
            .map(|i| i as u8)
    }

    /// Put an RPC on an idle channel and begin transmitting its request.
    /// On a driver error the channel is restored to Idle and the caller
    /// decides the RPC's fate.
    fn start_rpc_on_channel(
        &mut self,
        dctx: &mut DispatchCtx,
        channel_id: u8,
        rpc: RpcHandle,
    ) -> Result<()> {
        let template = self.fill_header(channel_id);
        let peer = self.peer();
        let channel = &mut self.channels[channel_id as usize];
        debug_assert_eq!(channel.state, ClientChannelState::Idle);
        channel.state = ClientChannelState::Sending;
        let request = rpc
            .borrow_mut()
            .request
            .take()
            .expect("RPC started without a request buffer");
        channel.current_rpc = Some(rpc);

        let mut cctx = dctx.channel_ctx(peer, template);
        let result = channel.outbound.begin_sending(&mut cctx, request);
        if result.is_err() {
            channel.current_rpc = None;
            channel.outbound.reset();
            channel.state = ClientChannelState::Idle;
        }
        result
    }

    /// Route one inbound packet for this session. The caller has already
    /// validated the token (or seen a SESSION_OPEN response).
    pub fn process_inbound_packet(
        &mut self,
        dctx: &mut DispatchCtx,
        header: &Header,
        received: &mut Received,
    ) {
        self.last_activity_time = dctx.now;
        if u32::from(header.channel_id) >= self.channels.len() as u32 {
            if header.payload_type() == Some(PayloadType::SessionOpen) {
                self.process_session_open_response(dctx, header, received);
            } else {
                warn!("invalid channel id {}", header.channel_id);
            }
            return;
        }

        let channel_id = header.channel_id;
        if self.channels[channel_id as usize].rpc_id == header.rpc_id {
            match header.payload_type() {
                Some(PayloadType::Data) => {
                    self.process_received_data(dctx, channel_id, header, received)
                }
                Some(PayloadType::Ack) => {
                    let template = self.fill_header(channel_id);
                    let peer = self.peer();
                    let channel = &mut self.channels[channel_id as usize];
                    if channel.state == ClientChannelState::Sending {
                        let mut cctx = dctx.channel_ctx(peer, template);
                        channel.outbound.process_received_ack(&mut cctx, received);
                    }
                }
                Some(PayloadType::BadSession) => self.handle_bad_session(dctx),
                other => warn!("bad payload type {:?} on client channel", other),
            }
        } else {
            let packet_rpc_id = header.rpc_id;
            warn!(
                "out-of-order packet on channel {} (got rpcId {}, current {})",
                channel_id, packet_rpc_id, self.channels[channel_id as usize].rpc_id
            );
        }
    }

    /// The server no longer knows this session (it may have restarted).
    /// Requeue everything in flight and redo the handshake.
    fn handle_bad_session(&mut self, dctx: &mut DispatchCtx) {
        debug!("session {} rejected by server, reconnecting", self.id);
        for channel in &mut self.channels {
            if let Some(rpc) = channel.current_rpc.take() {
                let mut state = rpc.borrow_mut();
                if let Some(request) = channel.outbound.reset() {
                    state.request = Some(request);
                }
                if let Some(mut response) = channel.inbound.reset(dctx.driver.as_ref()) {
                    // Throw away partially received response data; the RPC
                    // restarts from scratch.
                    response.reset();
                    state.response = Some(response);
                }
                drop(state);
                self.channel_queue.push_back(rpc);
            }
        }
        self.reset_channels(dctx.driver.as_ref());
        self.server_session_hint = INVALID_HINT;
        self.token = INVALID_TOKEN;
        self.connect(dctx);
    }

    fn process_received_data(
        &mut self,
        dctx: &mut DispatchCtx,
        channel_id: u8,
        header: &Header,
        received: &mut Received,
    ) {
        if self.channels[channel_id as usize].state == ClientChannelState::Idle {
            let packet_rpc_id = header.rpc_id;
            warn!("packet arrived on idle channel (rpcId {})", packet_rpc_id);
            return;
        }

        // First response packet ends the request transmission.
        if self.channels[channel_id as usize].state == ClientChannelState::Sending {
            let template = self.fill_header(channel_id);
            let peer = self.peer();
            let channel = &mut self.channels[channel_id as usize];
            let rpc = channel.current_rpc.as_ref().unwrap();
            let mut state = rpc.borrow_mut();
            if let Some(request) = channel.outbound.reset() {
                state.request = Some(request);
            }
            let response = state.response.take().expect("RPC without a response buffer");
            drop(state);
            let mut cctx = dctx.channel_ctx(peer, template);
            channel
                .inbound
                .init(&mut cctx, u32::from(header.total_frags), response);
            channel.state = ClientChannelState::Receiving;
        }

        let template = self.fill_header(channel_id);
        let peer = self.peer();
        let complete = {
            let mut cctx = dctx.channel_ctx(peer, template);
            self.channels[channel_id as usize]
                .inbound
                .process_received_data(&mut cctx, header, received)
        };
        if !complete {
            return;
        }

        // Response complete: finish the RPC and advance the channel.
        {
            let channel = &mut self.channels[channel_id as usize];
            let rpc = channel.current_rpc.take().unwrap();
            let mut state = rpc.borrow_mut();
            state.response = channel.inbound.take_buffer();
            state.status = RpcStatus::Completed;
            drop(state);
            channel.rpc_id = channel.rpc_id.wrapping_add(1);
            channel.outbound.reset();
            channel.inbound.reset(dctx.driver.as_ref());
            channel.inbound.disarm_timer();
            channel.outbound.disarm_timer();
            channel.state = ClientChannelState::Idle;
        }

        if let Some(next) = self.channel_queue.pop_front() {
            if let Err(e) = self.start_rpc_on_channel(dctx, channel_id, next.clone()) {
                warn!("failed to start queued RPC: {}", e);
                next.borrow_mut().status = RpcStatus::Aborted;
            }
        }
    }

    /// The session open retry timer fired. Stale deadlines are ignored;
    /// otherwise retry the handshake, or give up and close the session if
    /// the server has been silent too long.
    pub fn on_open_timer(&mut self, dctx: &mut DispatchCtx, deadline: u64) {
        if deadline == 0 || self.open_timer_deadline != deadline {
            return;
        }
        self.open_timer_deadline = 0;
        if dctx.now.saturating_sub(self.last_activity_time) > dctx.config.session_timeout_cycles {
            debug!("session {} open timed out", self.id);
            self.session_open_in_flight = false;
            self.close(dctx.driver.as_ref());
        } else {
            self.send_session_open_request(dctx);
        }
    }

    /// A channel's inbound inactivity timer fired: close a dead session, or
    /// prod the peer with an ACK so lost ACK-requests cannot stall the
    /// message.
    pub fn on_inbound_timer(&mut self, dctx: &mut DispatchCtx, channel_id: u8, deadline: u64) {
        if usize::from(channel_id) >= self.channels.len() {
            return;
        }
        if deadline == 0 || self.channels[usize::from(channel_id)].inbound.timer_deadline != deadline
        {
            return;
        }
        if dctx.now.saturating_sub(self.last_activity_time) > dctx.config.session_timeout_cycles {
            self.close(dctx.driver.as_ref());
        } else {
            let template = self.fill_header(channel_id);
            let peer = self.peer();
            let channel = &mut self.channels[usize::from(channel_id)];
            let mut cctx = dctx.channel_ctx(peer, template);
            channel.inbound.send_ack(&cctx);
            channel.inbound.arm_timer(&mut cctx);
        }
    }

    /// A channel's retransmit timer fired: close a dead session, or resend
    /// whatever is overdue.
    pub fn on_outbound_timer(&mut self, dctx: &mut DispatchCtx, channel_id: u8, deadline: u64) {
        if usize::from(channel_id) >= self.channels.len() {
            return;
        }
        if deadline == 0
            || self.channels[usize::from(channel_id)].outbound.timer_deadline != deadline
        {
            return;
        }
        if dctx.now.saturating_sub(self.last_activity_time) > dctx.config.session_timeout_cycles {
            debug!("closing session {} due to timeout", self.id);
            self.close(dctx.driver.as_ref());
        } else {
            let template = self.fill_header(channel_id);
            let peer = self.peer();
            let channel = &mut self.channels[usize::from(channel_id)];
            let mut cctx = dctx.channel_ctx(peer, template);
            if let Err(e) = channel.outbound.send(&mut cctx) {
                warn!("retransmit failed: {}", e);
            }
        }
    }

    /// Adopt the server's session identity and drain queued RPCs onto the
    /// newly allocated channels.
    fn process_session_open_response(
        &mut self,
        dctx: &mut DispatchCtx,
        header: &Header,
        received: &Received,
    ) {
        if self.is_connected() {
            return;
        }
        let Some(response) = SessionOpenResponse::from_bytes(&received.data()[HEADER_SIZE..])
        else {
            warn!("session open response too short");
            return;
        };

        self.open_timer_deadline = 0;
        self.session_open_in_flight = false;
        self.server_session_hint = header.server_session_hint;
        self.token = header.session_token;

        let num_channels = response
            .num_channels
            .min(dctx.config.max_channels_per_session);
        debug!(
            "session {} open: {} channels (server offered {})",
            self.id, num_channels, response.num_channels
        );
        self.channels = (0..num_channels)
            .map(|i| ClientChannel::new(self.id, i))
            .collect();

        for channel_id in 0..num_channels {
            let Some(rpc) = self.channel_queue.pop_front() else {
                break;
            };
            if let Err(e) = self.start_rpc_on_channel(dctx, channel_id, rpc.clone()) {
                warn!("failed to start queued RPC: {}", e);
                rpc.borrow_mut().status = RpcStatus::Aborted;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Server session

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ServerChannelState {
    /// No RPC since the session opened.
    Idle,
    /// Request being reassembled.
    Receiving,
    /// Request complete, response not yet ready.
    Processing,
    /// Response transmitting, or finished and awaiting the next RPC.
    SendingWaiting,
}

pub(crate) struct ServerChannel {
    pub rpc_id: u32,
    pub state: ServerChannelState,
    pub inbound: InboundMessage,
    pub outbound: OutboundMessage,
}

impl ServerChannel {
    fn new(session_id: u32, channel_id: u8) -> Self {
        // Servers do not arm timers; the client resynchronizes both sides.
        Self {
            rpc_id: INVALID_RPC_ID,
            state: ServerChannelState::Idle,
            inbound: InboundMessage::new(
                false,
                TimerTask::InboundActivity {
                    session: session_id,
                    channel: channel_id,
                },
            ),
            outbound: OutboundMessage::new(
                false,
                TimerTask::OutboundRetransmit {
                    session: session_id,
                    channel: channel_id,
                },
            ),
        }
    }
}

/// Server half of a session.
pub(crate) struct ServerSession {
    pub id: u32,
    pub next_free: u32,
    pub token: u64,
    pub client_session_hint: u32,
    pub client_address: Option<Address>,
    pub last_activity_time: u64,
    pub channels: Vec<ServerChannel>,
}

impl TableSlot for ServerSession {
    fn next_free(&self) -> u32 {
        self.next_free
    }
    fn set_next_free(&mut self, next_free: u32) {
        self.next_free = next_free;
    }
    fn last_activity_time(&self) -> u64 {
        self.last_activity_time
    }
}

impl ServerSession {
    pub fn new(id: u32, num_channels: u8) -> Self {
        Self {
            id,
            next_free: TABLE_NONE,
            token: INVALID_TOKEN,
            client_session_hint: INVALID_HINT,
            client_address: None,
            last_activity_time: 0,
            channels: (0..num_channels)
                .map(|i| ServerChannel::new(id, i))
                .collect(),
        }
    }

    fn fill_header(&self, channel_id: u8) -> Header {
        let mut header = Header::new();
        header.rpc_id = self.channels[channel_id as usize].rpc_id;
        header.channel_id = channel_id;
        header.set_direction(Direction::ServerToClient);
        header.client_session_hint = self.client_session_hint;
        header.server_session_hint = self.id;
        header.session_token = self.token;
        header
    }

    fn peer(&self) -> Address {
        self.client_address.clone().expect("session has no address")
    }

    /// Adopt a new client: record its address and hint, mint a token, and
    /// answer with a session open response announcing our channel count.
    pub fn start_session(
        &mut self,
        dctx: &mut DispatchCtx,
        client_address: Address,
        client_session_hint: u32,
    ) {
        self.client_address = Some(client_address);
        self.client_session_hint = client_session_hint;
        self.token = loop {
            let token: u64 = rand::random();
            if token != INVALID_TOKEN {
                break token;
            }
        };

        let mut template = Header::new();
        template.set_direction(Direction::ServerToClient);
        template.client_session_hint = client_session_hint;
        template.server_session_hint = self.id;
        template.session_token = self.token;

        let num_channels = self.channels.len() as u8;
        let peer = self.peer();
        let cctx = dctx.channel_ctx(peer, template);
        cctx.send_control(PayloadType::SessionOpen, Some(&[num_channels]));
        self.last_activity_time = dctx.now;
    }

    /// Reclaim the session unless a request is still being processed by
    /// the application.
    pub fn expire(&mut self, driver: &dyn Driver) -> bool {
        if self
            .channels
            .iter()
            .any(|c| c.state == ServerChannelState::Processing)
        {
            return false;
        }
        for channel in &mut self.channels {
            if channel.state == ServerChannelState::Idle {
                continue;
            }
            channel.state = ServerChannelState::Idle;
            channel.rpc_id = INVALID_RPC_ID;
            channel.inbound.reset(driver);
            channel.outbound.reset();
        }
        self.token = INVALID_TOKEN;
        self.client_session_hint = INVALID_HINT;
        self.client_address = None;
        true
    }

    /// Switch a channel from Processing to SendingWaiting and start
    /// transmitting the reply.
    pub fn begin_sending(
        &mut self,
        dctx: &mut DispatchCtx,
        channel_id: u8,
        reply: Buffer,
    ) -> Result<()> {
        let template = self.fill_header(channel_id);
        let peer = self.peer();
        let channel = &mut self.channels[channel_id as usize];
        debug_assert_eq!(channel.state, ServerChannelState::Processing);
        channel.state = ServerChannelState::SendingWaiting;
        self.last_activity_time = dctx.now;
        let mut cctx = dctx.channel_ctx(peer, template);
        channel.outbound.begin_sending(&mut cctx, reply)
    }

    /// Route one inbound packet for this session. The caller has already
    /// validated the token.
    pub fn process_inbound_packet(
        &mut self,
        dctx: &mut DispatchCtx,
        header: &Header,
        received: &mut Received,
        ready_queue: &mut VecDeque<ServerRpc>,
    ) {
        self.last_activity_time = dctx.now;
        if u32::from(header.channel_id) >= self.channels.len() as u32 {
            warn!("invalid channel id {}", header.channel_id);
            return;
        }

        let channel_id = header.channel_id;
        let channel_rpc_id = self.channels[channel_id as usize].rpc_id;
        if channel_rpc_id == header.rpc_id {
            // Part of the RPC already running on this channel.
            match header.payload_type() {
                Some(PayloadType::Data) => {
                    self.process_received_data(dctx, channel_id, header, received, ready_queue)
                }
                Some(PayloadType::Ack) => {
                    let template = self.fill_header(channel_id);
                    let peer = self.peer();
                    let channel = &mut self.channels[channel_id as usize];
                    if channel.state == ServerChannelState::SendingWaiting {
                        let mut cctx = dctx.channel_ctx(peer, template);
                        channel.outbound.process_received_ack(&mut cctx, received);
                    }
                }
                other => warn!("current rpc has bad packet type {:?}", other),
            }
        } else if channel_rpc_id.wrapping_add(1) == header.rpc_id {
            // Start of the next RPC on this channel.
            match header.payload_type() {
                Some(PayloadType::Data) => {
                    {
                        let channel = &mut self.channels[channel_id as usize];
                        channel.state = ServerChannelState::Receiving;
                        channel.rpc_id = header.rpc_id;
                        channel.inbound.reset(dctx.driver.as_ref());
                        channel.outbound.reset();
                    }
                    let template = self.fill_header(channel_id);
                    let peer = self.peer();
                    let mut cctx = dctx.channel_ctx(peer, template);
                    self.channels[channel_id as usize].inbound.init(
                        &mut cctx,
                        u32::from(header.total_frags),
                        Buffer::new(),
                    );
                    self.process_received_data(dctx, channel_id, header, received, ready_queue);
                }
                other => warn!("new rpc has bad packet type {:?}", other),
            }
        } else {
            let packet_rpc_id = header.rpc_id;
            warn!(
                "packet from old rpc (packet rpcId {}, channel rpcId {})",
                packet_rpc_id, channel_rpc_id
            );
        }
    }

    fn process_received_data(
        &mut self,
        dctx: &mut DispatchCtx,
        channel_id: u8,
        header: &Header,
        received: &mut Received,
        ready_queue: &mut VecDeque<ServerRpc>,
    ) {
        let template = self.fill_header(channel_id);
        let peer = self.peer();
        let state = self.channels[channel_id as usize].state;
        match state {
            ServerChannelState::Idle => {
                warn!("data packet arrived for idle channel");
            }
            ServerChannelState::Receiving => {
                let complete = {
                    let mut cctx = dctx.channel_ctx(peer, template);
                    self.channels[channel_id as usize]
                        .inbound
                        .process_received_data(&mut cctx, header, received)
                };
                if complete {
                    let channel = &mut self.channels[channel_id as usize];
                    let recv_payload = channel.inbound.take_buffer().unwrap();
                    ready_queue.push_back(ServerRpc {
                        recv_payload,
                        reply_payload: Buffer::new(),
                        session_hint: self.id,
                        channel_id,
                        rpc_id: channel.rpc_id,
                    });
                    channel.state = ServerChannelState::Processing;
                }
            }
            ServerChannelState::Processing => {
                // A retransmitted fragment means the client thinks its last
                // packet was lost; a current ACK resynchronizes it.
                if header.request_ack() {
                    let cctx = dctx.channel_ctx(peer, template);
                    self.channels[channel_id as usize].inbound.send_ack(&cctx);
                }
            }
            ServerChannelState::SendingWaiting => {
                // Harmless retransmit from a client that has not yet seen
                // the start of our response; re-pace the outbound message.
                debug!("extraneous packet {}", header);
                let channel = &mut self.channels[channel_id as usize];
                let mut cctx = dctx.channel_ctx(peer, template);
                if let Err(e) = channel.outbound.send(&mut cctx) {
                    warn!("re-kicked send failed: {}", e);
                }
            }
        }
    }
}
