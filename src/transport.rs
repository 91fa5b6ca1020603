//! The transport: reliable RPC over an unreliable datagram driver.
//!
//! One [`Transport`] owns a driver, a table of client sessions, a table of
//! server sessions, the queue of server RPCs awaiting application pickup,
//! and all timers. A single-threaded cooperative [`poll`](Transport::poll)
//! loop drains the driver and fires due timers; [`ClientRpc::wait`] simply
//! polls until its RPC leaves the in-progress state.
//!
//! Inbound packets are demultiplexed in O(1) by the session hint carried in
//! every header, guarded by the per-session random token: a packet whose
//! token does not match the hinted session is answered with BAD_SESSION
//! (server side) or dropped (client side).

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;

use log::{debug, warn};

use crate::buffer::Buffer;
use crate::config::TransportConfig;
use crate::driver::{Address, Driver, Received};
use crate::error::{Error, Result};
use crate::packet::{Direction, Header, PayloadType, HEADER_SIZE};
use crate::session::{
    ClientSession, DispatchCtx, RpcHandle, RpcState, RpcStatus, ServerChannelState, ServerRpc,
    ServerSession, SessionTable,
};
use crate::timing::{TimerEntry, TimerQueue, TimerTask};

/// A reference-counted handle to a client session slot.
///
/// While any `SessionRef` for a slot is alive the slot cannot be expired or
/// reused.
#[derive(Clone)]
pub struct SessionRef {
    hint: u32,
    _ref_token: Rc<()>,
}

/// One client-side RPC in flight.
///
/// Obtained from [`Transport::client_send`]; completion is observed through
/// [`is_ready`](ClientRpc::is_ready) or by blocking in
/// [`wait`](ClientRpc::wait).
pub struct ClientRpc {
    state: RpcHandle,
}

impl ClientRpc {
    /// Whether the RPC has completed or aborted.
    pub fn is_ready(&self) -> bool {
        self.state.borrow().status != RpcStatus::InProgress
    }

    /// Drive the transport until the RPC completes, returning the response
    /// buffer, or [`Error::Aborted`] if the session was lost.
    pub fn wait(self, transport: &Transport) -> Result<Buffer> {
        loop {
            let status = self.state.borrow().status;
            match status {
                RpcStatus::InProgress => {
                    transport.poll();
                }
                RpcStatus::Completed => break,
                RpcStatus::Aborted => return Err(Error::Aborted),
            }
        }
        let mut state = self.state.borrow_mut();
        Ok(state
            .response
            .take()
            .expect("completed RPC without a response"))
    }
}

/// Reliable request/response transport over an unreliable datagram driver.
pub struct Transport {
    driver: Rc<dyn Driver>,
    config: TransportConfig,
    client_sessions: RefCell<SessionTable<ClientSession>>,
    server_sessions: RefCell<SessionTable<ServerSession>>,
    /// Completed inbound requests awaiting `server_recv`.
    server_ready_queue: RefCell<VecDeque<ServerRpc>>,
    timers: RefCell<TimerQueue>,
    /// Cycle time as of the last poll; never 0 (0 is the "never sent"
    /// marker in retransmit bookkeeping).
    current_time: Cell<u64>,
}

impl Transport {
    /// Create a transport on top of `driver`.
    pub fn new(driver: Rc<dyn Driver>, config: TransportConfig) -> Result<Self> {
        if config.window_size == 0 {
            return Err(Error::InvalidConfig("window_size must be nonzero".into()));
        }
        if config.req_ack_after == 0 {
            return Err(Error::InvalidConfig("req_ack_after must be nonzero".into()));
        }
        if config.timeout_cycles == 0
            || config.session_timeout_cycles < config.timeout_cycles
        {
            return Err(Error::InvalidConfig(
                "session timeout must cover at least one retransmit timeout".into(),
            ));
        }
        if config.num_channels_per_session == 0 || config.max_channels_per_session == 0 {
            return Err(Error::InvalidConfig("channel counts must be nonzero".into()));
        }
        if driver.max_packet_size() <= HEADER_SIZE {
            return Err(Error::InvalidConfig(
                "driver packets too small for a header".into(),
            ));
        }

        let current_time = config.clock.now().max(1);
        Ok(Self {
            driver,
            config,
            client_sessions: RefCell::new(SessionTable::new()),
            server_sessions: RefCell::new(SessionTable::new()),
            server_ready_queue: RefCell::new(VecDeque::new()),
            timers: RefCell::new(TimerQueue::new()),
            current_time: Cell::new(current_time),
        })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// The locator peers can use to reach this transport.
    pub fn service_locator(&self) -> String {
        self.driver.service_locator()
    }

    /// Run one iteration of the cooperative loop: deliver every waiting
    /// inbound packet, then fire due timers. Returns the number of events
    /// processed.
    pub fn poll(&self) -> usize {
        self.refresh_time();
        let mut events = 0;
        while let Some(packet) = self.driver.try_recv() {
            let received = Received::new(Rc::clone(&self.driver), packet);
            self.handle_incoming_packet(received);
            events += 1;
        }
        events + self.process_timers()
    }

    fn refresh_time(&self) {
        self.current_time.set(self.config.clock.now().max(1));
    }

    /// Open (or reuse) a client session to the server at `locator`.
    pub fn get_session(&self, locator: &str) -> Result<SessionRef> {
        self.refresh_time();
        let address = self.driver.new_address(locator)?;
        let now = self.current_time.get();

        let mut sessions = self.client_sessions.borrow_mut();
        let driver = Rc::clone(&self.driver);
        sessions.expire_with(now, self.config.session_timeout_cycles, |session| {
            session.expire(driver.as_ref())
        });

        let hint = sessions.get_with(ClientSession::new);
        let session = sessions.get_mut(hint).unwrap();
        session.init(address);
        session.last_activity_time = now;
        Ok(SessionRef {
            hint,
            _ref_token: Rc::clone(&session.ref_token),
        })
    }

    /// Start an RPC on `session`: the request buffer is transmitted to the
    /// peer and the response will accumulate into `response`.
    ///
    /// A driver failure on the initial transmission surfaces here; once
    /// this returns, all further failures are reported through
    /// [`ClientRpc::wait`].
    pub fn client_send(
        &self,
        session: &SessionRef,
        request: Buffer,
        response: Buffer,
    ) -> Result<ClientRpc> {
        self.refresh_time();
        let state: RpcHandle = Rc::new(RefCell::new(RpcState {
            request: Some(request),
            response: Some(response),
            status: RpcStatus::InProgress,
        }));

        let mut sessions = self.client_sessions.borrow_mut();
        let session = sessions
            .get_mut(session.hint)
            .expect("SessionRef outlived its table");
        let mut timers = self.timers.borrow_mut();
        let mut dctx = DispatchCtx {
            driver: &self.driver,
            config: &self.config,
            timers: &mut timers,
            now: self.current_time.get(),
        };
        session.client_send(&mut dctx, Rc::clone(&state))?;
        Ok(ClientRpc { state })
    }

    /// Dequeue one inbound RPC whose request is complete, if any.
    pub fn server_recv(&self) -> Option<ServerRpc> {
        self.server_ready_queue.borrow_mut().pop_front()
    }

    /// Transmit the reply of an RPC obtained from `server_recv`.
    pub fn send_reply(&self, rpc: ServerRpc) -> Result<()> {
        self.refresh_time();
        let ServerRpc {
            recv_payload,
            reply_payload,
            session_hint,
            channel_id,
            rpc_id,
        } = rpc;
        // The request memory goes back to the driver here.
        drop(recv_payload);

        let mut sessions = self.server_sessions.borrow_mut();
        let Some(session) = sessions.get_mut(session_hint) else {
            warn!("reply for vanished session {}", session_hint);
            return Ok(());
        };
        let channel = &session.channels[usize::from(channel_id)];
        if channel.rpc_id != rpc_id || channel.state != ServerChannelState::Processing {
            warn!(
                "reply for stale rpc {} on session {} channel {}",
                rpc_id, session_hint, channel_id
            );
            return Ok(());
        }

        let mut timers = self.timers.borrow_mut();
        let mut dctx = DispatchCtx {
            driver: &self.driver,
            config: &self.config,
            timers: &mut timers,
            now: self.current_time.get(),
        };
        session.begin_sending(&mut dctx, channel_id, reply_payload)
    }

    /// Process one packet delivered by the driver. Malformed, stale, and
    /// mismatched packets are logged and recovered here; they never error.
    pub fn handle_incoming_packet(&self, mut received: Received) {
        let Some(header) = Header::from_bytes(received.data()) else {
            warn!("packet too short ({} bytes)", received.len());
            return;
        };
        if header.please_drop() {
            debug!("dropped (pleaseDrop)");
            return;
        }

        match header.direction() {
            Direction::ClientToServer => self.dispatch_to_server(&header, &mut received),
            Direction::ServerToClient => self.dispatch_to_client(&header, &mut received),
        }
    }

    fn dispatch_to_server(&self, header: &Header, received: &mut Received) {
        let now = self.current_time.get();
        let mut sessions = self.server_sessions.borrow_mut();

        if header.server_session_hint >= sessions.size() {
            if header.payload_type() == Some(PayloadType::SessionOpen) {
                // A new client; reclaim an idle slot or grow the table.
                let client_hint = header.client_session_hint;
                debug!("opening session for client hint {:x}", client_hint);
                let driver = Rc::clone(&self.driver);
                sessions.expire_with(now, self.config.session_timeout_cycles, |session| {
                    session.expire(driver.as_ref())
                });
                let num_channels = self.config.num_channels_per_session;
                let hint = sessions.get_with(|id| ServerSession::new(id, num_channels));
                let session = sessions.get_mut(hint).unwrap();

                let mut timers = self.timers.borrow_mut();
                let mut dctx = DispatchCtx {
                    driver: &self.driver,
                    config: &self.config,
                    timers: &mut timers,
                    now,
                };
                session.start_session(&mut dctx, received.sender().clone(), client_hint);
            } else {
                let hint = header.server_session_hint;
                warn!("bad session hint {:x}", hint);
                self.send_bad_session(header, received.sender());
            }
            return;
        }

        let session = sessions.get_mut(header.server_session_hint).unwrap();
        if session.token == header.session_token {
            let mut timers = self.timers.borrow_mut();
            let mut dctx = DispatchCtx {
                driver: &self.driver,
                config: &self.config,
                timers: &mut timers,
                now,
            };
            let mut ready = self.server_ready_queue.borrow_mut();
            session.process_inbound_packet(&mut dctx, header, received, &mut ready);
        } else {
            let session_token = session.token;
            let packet_token = header.session_token;
            let hint = header.server_session_hint;
            warn!(
                "bad session token ({:x} in session {:x}, {:x} in packet)",
                session_token, hint, packet_token
            );
            self.send_bad_session(header, received.sender());
        }
    }

    fn dispatch_to_client(&self, header: &Header, received: &mut Received) {
        let mut sessions = self.client_sessions.borrow_mut();
        if header.client_session_hint >= sessions.size() {
            let hint = header.client_session_hint;
            warn!("bad client session hint {:x}", hint);
            return;
        }
        let session = sessions.get_mut(header.client_session_hint).unwrap();
        if session.token == header.session_token
            || header.payload_type() == Some(PayloadType::SessionOpen)
        {
            let mut timers = self.timers.borrow_mut();
            let mut dctx = DispatchCtx {
                driver: &self.driver,
                config: &self.config,
                timers: &mut timers,
                now: self.current_time.get(),
            };
            session.process_inbound_packet(&mut dctx, header, received);
        } else {
            let session_token = session.token;
            let packet_token = header.session_token;
            let hint = header.client_session_hint;
            warn!(
                "bad fragment token ({:x} in session {:x}, {:x} in packet), dropping",
                session_token, hint, packet_token
            );
        }
    }

    /// Tell a peer its session is unknown, echoing the identifying fields
    /// so it can find its own state.
    fn send_bad_session(&self, header: &Header, address: &Address) {
        let mut reply = Header::new();
        reply.session_token = header.session_token;
        reply.rpc_id = header.rpc_id;
        reply.client_session_hint = header.client_session_hint;
        reply.server_session_hint = header.server_session_hint;
        reply.channel_id = header.channel_id;
        reply.set_direction(Direction::ServerToClient);
        reply.set_payload_type(PayloadType::BadSession);
        if let Err(e) = self.driver.send_packet(address, &reply.to_bytes(), None) {
            warn!("failed to send BAD_SESSION: {}", e);
        }
    }

    /// Fire every due timer. Stale entries (owner re-armed or disarmed) are
    /// discarded by deadline mismatch.
    fn process_timers(&self) -> usize {
        let now = self.current_time.get();
        let mut fired = 0;
        loop {
            let entry = self.timers.borrow_mut().pop_due(now);
            let Some(entry) = entry else { break };
            self.fire_timer(entry);
            fired += 1;
        }
        fired
    }

    fn fire_timer(&self, entry: TimerEntry) {
        let mut sessions = self.client_sessions.borrow_mut();
        let mut timers = self.timers.borrow_mut();
        let mut dctx = DispatchCtx {
            driver: &self.driver,
            config: &self.config,
            timers: &mut timers,
            now: self.current_time.get(),
        };
        match entry.task {
            TimerTask::SessionOpen { session } => {
                if let Some(session) = sessions.get_mut(session) {
                    session.on_open_timer(&mut dctx, entry.deadline);
                }
            }
            TimerTask::InboundActivity { session, channel } => {
                if let Some(session) = sessions.get_mut(session) {
                    session.on_inbound_timer(&mut dctx, channel, entry.deadline);
                }
            }
            TimerTask::OutboundRetransmit { session, channel } => {
                if let Some(session) = sessions.get_mut(session) {
                    session.on_outbound_timer(&mut dctx, channel, entry.deadline);
                }
            }
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        // Sessions may hold driver payload memory in staging windows and
        // assembled buffers; hand it all back before the driver goes away.
        let driver = Rc::clone(&self.driver);
        for session in self.client_sessions.borrow_mut().iter_mut() {
            session.close(driver.as_ref());
        }
        for session in self.server_sessions.borrow_mut().iter_mut() {
            for channel in &mut session.channels {
                channel.inbound.reset(driver.as_ref());
                channel.outbound.reset();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use crate::packet::MAX_STAGING_FRAGMENTS;

    fn transport() -> (Rc<MockDriver>, Transport) {
        let driver = Rc::new(MockDriver::new("mock:server"));
        let transport = Transport::new(
            driver.clone() as Rc<dyn Driver>,
            TransportConfig::default(),
        )
        .unwrap();
        (driver, transport)
    }

    fn deliver(driver: &MockDriver, header: &Header, body: &[u8]) {
        let mut bytes = header.to_bytes().to_vec();
        bytes.extend_from_slice(body);
        driver.deliver(&Address::new("client"), &bytes);
    }

    #[test]
    fn test_config_validation() {
        let driver = Rc::new(MockDriver::new("mock:"));
        let bad = TransportConfig::default().with_window_size(0);
        assert!(Transport::new(driver.clone() as Rc<dyn Driver>, bad).is_err());

        let bad = TransportConfig::default()
            .with_timeout_cycles(100)
            .with_session_timeout_cycles(50);
        assert!(Transport::new(driver as Rc<dyn Driver>, bad).is_err());
    }

    #[test]
    fn test_short_packet_dropped() {
        let (driver, transport) = transport();
        driver.deliver(&Address::new("client"), &[0u8; HEADER_SIZE - 1]);
        transport.poll();
        assert_eq!(driver.sent_count(), 0);
        assert_eq!(driver.outstanding_payloads(), 0);
    }

    #[test]
    fn test_please_drop_honored() {
        let (driver, transport) = transport();
        let mut header = Header::new();
        header.set_payload_type(PayloadType::SessionOpen);
        header.server_session_hint = crate::session::INVALID_HINT;
        header.set_please_drop(true);
        deliver(&driver, &header, &[]);
        transport.poll();
        // No session open response; the packet was thrown away.
        assert_eq!(driver.sent_count(), 0);
    }

    #[test]
    fn test_unknown_session_gets_bad_session() {
        let (driver, transport) = transport();
        let mut header = Header::new();
        header.session_token = 0x1234;
        header.server_session_hint = 7;
        header.rpc_id = 3;
        header.channel_id = 1;
        header.set_payload_type(PayloadType::Data);
        deliver(&driver, &header, b"data");
        transport.poll();

        let sent = driver.take_sent();
        assert_eq!(sent.len(), 1);
        let reply = Header::from_bytes(&sent[0].1).unwrap();
        assert_eq!(reply.payload_type(), Some(PayloadType::BadSession));
        assert_eq!(reply.direction(), Direction::ServerToClient);
        let (token, rpc_id, channel_id) = (reply.session_token, reply.rpc_id, reply.channel_id);
        assert_eq!(token, 0x1234);
        assert_eq!(rpc_id, 3);
        assert_eq!(channel_id, 1);
    }

    #[test]
    fn test_session_open_allocates_and_responds() {
        let (driver, transport) = transport();
        let mut header = Header::new();
        header.client_session_hint = 5;
        header.server_session_hint = crate::session::INVALID_HINT;
        header.set_payload_type(PayloadType::SessionOpen);
        deliver(&driver, &header, &[]);
        transport.poll();

        let sent = driver.take_sent();
        assert_eq!(sent.len(), 1);
        let reply = Header::from_bytes(&sent[0].1).unwrap();
        assert_eq!(reply.payload_type(), Some(PayloadType::SessionOpen));
        let (client_hint, server_hint) = (reply.client_session_hint, reply.server_session_hint);
        assert_eq!(client_hint, 5);
        assert_eq!(server_hint, 0);
        let token = reply.session_token;
        assert_ne!(token, 0);
        assert_eq!(sent[0].1[HEADER_SIZE], 8);

        // A data packet with the wrong token is rejected.
        let mut bogus = Header::new();
        bogus.server_session_hint = 0;
        bogus.session_token = token ^ 1;
        bogus.set_payload_type(PayloadType::Data);
        deliver(&driver, &bogus, b"x");
        transport.poll();
        let sent = driver.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            Header::from_bytes(&sent[0].1).unwrap().payload_type(),
            Some(PayloadType::BadSession)
        );
    }

    #[test]
    fn test_server_recv_empty() {
        let (_driver, transport) = transport();
        assert!(transport.server_recv().is_none());
    }

    #[test]
    fn test_window_constants_cover_staging() {
        // The send window may never outrun what the receiver can stage.
        let config = TransportConfig::default();
        assert!(config.window_size <= MAX_STAGING_FRAGMENTS);
    }
}
