//! Shared harness for transport integration tests: two transports joined by
//! mock drivers, a controllable cycle clock, and a packet pump with an
//! optional drop filter.

use std::cell::Cell;
use std::rc::Rc;

use fastrpc::{
    Address, CycleClock, Driver, Header, MockDriver, PayloadType, Transport, TransportConfig,
};

/// Per-fragment retransmit timeout used by the harness.
pub const TIMEOUT: u64 = 1_000;

/// Aggregate session timeout used by the harness.
pub const SESSION_TIMEOUT: u64 = 50_000;

/// Data bytes per fragment on harness networks.
pub const FRAG_DATA: usize = 1_000;

/// A cycle counter the test advances by hand.
#[derive(Clone)]
pub struct TestClock {
    now: Rc<Cell<u64>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(1)),
        }
    }

    pub fn cycle_clock(&self) -> CycleClock {
        let now = Rc::clone(&self.now);
        CycleClock::new(move || now.get())
    }

    pub fn advance(&self, cycles: u64) {
        self.now.set(self.now.get() + cycles);
    }

    pub fn now(&self) -> u64 {
        self.now.get()
    }
}

/// A client and a server transport joined by in-memory drivers.
pub struct TestPair {
    pub clock: TestClock,
    pub client_driver: Rc<MockDriver>,
    pub server_driver: Rc<MockDriver>,
    pub client: Transport,
    pub server: Transport,
    client_addr: Address,
    server_addr: Address,
}

impl TestPair {
    pub fn new() -> Self {
        Self::with_config(|config| config)
    }

    /// Build a pair whose configuration is adjusted by `tweak`.
    pub fn with_config(tweak: impl Fn(TransportConfig) -> TransportConfig) -> Self {
        let clock = TestClock::new();
        let config = tweak(
            TransportConfig::default()
                .with_timeout_cycles(TIMEOUT)
                .with_session_timeout_cycles(SESSION_TIMEOUT)
                .with_clock(clock.cycle_clock()),
        );

        let max_packet = fastrpc::HEADER_SIZE + FRAG_DATA;
        let client_driver =
            Rc::new(MockDriver::new("mock:client").with_max_packet_size(max_packet));
        let server_driver =
            Rc::new(MockDriver::new("mock:server").with_max_packet_size(max_packet));

        let client = Transport::new(client_driver.clone() as Rc<dyn Driver>, config.clone())
            .expect("client transport");
        let server = Transport::new(server_driver.clone() as Rc<dyn Driver>, config)
            .expect("server transport");

        Self {
            clock,
            client_driver,
            server_driver,
            client,
            server,
            client_addr: Address::new("mock:client"),
            server_addr: Address::new("mock:server"),
        }
    }

    /// Replace the server with a fresh transport that has forgotten every
    /// session, as after a restart.
    pub fn restart_server(&mut self) {
        let max_packet = fastrpc::HEADER_SIZE + FRAG_DATA;
        let server_driver =
            Rc::new(MockDriver::new("mock:server").with_max_packet_size(max_packet));
        let config = self.client.config().clone();
        self.server = Transport::new(server_driver.clone() as Rc<dyn Driver>, config)
            .expect("server transport");
        self.server_driver = server_driver;
    }

    /// Shuttle packets between the two transports until a full round of
    /// polls produces nothing new.
    pub fn pump(&self) {
        self.pump_filtered(|_| true);
    }

    /// Like `pump`, but packets for which `keep` returns false are lost in
    /// transit. The filter sees the raw bytes of every packet in both
    /// directions.
    pub fn pump_filtered(&self, mut keep: impl FnMut(&[u8]) -> bool) {
        loop {
            self.client.poll();
            self.server.poll();

            let client_out = self.client_driver.take_sent();
            let server_out = self.server_driver.take_sent();
            if client_out.is_empty() && server_out.is_empty() {
                break;
            }
            for (_recipient, bytes) in client_out {
                if keep(&bytes) {
                    self.server_driver.deliver(&self.client_addr, &bytes);
                }
            }
            for (_recipient, bytes) in server_out {
                if keep(&bytes) {
                    self.client_driver.deliver(&self.server_addr, &bytes);
                }
            }
        }
    }

    /// Assert that every driver payload surfaced to either transport has
    /// been returned.
    pub fn assert_no_payload_leaks(&self) {
        assert_eq!(self.client_driver.outstanding_payloads(), 0, "client leak");
        assert_eq!(self.server_driver.outstanding_payloads(), 0, "server leak");
    }
}

/// Classify a raw packet for filter decisions.
pub fn packet_kind(bytes: &[u8]) -> (Option<PayloadType>, u16, bool) {
    let header = Header::from_bytes(bytes).expect("runt packet in pump");
    let frag_number = header.frag_number;
    (header.payload_type(), frag_number, header.request_ack())
}

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
