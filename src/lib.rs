//! # fastrpc: reliable RPC over unreliable datagrams
//!
//! This crate layers a reliable, fragmenting, windowed request/response
//! transport on top of any unreliable datagram [`Driver`], together with the
//! two data-plane primitives the transport is built from:
//!
//! - **Zero-copy buffers**: [`Buffer`] assembles requests and replies from
//!   discontiguous chunks, including driver packet memory adopted without a
//!   copy and returned to the driver when the buffer is dropped.
//! - **Pointer hash index**: [`HashIndex`] maps 128-bit keys to tagged
//!   referent addresses through cache-line-packed buckets with a
//!   secondary-hash fast reject, for storage layers built on this transport.
//!
//! ## Protocol
//!
//! Endpoints exchange fragments over long-lived sessions, each multiplexing
//! several channels so one slow RPC does not block the rest. Sessions open
//! with a handshake that mints a random token; every later packet carries
//! the token plus compact table hints for O(1) demultiplexing. Within a
//! channel, a sender keeps at most a window of unacknowledged fragments in
//! flight, requests an ACK every few packets, and retransmits on timeout;
//! the receiver stages out-of-order fragments in a bounded window and
//! reports holes in an ACK bitmap.
//!
//! ## Usage
//!
//! ```ignore
//! use fastrpc::{Buffer, Transport, TransportConfig};
//!
//! let transport = Transport::new(driver, TransportConfig::default())?;
//!
//! // Client side.
//! let session = transport.get_session("fast+udp: host=server, port=12242")?;
//! let mut request = Buffer::new();
//! request.append(b"ping");
//! let rpc = transport.client_send(&session, request, Buffer::new())?;
//! let response = rpc.wait(&transport)?;
//!
//! // Server side.
//! loop {
//!     transport.poll();
//!     if let Some(mut rpc) = transport.server_recv() {
//!         rpc.reply_payload.append(b"pong");
//!         transport.send_reply(rpc)?;
//!     }
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`buffer`]: chunked byte buffers (`Buffer`)
//! - [`index`]: cache-line-packed pointer index (`HashIndex`)
//! - [`packet`]: wire format (`Header`, `AckResponse`)
//! - [`driver`]: the datagram endpoint contract (`Driver`, `Received`)
//! - `message`: fragment reassembly and windowed sending
//! - `session`: client/server session and channel state machines
//! - `timing`: the dispatcher's timer heap
//! - `transport`: packet dispatch and the public RPC surface
//! - [`mock`]: an in-memory driver for tests
//!
//! The whole stack is single-threaded and cooperative: one `poll` loop owns
//! the driver, the sessions, and every timer.

pub mod buffer;
pub mod config;
pub mod driver;
pub mod error;
pub mod index;
pub mod mock;
pub mod packet;

mod message;
mod session;
mod timing;
mod transport;
mod window;

pub use buffer::Buffer;
pub use config::{CycleClock, TransportConfig};
pub use driver::{Address, Driver, Packet, Received};
pub use error::{Error, Result};
pub use index::{HashIndex, Referent};
pub use mock::MockDriver;
pub use packet::{AckResponse, Header, PayloadType, HEADER_SIZE, MAX_STAGING_FRAGMENTS};
pub use session::ServerRpc;
pub use transport::{ClientRpc, SessionRef, Transport};
