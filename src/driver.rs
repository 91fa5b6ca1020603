//! Abstract unreliable datagram endpoint beneath the transport.
//!
//! A [`Driver`] sends one datagram at a time, surfaces received datagrams
//! through a non-blocking poll, and owns the memory backing each received
//! payload until the transport either drops the wrapping [`Received`] or
//! steals the payload for zero-copy assembly into a Buffer.

use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;

use crate::buffer;
use crate::error::Result;

/// Opaque address of a peer endpoint. Drivers define the interpretation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address(String);

impl Address {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Address(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One inbound datagram as surfaced by [`Driver::try_recv`].
///
/// The payload memory belongs to the driver; the transport wraps the packet
/// in a [`Received`] which returns the memory on drop unless stolen.
pub struct Packet {
    pub sender: Address,
    pub payload: NonNull<u8>,
    pub len: u32,
}

/// An unreliable datagram endpoint.
///
/// `send_packet` is non-blocking and may silently lose packets; reliability
/// lives entirely above the driver.
pub trait Driver {
    /// Largest datagram this driver can carry, header and payload included.
    fn max_packet_size(&self) -> usize;

    /// Transmit one datagram: `header` bytes followed by the bytes produced
    /// by `payload`, if any. Returns once the packet has been handed to the
    /// OS; the caller may immediately reuse both memory regions.
    fn send_packet(
        &self,
        recipient: &Address,
        header: &[u8],
        payload: Option<&mut buffer::Iter<'_>>,
    ) -> Result<()>;

    /// Poll for one received datagram. Non-blocking.
    fn try_recv(&self) -> Option<Packet>;

    /// Return payload memory previously surfaced through `try_recv`.
    fn release(&self, payload: NonNull<u8>, len: u32);

    /// Parse a service locator into a driver address.
    fn new_address(&self, locator: &str) -> Result<Address>;

    /// The locator other endpoints can use to reach this driver.
    fn service_locator(&self) -> String;
}

/// A received datagram with ownership tracking for its payload memory.
///
/// Dropping a `Received` that still owns its payload hands the memory back
/// to the driver. [`steal`](Received::steal) transfers that responsibility
/// to the caller, which must eventually call [`Driver::release`] itself
/// (in the transport, via a Buffer chunk release closure).
pub struct Received {
    driver: Rc<dyn Driver>,
    sender: Address,
    payload: Option<NonNull<u8>>,
    len: u32,
}

impl Received {
    pub fn new(driver: Rc<dyn Driver>, packet: Packet) -> Self {
        Self {
            driver,
            sender: packet.sender,
            payload: Some(packet.payload),
            len: packet.len,
        }
    }

    pub fn sender(&self) -> &Address {
        &self.sender
    }

    #[inline]
    pub fn len(&self) -> u32 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The packet bytes. Empty if the payload has been stolen.
    pub fn data(&self) -> &[u8] {
        match self.payload {
            Some(ptr) => unsafe { std::slice::from_raw_parts(ptr.as_ptr(), self.len as usize) },
            None => &[],
        }
    }

    /// Take over responsibility for the payload memory. The caller must
    /// eventually release it back to the driver that produced it.
    pub fn steal(&mut self) -> Option<(NonNull<u8>, u32)> {
        self.payload.take().map(|ptr| (ptr, self.len))
    }
}

impl Drop for Received {
    fn drop(&mut self) {
        if let Some(ptr) = self.payload.take() {
            self.driver.release(ptr, self.len);
        }
    }
}
