//! A driver that runs without a network or a remote counterpart.
//!
//! [`MockDriver`] records every packet sent through it and lets tests queue
//! inbound packets by hand. It also accounts for every payload allocation it
//! surfaces, so tests can assert that stolen driver memory is always
//! released.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::ptr::NonNull;

use crate::buffer;
use crate::driver::{Address, Driver, Packet};
use crate::error::Result;

/// Default maximum packet size for mock networks.
pub const MOCK_MAX_PACKET_SIZE: usize = 1400;

/// An in-memory [`Driver`] for tests.
pub struct MockDriver {
    locator: String,
    max_packet_size: usize,
    /// Packets sent through this driver, in order.
    sent: RefCell<VecDeque<(Address, Vec<u8>)>>,
    /// Inbound packets queued for `try_recv`.
    inbound: RefCell<VecDeque<Packet>>,
    /// Payload allocations currently owned by the receiving side,
    /// address -> length.
    outstanding: RefCell<HashMap<usize, u32>>,
    send_packet_count: Cell<u32>,
    release_count: Cell<u32>,
}

impl MockDriver {
    pub fn new<S: Into<String>>(locator: S) -> Self {
        Self {
            locator: locator.into(),
            max_packet_size: MOCK_MAX_PACKET_SIZE,
            sent: RefCell::new(VecDeque::new()),
            inbound: RefCell::new(VecDeque::new()),
            outstanding: RefCell::new(HashMap::new()),
            send_packet_count: Cell::new(0),
            release_count: Cell::new(0),
        }
    }

    pub fn with_max_packet_size(mut self, max_packet_size: usize) -> Self {
        self.max_packet_size = max_packet_size;
        self
    }

    /// Queue an inbound packet as if it had arrived from `sender`.
    pub fn deliver(&self, sender: &Address, bytes: &[u8]) {
        let len = bytes.len() as u32;
        let mut boxed = bytes.to_vec().into_boxed_slice();
        let ptr = boxed.as_mut_ptr();
        std::mem::forget(boxed);
        self.outstanding.borrow_mut().insert(ptr as usize, len);
        self.inbound.borrow_mut().push_back(Packet {
            sender: sender.clone(),
            payload: NonNull::new(ptr).unwrap(),
            len,
        });
    }

    /// Drain and return every packet sent so far.
    pub fn take_sent(&self) -> Vec<(Address, Vec<u8>)> {
        self.sent.borrow_mut().drain(..).collect()
    }

    /// Number of packets sent and not yet drained.
    pub fn sent_count(&self) -> usize {
        self.sent.borrow().len()
    }

    /// Payload allocations surfaced to a receiver and not yet released.
    pub fn outstanding_payloads(&self) -> usize {
        self.outstanding.borrow().len()
    }

    /// Total calls to `send_packet`.
    pub fn send_packet_count(&self) -> u32 {
        self.send_packet_count.get()
    }

    /// Total calls to `release`.
    pub fn release_count(&self) -> u32 {
        self.release_count.get()
    }

    fn free(&self, payload: NonNull<u8>) {
        let len = self
            .outstanding
            .borrow_mut()
            .remove(&(payload.as_ptr() as usize))
            .expect("release of unknown payload");
        unsafe {
            drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                payload.as_ptr(),
                len as usize,
            )));
        }
    }
}

impl Driver for MockDriver {
    fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    fn send_packet(
        &self,
        recipient: &Address,
        header: &[u8],
        payload: Option<&mut buffer::Iter<'_>>,
    ) -> Result<()> {
        self.send_packet_count.set(self.send_packet_count.get() + 1);
        let mut bytes = header.to_vec();
        if let Some(iter) = payload {
            for piece in iter {
                bytes.extend_from_slice(piece);
            }
        }
        debug_assert!(bytes.len() <= self.max_packet_size);
        self.sent.borrow_mut().push_back((recipient.clone(), bytes));
        Ok(())
    }

    fn try_recv(&self) -> Option<Packet> {
        self.inbound.borrow_mut().pop_front()
    }

    fn release(&self, payload: NonNull<u8>, _len: u32) {
        self.release_count.set(self.release_count.get() + 1);
        self.free(payload);
    }

    fn new_address(&self, locator: &str) -> Result<Address> {
        Ok(Address::new(locator))
    }

    fn service_locator(&self) -> String {
        self.locator.clone()
    }
}

impl Drop for MockDriver {
    fn drop(&mut self) {
        // Packets queued but never received still own their allocations.
        let queued: Vec<Packet> = self.inbound.borrow_mut().drain(..).collect();
        for packet in queued {
            self.free(packet.payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::Buffer;
    use crate::driver::Received;
    use std::rc::Rc;

    #[test]
    fn test_send_flattens_header_and_payload() {
        let driver = MockDriver::new("mock:");
        let mut payload = Buffer::new();
        payload.append(b"abc");
        payload.append(b"def");

        let mut iter = payload.iter();
        driver
            .send_packet(&Address::new("peer"), b"HD", Some(&mut iter))
            .unwrap();

        let sent = driver.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, Address::new("peer"));
        assert_eq!(sent[0].1, b"HDabcdef");
        assert_eq!(driver.send_packet_count(), 1);
    }

    #[test]
    fn test_deliver_and_release_accounting() {
        let driver = Rc::new(MockDriver::new("mock:"));
        let sender = Address::new("peer");
        driver.deliver(&sender, b"payload");
        assert_eq!(driver.outstanding_payloads(), 1);

        let packet = driver.try_recv().unwrap();
        let received = Received::new(driver.clone() as Rc<dyn Driver>, packet);
        assert_eq!(received.data(), b"payload");
        drop(received);

        assert_eq!(driver.outstanding_payloads(), 0);
        assert_eq!(driver.release_count(), 1);
        assert!(driver.try_recv().is_none());
    }
}
