//! Fragment-level send and receive machinery.
//!
//! An [`InboundMessage`] reassembles DATA fragments into a destination
//! [`Buffer`], staging out-of-order arrivals in a bounded sliding window and
//! answering ACK requests with a bitmap of what is staged. An
//! [`OutboundMessage`] fragments a send Buffer, paces transmission against
//! the receiver's window, requests ACKs periodically, and retransmits
//! fragments whose ACKs are overdue.
//!
//! Both sides steal driver payload memory instead of copying: a received
//! fragment's bytes are appended to the destination Buffer as a chunk whose
//! release closure hands the memory back to the driver.

use std::ptr::NonNull;
use std::rc::Rc;

use log::{debug, warn};

use crate::buffer::Buffer;
use crate::config::TransportConfig;
use crate::driver::{Address, Driver, Received};
use crate::error::Result;
use crate::packet::{
    AckResponse, Header, PayloadType, ACK_RESPONSE_SIZE, HEADER_SIZE, MAX_STAGING_FRAGMENTS,
};
use crate::timing::{TimerQueue, TimerTask};
use crate::window::Window;

/// Marker in `sent_times` for a fragment the receiver has acknowledged.
const ACKED: u64 = u64::MAX;

/// Bytes of message data carried per fragment.
#[inline]
pub(crate) fn data_per_fragment(max_packet_size: usize) -> u32 {
    (max_packet_size - HEADER_SIZE) as u32
}

/// Fragments needed to carry `length` bytes.
#[inline]
pub(crate) fn num_frags(length: u32, per_fragment: u32) -> u32 {
    (length + per_fragment - 1) / per_fragment
}

/// Everything a message needs from its surroundings to act on a packet:
/// the driver to send with, protocol constants, the timer queue, the
/// current time, the peer address, and a header prefilled with the owning
/// session and channel identity.
pub(crate) struct ChannelCtx<'a> {
    pub driver: &'a Rc<dyn Driver>,
    pub config: &'a TransportConfig,
    pub timers: &'a mut TimerQueue,
    pub now: u64,
    pub peer: Address,
    pub template: Header,
}

impl ChannelCtx<'_> {
    /// Send a packet built from the template with the given payload type and
    /// an optional body. Errors are logged; the reliability machinery will
    /// recover from the lost packet like any other.
    pub(crate) fn send_control(&self, payload_type: PayloadType, body: Option<&[u8]>) {
        let mut header = self.template;
        header.set_payload_type(payload_type);
        let mut payload = Buffer::new();
        if let Some(body) = body {
            payload.append(body);
        }
        let mut iter = payload.iter();
        let result = self
            .driver
            .send_packet(&self.peer, &header.to_bytes(), Some(&mut iter));
        if let Err(e) = result {
            warn!("failed to send {:?} packet: {}", payload_type, e);
        }
    }
}

/// Accumulates fragments of one inbound message.
///
/// `init` tells the message how many fragments to expect and hands it the
/// destination Buffer; fragments then flow in through
/// `process_received_data`, which returns true once the message is whole.
/// `reset` must run before the instance is reused.
pub(crate) struct InboundMessage {
    /// Total fragments in the current message. 0 until `init`.
    pub total_frags: u32,
    /// Earliest fragment not yet received.
    pub first_missing_frag: u32,
    /// Received fragments that cannot be appended yet because fragments
    /// before them are missing. The first slot is the fragment after
    /// `first_missing_frag`. Each occupied slot owns driver payload memory
    /// until it is transferred to the destination Buffer.
    staging: Window<Option<(NonNull<u8>, u32)>, { MAX_STAGING_FRAGMENTS as usize }>,
    /// Where the reassembled message accumulates.
    data_buffer: Option<Buffer>,
    /// Whether this side arms inactivity timers (clients do, servers rely
    /// on the client to resynchronize).
    use_timer: bool,
    /// Deadline last armed; 0 when disarmed. A popped timer entry with a
    /// different deadline is stale.
    pub timer_deadline: u64,
    timer_task: TimerTask,
}

impl InboundMessage {
    pub fn new(use_timer: bool, timer_task: TimerTask) -> Self {
        let mut staging = Window::new();
        // The first staging slot is the fragment after first_missing_frag.
        staging.advance();
        Self {
            total_frags: 0,
            first_missing_frag: 0,
            staging,
            data_buffer: None,
            use_timer,
            timer_deadline: 0,
            timer_task,
        }
    }

    /// Return staged payloads to the driver and make the message inactive.
    /// Returns the partially assembled buffer, if any.
    pub fn reset(&mut self, driver: &dyn Driver) -> Option<Buffer> {
        for i in 0..self.staging.len() {
            if let Some((payload, len)) = self.staging.get(self.first_missing_frag + 1 + i) {
                driver.release(payload, len);
            }
        }
        self.staging.reset();
        self.staging.advance();
        self.total_frags = 0;
        self.first_missing_frag = 0;
        self.timer_deadline = 0;
        self.data_buffer.take()
    }

    /// Prepare a reset message to receive `total_frags` fragments into
    /// `buffer`.
    pub fn init(&mut self, ctx: &mut ChannelCtx, total_frags: u32, buffer: Buffer) {
        debug_assert!(self.data_buffer.is_none(), "init without reset");
        self.total_frags = total_frags;
        self.data_buffer = Some(buffer);
        if self.use_timer {
            self.arm_timer(ctx);
        }
    }

    /// Take the destination buffer out of a completed message.
    pub fn take_buffer(&mut self) -> Option<Buffer> {
        self.data_buffer.take()
    }

    /// Arm the inactivity timer one retransmit-timeout from now.
    pub fn arm_timer(&mut self, ctx: &mut ChannelCtx) {
        self.timer_deadline = ctx.now + ctx.config.timeout_cycles;
        ctx.timers.schedule(self.timer_deadline, self.timer_task);
    }

    pub fn disarm_timer(&mut self) {
        self.timer_deadline = 0;
    }

    /// Transmit an ACK describing which fragments are still missing.
    pub fn send_ack(&self, ctx: &ChannelCtx) {
        let mut staging_vector = 0u32;
        for i in 0..self.staging.len() {
            if self.staging.get(self.first_missing_frag + 1 + i).is_some() {
                staging_vector |= 1 << i;
            }
        }
        let ack = AckResponse {
            first_missing_frag: self.first_missing_frag as u16,
            staging_vector,
        };
        ctx.send_control(PayloadType::Ack, Some(&ack.to_bytes()));
    }

    /// Incorporate one DATA fragment, ACKing if requested.
    ///
    /// Returns true once the full message has been received; the destination
    /// buffer is then complete and available through `take_buffer`.
    pub fn process_received_data(
        &mut self,
        ctx: &mut ChannelCtx,
        header: &Header,
        received: &mut Received,
    ) -> bool {
        let announced_total = u32::from(header.total_frags);
        if announced_total != self.total_frags {
            warn!(
                "header total_frags ({}) != expected total_frags ({})",
                announced_total, self.total_frags
            );
            return self.first_missing_frag == self.total_frags;
        }
        let frag_number = u32::from(header.frag_number);

        if frag_number == self.first_missing_frag {
            // In order: append it, then drain anything contiguous that was
            // staged behind it. The first loop iteration's advance accounts
            // for the fragment just appended.
            let (payload, len) = received.steal().expect("payload already stolen");
            self.append_stolen(ctx, payload, len);

            loop {
                let staged = self.staging.get(self.first_missing_frag + 1);
                self.staging.advance();
                self.first_missing_frag += 1;
                match staged {
                    Some((payload, len)) => self.append_stolen(ctx, payload, len),
                    None => break,
                }
            }
        } else if frag_number > self.first_missing_frag {
            if frag_number - self.first_missing_frag > MAX_STAGING_FRAGMENTS {
                warn!(
                    "fragment {} out of range (last staged would be {})",
                    frag_number,
                    self.first_missing_frag + MAX_STAGING_FRAGMENTS
                );
            } else if self.staging.get(frag_number).is_none() {
                let stolen = received.steal().expect("payload already stolen");
                self.staging.set(frag_number, Some(stolen));
            } else {
                warn!("duplicate fragment {} received", frag_number);
            }
        }
        // frag_number < first_missing_frag: stale retransmit, nothing to do.

        if header.request_ack() {
            self.send_ack(ctx);
        }
        if self.use_timer {
            self.arm_timer(ctx);
        }

        self.first_missing_frag == self.total_frags
    }

    /// Append stolen packet memory to the destination buffer, minus its
    /// header, transferring the release responsibility to the buffer.
    fn append_stolen(&mut self, ctx: &ChannelCtx, payload: NonNull<u8>, len: u32) {
        debug_assert!(len >= HEADER_SIZE as u32);
        let buffer = self.data_buffer.as_mut().expect("message not initialized");
        let driver = Rc::clone(ctx.driver);
        unsafe {
            buffer.append_with_release(
                payload.as_ptr().add(HEADER_SIZE),
                len - HEADER_SIZE as u32,
                move || driver.release(payload, len),
            );
        }
    }
}

/// Drives transmission of one outbound message.
///
/// `begin_sending` fragments the buffer and transmits as much as the window
/// allows; ACKs flow in through `process_received_ack`, which frees window
/// and triggers further sends. A retransmitted fragment always requests an
/// ACK and pauses further transmission until the next event.
pub(crate) struct OutboundMessage {
    /// The data being sent. None when the message is inactive.
    send_buffer: Option<Buffer>,
    /// Fragments before this one have all been acknowledged.
    pub first_missing_frag: u32,
    /// Total fragments in the message.
    pub total_frags: u32,
    /// Data packets sent since the last ACK request.
    packets_since_ack_req: u32,
    /// Send timestamp per fragment: 0 = never sent, ACKED = acknowledged,
    /// otherwise the cycle time of the last transmission. Covers
    /// `first_missing_frag` through the end of the receiver's staging reach.
    sent_times: Window<u64, { MAX_STAGING_FRAGMENTS as usize + 1 }>,
    /// Fragments acknowledged so far; the sender never lets more than
    /// `window_size` fragments beyond this number carry a timestamp.
    pub num_acked: u32,
    use_timer: bool,
    /// Deadline last armed; 0 when disarmed.
    pub timer_deadline: u64,
    timer_task: TimerTask,
}

impl OutboundMessage {
    pub fn new(use_timer: bool, timer_task: TimerTask) -> Self {
        Self {
            send_buffer: None,
            first_missing_frag: 0,
            total_frags: 0,
            packets_since_ack_req: 0,
            sent_times: Window::new(),
            num_acked: 0,
            use_timer,
            timer_deadline: 0,
            timer_task,
        }
    }

    /// Make the message inactive, returning its buffer if it had one.
    pub fn reset(&mut self) -> Option<Buffer> {
        self.first_missing_frag = 0;
        self.total_frags = 0;
        self.packets_since_ack_req = 0;
        self.sent_times.reset();
        self.num_acked = 0;
        self.timer_deadline = 0;
        self.send_buffer.take()
    }

    /// Start sending `buffer`, transmitting as many fragments as the
    /// protocol allows right away.
    ///
    /// # Panics
    /// Panics if the message is already sending; `reset` first.
    pub fn begin_sending(&mut self, ctx: &mut ChannelCtx, buffer: Buffer) -> Result<()> {
        assert!(self.send_buffer.is_none(), "begin_sending on active message");
        let per_fragment = data_per_fragment(ctx.driver.max_packet_size());
        self.total_frags = num_frags(buffer.total_length(), per_fragment);
        self.send_buffer = Some(buffer);
        self.send(ctx)
    }

    /// Transmit or retransmit whatever the window, the receiver's staging
    /// reach, and the retransmit timeout currently permit.
    ///
    /// A retransmitted fragment requests an ACK and stops the loop: nothing
    /// further is sent until an ACK arrives or another timeout passes. Fresh
    /// fragments request an ACK every `req_ack_after` packets, except on the
    /// final fragment.
    pub fn send(&mut self, ctx: &mut ChannelCtx) -> Result<()> {
        if self.send_buffer.is_none() {
            return Ok(());
        }
        let now = ctx.now;

        let stop = self
            .total_frags
            .min(self.num_acked + ctx.config.window_size)
            .min(self.first_missing_frag + MAX_STAGING_FRAGMENTS + 1);

        for frag_number in self.first_missing_frag..stop {
            let sent_time = self.sent_times.get(frag_number);
            if sent_time == ACKED
                || (sent_time != 0 && sent_time + ctx.config.timeout_cycles >= now)
            {
                continue;
            }
            let is_retransmit = sent_time != 0;
            let request_ack = is_retransmit
                || (self.packets_since_ack_req == ctx.config.req_ack_after - 1
                    && frag_number != self.total_frags - 1);
            self.send_one_data(ctx, frag_number, request_ack)?;
            self.sent_times.set(frag_number, now);
            if is_retransmit {
                break;
            }
        }

        if self.use_timer {
            // Arm for the oldest outstanding fragment's deadline.
            let mut oldest = u64::MAX;
            for frag_number in self.first_missing_frag..stop {
                let sent_time = self.sent_times.get(frag_number);
                if sent_time == 0 {
                    break;
                }
                if sent_time != ACKED && sent_time < oldest {
                    oldest = sent_time;
                }
            }
            if oldest != u64::MAX {
                // Never arm at or before now, or the poll loop would spin on
                // a fragment that is one cycle short of its timeout.
                self.timer_deadline = (oldest + ctx.config.timeout_cycles).max(ctx.now + 1);
                ctx.timers.schedule(self.timer_deadline, self.timer_task);
            }
        }
        Ok(())
    }

    /// Process an ACK, advancing the window and sending anything newly
    /// permitted. Returns true once the entire message has been
    /// acknowledged.
    pub fn process_received_ack(&mut self, ctx: &mut ChannelCtx, received: &Received) -> bool {
        if self.send_buffer.is_none() {
            return false;
        }

        let data = received.data();
        if data.len() < HEADER_SIZE + ACK_RESPONSE_SIZE {
            warn!("ACK packet too short ({} bytes)", data.len());
            return false;
        }
        let ack = AckResponse::from_bytes(&data[HEADER_SIZE..]).unwrap();
        let ack_first = u32::from(ack.first_missing_frag);

        if ack_first < self.first_missing_frag {
            warn!(
                "stale ACK (ack first missing {}, current {})",
                ack_first, self.first_missing_frag
            );
        } else if ack_first > self.total_frags {
            warn!(
                "invalid ACK (first missing {} > total frags {})",
                ack_first, self.total_frags
            );
        } else if ack_first > self.first_missing_frag + self.sent_times.len() {
            warn!(
                "invalid ACK (first missing {} beyond end of window {})",
                ack_first,
                self.first_missing_frag + self.sent_times.len()
            );
        } else {
            self.sent_times.advance_by(ack_first - self.first_missing_frag);
            self.first_missing_frag = ack_first;
            self.num_acked = ack_first;
            let staging_vector = ack.staging_vector;
            for i in 0..self.sent_times.len() - 1 {
                if (staging_vector >> i) & 1 != 0 {
                    self.sent_times.set(self.first_missing_frag + i + 1, ACKED);
                    self.num_acked += 1;
                }
            }
        }

        if let Err(e) = self.send(ctx) {
            warn!("send after ACK failed: {}", e);
        }
        self.first_missing_frag == self.total_frags
    }

    pub fn disarm_timer(&mut self) {
        self.timer_deadline = 0;
    }

    /// Transmit a single data fragment drawn from the send buffer.
    fn send_one_data(
        &mut self,
        ctx: &mut ChannelCtx,
        frag_number: u32,
        request_ack: bool,
    ) -> Result<()> {
        let mut header = ctx.template;
        header.frag_number = frag_number as u16;
        header.total_frags = self.total_frags as u16;
        header.set_request_ack(request_ack);
        header.set_payload_type(PayloadType::Data);

        let per_fragment = data_per_fragment(ctx.driver.max_packet_size());
        let buffer = self.send_buffer.as_ref().unwrap();
        let mut iter = buffer.iter_range(frag_number * per_fragment, per_fragment);
        ctx.driver
            .send_packet(&ctx.peer, &header.to_bytes(), Some(&mut iter))?;

        if request_ack {
            debug!("requested ACK at fragment {}", frag_number);
            self.packets_since_ack_req = 0;
        } else {
            self.packets_since_ack_req += 1;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockDriver;
    use crate::packet::Direction;

    const TEST_MAX_PACKET: usize = HEADER_SIZE + 1000;

    struct Fixture {
        driver: Rc<MockDriver>,
        dyn_driver: Rc<dyn Driver>,
        config: TransportConfig,
        timers: TimerQueue,
        now: u64,
    }

    impl Fixture {
        fn new() -> Self {
            let driver =
                Rc::new(MockDriver::new("mock:test").with_max_packet_size(TEST_MAX_PACKET));
            Self {
                driver: driver.clone(),
                dyn_driver: driver,
                config: TransportConfig::default()
                    .with_timeout_cycles(1_000)
                    .with_session_timeout_cycles(1_000_000),
                timers: TimerQueue::new(),
                // Cycle 0 is reserved to mean "never sent".
                now: 1,
            }
        }

        fn ctx(&mut self) -> ChannelCtx<'_> {
            let mut template = Header::new();
            template.session_token = 0x99;
            template.rpc_id = 1;
            template.channel_id = 0;
            template.set_direction(Direction::ClientToServer);
            ChannelCtx {
                driver: &self.dyn_driver,
                config: &self.config,
                timers: &mut self.timers,
                now: self.now,
                peer: Address::new("peer"),
                template,
            }
        }

        /// Build a DATA packet and run it through an inbound message.
        fn feed_data(
            &mut self,
            inbound: &mut InboundMessage,
            frag_number: u16,
            total_frags: u16,
            body: &[u8],
            request_ack: bool,
        ) -> bool {
            let mut header = Header::new();
            header.frag_number = frag_number;
            header.total_frags = total_frags;
            header.set_request_ack(request_ack);
            header.set_payload_type(PayloadType::Data);
            let mut bytes = header.to_bytes().to_vec();
            bytes.extend_from_slice(body);

            let sender = Address::new("peer");
            self.driver.deliver(&sender, &bytes);
            let packet = self.driver.try_recv().unwrap();
            let mut received = Received::new(self.dyn_driver.clone(), packet);
            let mut ctx = self.ctx();
            inbound.process_received_data(&mut ctx, &header, &mut received)
        }
    }

    fn inbound_task() -> TimerTask {
        TimerTask::InboundActivity {
            session: 0,
            channel: 0,
        }
    }

    fn outbound_task() -> TimerTask {
        TimerTask::OutboundRetransmit {
            session: 0,
            channel: 0,
        }
    }

    fn frag_of(header: &Header) -> u16 {
        header.frag_number
    }

    fn sent_headers(driver: &MockDriver) -> Vec<(Header, Vec<u8>)> {
        driver
            .take_sent()
            .into_iter()
            .map(|(_, bytes)| {
                let header = Header::from_bytes(&bytes).unwrap();
                (header, bytes[HEADER_SIZE..].to_vec())
            })
            .collect()
    }

    #[test]
    fn test_outbound_fragments_whole_buffer() {
        let mut fx = Fixture::new();
        let mut outbound = OutboundMessage::new(true, outbound_task());

        let mut buffer = Buffer::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| i as u8).collect();
        buffer.append(&data);

        let mut ctx = fx.ctx();
        outbound.begin_sending(&mut ctx, buffer).unwrap();

        let sent = sent_headers(&fx.driver);
        assert_eq!(sent.len(), 10);
        let mut reassembled = Vec::new();
        for (i, (header, body)) in sent.iter().enumerate() {
            let (frag_number, total_frags) = (header.frag_number, header.total_frags);
            assert_eq!(frag_number as usize, i);
            assert_eq!(total_frags, 10);
            assert_eq!(header.payload_type(), Some(PayloadType::Data));
            // One periodic ACK request per req_ack_after packets, never on
            // the final fragment.
            assert_eq!(header.request_ack(), i == 4);
            reassembled.extend_from_slice(body);
        }
        assert_eq!(reassembled, data);
        // Retransmit timer armed for the first send.
        assert!(outbound.timer_deadline > 0);
    }

    #[test]
    fn test_outbound_respects_window() {
        let mut fx = Fixture::new();
        fx.config = fx.config.clone().with_window_size(4);
        let mut outbound = OutboundMessage::new(true, outbound_task());

        let mut buffer = Buffer::new();
        buffer.append(&vec![0u8; 10_000]);

        let mut ctx = fx.ctx();
        outbound.begin_sending(&mut ctx, buffer).unwrap();
        assert_eq!(fx.driver.sent_count(), 4);
        fx.driver.take_sent();

        // ACK the first two fragments; two more may fly.
        let ack = AckResponse::new(2);
        let mut bytes = Header::new().to_bytes().to_vec();
        bytes.extend_from_slice(&ack.to_bytes());
        let sender = Address::new("peer");
        fx.driver.deliver(&sender, &bytes);
        let packet = fx.driver.try_recv().unwrap();
        let received = Received::new(fx.dyn_driver.clone(), packet);

        let mut ctx = fx.ctx();
        let complete = outbound.process_received_ack(&mut ctx, &received);
        assert!(!complete);
        assert_eq!(outbound.first_missing_frag, 2);
        assert_eq!(outbound.num_acked, 2);

        let sent = sent_headers(&fx.driver);
        assert_eq!(sent.len(), 2);
        assert_eq!(frag_of(&sent[0].0), 4);
        assert_eq!(frag_of(&sent[1].0), 5);
    }

    #[test]
    fn test_outbound_retransmit_requests_ack_and_blocks() {
        let mut fx = Fixture::new();
        let mut outbound = OutboundMessage::new(true, outbound_task());

        let mut buffer = Buffer::new();
        buffer.append(&vec![1u8; 3_000]);

        let mut ctx = fx.ctx();
        outbound.begin_sending(&mut ctx, buffer).unwrap();
        assert_eq!(fx.driver.take_sent().len(), 3);

        // Nothing is due before the timeout.
        fx.now = 500;
        let mut ctx = fx.ctx();
        outbound.send(&mut ctx).unwrap();
        assert_eq!(fx.driver.sent_count(), 0);

        // After the timeout the first fragment is retransmitted with an ACK
        // request, and transmission stops there.
        fx.now = 1_002;
        let mut ctx = fx.ctx();
        outbound.send(&mut ctx).unwrap();
        let sent = sent_headers(&fx.driver);
        assert_eq!(sent.len(), 1);
        assert_eq!(frag_of(&sent[0].0), 0);
        assert!(sent[0].0.request_ack());
    }

    #[test]
    fn test_outbound_ack_with_staging_vector() {
        let mut fx = Fixture::new();
        let mut outbound = OutboundMessage::new(true, outbound_task());

        let mut buffer = Buffer::new();
        buffer.append(&vec![2u8; 10_000]);
        let mut ctx = fx.ctx();
        outbound.begin_sending(&mut ctx, buffer).unwrap();
        fx.driver.take_sent();

        // Receiver has 0..4 and 5..10: fragment 4 is the hole.
        let ack = AckResponse {
            first_missing_frag: 4,
            staging_vector: 0b11111,
        };
        let mut bytes = Header::new().to_bytes().to_vec();
        bytes.extend_from_slice(&ack.to_bytes());
        let sender = Address::new("peer");
        fx.driver.deliver(&sender, &bytes);
        let packet = fx.driver.try_recv().unwrap();
        let received = Received::new(fx.dyn_driver.clone(), packet);

        fx.now = 2_000;
        let mut ctx = fx.ctx();
        let complete = outbound.process_received_ack(&mut ctx, &received);
        assert!(!complete);
        assert_eq!(outbound.first_missing_frag, 4);
        assert_eq!(outbound.num_acked, 9);

        // Fragment 4 timed out, so the ACK triggers its retransmission.
        let sent = sent_headers(&fx.driver);
        assert_eq!(sent.len(), 1);
        assert_eq!(frag_of(&sent[0].0), 4);
        assert!(sent[0].0.request_ack());

        // A full ACK completes the message.
        let ack = AckResponse::new(10);
        let mut bytes = Header::new().to_bytes().to_vec();
        bytes.extend_from_slice(&ack.to_bytes());
        fx.driver.deliver(&sender, &bytes);
        let packet = fx.driver.try_recv().unwrap();
        let received = Received::new(fx.dyn_driver.clone(), packet);
        let mut ctx = fx.ctx();
        assert!(outbound.process_received_ack(&mut ctx, &received));
    }

    #[test]
    fn test_outbound_rejects_bad_acks() {
        let mut fx = Fixture::new();
        let mut outbound = OutboundMessage::new(true, outbound_task());

        // 40 fragments: enough that an ACK can be past the window without
        // being past the message.
        let mut buffer = Buffer::new();
        buffer.append(&vec![3u8; 40_000]);
        let mut ctx = fx.ctx();
        outbound.begin_sending(&mut ctx, buffer).unwrap();
        fx.driver.take_sent();

        for bad_first in [41u16, 35] {
            let ack = AckResponse::new(bad_first);
            let mut bytes = Header::new().to_bytes().to_vec();
            bytes.extend_from_slice(&ack.to_bytes());
            let sender = Address::new("peer");
            fx.driver.deliver(&sender, &bytes);
            let packet = fx.driver.try_recv().unwrap();
            let received = Received::new(fx.dyn_driver.clone(), packet);
            let mut ctx = fx.ctx();
            outbound.process_received_ack(&mut ctx, &received);
            assert_eq!(outbound.first_missing_frag, 0);
            assert_eq!(outbound.num_acked, 0);
        }

        // Truncated ACK body.
        let sender = Address::new("peer");
        let bytes = Header::new().to_bytes().to_vec();
        fx.driver.deliver(&sender, &bytes);
        let packet = fx.driver.try_recv().unwrap();
        let received = Received::new(fx.dyn_driver.clone(), packet);
        let mut ctx = fx.ctx();
        assert!(!outbound.process_received_ack(&mut ctx, &received));
    }

    #[test]
    fn test_inbound_in_order_assembly() {
        let mut fx = Fixture::new();
        let mut inbound = InboundMessage::new(true, inbound_task());
        let mut ctx = fx.ctx();
        inbound.init(&mut ctx, 3, Buffer::new());

        assert!(!fx.feed_data(&mut inbound, 0, 3, b"aaa", false));
        assert!(!fx.feed_data(&mut inbound, 1, 3, b"bbb", false));
        assert!(fx.feed_data(&mut inbound, 2, 3, b"ccc", false));

        let buffer = inbound.take_buffer().unwrap();
        let mut out = vec![0u8; 9];
        buffer.copy_out(0, &mut out);
        assert_eq!(&out, b"aaabbbccc");

        // All payload memory is owned by the buffer; dropping it releases
        // everything back to the driver.
        assert_eq!(fx.driver.outstanding_payloads(), 3);
        drop(buffer);
        assert_eq!(fx.driver.outstanding_payloads(), 0);
    }

    #[test]
    fn test_inbound_out_of_order_staging_and_ack() {
        let mut fx = Fixture::new();
        let mut inbound = InboundMessage::new(false, inbound_task());
        let mut ctx = fx.ctx();
        inbound.init(&mut ctx, 10, Buffer::new());

        // Fragments 0..4 arrive, 4 is lost, 5..10 arrive.
        for i in 0..4u16 {
            fx.feed_data(&mut inbound, i, 10, &[i as u8; 4], false);
        }
        for i in 5..9u16 {
            fx.feed_data(&mut inbound, i, 10, &[i as u8; 4], false);
        }
        // The final fragment asks for an ACK describing the hole.
        assert!(!fx.feed_data(&mut inbound, 9, 10, &[9u8; 4], true));

        assert_eq!(inbound.first_missing_frag, 4);
        let sent = sent_headers(&fx.driver);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.payload_type(), Some(PayloadType::Ack));
        let ack = AckResponse::from_bytes(&sent[0].1).unwrap();
        let (ack_first, staging_vector) = (ack.first_missing_frag, ack.staging_vector);
        assert_eq!(ack_first, 4);
        assert_eq!(staging_vector, 0b11111);

        // The retransmitted hole completes the message in one step.
        assert!(fx.feed_data(&mut inbound, 4, 10, &[4u8; 4], false));
        let buffer = inbound.take_buffer().unwrap();
        assert_eq!(buffer.total_length(), 40);
        let mut out = vec![0u8; 40];
        buffer.copy_out(0, &mut out);
        let expected: Vec<u8> = (0..10u8).flat_map(|i| [i; 4]).collect();
        assert_eq!(out, expected);
    }

    #[test]
    fn test_inbound_duplicate_and_out_of_window_released() {
        let mut fx = Fixture::new();
        let mut inbound = InboundMessage::new(false, inbound_task());
        let mut ctx = fx.ctx();
        inbound.init(&mut ctx, 64, Buffer::new());

        fx.feed_data(&mut inbound, 2, 64, b"zz", false);
        assert_eq!(fx.driver.outstanding_payloads(), 1);

        // Duplicate of a staged fragment is dropped and released.
        fx.feed_data(&mut inbound, 2, 64, b"zz", false);
        assert_eq!(fx.driver.outstanding_payloads(), 1);

        // A fragment beyond the staging window is dropped and released.
        fx.feed_data(&mut inbound, 40, 64, b"yy", false);
        assert_eq!(fx.driver.outstanding_payloads(), 1);

        // In-order fragment 0 is appended; a later copy of it is stale and
        // dropped without disturbing progress.
        fx.feed_data(&mut inbound, 0, 64, b"a", false);
        assert_eq!(inbound.first_missing_frag, 1);
        assert_eq!(fx.driver.outstanding_payloads(), 2);
        fx.feed_data(&mut inbound, 0, 64, b"a", false);
        assert_eq!(inbound.first_missing_frag, 1);
        assert_eq!(fx.driver.outstanding_payloads(), 2);

        // Reset returns the staged fragment 2 to the driver; the appended
        // fragment 0 now belongs to the returned buffer.
        let buffer = inbound.reset(fx.dyn_driver.as_ref());
        assert_eq!(fx.driver.outstanding_payloads(), 1);
        drop(buffer);
        assert_eq!(fx.driver.outstanding_payloads(), 0);
    }

    #[test]
    fn test_inbound_total_frags_mismatch_ignored() {
        let mut fx = Fixture::new();
        let mut inbound = InboundMessage::new(false, inbound_task());
        let mut ctx = fx.ctx();
        inbound.init(&mut ctx, 2, Buffer::new());

        assert!(!fx.feed_data(&mut inbound, 0, 5, b"bad", false));
        assert_eq!(inbound.first_missing_frag, 0);
        assert_eq!(fx.driver.outstanding_payloads(), 0);
    }
}
