//! Wire format for transport fragments.
//!
//! Every datagram begins with a fixed little-endian [`Header`]. DATA payload
//! follows the header directly; ACK packets carry an [`AckResponse`] body and
//! session open responses carry a [`SessionOpenResponse`] body.

use std::fmt;

/// Packet header size in bytes.
pub const HEADER_SIZE: usize = 26;

/// Size of an ACK response body in bytes.
pub const ACK_RESPONSE_SIZE: usize = 6;

/// Size of a session open response body in bytes.
pub const SESSION_OPEN_RESPONSE_SIZE: usize = 1;

/// Highest fragment number beyond `first_missing_frag` that a receiver will
/// stage rather than discard. Bounds both the staging window and the span of
/// fragments a sender may have outstanding past the first unacknowledged one.
pub const MAX_STAGING_FRAGMENTS: u32 = 32;

// The ACK staging bitmap must cover the whole staging window.
const _: () = assert!(32 >= MAX_STAGING_FRAGMENTS);

/// Payload interpretation for the bytes following a [`Header`] (4-bit field).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadType {
    /// Payload contains user data.
    Data = 0,
    /// Payload contains an AckResponse.
    Ack = 1,
    /// Session open request (no body) or response (SessionOpenResponse body).
    SessionOpen = 2,
    /// The session named by the packet is unknown; no body.
    BadSession = 4,
}

impl PayloadType {
    fn from_bits(bits: u8) -> Option<PayloadType> {
        match bits {
            0 => Some(PayloadType::Data),
            1 => Some(PayloadType::Ack),
            2 => Some(PayloadType::SessionOpen),
            4 => Some(PayloadType::BadSession),
            _ => None,
        }
    }
}

/// Which way a packet is traveling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Direction {
    /// Fragment is part of a client request.
    ClientToServer = 0,
    /// Fragment is part of a server response.
    ServerToClient = 1,
}

/// Fragment header present on every datagram (26 bytes, little-endian).
///
/// Layout:
/// ```text
/// Offset  Size  Field
/// 0       8     session_token
/// 8       4     rpc_id
/// 12      4     client_session_hint
/// 16      4     server_session_hint
/// 20      2     frag_number
/// 22      2     total_frags
/// 24      1     channel_id
/// 25      1     flags: direction[0] | request_ack[1] | please_drop[2]
///               | reserved[3] | payload_type[4..8]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct Header {
    /// Authentication token for the session this fragment belongs to.
    /// 0 means "no session yet" and is only legal on SESSION_OPEN requests.
    pub session_token: u64,
    /// Strictly increasing id disambiguating which RPC on the channel this
    /// fragment is part of.
    pub rpc_id: u32,
    /// Offset of the client's session in its own session table.
    pub client_session_hint: u32,
    /// Offset of the server's session in its own session table.
    pub server_session_hint: u32,
    /// Position of this fragment in the message, starting from 0.
    pub frag_number: u16,
    /// Total number of fragments the receiver should expect.
    pub total_frags: u16,
    /// Which channel of the session carries this RPC.
    pub channel_id: u8,
    flags: u8,
}

const DIRECTION_BIT: u8 = 1 << 0;
const REQUEST_ACK_BIT: u8 = 1 << 1;
const PLEASE_DROP_BIT: u8 = 1 << 2;
const PAYLOAD_TYPE_SHIFT: u8 = 4;

impl Header {
    /// Create an all-zero header: client-to-server DATA with no flags set.
    pub fn new() -> Self {
        Self {
            session_token: 0,
            rpc_id: 0,
            client_session_hint: 0,
            server_session_hint: 0,
            frag_number: 0,
            total_frags: 0,
            channel_id: 0,
            flags: 0,
        }
    }

    #[inline]
    pub fn direction(&self) -> Direction {
        if self.flags & DIRECTION_BIT == 0 {
            Direction::ClientToServer
        } else {
            Direction::ServerToClient
        }
    }

    #[inline]
    pub fn set_direction(&mut self, direction: Direction) {
        match direction {
            Direction::ClientToServer => self.flags &= !DIRECTION_BIT,
            Direction::ServerToClient => self.flags |= DIRECTION_BIT,
        }
    }

    #[inline]
    pub fn request_ack(&self) -> bool {
        self.flags & REQUEST_ACK_BIT != 0
    }

    #[inline]
    pub fn set_request_ack(&mut self, request_ack: bool) {
        if request_ack {
            self.flags |= REQUEST_ACK_BIT;
        } else {
            self.flags &= !REQUEST_ACK_BIT;
        }
    }

    #[inline]
    pub fn please_drop(&self) -> bool {
        self.flags & PLEASE_DROP_BIT != 0
    }

    #[inline]
    pub fn set_please_drop(&mut self, please_drop: bool) {
        if please_drop {
            self.flags |= PLEASE_DROP_BIT;
        } else {
            self.flags &= !PLEASE_DROP_BIT;
        }
    }

    /// Payload type, or None if the 4-bit field holds a reserved value.
    #[inline]
    pub fn payload_type(&self) -> Option<PayloadType> {
        PayloadType::from_bits(self.flags >> PAYLOAD_TYPE_SHIFT)
    }

    #[inline]
    pub fn set_payload_type(&mut self, payload_type: PayloadType) {
        self.flags = (self.flags & 0x0f) | ((payload_type as u8) << PAYLOAD_TYPE_SHIFT);
    }

    /// Serialize the header into a destination buffer.
    ///
    /// # Safety
    /// The destination must be valid for at least `HEADER_SIZE` bytes.
    #[inline]
    pub unsafe fn write_to(&self, dst: *mut u8) {
        unsafe {
            std::ptr::copy_nonoverlapping(self as *const Self as *const u8, dst, HEADER_SIZE);
        }
    }

    /// Deserialize a header from a source buffer.
    ///
    /// # Safety
    /// The source must be valid for at least `HEADER_SIZE` bytes.
    #[inline]
    pub unsafe fn read_from(src: *const u8) -> Self {
        unsafe {
            let mut hdr = std::mem::MaybeUninit::<Self>::uninit();
            std::ptr::copy_nonoverlapping(src, hdr.as_mut_ptr() as *mut u8, HEADER_SIZE);
            hdr.assume_init()
        }
    }

    /// Parse a header from the front of a packet, or None if the packet is
    /// shorter than a header.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }
        Some(unsafe { Self::read_from(bytes.as_ptr()) })
    }

    /// Serialize the header to an owned byte array.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        unsafe { self.write_to(buf.as_mut_ptr()) };
        buf
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let token = self.session_token;
        let rpc_id = self.rpc_id;
        let client_hint = self.client_session_hint;
        let server_hint = self.server_session_hint;
        let frag = self.frag_number;
        let total = self.total_frags;
        write!(
            f,
            "{{ token:{:x} rpcId:{} clientHint:{:x} serverHint:{:x} \
             {}/{} frags channel:{} dir:{:?} reqAck:{} drop:{} type:{:?} }}",
            token,
            rpc_id,
            client_hint,
            server_hint,
            frag,
            total,
            self.channel_id,
            self.direction(),
            self.request_ack() as u8,
            self.please_drop() as u8,
            self.payload_type(),
        )
    }
}

/// Body of an ACK packet (6 bytes, little-endian).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct AckResponse {
    /// Earliest fragment the receiver has not yet received.
    pub first_missing_frag: u16,
    /// Bit i set means fragment `first_missing_frag + 1 + i` is staged.
    pub staging_vector: u32,
}

impl AckResponse {
    pub fn new(first_missing_frag: u16) -> Self {
        Self {
            first_missing_frag,
            staging_vector: 0,
        }
    }

    /// Parse an ACK body, or None if the slice is too short.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < ACK_RESPONSE_SIZE {
            return None;
        }
        let mut body = std::mem::MaybeUninit::<Self>::uninit();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                body.as_mut_ptr() as *mut u8,
                ACK_RESPONSE_SIZE,
            );
            Some(body.assume_init())
        }
    }

    /// Serialize the ACK body to an owned byte array.
    pub fn to_bytes(&self) -> [u8; ACK_RESPONSE_SIZE] {
        let mut buf = [0u8; ACK_RESPONSE_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self as *const Self as *const u8,
                buf.as_mut_ptr(),
                ACK_RESPONSE_SIZE,
            );
        }
        buf
    }
}

/// Body of a session open response (1 byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct SessionOpenResponse {
    /// Channels the client may use on this session, ids `0..num_channels`.
    pub num_channels: u8,
}

impl SessionOpenResponse {
    /// Parse a session open response body, or None if the slice is empty.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes
            .first()
            .map(|&num_channels| Self { num_channels })
    }
}
