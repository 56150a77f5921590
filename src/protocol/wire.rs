//! Request and reply envelopes.
//!
//! Wire layout (native byte order, both sides built from the same
//! definitions):
//!
//! ```text
//! request: [u32 opcode][u32 request_size][56-byte body][segment 0]..[segment K-1]
//! reply:   [u32 error ][u32 reply_size  ][56-byte body][reply_size bytes]
//! ```
//!
//! Segment boundaries are implied by the opcode's declared sizes; the wire
//! carries no delimiters between them.

use crate::constants::{
    MAX_REQUEST_DATA, MAX_REQUEST_SEGMENTS, REPLY_BODY_SIZE, REPLY_FIXED_SIZE,
    REPLY_HEADER_SIZE, REQUEST_BODY_SIZE, REQUEST_FIXED_SIZE, REQUEST_HEADER_SIZE,
};
use crate::error::{RequestError, Status};

use super::opcode::Opcode;

/// Opaque name of a broker-owned object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Handle(pub u32);

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

// ─── Fixed-field cursors ───────────────────────────────────────────────────

/// Sequential writer over an opcode's fixed request body.
#[derive(Debug)]
pub struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
    overflow: bool,
}

impl<'a> FieldWriter<'a> {
    fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0, overflow: false }
    }

    fn put(&mut self, bytes: &[u8]) -> &mut Self {
        let end = self.pos + bytes.len();
        if end > self.buf.len() {
            self.overflow = true;
        } else {
            self.buf[self.pos..end].copy_from_slice(bytes);
            self.pos = end;
        }
        self
    }

    /// Append a `u32`.
    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.put(&v.to_ne_bytes())
    }

    /// Append an `i32`.
    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.put(&v.to_ne_bytes())
    }

    /// Append a `u64`, aligned to 8 bytes within the body.
    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.align(8);
        self.put(&v.to_ne_bytes())
    }

    /// Append a handle.
    pub fn handle(&mut self, h: Handle) -> &mut Self {
        self.u32(h.0)
    }

    fn align(&mut self, to: usize) {
        let pad = (to - (REQUEST_HEADER_SIZE + self.pos) % to) % to;
        self.pos += pad;
    }
}

/// Sequential reader over an opcode's fixed reply body.
///
/// Reading past the body yields zeroes; the body is always fully present
/// once a reply has been accepted.
#[derive(Debug)]
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    /// Reader over a reply body.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        if let Some(src) = self.buf.get(self.pos..self.pos + N) {
            out.copy_from_slice(src);
        }
        self.pos += N;
        out
    }

    /// Next `u32`.
    pub fn u32(&mut self) -> u32 {
        u32::from_ne_bytes(self.take())
    }

    /// Next `i32`.
    pub fn i32(&mut self) -> i32 {
        i32::from_ne_bytes(self.take())
    }

    /// Next `u64`, aligned to 8 bytes within the reply.
    pub fn u64(&mut self) -> u64 {
        self.pos += (8 - (REPLY_HEADER_SIZE + self.pos) % 8) % 8;
        u64::from_ne_bytes(self.take())
    }

    /// Next handle.
    pub fn handle(&mut self) -> Handle {
        Handle(self.u32())
    }
}

// ─── Request ───────────────────────────────────────────────────────────────

/// One request: opcode, fixed body and borrowed variable ranges.
#[derive(Debug, Clone)]
pub struct Request<'a> {
    opcode: Opcode,
    body: [u8; REQUEST_BODY_SIZE],
    segments: Vec<&'a [u8]>,
    data_len: usize,
}

impl<'a> Request<'a> {
    /// Empty request for `opcode`.
    #[must_use]
    pub fn new(opcode: Opcode) -> Self {
        Self {
            opcode,
            body: [0; REQUEST_BODY_SIZE],
            segments: Vec::new(),
            data_len: 0,
        }
    }

    /// Fill the fixed body through a [`FieldWriter`].
    pub fn fields<F>(mut self, fill: F) -> Result<Self, RequestError>
    where
        F: FnOnce(&mut FieldWriter<'_>),
    {
        let mut writer = FieldWriter::new(&mut self.body);
        fill(&mut writer);
        if writer.overflow {
            return Err(RequestError::BodyOverflow);
        }
        Ok(self)
    }

    /// Append a variable-length range.
    pub fn push_data(&mut self, data: &'a [u8]) -> Result<&mut Self, RequestError> {
        if self.segments.len() == MAX_REQUEST_SEGMENTS {
            return Err(RequestError::TooManySegments { max: MAX_REQUEST_SEGMENTS });
        }
        let len = self.data_len + data.len();
        if len > MAX_REQUEST_DATA {
            return Err(RequestError::TooMuchData { len, max: MAX_REQUEST_DATA });
        }
        self.segments.push(data);
        self.data_len = len;
        Ok(self)
    }

    /// Builder form of [`Self::push_data`].
    pub fn with_data(mut self, data: &'a [u8]) -> Result<Self, RequestError> {
        self.push_data(data)?;
        Ok(self)
    }

    /// The request kind.
    #[must_use]
    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    /// Declared variable size (sum of all segments).
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// The variable ranges, in wire order.
    #[must_use]
    pub fn segments(&self) -> &[&'a [u8]] {
        &self.segments
    }

    /// The fixed frame: header followed by the body.
    #[must_use]
    pub fn fixed_bytes(&self) -> [u8; REQUEST_FIXED_SIZE] {
        let mut out = [0u8; REQUEST_FIXED_SIZE];
        out[0..4].copy_from_slice(&self.opcode.raw().to_ne_bytes());
        out[4..8].copy_from_slice(&(self.data_len as u32).to_ne_bytes());
        out[REQUEST_HEADER_SIZE..].copy_from_slice(&self.body);
        out
    }

    /// Total bytes this request occupies on the wire.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        REQUEST_FIXED_SIZE + self.data_len
    }
}

/// Decoded request header, as a broker sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestHeader {
    /// Raw opcode value.
    pub opcode: u32,
    /// Declared variable size.
    pub request_size: u32,
}

impl RequestHeader {
    /// Parse the header from a fixed request frame.
    #[must_use]
    pub fn parse(fixed: &[u8; REQUEST_FIXED_SIZE]) -> Self {
        let mut r = FieldReader::new(&fixed[..REQUEST_HEADER_SIZE]);
        Self { opcode: r.u32(), request_size: r.u32() }
    }
}

// ─── Reply ─────────────────────────────────────────────────────────────────

/// A fixed reply frame plus the length of variable data delivered with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    fixed: [u8; REPLY_FIXED_SIZE],
    data_len: usize,
}

impl Reply {
    /// Wrap a received fixed frame.
    #[must_use]
    pub fn from_fixed(fixed: [u8; REPLY_FIXED_SIZE]) -> Self {
        let mut reply = Self { fixed, data_len: 0 };
        reply.data_len = reply.declared_size() as usize;
        reply
    }

    /// Build a reply frame (used by brokers and fast-path helpers).
    #[must_use]
    pub fn build(status: Status, reply_size: u32, body: &[u8]) -> [u8; REPLY_FIXED_SIZE] {
        let mut out = [0u8; REPLY_FIXED_SIZE];
        out[0..4].copy_from_slice(&status.0.to_ne_bytes());
        out[4..8].copy_from_slice(&reply_size.to_ne_bytes());
        let n = body.len().min(REPLY_BODY_SIZE);
        out[REPLY_HEADER_SIZE..REPLY_HEADER_SIZE + n].copy_from_slice(&body[..n]);
        out
    }

    /// Broker-reported status.
    #[must_use]
    pub fn status(&self) -> Status {
        Status(u32::from_ne_bytes([self.fixed[0], self.fixed[1], self.fixed[2], self.fixed[3]]))
    }

    /// Variable reply size declared in the header.
    #[must_use]
    pub fn declared_size(&self) -> u32 {
        u32::from_ne_bytes([self.fixed[4], self.fixed[5], self.fixed[6], self.fixed[7]])
    }

    /// Bytes of variable data written into the caller's buffer.
    #[must_use]
    pub fn data_len(&self) -> usize {
        self.data_len
    }

    /// Reader over the opcode-specific fixed fields.
    #[must_use]
    pub fn fields(&self) -> FieldReader<'_> {
        FieldReader::new(&self.fixed[REPLY_HEADER_SIZE..])
    }

    /// The full fixed frame.
    #[must_use]
    pub fn fixed_bytes(&self) -> &[u8; REPLY_FIXED_SIZE] {
        &self.fixed
    }
}

// ─── Typed bodies ──────────────────────────────────────────────────────────

/// A typed request body with its matching reply.
pub trait RequestBody {
    /// Decoded reply type.
    type Reply: ReplyBody;

    /// Opcode this body is sent under.
    const OPCODE: Opcode;

    /// Encode fixed fields and attach variable data.
    fn encode<'a>(&'a self, request: Request<'a>) -> Result<Request<'a>, RequestError>;
}

/// A typed reply decoded from the fixed fields plus variable data.
pub trait ReplyBody: Sized {
    /// Decode from a successful reply and its variable data.
    fn decode(reply: &Reply, data: &[u8]) -> Self;
}

impl ReplyBody for () {
    fn decode(_reply: &Reply, _data: &[u8]) -> Self {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_carries_opcode_and_declared_size() {
        let name = [0u8; 10];
        let req = Request::new(Opcode::OpenEvent)
            .fields(|w| {
                w.u32(0x1f_0003).u32(0).handle(Handle(0));
            })
            .and_then(|r| r.with_data(&name))
            .expect("valid request");
        let fixed = req.fixed_bytes();
        let header = RequestHeader::parse(&fixed);
        assert_eq!(header.opcode, Opcode::OpenEvent.raw());
        assert_eq!(header.request_size, 10);
        assert_eq!(req.wire_len(), REQUEST_FIXED_SIZE + 10);
        assert_eq!(&fixed[8..12], &0x1f_0003u32.to_ne_bytes());
    }

    #[test]
    fn segment_limits_are_enforced() {
        let chunk = [0u8; 1];
        let mut req = Request::new(Opcode::SetKeyValue);
        for _ in 0..MAX_REQUEST_SEGMENTS {
            req.push_data(&chunk).expect("within limit");
        }
        assert_eq!(
            req.push_data(&chunk).map(|_| ()),
            Err(RequestError::TooManySegments { max: MAX_REQUEST_SEGMENTS })
        );
    }

    #[test]
    fn data_cap_is_enforced() {
        let big = vec![0u8; MAX_REQUEST_DATA + 1];
        let err = Request::new(Opcode::SetKeyValue).with_data(&big).map(|_| ());
        assert_eq!(
            err,
            Err(RequestError::TooMuchData { len: MAX_REQUEST_DATA + 1, max: MAX_REQUEST_DATA })
        );
    }

    #[test]
    fn body_overflow_is_rejected() {
        let err = Request::new(Opcode::InitThread).fields(|w| {
            for _ in 0..15 {
                w.u32(7);
            }
        });
        assert_eq!(err.map(|_| ()), Err(RequestError::BodyOverflow));
    }

    #[test]
    fn u64_fields_are_aligned_like_the_reader() {
        let req = Request::new(Opcode::InitThread)
            .fields(|w| {
                w.i32(1).i32(2).u64(0xdead_beef_0000_0001);
            })
            .expect("fits");
        let fixed = req.fixed_bytes();
        // header (8) + two i32 (8) = 16, already 8-aligned.
        assert_eq!(&fixed[16..24], &0xdead_beef_0000_0001u64.to_ne_bytes());
    }

    #[test]
    fn reply_accessors() {
        let fixed = Reply::build(Status(0), 0, &7u32.to_ne_bytes());
        let reply = Reply::from_fixed(fixed);
        assert!(reply.status().is_success());
        assert_eq!(reply.declared_size(), 0);
        assert_eq!(reply.fields().u32(), 7);
    }
}
