//! Protocol codec. Pure, deterministic, no I/O: turns typed `Frame`s into
//! length-prefixed byte strings and back. The only
//! failure mode is a malformed frame, which the session layer treats as
//! fatal (`ErrorKind::Malformed`).
//!
//! Frame layout: big-endian `u32` payload length (covers the tag byte and
//! everything after it), then a `u8` tag, then a tag-specific body. All
//! multi-byte integers are network order; sequence numbers are IEEE-754
//! big-endian doubles.

use crate::error::{err, Result};
use crate::seqnum::SeqNum;
use std::convert::TryFrom;

/// Opaque client identifier, assigned by the server on first handshake.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ClientId(pub u32);

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "client-{}", self.0)
    }
}

/// Subscription target: a specific channel, or the wildcard `all`.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub enum Selector {
    All,
    Channel(String),
}

impl Selector {
    pub fn matches(&self, channel: &str) -> bool {
        match self {
            Selector::All => true,
            Selector::Channel(name) => name == channel,
        }
    }
}

const TAG_HELLO: u8 = 1;
const TAG_HELLO_ACK: u8 = 2;
const TAG_SUBSCRIBE: u8 = 3;
const TAG_SUBSCRIBE_ACK: u8 = 4;
const TAG_UNSUBSCRIBE: u8 = 5;
const TAG_UNSUBSCRIBE_ACK: u8 = 6;
const TAG_PUBLISH: u8 = 7;
const TAG_CLEAR_TO_ADVANCE: u8 = 8;
const TAG_REQUEST_ADVANCE: u8 = 9;
const TAG_ADVANCE_GRANT: u8 = 10;
const TAG_DELIVER: u8 = 11;
const TAG_DELIVERY_ACK: u8 = 12;

const SELECTOR_ALL: u8 = 0;
const SELECTOR_CHANNEL: u8 = 1;

/// Every message this fabric can carry over the wire.
#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Hello,
    HelloAck { client: ClientId, initial_seq: SeqNum },
    Subscribe { selector: Selector, eff: SeqNum },
    SubscribeAck { eff: SeqNum },
    Unsubscribe { selector: Selector, eff: SeqNum },
    UnsubscribeAck { eff: SeqNum },
    Publish { publish_seq: SeqNum, receive_seq: SeqNum, channel: String, payload: Vec<u8> },
    ClearToAdvance { seq: SeqNum },
    RequestAdvance { seq: SeqNum },
    AdvanceGrant { seq: SeqNum },
    Deliver {
        publisher: ClientId,
        publish_seq: SeqNum,
        receive_seq: SeqNum,
        channel: String,
        payload: Vec<u8>,
    },
    DeliveryAck { seq: SeqNum },
}

impl Frame {
    fn tag(&self) -> u8 {
        match self {
            Frame::Hello => TAG_HELLO,
            Frame::HelloAck { .. } => TAG_HELLO_ACK,
            Frame::Subscribe { .. } => TAG_SUBSCRIBE,
            Frame::SubscribeAck { .. } => TAG_SUBSCRIBE_ACK,
            Frame::Unsubscribe { .. } => TAG_UNSUBSCRIBE,
            Frame::UnsubscribeAck { .. } => TAG_UNSUBSCRIBE_ACK,
            Frame::Publish { .. } => TAG_PUBLISH,
            Frame::ClearToAdvance { .. } => TAG_CLEAR_TO_ADVANCE,
            Frame::RequestAdvance { .. } => TAG_REQUEST_ADVANCE,
            Frame::AdvanceGrant { .. } => TAG_ADVANCE_GRANT,
            Frame::Deliver { .. } => TAG_DELIVER,
            Frame::DeliveryAck { .. } => TAG_DELIVERY_ACK,
        }
    }

    /// Encodes this frame as a complete wire-ready buffer: length prefix,
    /// tag, body.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(32);
        body.push(self.tag());
        self.encode_body(&mut body);

        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&(body.len() as u32).to_be_bytes());
        out.extend_from_slice(&body);
        out
    }

    fn encode_body(&self, out: &mut Vec<u8>) {
        match self {
            Frame::Hello => {}
            Frame::HelloAck { client, initial_seq } => {
                out.extend_from_slice(&client.0.to_be_bytes());
                out.extend_from_slice(&initial_seq.value().to_be_bytes());
            }
            Frame::Subscribe { selector, eff } | Frame::Unsubscribe { selector, eff } => {
                encode_selector(out, selector, *eff);
            }
            Frame::SubscribeAck { eff } | Frame::UnsubscribeAck { eff } => {
                out.extend_from_slice(&eff.value().to_be_bytes());
            }
            Frame::Publish { publish_seq, receive_seq, channel, payload } => {
                out.extend_from_slice(&publish_seq.value().to_be_bytes());
                out.extend_from_slice(&receive_seq.value().to_be_bytes());
                encode_string(out, channel);
                encode_bytes(out, payload);
            }
            Frame::ClearToAdvance { seq }
            | Frame::RequestAdvance { seq }
            | Frame::AdvanceGrant { seq }
            | Frame::DeliveryAck { seq } => {
                out.extend_from_slice(&seq.value().to_be_bytes());
            }
            Frame::Deliver { publisher, publish_seq, receive_seq, channel, payload } => {
                out.extend_from_slice(&publisher.0.to_be_bytes());
                out.extend_from_slice(&publish_seq.value().to_be_bytes());
                out.extend_from_slice(&receive_seq.value().to_be_bytes());
                encode_string(out, channel);
                encode_bytes(out, payload);
            }
        }
    }

    /// Decodes a single frame from `body` (the bytes after the tag, i.e.
    /// `full[5..]` once the length prefix and tag have been stripped).
    fn decode_body(tag: u8, body: &[u8]) -> Result<Frame> {
        let mut r = Reader::new(body);
        let frame = match tag {
            TAG_HELLO => Frame::Hello,
            TAG_HELLO_ACK => {
                let client = ClientId(r.u32()?);
                let initial_seq = SeqNum::new(r.f64()?);
                Frame::HelloAck { client, initial_seq }
            }
            TAG_SUBSCRIBE => {
                let (selector, eff) = decode_selector(&mut r)?;
                Frame::Subscribe { selector, eff }
            }
            TAG_SUBSCRIBE_ACK => Frame::SubscribeAck { eff: SeqNum::new(r.f64()?) },
            TAG_UNSUBSCRIBE => {
                let (selector, eff) = decode_selector(&mut r)?;
                Frame::Unsubscribe { selector, eff }
            }
            TAG_UNSUBSCRIBE_ACK => Frame::UnsubscribeAck { eff: SeqNum::new(r.f64()?) },
            TAG_PUBLISH => {
                let publish_seq = SeqNum::new(r.f64()?);
                let receive_seq = SeqNum::new(r.f64()?);
                let channel = r.string()?;
                let payload = r.bytes()?;
                Frame::Publish { publish_seq, receive_seq, channel, payload }
            }
            TAG_CLEAR_TO_ADVANCE => Frame::ClearToAdvance { seq: SeqNum::new(r.f64()?) },
            TAG_REQUEST_ADVANCE => Frame::RequestAdvance { seq: SeqNum::new(r.f64()?) },
            TAG_ADVANCE_GRANT => Frame::AdvanceGrant { seq: SeqNum::new(r.f64()?) },
            TAG_DELIVER => {
                let publisher = ClientId(r.u32()?);
                let publish_seq = SeqNum::new(r.f64()?);
                let receive_seq = SeqNum::new(r.f64()?);
                let channel = r.string()?;
                let payload = r.bytes()?;
                Frame::Deliver { publisher, publish_seq, receive_seq, channel, payload }
            }
            TAG_DELIVERY_ACK => Frame::DeliveryAck { seq: SeqNum::new(r.f64()?) },
            other => err!(Malformed, desc: "unknown frame tag {}", other)?,
        };
        r.expect_exhausted()?;
        Ok(frame)
    }
}

fn encode_selector(out: &mut Vec<u8>, selector: &Selector, eff: SeqNum) {
    out.extend_from_slice(&eff.value().to_be_bytes());
    match selector {
        Selector::All => out.push(SELECTOR_ALL),
        Selector::Channel(name) => {
            out.push(SELECTOR_CHANNEL);
            encode_string(out, name);
        }
    }
}

fn decode_selector(r: &mut Reader<'_>) -> Result<(Selector, SeqNum)> {
    let eff = SeqNum::new(r.f64()?);
    let kind = r.u8()?;
    let selector = match kind {
        SELECTOR_ALL => Selector::All,
        SELECTOR_CHANNEL => Selector::Channel(r.string()?),
        other => err!(Malformed, desc: "unknown selector kind {}", other)?,
    };
    Ok((selector, eff))
}

fn encode_string(out: &mut Vec<u8>, s: &str) {
    let bytes = s.as_bytes();
    out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(bytes);
}

fn encode_bytes(out: &mut Vec<u8>, b: &[u8]) {
    out.extend_from_slice(&(b.len() as u32).to_be_bytes());
    out.extend_from_slice(b);
}

/// A cursor over a decode buffer; every read is bounds-checked and raises
/// `Malformed` on truncation rather than panicking.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            err!(Malformed, desc: "truncated frame: need {} bytes, have {}", n, self.buf.len() - self.pos)?;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn f64(&mut self) -> Result<f64> {
        Ok(f64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn string(&mut self) -> Result<String> {
        let len = self.u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| crate::error::Error::new(crate::error::ErrorKind::Malformed, e.to_string()))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = u32::try_from(self.u32()?).map_err(|_| {
            crate::error::Error::new(crate::error::ErrorKind::Malformed, "payload length overflow")
        })?;
        Ok(self.take(len as usize)?.to_vec())
    }

    fn expect_exhausted(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            err!(Malformed, desc: "trailing bytes after decoding frame body ({} left)", self.buf.len() - self.pos)?;
        }
        Ok(())
    }
}

/// Incremental decoder: accumulates raw bytes from a `Channel` and yields
/// whole frames as they become available. One per session inbound side.
#[derive(Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pulls every complete frame currently buffered. A truncated trailing
    /// frame is left in the buffer for the next `feed`.
    pub fn drain_frames(&mut self) -> Result<Vec<Frame>> {
        let mut frames = Vec::new();
        loop {
            match self.try_decode_one()? {
                Some(frame) => frames.push(frame),
                None => break,
            }
        }
        Ok(frames)
    }

    fn try_decode_one(&mut self) -> Result<Option<Frame>> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(self.buf[0..4].try_into().unwrap()) as usize;
        if len == 0 {
            err!(Malformed, desc: "zero-length frame")?;
        }
        if self.buf.len() < 4 + len {
            return Ok(None);
        }
        let tag = self.buf[4];
        let body = &self.buf[5..4 + len];
        let frame = Frame::decode_body(tag, body)?;
        self.buf.drain(0..4 + len);
        Ok(Some(frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(frame: Frame) {
        let encoded = frame.encode();
        let mut dec = FrameDecoder::new();
        dec.feed(&encoded);
        let got = dec.drain_frames().unwrap();
        assert_eq!(got, vec![frame]);
    }

    #[test]
    fn round_trips_every_variant() {
        round_trip(Frame::Hello);
        round_trip(Frame::HelloAck { client: ClientId(7), initial_seq: SeqNum::new(0.0) });
        round_trip(Frame::Subscribe { selector: Selector::All, eff: SeqNum::new(1.0) });
        round_trip(Frame::Subscribe {
            selector: Selector::Channel("x".into()),
            eff: SeqNum::new(2.5),
        });
        round_trip(Frame::SubscribeAck { eff: SeqNum::new(2.5) });
        round_trip(Frame::Unsubscribe { selector: Selector::All, eff: SeqNum::new(3.0) });
        round_trip(Frame::UnsubscribeAck { eff: SeqNum::new(3.0) });
        round_trip(Frame::Publish {
            publish_seq: SeqNum::new(1.0),
            receive_seq: SeqNum::new(2.0),
            channel: "x".into(),
            payload: vec![0xDE, 0xAD],
        });
        round_trip(Frame::ClearToAdvance { seq: SeqNum::new(3.0) });
        round_trip(Frame::RequestAdvance { seq: SeqNum::new(3.0) });
        round_trip(Frame::AdvanceGrant { seq: SeqNum::new(3.0) });
        round_trip(Frame::Deliver {
            publisher: ClientId(1),
            publish_seq: SeqNum::new(1.0),
            receive_seq: SeqNum::new(2.0),
            channel: "x".into(),
            payload: vec![1, 2, 3],
        });
        round_trip(Frame::DeliveryAck { seq: SeqNum::new(3.0) });
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let encoded = Frame::ClearToAdvance { seq: SeqNum::new(9.0) }.encode();
        let mut dec = FrameDecoder::new();
        dec.feed(&encoded[..encoded.len() - 2]);
        assert!(dec.drain_frames().unwrap().is_empty());
        dec.feed(&encoded[encoded.len() - 2..]);
        assert_eq!(dec.drain_frames().unwrap().len(), 1);
    }

    #[test]
    fn unknown_tag_is_malformed() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_be_bytes());
        buf.push(200);
        let mut dec = FrameDecoder::new();
        dec.feed(&buf);
        let err = dec.drain_frames().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Malformed);
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&Frame::Hello.encode());
        buf.extend_from_slice(&Frame::ClearToAdvance { seq: SeqNum::new(1.0) }.encode());
        let mut dec = FrameDecoder::new();
        dec.feed(&buf);
        let frames = dec.drain_frames().unwrap();
        assert_eq!(frames.len(), 2);
    }
}
