//! The client library: mirrors the protocol on the client side, enforces
//! client-local monotonicity, and exposes the public connection API.
//! Blocking calls (`start`, `subscribe`, `unsubscribe`, `await_advance`,
//! `receive_until`) internally loop a cooperative `process_io` work
//! function; `publish`, `clear_to_advance`, and `receive_messages` never
//! suspend.

use crate::error::{err, ErrorKind, Result};
use crate::message::Message;
use crate::seqnum::{SeqNum, FIRST_SEQ_NUM};
use crate::transport::Channel;
use crate::wire::{ClientId, Frame, FrameDecoder, Selector};
use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

/// An outgoing publication, before the fabric assigns it a publisher id.
pub struct OutboundPublish {
    pub publish_seq: SeqNum,
    pub receive_seq: SeqNum,
    pub channel: String,
    pub payload: Vec<u8>,
}

pub struct Client {
    channel: Box<dyn Channel + Send>,
    decoder: FrameDecoder,
    outbound_bytes: Vec<u8>,
    outbound_cursor: usize,

    id: Option<ClientId>,
    min_send_seq: SeqNum,
    min_recv_seq: SeqNum,
    /// Union cursor of every `publish_seq`, `clear_until`, and
    /// subscription effective-from value this client has emitted, in
    /// call order. Enforces client-local monotonicity.
    local_cursor: SeqNum,

    last_returned_advance: SeqNum,
    pending_advances: VecDeque<SeqNum>,
    pending_subscribe_acks: VecDeque<SeqNum>,
    pending_unsubscribe_acks: VecDeque<SeqNum>,
    buffered_deliveries: VecDeque<Message>,

    subscriptions: HashMap<SelectorKey, SeqNum>,
}

/// `Selector` isn't `Hash`+`Eq` over its `String` variant out of the box
/// in a way that's convenient to key a map with directly through the
/// wire type, so the client keeps its own light key.
#[derive(Clone, Eq, PartialEq, Hash)]
enum SelectorKey {
    All,
    Channel(String),
}

impl From<&Selector> for SelectorKey {
    fn from(sel: &Selector) -> SelectorKey {
        match sel {
            Selector::All => SelectorKey::All,
            Selector::Channel(name) => SelectorKey::Channel(name.clone()),
        }
    }
}

const POLL_BACKOFF: Duration = Duration::from_micros(200);

impl Client {
    /// Blocks for the `Hello`/`HelloAck` handshake. After return,
    /// `min_send_seq == min_recv_seq == kFirstSeqNum`.
    pub fn start(channel: Box<dyn Channel + Send>) -> Result<Client> {
        let mut client = Client {
            channel,
            decoder: FrameDecoder::new(),
            outbound_bytes: Vec::new(),
            outbound_cursor: 0,
            id: None,
            min_send_seq: FIRST_SEQ_NUM,
            min_recv_seq: FIRST_SEQ_NUM,
            local_cursor: FIRST_SEQ_NUM,
            last_returned_advance: SeqNum::new(f64::NEG_INFINITY),
            pending_advances: VecDeque::new(),
            pending_subscribe_acks: VecDeque::new(),
            pending_unsubscribe_acks: VecDeque::new(),
            buffered_deliveries: VecDeque::new(),
            subscriptions: HashMap::new(),
        };
        client.enqueue(Frame::Hello);
        client.flush()?;
        client.block_until(|c| c.id)?;
        Ok(client)
    }

    pub fn id(&self) -> Option<ClientId> {
        self.id
    }

    pub fn min_send_seq(&self) -> SeqNum {
        self.min_send_seq
    }

    pub fn min_recv_seq(&self) -> SeqNum {
        self.min_recv_seq
    }

    /// Blocks until the matching `SubscribeAck`.
    pub fn subscribe(&mut self, selector: Selector, seq: SeqNum) -> Result<SeqNum> {
        self.check_monotonic(seq)?;
        let key = SelectorKey::from(&selector);
        self.enqueue(Frame::Subscribe { selector, eff: seq });
        self.flush()?;
        let eff = self.block_until(|c| c.pending_subscribe_acks.pop_front())?;
        self.subscriptions.insert(key, eff);
        self.local_cursor = seq;
        Ok(eff)
    }

    /// Blocks until the matching `UnsubscribeAck`.
    pub fn unsubscribe(&mut self, selector: Selector, seq: SeqNum) -> Result<SeqNum> {
        self.check_monotonic(seq)?;
        let key = SelectorKey::from(&selector);
        self.enqueue(Frame::Unsubscribe { selector, eff: seq });
        self.flush()?;
        let eff = self.block_until(|c| c.pending_unsubscribe_acks.pop_front())?;
        self.subscriptions.remove(&key);
        self.local_cursor = seq;
        Ok(eff)
    }

    /// Nonblocking, locally advances `min_send_seq`. Rejects locally (as
    /// `Misuse`) rather than going over the wire if the publication is
    /// already known to violate a local invariant.
    pub fn publish(&mut self, msg: OutboundPublish) -> Result<()> {
        if msg.publish_seq < self.min_send_seq {
            return err!(
                Misuse,
                desc: "publish_seq {} below min_send_seq {}", msg.publish_seq, self.min_send_seq
            );
        }
        if msg.receive_seq <= msg.publish_seq {
            return err!(
                Misuse,
                desc: "receive_seq {} not strictly greater than publish_seq {}",
                msg.receive_seq, msg.publish_seq
            );
        }
        self.check_monotonic(msg.publish_seq)?;
        self.min_send_seq = msg.publish_seq;
        self.local_cursor = msg.publish_seq;
        self.enqueue(Frame::Publish {
            publish_seq: msg.publish_seq,
            receive_seq: msg.receive_seq,
            channel: msg.channel,
            payload: msg.payload,
        });
        self.flush()
    }

    /// Nonblocking, advances local `min_send_seq`.
    pub fn clear_to_advance(&mut self, t: SeqNum) -> Result<()> {
        if t < self.min_send_seq {
            return err!(Misuse, desc: "clear_to_advance({}) regresses min_send_seq {}", t, self.min_send_seq);
        }
        self.check_monotonic(t)?;
        self.min_send_seq = t;
        self.local_cursor = t;
        self.enqueue(Frame::ClearToAdvance { seq: t });
        self.flush()
    }

    /// Requests the server grant the client's `min_recv_seq` up to `t`.
    /// Required to drive `await_advance`/`receive_until`.
    pub fn request_advance(&mut self, t: SeqNum) -> Result<()> {
        if t < self.min_recv_seq {
            return err!(Misuse, desc: "request_advance({}) below min_recv_seq {}", t, self.min_recv_seq);
        }
        self.enqueue(Frame::RequestAdvance { seq: t });
        self.flush()
    }

    /// Blocks until the next `AdvanceGrant` whose value exceeds the last
    /// one returned.
    pub fn await_advance(&mut self) -> Result<SeqNum> {
        let floor = self.last_returned_advance;
        let grant = self.block_until(|c| {
            while let Some(next) = c.pending_advances.pop_front() {
                if next > floor {
                    return Some(next);
                }
            }
            None
        })?;
        self.last_returned_advance = grant;
        Ok(grant)
    }

    /// Nonblocking, drains every delivery buffered locally up to and
    /// including the latest grant.
    pub fn receive_messages(&mut self) -> Result<(Vec<Message>, SeqNum)> {
        self.process_io_nonblocking()?;
        let mut out = Vec::new();
        while let Some(front) = self.buffered_deliveries.front() {
            if front.receive_seq > self.min_recv_seq {
                break;
            }
            out.push(self.buffered_deliveries.pop_front().unwrap());
        }
        if !out.is_empty() {
            self.enqueue(Frame::DeliveryAck { seq: self.min_recv_seq });
            self.flush()?;
        }
        Ok((out, self.min_recv_seq))
    }

    /// `ClearToAdvance(T)`; request a grant to `T`; loop receiving and
    /// awaiting advances until `min_recv_seq >= T`.
    pub fn receive_until(&mut self, t: SeqNum) -> Result<Vec<Message>> {
        self.clear_to_advance(t)?;
        self.request_advance(t)?;
        let mut all = Vec::new();
        loop {
            let (msgs, min_recv) = self.receive_messages()?;
            all.extend(msgs);
            if min_recv >= t {
                break;
            }
            self.await_advance()?;
        }
        Ok(all)
    }

    fn check_monotonic(&self, seq: SeqNum) -> Result<()> {
        if seq < self.local_cursor {
            return err!(
                Misuse,
                desc: "seq {} regresses client-local monotonicity cursor {}", seq, self.local_cursor
            );
        }
        Ok(())
    }

    fn enqueue(&mut self, frame: Frame) {
        self.outbound_bytes.extend_from_slice(&frame.encode());
    }

    fn flush(&mut self) -> Result<()> {
        while self.outbound_cursor < self.outbound_bytes.len() {
            let n = self.channel.write_available(&self.outbound_bytes[self.outbound_cursor..])?;
            if n == 0 {
                break;
            }
            self.outbound_cursor += n;
        }
        if self.outbound_cursor == self.outbound_bytes.len() {
            self.outbound_bytes.clear();
            self.outbound_cursor = 0;
        }
        Ok(())
    }

    fn process_io_nonblocking(&mut self) -> Result<()> {
        let bytes = self.channel.read_available()?;
        if !bytes.is_empty() {
            self.decoder.feed(&bytes);
        }
        for frame in self.decoder.drain_frames()? {
            self.apply_inbound(frame)?;
        }
        self.flush()
    }

    fn apply_inbound(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::HelloAck { client, initial_seq } => {
                self.id = Some(client);
                self.min_send_seq = initial_seq;
                self.min_recv_seq = initial_seq;
                self.local_cursor = initial_seq;
                Ok(())
            }
            Frame::SubscribeAck { eff } => {
                self.pending_subscribe_acks.push_back(eff);
                Ok(())
            }
            Frame::UnsubscribeAck { eff } => {
                self.pending_unsubscribe_acks.push_back(eff);
                Ok(())
            }
            Frame::AdvanceGrant { seq } => {
                self.min_recv_seq = self.min_recv_seq.max(seq);
                self.pending_advances.push_back(seq);
                Ok(())
            }
            Frame::Deliver { publisher, publish_seq, receive_seq, channel, payload } => {
                self.buffered_deliveries.push_back(Message {
                    publisher,
                    publish_seq,
                    receive_seq,
                    channel,
                    payload,
                });
                Ok(())
            }
            other => err!(ProtocolViolation, desc: "server sent client-only frame {:?}", other),
        }
    }

    /// Drives `process_io` in a loop until `check` returns `Some`, or the
    /// transport is closed.
    fn block_until<T>(&mut self, mut check: impl FnMut(&mut Client) -> Option<T>) -> Result<T> {
        loop {
            if let Some(v) = check(self) {
                return Ok(v);
            }
            self.process_io_nonblocking()?;
            if let Some(v) = check(self) {
                return Ok(v);
            }
            thread::sleep(POLL_BACKOFF);
        }
    }
}
