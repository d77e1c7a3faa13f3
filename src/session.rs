//! Server-side client session.
//!
//! One `Session` per connected client: it owns the byte channel, drains
//! and decodes inbound frames, tracks the client's frontier promises
//! (`min_send_seq`, `min_recv_seq`), and queues outbound frames for
//! `flush`. Cross-session concerns (recipient resolution, grant
//! arbitration, the global frontier `G`) are NOT here; they belong to
//! `Sequencer`, which owns the whole set of sessions as a shared,
//! session-indexed frontier; sessions never reference each other
//! directly.
//!
//! One inbound decode buffer, one outbound byte queue, explicit `flush`.

use crate::error::{err, Error, Result};
use crate::message::Message;
use crate::seqnum::{SeqNum, FIRST_SEQ_NUM};
use crate::transport::Channel;
use crate::wire::{ClientId, Frame, FrameDecoder, Selector};
use log::{debug, trace, warn};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SessionState {
    Handshaking,
    Active,
    Closing,
    Dead,
}

/// `(client, selector)` keyed subscription carrying an effective-from
/// sequence number and whether it is currently live. `active` is false
/// once the selector has been unsubscribed; `eff` then holds the point
/// the unsubscribe took effect at rather than a subscribe point, and the
/// entry is kept (not removed) so a later resubscribe updates it in
/// place instead of duplicating it.
#[derive(Clone, Debug, PartialEq)]
pub struct Subscription {
    pub selector: Selector,
    pub eff: SeqNum,
    pub active: bool,
}

/// One message queued for delivery to this session but not yet
/// transmitted. Shared via `Arc` since the same published message can be
/// queued for many recipients at once.
#[derive(Clone)]
struct PendingDelivery(Arc<Message>);

impl PendingDelivery {
    fn order_key(&self) -> (SeqNum, ClientId, SeqNum) {
        (self.0.receive_seq, self.0.publisher, self.0.publish_seq)
    }
}

pub struct Session {
    prefix: String,
    pub id: Option<ClientId>,
    state: SessionState,
    channel: Box<dyn Channel + Send>,
    decoder: FrameDecoder,
    outbound_bytes: Vec<u8>,
    outbound_cursor: usize,
    pub subscriptions: Vec<Subscription>,
    pub min_send_seq: SeqNum,
    pub min_recv_seq: SeqNum,
    pending_delivery: VecDeque<PendingDelivery>,
    pub pending_grant: Option<SeqNum>,
}

impl Session {
    pub fn new(channel: Box<dyn Channel + Send>) -> Session {
        Session {
            prefix: "session-?".to_string(),
            id: None,
            state: SessionState::Handshaking,
            channel,
            decoder: FrameDecoder::new(),
            outbound_bytes: Vec::new(),
            outbound_cursor: 0,
            subscriptions: Vec::new(),
            min_send_seq: FIRST_SEQ_NUM,
            min_recv_seq: FIRST_SEQ_NUM,
            pending_delivery: VecDeque::new(),
            pending_grant: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.state, SessionState::Dead)
    }

    /// Drains whatever bytes the transport has ready and decodes every
    /// complete frame found. A `Malformed` frame or transport error
    /// transitions the session toward `Dead` and is returned to the
    /// caller (the sequencer) for logging.
    pub fn poll_inbound(&mut self) -> Result<Vec<Frame>> {
        if !matches!(self.state, SessionState::Handshaking | SessionState::Active) {
            return Ok(Vec::new());
        }
        let bytes = match self.channel.read_available() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        self.decoder.feed(&bytes);
        match self.decoder.drain_frames() {
            Ok(frames) => Ok(frames),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    /// Applies the local part of a frame's state transition: the parts
    /// that only need this session's own state. `Hello` and `Publish`
    /// recipient-resolution stay with the sequencer, which has the
    /// cross-session view they need.
    pub fn apply_local(&mut self, frame: &Frame) -> Result<()> {
        match (self.state, frame) {
            (SessionState::Handshaking, Frame::Hello) => Ok(()),
            (SessionState::Handshaking, _) => {
                err!(ProtocolViolation, desc: "{} frame before Hello", self.prefix)
            }
            (SessionState::Active, Frame::ClearToAdvance { seq }) => {
                if *seq < self.min_send_seq {
                    return err!(
                        ProtocolViolation,
                        desc: "{} ClearToAdvance({}) regresses min_send_seq {}",
                        self.prefix, seq, self.min_send_seq
                    );
                }
                self.min_send_seq = *seq;
                Ok(())
            }
            (SessionState::Active, Frame::RequestAdvance { seq }) => {
                if *seq < self.min_recv_seq {
                    return err!(
                        ProtocolViolation,
                        desc: "{} RequestAdvance({}) below min_recv_seq {}",
                        self.prefix, seq, self.min_recv_seq
                    );
                }
                self.pending_grant = Some(*seq);
                Ok(())
            }
            (SessionState::Active, Frame::DeliveryAck { seq }) => {
                self.min_recv_seq = self.min_recv_seq.max(*seq);
                Ok(())
            }
            (SessionState::Active, Frame::Subscribe { .. })
            | (SessionState::Active, Frame::Unsubscribe { .. })
            | (SessionState::Active, Frame::Publish { .. }) => {
                // Cross-session resolution lives in the sequencer.
                Ok(())
            }
            (SessionState::Active, Frame::Hello) => {
                err!(ProtocolViolation, desc: "{} duplicate Hello", self.prefix)
            }
            (state, frame) => {
                err!(ProtocolViolation, desc: "{} frame {:?} invalid in state {:?}", self.prefix, frame, state)
            }
        }
    }

    /// Enrolls or updates a subscription. Publications already resolved
    /// at publish time remain queued regardless of a later unsubscribe.
    pub fn subscribe(&mut self, selector: Selector, eff: SeqNum) {
        match self.subscriptions.iter_mut().find(|s| s.selector == selector) {
            Some(existing) => {
                existing.eff = eff;
                existing.active = true;
            }
            None => self.subscriptions.push(Subscription { selector, eff, active: true }),
        }
    }

    /// Marks the subscription inactive as of `eff`. A publication with
    /// `publish_seq >= eff` no longer matches this selector; one already
    /// resolved into `pending_delivery` before the unsubscribe was
    /// applied is untouched.
    pub fn unsubscribe(&mut self, selector: &Selector, eff: SeqNum) {
        if let Some(existing) = self.subscriptions.iter_mut().find(|s| &s.selector == selector) {
            existing.eff = eff;
            existing.active = false;
        }
    }

    pub fn validate_subscription_change(&self, req_eff: SeqNum) -> Result<()> {
        if req_eff < self.min_send_seq {
            return err!(
                ProtocolViolation,
                desc: "{} subscription req_eff {} below min_send_seq {}",
                self.prefix, req_eff, self.min_send_seq
            );
        }
        Ok(())
    }

    pub fn validate_publish(&self, publish_seq: SeqNum, receive_seq: SeqNum) -> Result<()> {
        if publish_seq < self.min_send_seq {
            return err!(
                ProtocolViolation,
                desc: "{} publish_seq {} below min_send_seq {}",
                self.prefix, publish_seq, self.min_send_seq
            );
        }
        if receive_seq <= publish_seq {
            return err!(
                ProtocolViolation,
                desc: "{} receive_seq {} not strictly greater than publish_seq {}",
                self.prefix, receive_seq, publish_seq
            );
        }
        Ok(())
    }

    pub fn record_publish(&mut self, publish_seq: SeqNum) {
        self.min_send_seq = self.min_send_seq.max(publish_seq);
    }

    /// Inserts `message` into this session's delivery queue, preserving
    /// the delivery-order invariant: non-decreasing `receive_seq`, ties
    /// broken by `(publisher, publish_seq)` ascending.
    pub fn queue_delivery(&mut self, message: Arc<Message>) {
        let entry = PendingDelivery(message);
        let key = entry.order_key();
        let pos = self
            .pending_delivery
            .iter()
            .position(|existing| existing.order_key() > key)
            .unwrap_or(self.pending_delivery.len());
        self.pending_delivery.insert(pos, entry);
    }

    pub fn next_pending_receive_seq(&self) -> Option<SeqNum> {
        self.pending_delivery.front().map(|p| p.0.receive_seq)
    }

    /// Pops and enqueues-as-`Deliver` every pending message with
    /// `receive_seq <= frontier`, in delivery order. Returns the
    /// messages dispatched, so a caller tracking per-client delivery
    /// events can record one per message.
    pub fn dispatch_deliverable(&mut self, frontier: SeqNum) -> Vec<Arc<Message>> {
        let mut dispatched = Vec::new();
        while let Some(front) = self.pending_delivery.front() {
            if front.0.receive_seq > frontier {
                break;
            }
            let msg = self.pending_delivery.pop_front().unwrap().0;
            self.enqueue_outbound(Frame::Deliver {
                publisher: msg.publisher,
                publish_seq: msg.publish_seq,
                receive_seq: msg.receive_seq,
                channel: msg.channel.clone(),
                payload: msg.payload.clone(),
            });
            dispatched.push(msg);
        }
        dispatched
    }

    pub fn has_deliverable_at_or_below(&self, frontier: SeqNum) -> bool {
        matches!(self.next_pending_receive_seq(), Some(seq) if seq <= frontier)
    }

    pub fn enqueue_outbound(&mut self, frame: Frame) {
        self.outbound_bytes.extend_from_slice(&frame.encode());
    }

    /// Pushes as many queued outbound bytes as the transport accepts
    /// without blocking.
    pub fn flush(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Dead) {
            return Ok(());
        }
        let remaining = &self.outbound_bytes[self.outbound_cursor..];
        if remaining.is_empty() {
            return Ok(());
        }
        match self.channel.write_available(remaining) {
            Ok(n) => {
                self.outbound_cursor += n;
                if self.outbound_cursor == self.outbound_bytes.len() {
                    self.outbound_bytes.clear();
                    self.outbound_cursor = 0;
                }
                Ok(())
            }
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    pub fn complete_handshake(&mut self, id: ClientId) {
        self.id = Some(id);
        self.prefix = format!("session-{}", id.0);
        self.state = SessionState::Active;
        debug!("{} handshake complete", self.prefix);
    }

    pub fn fail(&mut self, err: &Error) {
        if matches!(self.state, SessionState::Dead | SessionState::Closing) {
            return;
        }
        warn!("{} fatal error, closing: {}", self.prefix, err);
        self.close();
    }

    /// `Closing -> Dead`: no further outbound is flushed, inbound is
    /// dropped, the channel is released.
    pub fn close(&mut self) {
        if matches!(self.state, SessionState::Dead) {
            return;
        }
        self.state = SessionState::Closing;
        trace!("{} closing", self.prefix);
        self.outbound_bytes.clear();
        self.outbound_cursor = 0;
        self.state = SessionState::Dead;
    }

    pub fn matching_eff(&self, channel: &str) -> Option<SeqNum> {
        self.subscriptions
            .iter()
            .filter(|s| s.active && s.selector.matches(channel))
            .map(|s| s.eff)
            .min()
    }
}
