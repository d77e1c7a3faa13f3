//! `Sequencer`: the single authority for the fabric's total order. Owns
//! every `Session`; exposes one cooperative work function, `handle_io`,
//! that drains inbound frames, applies their state transitions,
//! evaluates advance grants, and flushes outbound frames.
//!
//! Cyclic coupling between sessions (one session's `min_send_seq` gates
//! another's grant) is expressed here as a shared, session-indexed
//! frontier rather than sessions referencing each other directly.

use crate::error::{err, Result};
use crate::message::Message;
use crate::seqnum::{SeqNum, FIRST_SEQ_NUM};
use crate::session::{Session, SessionState};
use crate::transport::Channel;
use crate::wire::{ClientId, Frame};
use log::{debug, trace};
use std::sync::Arc;

#[cfg(feature = "debug-critic")]
use crate::critic::Event;

pub struct Sequencer {
    sessions: Vec<Session>,
    next_client_id: u32,
    #[cfg(feature = "debug-critic")]
    events: Vec<Event>,
}

impl Default for Sequencer {
    fn default() -> Sequencer {
        Sequencer::new()
    }
}

impl Sequencer {
    pub fn new() -> Sequencer {
        Sequencer {
            sessions: Vec::new(),
            next_client_id: 1,
            #[cfg(feature = "debug-critic")]
            events: Vec::new(),
        }
    }

    /// Admits a newly-accepted channel as a session in `Handshaking`
    /// state. Returns the session's slot index (stable until the session
    /// is removed, which only happens once it is `Dead`).
    pub fn add_session(&mut self, channel: Box<dyn Channel + Send>) -> usize {
        self.sessions.push(Session::new(channel));
        self.sessions.len() - 1
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session_by_client(&self, id: ClientId) -> Option<&Session> {
        self.sessions.iter().find(|s| s.id == Some(id))
    }

    #[cfg(feature = "debug-critic")]
    pub fn drain_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// The cooperative work function: drains inbound on every session in
    /// the given order, applies each frame, arbitrates grants, and
    /// flushes outbound. Exposing the polling order as a parameter is
    /// what lets a permutation harness prove the outcome doesn't depend
    /// on it.
    pub fn handle_io_with_session_order(&mut self, order: &[usize]) -> Result<()> {
        for &idx in order {
            if idx < self.sessions.len() {
                self.drain_session(idx);
            }
        }
        self.arbitrate_grants();
        for session in self.sessions.iter_mut() {
            if session.is_live() {
                let _ = session.flush();
            }
        }
        self.reap_dead_sessions();
        Ok(())
    }

    pub fn handle_io(&mut self) -> Result<()> {
        let order: Vec<usize> = (0..self.sessions.len()).collect();
        self.handle_io_with_session_order(&order)
    }

    fn drain_session(&mut self, idx: usize) {
        let frames = match self.sessions[idx].poll_inbound() {
            Ok(frames) => frames,
            Err(_) => return,
        };
        for frame in frames {
            if let Err(e) = self.apply_frame(idx, frame) {
                self.sessions[idx].fail(&e);
                break;
            }
        }
    }

    fn apply_frame(&mut self, idx: usize, frame: Frame) -> Result<()> {
        self.sessions[idx].apply_local(&frame)?;
        match frame {
            Frame::Hello => {
                let id = ClientId(self.next_client_id);
                self.next_client_id += 1;
                self.sessions[idx].complete_handshake(id);
                self.sessions[idx]
                    .enqueue_outbound(Frame::HelloAck { client: id, initial_seq: FIRST_SEQ_NUM });
                Ok(())
            }
            Frame::Subscribe { selector, eff: req_eff } => {
                self.sessions[idx].validate_subscription_change(req_eff)?;
                let eff = req_eff.max(self.global_frontier());
                self.sessions[idx].subscribe(selector, eff);
                self.sessions[idx].enqueue_outbound(Frame::SubscribeAck { eff });
                Ok(())
            }
            Frame::Unsubscribe { selector, eff: req_eff } => {
                self.sessions[idx].validate_subscription_change(req_eff)?;
                let eff = req_eff.max(self.global_frontier());
                self.sessions[idx].unsubscribe(&selector, eff);
                self.sessions[idx].enqueue_outbound(Frame::UnsubscribeAck { eff });
                Ok(())
            }
            Frame::Publish { publish_seq, receive_seq, channel, payload } => {
                self.sessions[idx].validate_publish(publish_seq, receive_seq)?;
                let publisher = self.sessions[idx]
                    .id
                    .ok_or_else(|| crate::error::Error::new(
                        crate::error::ErrorKind::Internal,
                        "publish from session without assigned client id",
                    ))?;
                self.sessions[idx].record_publish(publish_seq);
                let message = Arc::new(Message { publisher, publish_seq, receive_seq, channel, payload });
                #[cfg(feature = "debug-critic")]
                self.events.push(Event::Publish {
                    publisher,
                    publish_seq: message.publish_seq,
                    receive_seq: message.receive_seq,
                });
                self.resolve_and_enqueue(message, publish_seq);
                Ok(())
            }
            Frame::ClearToAdvance { .. } | Frame::RequestAdvance { .. } | Frame::DeliveryAck { .. } => {
                // Fully handled by `Session::apply_local` above.
                Ok(())
            }
            other => err!(ProtocolViolation, desc: "client sent server-only frame {:?}", other),
        }
    }

    /// Recipient resolution: the union of sessions with a
    /// channel-specific subscription whose `eff <= publish_seq` and
    /// sessions with a wildcard subscription whose `eff <= publish_seq`.
    /// The publisher is included iff it itself holds a matching
    /// subscription.
    fn resolve_and_enqueue(&mut self, message: Arc<Message>, publish_seq: SeqNum) {
        for session in self.sessions.iter_mut() {
            if session.state() != SessionState::Active {
                continue;
            }
            if let Some(eff) = session.matching_eff(&message.channel) {
                if eff <= publish_seq {
                    session.queue_delivery(message.clone());
                }
            }
        }
    }

    /// `G`: the minimum `min_send_seq` across all live sessions. With no
    /// live sessions there is no constraint, so we return `+infinity`.
    pub fn global_frontier(&self) -> SeqNum {
        self.sessions
            .iter()
            .filter(|s| s.is_live())
            .map(|s| s.min_send_seq)
            .fold(SeqNum::new(f64::INFINITY), SeqNum::min)
    }

    /// Grant arbitration, processed in ascending `ClientId` order for
    /// determinism under concurrent grantability.
    fn arbitrate_grants(&mut self) {
        let g = self.global_frontier();
        let mut candidates: Vec<usize> = (0..self.sessions.len())
            .filter(|&i| {
                self.sessions[i].state() == SessionState::Active
                    && self.sessions[i].pending_grant.is_some()
            })
            .collect();
        candidates.sort_by_key(|&i| self.sessions[i].id.unwrap().0);

        for idx in candidates {
            let session = &mut self.sessions[idx];
            #[cfg_attr(not(feature = "debug-critic"), allow(unused_variables))]
            let dispatched = session.dispatch_deliverable(g);
            debug_assert!(!session.has_deliverable_at_or_below(g));
            let requested = session.pending_grant.unwrap();
            let grant = requested.min(g);
            session.enqueue_outbound(Frame::AdvanceGrant { seq: grant });
            session.min_recv_seq = session.min_recv_seq.max(grant);
            #[cfg(feature = "debug-critic")]
            if let Some(id) = session.id {
                for msg in &dispatched {
                    self.events.push(Event::Receive {
                        client: id,
                        publisher: msg.publisher,
                        publish_seq: msg.publish_seq,
                        receive_seq: msg.receive_seq,
                    });
                }
                self.events.push(Event::Sequence { client: id, seq_num: grant });
            }
            if grant == requested {
                session.pending_grant = None;
            }
            trace!("granted {} up to {}", session.id.unwrap(), grant);
        }
    }

    fn reap_dead_sessions(&mut self) {
        let before = self.sessions.len();
        self.sessions.retain(|s| s.state() != SessionState::Dead);
        let removed = before - self.sessions.len();
        if removed > 0 {
            debug!("reaped {} dead session(s)", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackChannel;
    use crate::wire::Selector;

    fn hello(seq: &mut Sequencer, idx: usize) -> ClientId {
        // Caller writes a Hello frame via the peer end before calling this.
        seq.drain_session(idx);
        seq.sessions[idx].id.expect("handshake completed")
    }

    #[test]
    fn handshake_assigns_sequential_ids() {
        let mut seq = Sequencer::new();
        let (server_a, mut client_a) = LoopbackChannel::pair();
        let idx_a = seq.add_session(Box::new(server_a));
        client_a.write_available(&Frame::Hello.encode()).unwrap();
        let id_a = hello(&mut seq, idx_a);
        assert_eq!(id_a, ClientId(1));

        let (server_b, mut client_b) = LoopbackChannel::pair();
        let idx_b = seq.add_session(Box::new(server_b));
        client_b.write_available(&Frame::Hello.encode()).unwrap();
        let id_b = hello(&mut seq, idx_b);
        assert_eq!(id_b, ClientId(2));
    }

    #[test]
    fn publish_without_subscriber_is_dropped_silently() {
        let mut seq = Sequencer::new();
        let (server, mut client) = LoopbackChannel::pair();
        let idx = seq.add_session(Box::new(server));
        client.write_available(&Frame::Hello.encode()).unwrap();
        hello(&mut seq, idx);
        client
            .write_available(
                &Frame::Publish {
                    publish_seq: SeqNum::new(1.0),
                    receive_seq: SeqNum::new(2.0),
                    channel: "x".into(),
                    payload: vec![1],
                }
                .encode(),
            )
            .unwrap();
        seq.handle_io().unwrap();
        assert_eq!(seq.global_frontier(), SeqNum::new(1.0));
    }

    #[test]
    fn causality_violation_closes_session() {
        let mut seq = Sequencer::new();
        let (server, mut client) = LoopbackChannel::pair();
        let idx = seq.add_session(Box::new(server));
        client.write_available(&Frame::Hello.encode()).unwrap();
        hello(&mut seq, idx);
        client
            .write_available(
                &Frame::Publish {
                    publish_seq: SeqNum::new(2.0),
                    receive_seq: SeqNum::new(1.0),
                    channel: "x".into(),
                    payload: vec![],
                }
                .encode(),
            )
            .unwrap();
        seq.handle_io().unwrap();
        assert_eq!(seq.session_count(), 0);
    }

    #[test]
    fn subscribe_ack_reflects_effective_seq() {
        let mut seq = Sequencer::new();
        let (server, mut client) = LoopbackChannel::pair();
        let idx = seq.add_session(Box::new(server));
        client.write_available(&Frame::Hello.encode()).unwrap();
        hello(&mut seq, idx);
        client
            .write_available(
                &Frame::Subscribe { selector: Selector::Channel("x".into()), eff: SeqNum::new(0.0) }
                    .encode(),
            )
            .unwrap();
        seq.handle_io().unwrap();
        assert_eq!(seq.sessions[idx].subscriptions[0].eff, SeqNum::new(0.0));
    }

    #[test]
    fn unsubscribe_stops_future_deliveries() {
        use crate::wire::FrameDecoder;

        let mut seq = Sequencer::new();
        let (sub_server, mut sub_client) = LoopbackChannel::pair();
        let sub_idx = seq.add_session(Box::new(sub_server));
        sub_client.write_available(&Frame::Hello.encode()).unwrap();
        hello(&mut seq, sub_idx);

        let (pub_server, mut pub_client) = LoopbackChannel::pair();
        let pub_idx = seq.add_session(Box::new(pub_server));
        pub_client.write_available(&Frame::Hello.encode()).unwrap();
        hello(&mut seq, pub_idx);

        sub_client
            .write_available(
                &Frame::Subscribe { selector: Selector::Channel("x".into()), eff: SeqNum::new(0.0) }
                    .encode(),
            )
            .unwrap();
        seq.handle_io().unwrap();
        sub_client
            .write_available(
                &Frame::Unsubscribe { selector: Selector::Channel("x".into()), eff: SeqNum::new(5.0) }
                    .encode(),
            )
            .unwrap();
        seq.handle_io().unwrap();
        assert!(!seq.sessions[sub_idx].subscriptions[0].active);

        pub_client
            .write_available(
                &Frame::Publish {
                    publish_seq: SeqNum::new(10.0),
                    receive_seq: SeqNum::new(11.0),
                    channel: "x".into(),
                    payload: vec![7],
                }
                .encode(),
            )
            .unwrap();
        seq.handle_io().unwrap();
        sub_client
            .write_available(&Frame::ClearToAdvance { seq: SeqNum::new(11.0) }.encode())
            .unwrap();
        seq.handle_io().unwrap();
        sub_client
            .write_available(&Frame::RequestAdvance { seq: SeqNum::new(11.0) }.encode())
            .unwrap();
        seq.handle_io().unwrap();

        let mut decoder = FrameDecoder::new();
        decoder.feed(&sub_client.read_available().unwrap());
        let delivered = decoder
            .drain_frames()
            .unwrap()
            .into_iter()
            .any(|f| matches!(f, Frame::Deliver { .. }));
        assert!(!delivered, "unsubscribed session should not have received the later publish");
    }
}
