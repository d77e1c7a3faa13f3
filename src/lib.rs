//! A deterministic publish/subscribe datagram fabric for multi-process
//! simulation: a single sequencer interleaves every client's publishes,
//! subscriptions, and advance requests onto one total order and blocks
//! each client exactly long enough that what it observes is causally
//! complete with respect to that order.
//!
//! The sequencing core (codec, session, sequencer, client library,
//! critic) is the hard part; transport byte-framing and socket setup
//! are provided but are not where the interesting invariants live.

pub mod client;
pub mod config;
pub mod critic;
pub mod error;
pub mod message;
pub mod sequencer;
pub mod session;
pub mod transport;
pub mod wire;

pub use client::{Client, OutboundPublish};
pub use error::{Error, ErrorKind, Result};
pub use message::Message;
pub use seqnum::{SeqNum, FIRST_SEQ_NUM};
pub use sequencer::Sequencer;
pub use wire::{ClientId, Frame, Selector};

pub mod seqnum;
