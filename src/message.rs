//! `Message`: the immutable tuple born on `Publish` and shared read-only
//! across every recipient. A plain struct since the fabric only ever
//! carries one payload shape.

use crate::seqnum::SeqNum;
use crate::wire::ClientId;

/// A published message, shared via `Arc` once it reaches one or more
/// sessions' pending-delivery queues so the bytes are never copied per
/// recipient.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub publisher: ClientId,
    pub publish_seq: SeqNum,
    pub receive_seq: SeqNum,
    pub channel: String,
    pub payload: Vec<u8>,
}

impl Message {
    /// Holds iff this message cannot be delivered before it was published.
    pub fn is_causal(&self) -> bool {
        self.receive_seq > self.publish_seq
    }
}
