//! The critic: a pure validator over a list of sequencing events, used to
//! check causality and ordering invariants hold across a whole trace. It
//! never mutates anything it's handed and never touches I/O: a test-time
//! (and optionally debug-mode) function, not part of the runtime hot
//! path.

use crate::seqnum::SeqNum;
use crate::wire::ClientId;

/// One entry in the interleaved trace the critic inspects.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Publish { publisher: ClientId, publish_seq: SeqNum, receive_seq: SeqNum },
    Receive { client: ClientId, publisher: ClientId, publish_seq: SeqNum, receive_seq: SeqNum },
    Sequence { client: ClientId, seq_num: SeqNum },
}

impl Event {
    /// The sequence number the running causal-point cursor checks this
    /// event against.
    fn cursor_seq(&self) -> SeqNum {
        match self {
            Event::Publish { publish_seq, .. } => *publish_seq,
            Event::Receive { receive_seq, .. } => *receive_seq,
            Event::Sequence { seq_num, .. } => *seq_num,
        }
    }
}

/// Runs every causality and ordering check over `events` in order,
/// returning a diagnostic string per violation found. An empty result
/// means the trace is consistent with the fabric's invariants.
pub fn critique(events: &[Event]) -> Vec<String> {
    let mut diagnostics = Vec::new();
    let mut cursor: Option<SeqNum> = None;

    for (i, event) in events.iter().enumerate() {
        if let Event::Publish { publisher, publish_seq, receive_seq } = event {
            if *receive_seq <= *publish_seq {
                diagnostics.push(format!(
                    "event[{}]: publish by {} has receive_seq {} <= publish_seq {}",
                    i, publisher, receive_seq, publish_seq
                ));
            }
        }

        let seq = event.cursor_seq();
        if let Some(c) = cursor {
            if seq <= c {
                diagnostics.push(format!(
                    "event[{}]: {:?} has seq {} <= running causal cursor {}",
                    i, event, seq, c
                ));
            }
        }
        cursor = Some(seq);
    }

    diagnostics
}
