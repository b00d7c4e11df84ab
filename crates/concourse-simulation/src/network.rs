//! The simulated network's delivery model.

use concourse_core::{Event, OutboundMessage};
use concourse_types::NodeId;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::time::Duration;

/// Per-hop delivery delay: a fixed base plus uniform jitter.
#[derive(Debug, Clone, Copy)]
pub struct LatencyModel {
    pub base: Duration,
    pub jitter: Duration,
}

impl LatencyModel {
    pub fn sample(&self, rng: &mut ChaCha8Rng) -> Duration {
        let jitter_micros = self.jitter.as_micros() as u64;
        if jitter_micros == 0 {
            return self.base;
        }
        self.base + Duration::from_micros(rng.gen_range(0..=jitter_micros))
    }
}

impl Default for LatencyModel {
    fn default() -> Self {
        LatencyModel {
            base: Duration::from_millis(10),
            jitter: Duration::from_millis(5),
        }
    }
}

/// What an outbound message looks like on the receiving side.
pub fn message_to_event(from: NodeId, message: OutboundMessage) -> Event {
    match message {
        OutboundMessage::Proposal(proposal) => Event::ProposalReceived { proposal },
        OutboundMessage::Vote(vote) => Event::VoteReceived { vote },
        OutboundMessage::GetVerticesRequest(request) => {
            Event::VertexRequestReceived { from, request }
        }
        OutboundMessage::GetVerticesResponse(response) => {
            Event::VertexResponseReceived { from, response }
        }
        OutboundMessage::GetVerticesErrorResponse(response) => {
            Event::VertexErrorResponseReceived { from, response }
        }
    }
}
