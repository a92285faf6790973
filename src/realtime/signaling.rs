//! WebRTC signaling memory per session, so late joiners can sync.

use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::{PoisonError, RwLock};

/// Oldest ICE candidates are dropped beyond this count.
pub const MAX_ICE_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingSnapshot {
    pub offer: Option<SignalEntry>,
    pub answers: Vec<SignalEntry>,
    pub ice_candidates: Vec<SignalEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalEntry {
    pub from: String,
    pub payload: Value,
}

#[derive(Debug, Default)]
struct SessionSignals {
    offer: Option<SignalEntry>,
    answers: Vec<SignalEntry>,
    ice: VecDeque<SignalEntry>,
}

#[derive(Debug, Default)]
pub struct SignalingStore {
    sessions: RwLock<HashMap<String, SessionSignals>>,
}

impl SignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new offer starts a fresh negotiation.
    pub fn record_offer(&self, session_id: &str, from: &str, sdp: Value) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        sessions.insert(
            session_id.to_string(),
            SessionSignals {
                offer: Some(SignalEntry { from: from.to_string(), payload: sdp }),
                ..SessionSignals::default()
            },
        );
    }

    /// Latest answer per peer.
    pub fn record_answer(&self, session_id: &str, from: &str, sdp: Value) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let signals = sessions.entry(session_id.to_string()).or_default();
        signals.answers.retain(|a| a.from != from);
        signals.answers.push(SignalEntry { from: from.to_string(), payload: sdp });
    }

    pub fn record_ice_candidate(&self, session_id: &str, from: &str, candidate: Value) {
        let mut sessions = self.sessions.write().unwrap_or_else(PoisonError::into_inner);
        let signals = sessions.entry(session_id.to_string()).or_default();
        signals.ice.push_back(SignalEntry { from: from.to_string(), payload: candidate });
        while signals.ice.len() > MAX_ICE_CANDIDATES {
            signals.ice.pop_front();
        }
    }

    pub fn snapshot(&self, session_id: &str) -> SignalingSnapshot {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        sessions
            .get(session_id)
            .map(|s| SignalingSnapshot {
                offer: s.offer.clone(),
                answers: s.answers.clone(),
                ice_candidates: s.ice.iter().cloned().collect(),
            })
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
    }
}
