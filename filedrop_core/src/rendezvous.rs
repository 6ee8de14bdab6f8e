//! Rendezvous client interface.
//!
//! Two peers with no direct path yet exchange offers, answers and ICE
//! candidates through a shared store keyed by session code. The store is
//! a dumb mailbox: offer/answer are set-once, candidates are append-only
//! per role, and reads return the full history to date.

use crate::code::SessionCode;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::RwLock;

/// Which side of the rendezvous a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Created the session code and publishes the offer
    Initiator,
    /// Entered the code and publishes the answer
    Joiner,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Initiator => Role::Joiner,
            Role::Joiner => Role::Initiator,
        }
    }

    pub fn is_initiator(self) -> bool {
        matches!(self, Role::Initiator)
    }
}

/// One signaling payload as written by its originator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalingEnvelope {
    Offer(String),
    Answer(String),
    IceCandidate { candidate: String, origin: Role },
}

/// Remote store consumed by the connection state machine.
///
/// All operations may fail transiently; callers retry on their next poll
/// tick rather than recovering explicitly.
pub trait Rendezvous: Send + Sync + 'static {
    /// Set-once. A second call with a different payload is undefined; stores
    /// are expected to keep the first.
    fn publish_offer(&self, code: &SessionCode, sdp: &str)
    -> impl Future<Output = Result<()>> + Send;

    fn publish_answer(
        &self,
        code: &SessionCode,
        sdp: &str,
    ) -> impl Future<Output = Result<()>> + Send;

    /// `None` means "not yet available", not an error.
    fn fetch_offer(&self, code: &SessionCode) -> impl Future<Output = Result<Option<String>>> + Send;

    fn fetch_answer(
        &self,
        code: &SessionCode,
    ) -> impl Future<Output = Result<Option<String>>> + Send;

    fn publish_ice_candidate(
        &self,
        code: &SessionCode,
        candidate: &str,
        origin: Role,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Every candidate `origin` has published so far, in order.
    fn fetch_ice_candidates(
        &self,
        code: &SessionCode,
        origin: Role,
    ) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Write any envelope through the matching operation.
    fn publish(
        &self,
        code: &SessionCode,
        envelope: &SignalingEnvelope,
    ) -> impl Future<Output = Result<()>> + Send {
        async move {
            match envelope {
                SignalingEnvelope::Offer(sdp) => self.publish_offer(code, sdp).await,
                SignalingEnvelope::Answer(sdp) => self.publish_answer(code, sdp).await,
                SignalingEnvelope::IceCandidate { candidate, origin } => {
                    self.publish_ice_candidate(code, candidate, *origin).await
                }
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Mailbox {
    offer: Option<String>,
    answer: Option<String>,
    initiator_candidates: Vec<String>,
    joiner_candidates: Vec<String>,
}

impl Mailbox {
    fn candidates_mut(&mut self, origin: Role) -> &mut Vec<String> {
        match origin {
            Role::Initiator => &mut self.initiator_candidates,
            Role::Joiner => &mut self.joiner_candidates,
        }
    }
}

/// In-process store, for tests and same-process loopback sessions.
#[derive(Debug, Default)]
pub struct MemoryRendezvous {
    sessions: RwLock<HashMap<SessionCode, Mailbox>>,
}

impl MemoryRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget everything stored under `code`.
    pub async fn remove(&self, code: &SessionCode) {
        self.sessions.write().await.remove(code);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

impl Rendezvous for MemoryRendezvous {
    async fn publish_offer(&self, code: &SessionCode, sdp: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let mailbox = sessions.entry(code.clone()).or_default();
        if mailbox.offer.is_none() {
            mailbox.offer = Some(sdp.to_string());
        }
        Ok(())
    }

    async fn publish_answer(&self, code: &SessionCode, sdp: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let mailbox = sessions.entry(code.clone()).or_default();
        if mailbox.answer.is_none() {
            mailbox.answer = Some(sdp.to_string());
        }
        Ok(())
    }

    async fn fetch_offer(&self, code: &SessionCode) -> Result<Option<String>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(code).and_then(|m| m.offer.clone()))
    }

    async fn fetch_answer(&self, code: &SessionCode) -> Result<Option<String>> {
        let sessions = self.sessions.read().await;
        Ok(sessions.get(code).and_then(|m| m.answer.clone()))
    }

    async fn publish_ice_candidate(
        &self,
        code: &SessionCode,
        candidate: &str,
        origin: Role,
    ) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        sessions
            .entry(code.clone())
            .or_default()
            .candidates_mut(origin)
            .push(candidate.to_string());
        Ok(())
    }

    async fn fetch_ice_candidates(&self, code: &SessionCode, origin: Role) -> Result<Vec<String>> {
        let sessions = self.sessions.read().await;
        Ok(sessions
            .get(code)
            .map(|m| match origin {
                Role::Initiator => m.initiator_candidates.clone(),
                Role::Joiner => m.joiner_candidates.clone(),
            })
            .unwrap_or_default())
    }
}
