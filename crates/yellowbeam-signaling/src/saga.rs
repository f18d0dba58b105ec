//! Compensating actions for multi-step call setup.
//!
//! Each completed step records how to undo itself; on failure the recorded
//! steps are undone newest first.

use crate::call::{BindingId, CallBinding, CallRegistry};
use crate::registry::UserSession;
use std::sync::Arc;
use yellowbeam_media::MediaEngine;

#[derive(Debug)]
pub enum Compensation {
    /// Destroy the call's media session.
    ReleaseMedia(Arc<CallBinding>),
    /// Drop the call from the registry under both keys.
    Unindex(BindingId),
    /// Forget the endpoint attached to a participant.
    DetachEndpoint(Arc<UserSession>),
}

#[derive(Debug)]
pub struct Saga {
    name: &'static str,
    done: Vec<Compensation>,
}

impl Saga {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            done: Vec::new(),
        }
    }

    pub fn record(&mut self, step: Compensation) {
        self.done.push(step);
    }

    /// Keep everything that was done.
    pub fn commit(self) {
        tracing::trace!(saga = self.name, steps = self.done.len(), "Saga committed");
    }

    pub async fn rollback(self, engine: &dyn MediaEngine, calls: &CallRegistry) {
        tracing::debug!(saga = self.name, steps = self.done.len(), "Rolling back");

        for step in self.done.into_iter().rev() {
            match step {
                Compensation::ReleaseMedia(binding) => {
                    if let Err(e) = binding.release(engine).await {
                        tracing::warn!(
                            saga = self.name,
                            media = %binding.media(),
                            error = %e,
                            "Compensation failed: media session not released"
                        );
                    }
                }
                Compensation::Unindex(id) => {
                    calls.remove(id);
                }
                Compensation::DetachEndpoint(session) => session.detach_endpoint().await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::call::Participant;
    use crate::registry::{Connection, SessionRegistry};
    use crate::testing::FakeMediaEngine;
    use yellowbeam_media::EndpointId;

    #[tokio::test]
    async fn rollback_undoes_every_step() {
        let engine = FakeMediaEngine::new();
        let sessions = SessionRegistry::new();
        let calls = CallRegistry::new();
        let (a, _rx_a) = Connection::open();
        let (b, _rx_b) = Connection::open();
        let alice = sessions.register("alice", a).unwrap();
        let bob = sessions.register("bob", b).unwrap();

        let mut saga = Saga::new("test");
        let binding = Arc::new(
            CallBinding::create(&engine, Participant::of(&alice), Participant::of(&bob))
                .await
                .unwrap(),
        );
        saga.record(Compensation::ReleaseMedia(binding.clone()));
        calls.insert(binding.clone()).unwrap();
        saga.record(Compensation::Unindex(binding.id()));
        alice.attach_endpoint(EndpointId("ep".into())).await;
        saga.record(Compensation::DetachEndpoint(alice.clone()));
        assert_eq!(saga.done.len(), 3);

        saga.rollback(&engine, &calls).await;

        assert!(calls.is_empty());
        assert!(alice.state().await.endpoint.is_none());
        assert_eq!(engine.sessions_released(), 1);
    }

    #[tokio::test]
    async fn commit_keeps_everything() {
        let engine = FakeMediaEngine::new();
        let binding = Arc::new(
            CallBinding::create(
                &engine,
                Participant {
                    name: "a".into(),
                    connection: crate::registry::ConnectionId::new(),
                },
                Participant {
                    name: "b".into(),
                    connection: crate::registry::ConnectionId::new(),
                },
            )
            .await
            .unwrap(),
        );
        let mut saga = Saga::new("test");
        saga.record(Compensation::ReleaseMedia(binding));
        saga.commit();

        assert_eq!(engine.sessions_released(), 0);
    }
}
