//! Shared participant lifecycle
//!
//! Every user-facing role (informer, listener, RPC server and client)
//! runs through the same state machine: activate once, deactivate once.
//! A deactivated participant cannot be reactivated.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::error::{BusError, Result};
use crate::event::ParticipantId;
use crate::scope::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Fresh,
    Active,
    Terminated,
}

/// Lifecycle state machine shared by all participants
///
/// Transitions are serialized through an internal mutex; `is_active`
/// reads a mirror flag and is safe to call concurrently with them.
#[derive(Debug)]
pub struct ParticipantState {
    phase: tokio::sync::Mutex<Phase>,
    active: AtomicBool,
}

impl Default for ParticipantState {
    fn default() -> Self {
        Self::new()
    }
}

impl ParticipantState {
    pub fn new() -> Self {
        Self {
            phase: tokio::sync::Mutex::new(Phase::Fresh),
            active: AtomicBool::new(false),
        }
    }

    /// Transition Fresh → Active
    pub async fn activate(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Fresh => {
                *phase = Phase::Active;
                self.active.store(true, Ordering::SeqCst);
                Ok(())
            }
            Phase::Active => Err(BusError::Lifecycle("already active".to_string())),
            Phase::Terminated => Err(BusError::Lifecycle(
                "cannot reactivate a deactivated participant".to_string(),
            )),
        }
    }

    /// Transition Active → Terminated
    pub async fn deactivate(&self) -> Result<()> {
        let mut phase = self.phase.lock().await;
        match *phase {
            Phase::Active => {
                *phase = Phase::Terminated;
                self.active.store(false, Ordering::SeqCst);
                Ok(())
            }
            Phase::Fresh => Err(BusError::Lifecycle("not active".to_string())),
            Phase::Terminated => Err(BusError::Lifecycle("already deactivated".to_string())),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }
}

/// Common surface of all user-facing bus roles
#[async_trait]
pub trait Participant: Send + Sync {
    /// Unique id of this participant
    fn id(&self) -> ParticipantId;

    /// Scope this participant operates under
    fn scope(&self) -> &Scope;

    /// Activate; fails if already active or previously deactivated
    async fn activate(&self) -> Result<()>;

    /// Deactivate; fails unless currently active
    async fn deactivate(&self) -> Result<()>;

    fn is_active(&self) -> bool;
}
