//! Story director: spawns session drivers and routes controls to them.

use std::collections::HashMap;
use std::sync::Arc;

use taleweave_arbiter::{Arbiter, GenerationBackend};
use taleweave_cadence::CadenceConfig;
use taleweave_competition::Competition;
use taleweave_protocol::{SessionId, StoryEvent};
use taleweave_session::StoryConfig;
use tokio::sync::mpsc;

use crate::driver::{DriverContext, spawn_driver};
use crate::{DriverHandle, DriverStatus, SharedRegistry, StoryError};

/// Default command channel size for drivers.
const DEFAULT_CHANNEL_SIZE: usize = 64;

/// Keeps one [`DriverHandle`] per session.
///
/// Drivers share the registry and the arbiter; the director only tracks
/// their handles. A driver that finishes closes its handle, and
/// [`prune`](Self::prune) drops it.
pub struct StoryDirector<B> {
    context: DriverContext<B>,
    drivers: HashMap<SessionId, DriverHandle>,
}

impl<B: GenerationBackend> StoryDirector<B> {
    pub fn new(registry: SharedRegistry, arbiter: Arc<Arbiter<B>>, cadence: CadenceConfig) -> Self {
        let competition = Competition::new(Arc::clone(&arbiter));
        Self {
            context: DriverContext {
                registry,
                arbiter,
                competition,
                cadence,
            },
            drivers: HashMap::new(),
        }
    }

    /// Starts the driver for a newly created session.
    ///
    /// `events` is the receiver returned by
    /// [`SessionRegistry::create_session`](taleweave_session::SessionRegistry::create_session).
    /// A driver already running for the same id is replaced; its handle is
    /// dropped.
    pub fn spawn(
        &mut self,
        session_id: SessionId,
        config: StoryConfig,
        events: mpsc::UnboundedReceiver<StoryEvent>,
    ) -> DriverHandle {
        let handle = spawn_driver(
            session_id.clone(),
            config,
            events,
            self.context.clone(),
            DEFAULT_CHANNEL_SIZE,
        );
        self.drivers.insert(session_id.clone(), handle.clone());
        tracing::debug!(%session_id, drivers = self.drivers.len(), "driver spawned");
        handle
    }

    /// A clone of the session's driver handle.
    pub fn handle(&self, session_id: &SessionId) -> Result<DriverHandle, StoryError> {
        self.drivers
            .get(session_id)
            .cloned()
            .ok_or_else(|| StoryError::NotFound(session_id.clone()))
    }

    pub async fn skip(&self, session_id: &SessionId) -> Result<bool, StoryError> {
        self.handle(session_id)?.skip().await
    }

    pub async fn force_start(&self, session_id: &SessionId) -> Result<bool, StoryError> {
        self.handle(session_id)?.force_start().await
    }

    pub async fn status(&self, session_id: &SessionId) -> Result<DriverStatus, StoryError> {
        self.handle(session_id)?.status().await
    }

    /// Stops a session's driver and forgets it.
    pub async fn shutdown(&mut self, session_id: &SessionId) -> Result<(), StoryError> {
        let handle = self
            .drivers
            .remove(session_id)
            .ok_or_else(|| StoryError::NotFound(session_id.clone()))?;
        // Already stopped is fine.
        let _ = handle.shutdown().await;
        tracing::info!(%session_id, "driver stopped");
        Ok(())
    }

    /// Stops every driver.
    pub async fn shutdown_all(&mut self) {
        for (_, handle) in self.drivers.drain() {
            let _ = handle.shutdown().await;
        }
    }

    /// Forgets the handle without stopping the driver.
    pub fn remove(&mut self, session_id: &SessionId) -> Option<DriverHandle> {
        self.drivers.remove(session_id)
    }

    /// Drops handles whose driver has exited. Returns their session ids.
    pub fn prune(&mut self) -> Vec<SessionId> {
        let finished: Vec<SessionId> = self
            .drivers
            .iter()
            .filter(|(_, handle)| handle.is_closed())
            .map(|(id, _)| id.clone())
            .collect();
        for session_id in &finished {
            self.drivers.remove(session_id);
        }
        finished
    }

    pub fn registry(&self) -> &SharedRegistry {
        &self.context.registry
    }

    pub fn arbiter(&self) -> &Arc<Arbiter<B>> {
        &self.context.arbiter
    }

    pub fn competition(&self) -> &Competition<B> {
        &self.context.competition
    }

    /// Lists sessions with a tracked driver.
    pub fn session_ids(&self) -> Vec<SessionId> {
        self.drivers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}
