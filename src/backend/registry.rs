//! Session registry keyed by (document, dialect).
//!
//! The map lock is held only long enough to find or insert a per-key slot.
//! Each slot has its own async mutex, held across a whole create or
//! execute, which gives two guarantees:
//!
//! - two near-simultaneous first executions for one key spawn one child;
//! - requests for one session are serviced one at a time, in lock order,
//!   so a write and reload never interleave with another unit's.
//!
//! Different keys never wait on each other beyond the brief map lock.
//!
//! Disposal removes a slot from the map and cancels its `retired` token
//! before waiting for the slot lock. A creation in progress on that slot
//! observes the token, tears its backend down, and releases the lock, so
//! disposal never waits out the readiness timeout.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::advisory::AdvisorySink;
use crate::backend::port;
use crate::backend::session::Session;
use crate::config::GlobalConfig;
use crate::models::session::{DocumentId, Health, SessionKey, SessionSummary};
use crate::models::unit::{StableId, UnitRequest};
use crate::{AppError, Result};

/// Attempts at finding a port no earlier session has used.
const MAX_PORT_ATTEMPTS: usize = 16;

#[derive(Debug)]
struct SlotState {
    session: Mutex<Option<Session>>,
    /// Cancelled once the slot has been removed from the map.
    retired: CancellationToken,
}

type Slot = Arc<SlotState>;

fn new_slot() -> Slot {
    Arc::new(SlotState {
        session: Mutex::new(None),
        retired: CancellationToken::new(),
    })
}

/// Owner of every live session.
#[derive(Debug)]
pub struct SessionRegistry {
    config: Arc<GlobalConfig>,
    sink: AdvisorySink,
    slots: Mutex<HashMap<SessionKey, Slot>>,
    issued_ports: std::sync::Mutex<HashSet<u16>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: Arc<GlobalConfig>, sink: AdvisorySink) -> Self {
        Self {
            config,
            sink,
            slots: Mutex::new(HashMap::new()),
            issued_ports: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Run `unit`: start a session for its key if none is live, otherwise
    /// write the unit and reload the existing backend. Returns the address.
    ///
    /// # Errors
    ///
    /// Creation failures (`Port`, `Sync`, `Spawn`, `Readiness`) leave no
    /// session behind. Failures against an existing session (`Sync`,
    /// `Control`) are returned per call; the session stays registered.
    pub async fn get_or_create(&self, unit: &UnitRequest) -> Result<String> {
        let key = unit.key();
        loop {
            let slot = self.slot(&key).await;
            let mut guard = slot.session.lock().await;

            if let Some(session) = guard.as_mut() {
                return session.execute(unit).await;
            }
            if slot.retired.is_cancelled() {
                // Disposed while we queued; retry on a fresh slot.
                continue;
            }

            let port = self.allocate_port().await?;
            let started = Session::start_cancellable(
                unit,
                port,
                &self.config,
                self.sink.clone(),
                &slot.retired,
            )
            .await;
            return match started {
                Ok(session) => {
                    let address = session.address().to_owned();
                    info!(session = %key, %address, "session started");
                    *guard = Some(session);
                    Ok(address)
                }
                Err(err) => {
                    drop(guard);
                    self.forget_if_empty(&key, &slot).await;
                    Err(err)
                }
            };
        }
    }

    /// Dispose every session belonging to `document`. Returns how many were
    /// disposed; sessions of other documents are untouched.
    ///
    /// Sessions still waiting for readiness are cancelled and torn down by
    /// their creator; they are not counted.
    pub async fn dispose_all(&self, document: &DocumentId) -> usize {
        let slots: Vec<(SessionKey, Slot)> = {
            let mut map = self.slots.lock().await;
            let keys: Vec<SessionKey> = map
                .keys()
                .filter(|k| &k.document == document)
                .cloned()
                .collect();
            keys.into_iter()
                .filter_map(|k| map.remove(&k).map(|slot| (k, slot)))
                .inspect(|(_, slot)| slot.retired.cancel())
                .collect()
        };
        dispose_slots(slots).await
    }

    /// Dispose the session for `key`, if any. Returns whether one existed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Sync` if the session's directory could not be
    /// removed; the process is terminated regardless.
    pub async fn dispose(&self, key: &SessionKey) -> Result<bool> {
        let slot = {
            let mut map = self.slots.lock().await;
            map.remove(key).inspect(|slot| slot.retired.cancel())
        };
        let Some(slot) = slot else {
            return Ok(false);
        };
        let taken = slot.session.lock().await.take();
        match taken {
            Some(mut session) => session.dispose().await.map(|()| true),
            None => Ok(false),
        }
    }

    /// Dispose every session.
    pub async fn shutdown(&self) -> usize {
        let slots: Vec<(SessionKey, Slot)> = {
            let mut map = self.slots.lock().await;
            map.drain()
                .inspect(|(_, slot)| slot.retired.cancel())
                .collect()
        };
        let count = dispose_slots(slots).await;
        info!(count, "all sessions disposed");
        count
    }

    /// Listing of live sessions, ordered by key.
    pub async fn snapshot(&self) -> Vec<SessionSummary> {
        let mut summaries = Vec::new();
        for slot in self.all_slots().await {
            if let Some(session) = slot.session.lock().await.as_ref() {
                summaries.push(session.summary());
            }
        }
        summaries.sort_by(|a, b| (&a.document, &a.dialect).cmp(&(&b.document, &b.dialect)));
        summaries
    }

    /// Health of the session for `key`.
    pub async fn health(&self, key: &SessionKey) -> Option<Health> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let guard = slot.session.lock().await;
        guard.as_ref().map(Session::health)
    }

    /// Address of the session for `key`.
    pub async fn address(&self, key: &SessionKey) -> Option<String> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let guard = slot.session.lock().await;
        guard.as_ref().map(|s| s.address().to_owned())
    }

    /// On-disk file for unit `id` in the session for `key`.
    pub async fn source_path(&self, key: &SessionKey, id: &StableId) -> Option<PathBuf> {
        let slot = self.slots.lock().await.get(key).cloned()?;
        let guard = slot.session.lock().await;
        guard.as_ref().and_then(|s| s.source_path(id))
    }

    async fn slot(&self, key: &SessionKey) -> Slot {
        let mut map = self.slots.lock().await;
        Arc::clone(map.entry(key.clone()).or_insert_with(new_slot))
    }

    async fn all_slots(&self) -> Vec<Slot> {
        self.slots.lock().await.values().cloned().collect()
    }

    async fn forget_if_empty(&self, key: &SessionKey, slot: &Slot) {
        let mut map = self.slots.lock().await;
        let is_same = map.get(key).is_some_and(|current| Arc::ptr_eq(current, slot));
        // Map entry plus the caller's clone; anyone else may still create.
        if is_same && Arc::strong_count(slot) <= 2 {
            if let Ok(guard) = slot.session.try_lock() {
                if guard.is_none() {
                    drop(guard);
                    map.remove(key);
                }
            }
        }
    }

    async fn allocate_port(&self) -> Result<u16> {
        for _ in 0..MAX_PORT_ATTEMPTS {
            let candidate = port::acquire(&self.config.host).await?;
            let mut issued = self
                .issued_ports
                .lock()
                .map_err(|_| AppError::Port("issued port set poisoned".into()))?;
            if issued.insert(candidate) {
                return Ok(candidate);
            }
        }
        Err(AppError::Port(format!(
            "no unused port after {MAX_PORT_ATTEMPTS} attempts"
        )))
    }
}

async fn dispose_slots(slots: Vec<(SessionKey, Slot)>) -> usize {
    let results = join_all(slots.into_iter().map(|(key, slot)| async move {
        let taken = slot.session.lock().await.take();
        let mut session = taken?;
        if let Err(err) = session.dispose().await {
            warn!(session = %key, %err, "session disposal incomplete");
        }
        Some(key)
    }))
    .await;
    results.into_iter().flatten().count()
}
