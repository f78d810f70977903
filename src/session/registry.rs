//! # Session Registry
//!
//! At most one session per room name. Concurrent joins for the same room share one
//! start attempt; a failed start leaves no entry behind so the next join retries.
//! Sessions remove themselves when their room disconnects.

use crate::error::SessionStartError;
use crate::session::room_session::{self, SessionHandle, TeardownHook};
use crate::session::SessionDeps;
use futures_util::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{error, info};
use uuid::Uuid;

type Slot = Arc<OnceCell<SessionHandle>>;
type Sessions = Arc<Mutex<HashMap<String, Slot>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinOutcome {
    pub identity: String,
    /// False when the room already had a session.
    pub created: bool,
}

pub struct SessionRegistry {
    deps: Arc<SessionDeps>,
    sessions: Sessions,
}

impl SessionRegistry {
    pub fn new(deps: Arc<SessionDeps>) -> Self {
        Self {
            deps,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Join `room_name`, or return the identity of the session already there.
    pub async fn join(&self, room_name: &str, problem_id: &str) -> Result<JoinOutcome, SessionStartError> {
        let slot = {
            let mut sessions = self.sessions.lock();
            let slot = sessions.entry(room_name.to_string()).or_default();
            if slot.get().is_some_and(SessionHandle::is_closed) {
                *slot = Slot::default();
            }
            Arc::clone(slot)
        };

        let mut created = false;
        let result = slot
            .get_or_try_init(|| {
                created = true;
                self.start(room_name, problem_id)
            })
            .await;

        match result {
            Ok(handle) => Ok(JoinOutcome {
                identity: handle.identity.clone(),
                created,
            }),
            Err(err) => {
                error!(room = %room_name, error = %err, "Session start failed");
                let mut sessions = self.sessions.lock();
                let abandoned = sessions
                    .get(room_name)
                    .is_some_and(|current| Arc::ptr_eq(current, &slot) && current.get().is_none());
                if abandoned {
                    sessions.remove(room_name);
                }
                Err(err)
            }
        }
    }

    async fn start(&self, room_name: &str, problem_id: &str) -> Result<SessionHandle, SessionStartError> {
        let identity = agent_identity(&self.deps.identity_prefix);
        info!(room = %room_name, identity = %identity, problem_id, "Starting session");
        room_session::start(
            room_name,
            problem_id,
            identity,
            Arc::clone(&self.deps),
            teardown_hook(Arc::clone(&self.sessions)),
        )
        .await
    }

    /// Stop every session and wait for each to release its resources.
    pub async fn stop_all(&self) {
        let handles: Vec<SessionHandle> = self
            .sessions
            .lock()
            .values()
            .filter_map(|slot| slot.get().cloned())
            .collect();
        if handles.is_empty() {
            return;
        }
        info!(sessions = handles.len(), "Stopping all sessions");
        join_all(handles.iter().map(SessionHandle::stop)).await;
    }

    /// Names of rooms with a running session, sorted.
    ///
    /// Also drops entries whose session exited before its handle was stored, which the
    /// teardown hook cannot see.
    pub fn active_rooms(&self) -> Vec<String> {
        let mut sessions = self.sessions.lock();
        sessions.retain(|_, slot| !slot.get().is_some_and(SessionHandle::is_closed));
        let mut rooms: Vec<String> = sessions
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(room, _)| room.clone())
            .collect();
        rooms.sort();
        rooms
    }

    pub fn len(&self) -> usize {
        self.active_rooms().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn agent_identity(prefix: &str) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &suffix[..8])
}

/// Remove the room's entry, but only if it still belongs to the closing session.
fn teardown_hook(sessions: Sessions) -> TeardownHook {
    Box::new(move |room_name: &str, session_id: Uuid| {
        let mut sessions = sessions.lock();
        let owned = sessions
            .get(room_name)
            .and_then(|slot| slot.get())
            .is_some_and(|handle| handle.session_id == session_id);
        if owned {
            sessions.remove(room_name);
            info!(room = %room_name, "Session removed from registry");
        }
    })
}
