use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::{
    VodError,
    session::{PendingSession, Session},
};

type Sessions = HashMap<String, Arc<Session>>;

/// Running sessions, keyed by request path.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<Sessions>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, path: &str) -> Option<Arc<Session>> {
        self.sessions.lock().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }

    /// Returns the session registered for `path`, resolving and starting a new one with
    /// `create` if there is none.
    ///
    /// `create` runs without the registry lock held. If another caller registered a
    /// session for the same path in the meantime, the freshly resolved one is discarded
    /// without being started and the registered one is returned.
    pub fn get_or_create(
        &self,
        path: &str,
        create: impl FnOnce() -> Result<PendingSession, VodError>,
    ) -> Result<Arc<Session>, VodError> {
        if let Some(session) = self.get(path) {
            return Ok(session);
        }

        let pending = create()?;

        let session = {
            let mut sessions = self.sessions.lock();
            if let Some(existing) = sessions.get(path) {
                debug!(path, id = %pending.info().id, "VOD already exists");
                return Ok(existing.clone());
            }

            let session = Arc::new(pending.start());
            sessions.insert(path.to_string(), session.clone());
            session
        };

        let registered = self.deregister_on_stop(path, &session);
        if registered.is_err() {
            // stopped before the callback could be queued
            self.remove(path, &Arc::downgrade(&session));
        }

        info!(path, id = %session.id(), sessions = self.len(), "VOD registered");
        Ok(session)
    }

    fn deregister_on_stop(&self, path: &str, session: &Arc<Session>) -> Result<(), VodError> {
        let registry = self.clone();
        let path = path.to_string();
        let weak = Arc::downgrade(session);

        session.on_stop(move || registry.remove(&path, &weak))
    }

    fn remove(&self, path: &str, session: &Weak<Session>) {
        let mut sessions = self.sessions.lock();
        if sessions
            .get(path)
            .is_some_and(|registered| Weak::ptr_eq(&Arc::downgrade(registered), session))
        {
            sessions.remove(path);
            info!(path, "VOD deregistered");
        }
    }

    /// Stops every registered session and waits for each to finish.
    pub fn stop_all(&self) {
        let sessions = self.sessions.lock().values().cloned().collect::<Vec<_>>();

        for session in &sessions {
            session.stop();
        }
        for session in &sessions {
            session.wait_stopped();
        }
    }
}
