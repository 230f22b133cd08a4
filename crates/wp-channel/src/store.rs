//! Persistent mirror of control messages that were not confirmed sent.

use crate::message::CommandId;
use crate::message::ServiceMessage;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use wp_core::ProxyError;
use wp_core::ProxyResult;
use wp_storage::KeyValueStore;

/// Session-keyed list of undelivered messages, at most one per command.
///
/// Records are kept as a JSON array under the session id. An unreadable or
/// corrupt entry reads as "nothing pending".
///
/// Every read-modify-write of a session entry holds `update_lock`.
#[derive(Debug)]
pub struct MessageStore<S> {
    backend: S,
    update_lock: Mutex<()>,
}

impl<S> MessageStore<S>
where
    S: KeyValueStore,
{
    pub fn new(backend: S) -> Self {
        Self {
            backend,
            update_lock: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &S {
        &self.backend
    }

    /// Records pending for `session`, oldest first.
    pub fn load(&self, session: &str) -> Vec<ServiceMessage> {
        let raw = match self.backend.get(session) {
            Ok(Some(raw)) => raw,
            Ok(None) => return Vec::new(),
            Err(error) => {
                log::warn!("pending messages for session {session} unreadable: {error}");
                return Vec::new();
            }
        };

        match serde_json::from_str(&raw) {
            Ok(records) => records,
            Err(error) => {
                log::warn!("discarding corrupt pending messages for session {session}: {error}");
                Vec::new()
            }
        }
    }

    /// Stores `message`, superseding any record for the same command.
    pub fn save(&self, session: &str, message: &ServiceMessage) -> ProxyResult<()> {
        let _guard = self.lock();
        let mut records = self.load(session);
        let command = message.command();
        records.retain(|record| record.command() != command);
        records.push(message.clone());
        self.write(session, &records)
    }

    /// Drops the record for `command`. Returns whether one was present.
    pub fn remove_command(&self, session: &str, command: CommandId) -> ProxyResult<bool> {
        let _guard = self.lock();
        let mut records = self.load(session);
        let before = records.len();
        records.retain(|record| record.command() != command);
        if records.len() == before {
            return Ok(false);
        }

        self.write(session, &records)?;
        Ok(true)
    }

    /// Returns every pending record and clears the session entry.
    pub fn take_all(&self, session: &str) -> Vec<ServiceMessage> {
        let _guard = self.lock();
        let records = self.load(session);
        if let Err(error) = self.backend.remove(session) {
            log::warn!("failed clearing pending messages for session {session}: {error}");
        }
        records
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.update_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self, session: &str, records: &[ServiceMessage]) -> ProxyResult<()> {
        if records.is_empty() {
            return self.backend.remove(session);
        }

        let encoded = serde_json::to_string(records).map_err(|error| {
            ProxyError::new(
                "channel.store_encode_failed",
                format!("failed to serialize pending messages: {error}"),
            )
        })?;
        self.backend.set(session, &encoded)
    }
}
