//! The control channel: per-command delivery queues, send-mode switching,
//! failure recovery, and replay of persisted messages.

use crate::message::CommandId;
use crate::message::ControlMessage;
use crate::message::ServiceMessage;
use crate::policy::FailureAction;
use crate::policy::ReliabilityPolicy;
use crate::settings::ChannelSettings;
use crate::store::MessageStore;
use serde_json::Value;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::Condvar;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::sync::Weak;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use std::time::Instant;
use wp_core::ProxyResult;
use wp_net::ServiceResponse;
use wp_net::ServiceTransport;
use wp_storage::KeyValueStore;

type ResponseCallback = Box<dyn FnOnce(Option<Value>) + Send + 'static>;
type DoneCallback = Box<dyn FnOnce() + Send + 'static>;

/// How a send is issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// On a worker thread; the caller returns immediately.
    Async,
    /// On the caller's thread, which blocks until the request finishes.
    Sync,
}

struct QueuedMessage {
    message: ServiceMessage,
    callback: Option<ResponseCallback>,
}

struct ChannelState {
    use_async: bool,
    urgent_sends: usize,
    in_flight: usize,
    queues: HashMap<CommandId, VecDeque<QueuedMessage>>,
    cookie_waiters: Vec<DoneCallback>,
    unload_epoch: u64,
}

impl ChannelState {
    fn mode(&self) -> SendMode {
        if self.use_async && self.urgent_sends == 0 {
            SendMode::Async
        } else {
            SendMode::Sync
        }
    }

    fn cookie_sync_pending(&self) -> bool {
        self.queues
            .get(&CommandId::SetCookie)
            .is_some_and(|queue| !queue.is_empty())
    }
}

struct ChannelShared<T, S> {
    settings: ChannelSettings,
    policy: ReliabilityPolicy,
    transport: T,
    store: MessageStore<S>,
    state: Mutex<ChannelState>,
    completed: Condvar,
}

impl<T, S> ChannelShared<T, S> {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a control channel. Clones share the same queues and state.
pub struct ControlChannel<T, S> {
    shared: Arc<ChannelShared<T, S>>,
}

impl<T, S> Clone for ControlChannel<T, S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, S> std::fmt::Debug for ControlChannel<T, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state();
        f.debug_struct("ControlChannel")
            .field("session_id", &self.shared.settings.session_id)
            .field("mode", &state.mode())
            .field("in_flight", &state.in_flight)
            .field("queued_commands", &state.queues.len())
            .finish()
    }
}

impl<T, S> ControlChannel<T, S>
where
    T: ServiceTransport,
    S: KeyValueStore + 'static,
{
    pub fn new(
        settings: ChannelSettings,
        policy: ReliabilityPolicy,
        transport: T,
        store: MessageStore<S>,
    ) -> ProxyResult<Self> {
        settings.validate()?;
        Ok(Self {
            shared: Arc::new(ChannelShared {
                settings,
                policy,
                transport,
                store,
                state: Mutex::new(ChannelState {
                    use_async: true,
                    urgent_sends: 0,
                    in_flight: 0,
                    queues: HashMap::new(),
                    cookie_waiters: Vec::new(),
                    unload_epoch: 0,
                }),
                completed: Condvar::new(),
            }),
        })
    }

    pub fn settings(&self) -> &ChannelSettings {
        &self.shared.settings
    }

    pub fn store(&self) -> &MessageStore<S> {
        &self.shared.store
    }

    pub fn mode(&self) -> SendMode {
        self.shared.state().mode()
    }

    pub fn in_flight(&self) -> usize {
        self.shared.state().in_flight
    }

    /// Messages queued for `command`, including the one being sent.
    pub fn queued(&self, command: CommandId) -> usize {
        self.shared
            .state()
            .queues
            .get(&command)
            .map_or(0, VecDeque::len)
    }

    /// Sends `message` behind any earlier message with the same command.
    pub fn send_reliable<F>(&self, message: ControlMessage, callback: F)
    where
        F: FnOnce(Option<Value>) + Send + 'static,
    {
        self.enqueue(ServiceMessage::new(message), Box::new(callback));
    }

    /// Sends `message` immediately, without queueing behind earlier
    /// messages of its command.
    pub fn send_once<F>(&self, message: ControlMessage, callback: F)
    where
        F: FnOnce(Option<Value>) + Send + 'static,
    {
        self.dispatch(ServiceMessage::new(message), Box::new(callback));
    }

    /// Sends `message` synchronously whatever the current mode; any send
    /// started while this one is running is synchronous too. Returns after
    /// `callback` has run.
    pub fn send_urgent<F>(&self, message: ControlMessage, callback: F)
    where
        F: FnOnce(Option<Value>) + Send + 'static,
    {
        self.shared.state().urgent_sends += 1;

        let channel = self.clone();
        self.send_once(message, move |response| {
            {
                let mut state = channel.shared.state();
                state.urgent_sends = state.urgent_sends.saturating_sub(1);
            }
            callback(response);
        });
    }

    /// Runs `callback` once no cookie message is queued or in flight.
    pub fn await_cookie_sync<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut state = self.shared.state();
            if state.cookie_sync_pending() {
                state.cookie_waiters.push(Box::new(callback));
                return;
            }
        }

        callback();
    }

    /// Runs `callback` once nothing is in flight, or once `timeout` has
    /// elapsed, whichever comes first. Runs it on the calling thread when the
    /// channel is already idle, on a watcher thread otherwise.
    pub fn await_quiescence<F>(&self, timeout: Duration, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.in_flight() == 0 {
            callback();
            return;
        }

        let shared = Arc::clone(&self.shared);
        thread::spawn(move || {
            let deadline = Instant::now() + timeout;
            let poll = shared.settings.quiescence_poll();
            let mut state = shared.state();

            while state.in_flight > 0 {
                let now = Instant::now();
                if now >= deadline {
                    log::debug!(
                        "gave up waiting for {} in-flight control messages after {timeout:?}",
                        state.in_flight
                    );
                    break;
                }

                let wait = poll.min(deadline - now);
                state = match shared.completed.wait_timeout(state, wait) {
                    Ok((guard, _)) => guard,
                    Err(poisoned) => poisoned.into_inner().0,
                };
            }

            drop(state);
            callback();
        });
    }

    /// Re-sends every message persisted for this session through the
    /// per-command queues. The store is cleared up front; `callback` runs
    /// once every replayed message has completed.
    pub fn replay_persisted<F>(&self, callback: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let records = self.shared.store.take_all(&self.shared.settings.session_id);
        if records.is_empty() {
            callback();
            return;
        }

        log::info!(
            "replaying {} persisted control messages for session {}",
            records.len(),
            self.shared.settings.session_id
        );

        let remaining = Arc::new(AtomicUsize::new(records.len()));
        let finished: Arc<Mutex<Option<DoneCallback>>> =
            Arc::new(Mutex::new(Some(Box::new(callback))));

        for record in records {
            let remaining = Arc::clone(&remaining);
            let finished = Arc::clone(&finished);
            self.enqueue(
                record,
                Box::new(move |_: Option<Value>| {
                    if remaining.fetch_sub(1, Ordering::AcqRel) != 1 {
                        return;
                    }
                    let callback = finished
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(callback) = callback {
                        callback();
                    }
                }),
            );
        }
    }

    /// The hosting page is about to unload: send synchronously until the
    /// grace period passes without another unload signal.
    ///
    /// Each signal restarts the grace period; only the timer started by the
    /// latest signal switches back to async sends.
    pub fn notify_unload(&self) {
        let epoch = {
            let mut state = self.shared.state();
            state.use_async = false;
            state.unload_epoch += 1;
            state.unload_epoch
        };

        let grace = self.shared.settings.unload_grace();
        let shared: Weak<ChannelShared<T, S>> = Arc::downgrade(&self.shared);
        thread::spawn(move || {
            thread::sleep(grace);
            let Some(shared) = shared.upgrade() else {
                return;
            };

            let mut state = shared.state();
            if state.unload_epoch == epoch {
                log::debug!("unload not followed through; back to async sends");
                state.use_async = true;
            }
        });
    }

    fn enqueue(&self, message: ServiceMessage, callback: ResponseCallback) {
        let command = message.command();
        let is_only_entry = {
            let mut state = self.shared.state();
            let queue = state.queues.entry(command).or_default();
            queue.push_back(QueuedMessage {
                message,
                callback: Some(callback),
            });
            queue.len() == 1
        };

        if is_only_entry {
            self.send_next_queued(command);
        }
    }

    fn send_next_queued(&self, command: CommandId) {
        let head = {
            let state = self.shared.state();
            state
                .queues
                .get(&command)
                .and_then(VecDeque::front)
                .map(|entry| entry.message.clone())
        };
        let Some(message) = head else {
            return;
        };

        let channel = self.clone();
        self.dispatch(
            message,
            Box::new(move |response| channel.finish_queued(command, response)),
        );
    }

    fn finish_queued(&self, command: CommandId, response: Option<Value>) {
        let callback = {
            let mut state = self.shared.state();
            state
                .queues
                .get_mut(&command)
                .and_then(VecDeque::front_mut)
                .and_then(|entry| entry.callback.take())
        };
        if let Some(callback) = callback {
            callback(response);
        }

        let (has_next, ready_waiters) = {
            let mut state = self.shared.state();
            let remaining = match state.queues.get_mut(&command) {
                Some(queue) => {
                    queue.pop_front();
                    queue.len()
                }
                None => 0,
            };
            if remaining == 0 {
                state.queues.remove(&command);
            }

            let ready_waiters = if state.cookie_sync_pending() {
                Vec::new()
            } else {
                std::mem::take(&mut state.cookie_waiters)
            };
            (remaining > 0, ready_waiters)
        };

        self.shared.completed.notify_all();
        for waiter in ready_waiters {
            waiter();
        }

        if has_next {
            self.send_next_queued(command);
        }
    }

    fn dispatch(&self, mut message: ServiceMessage, on_complete: ResponseCallback) {
        let settings = &self.shared.settings;
        message.session_id.clone_from(&settings.session_id);
        if settings.addressless_frame {
            message.referer.clone_from(&settings.referer);
        }

        // A new send for a command supersedes whatever was parked for it.
        if let Err(error) = self
            .shared
            .store
            .remove_command(&settings.session_id, message.command())
        {
            log::warn!(
                "failed evicting stored `{}` message: {error}",
                message.command().as_str()
            );
        }

        let mode = {
            let mut state = self.shared.state();
            state.in_flight += 1;
            state.mode()
        };

        match mode {
            SendMode::Sync => self.deliver(&message, false, on_complete),
            SendMode::Async => {
                let channel = self.clone();
                thread::spawn(move || channel.deliver(&message, false, on_complete));
            }
        }
    }

    fn deliver(&self, message: &ServiceMessage, forced: bool, on_complete: ResponseCallback) {
        let command = message.command().as_str();
        let body = match message.to_json() {
            Ok(body) => body,
            Err(error) => {
                log::error!("dropping unserializable control message: {error}");
                self.complete(None, on_complete);
                return;
            }
        };

        let error = match self
            .shared
            .transport
            .post(&self.shared.settings.service_msg_url, &body)
        {
            Ok(response) => {
                self.complete(parse_response(command, &response), on_complete);
                return;
            }
            Err(error) => error,
        };

        if forced {
            log::warn!("forced retry of `{command}` failed, giving up: {error}");
            self.complete(None, on_complete);
            return;
        }

        match self.shared.policy.on_failure() {
            FailureAction::RetrySynchronously => {
                log::debug!("`{command}` send failed, retrying synchronously: {error}");
                self.deliver(message, true, on_complete);
            }
            FailureAction::PersistAndComplete => {
                log::warn!("`{command}` send failed, parking it for replay: {error}");
                if let Err(error) = self
                    .shared
                    .store
                    .save(&self.shared.settings.session_id, message)
                {
                    log::warn!("failed persisting `{command}` message: {error}");
                }
                self.complete(None, on_complete);
            }
        }
    }

    fn complete(&self, response: Option<Value>, on_complete: ResponseCallback) {
        {
            let mut state = self.shared.state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.shared.completed.notify_all();
        on_complete(response);
    }
}

fn parse_response(command: &str, response: &ServiceResponse) -> Option<Value> {
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return None;
    }

    match serde_json::from_slice(&response.body) {
        Ok(value) => Some(value),
        Err(error) => {
            log::warn!(
                "`{command}` response (status {}) is not JSON: {error}",
                response.status
            );
            None
        }
    }
}
