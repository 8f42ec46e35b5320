//! Per-session command and capture-audio queues.
//!
//! Each attached session gets a bounded command queue, a bounded raw-audio
//! queue and a listener thread that blocks on both and forwards into the
//! [`SessionManager`]. The listener holds only a weak reference to the
//! manager and exits when the session or the manager goes away.

use crate::audio::ingest::pcm16_to_chunks;
use crate::error::{RenderError, Result};
use crate::pipeline::messages::{AudioChunk, ControlCommand, SessionId};
use crate::session::SessionManager;
use crossbeam_channel::{Receiver, Sender, TrySendError, select};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const COMMAND_CAPACITY: usize = 32;
const AUDIO_CAPACITY: usize = 256;

struct Route {
    commands: Sender<ControlCommand>,
    audio: Sender<AudioChunk>,
    cancel: CancellationToken,
    listener: JoinHandle<()>,
}

/// Session-keyed command and audio queues.
pub struct ControlBus {
    routes: Mutex<HashMap<SessionId, Route>>,
    chunk_samples: usize,
    poll: Duration,
}

impl ControlBus {
    pub fn new(chunk_samples: usize, poll: Duration) -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
            chunk_samples,
            poll,
        }
    }

    /// Create the queues for `session` and start its listener.
    ///
    /// # Errors
    ///
    /// Returns `Channel` if the session is already attached, or an I/O
    /// error if the listener thread cannot be spawned.
    pub fn attach(&self, manager: &Arc<SessionManager>, session: SessionId) -> Result<()> {
        let mut routes = self.lock_routes();
        routes.retain(|_, route| !route.listener.is_finished());
        if routes.contains_key(&session) {
            return Err(RenderError::Channel(format!("session {session} already attached")));
        }

        let (commands, command_rx) = crossbeam_channel::bounded(COMMAND_CAPACITY);
        let (audio, audio_rx) = crossbeam_channel::bounded(AUDIO_CAPACITY);
        let cancel = CancellationToken::new();
        let listener = Listener {
            session: session.clone(),
            manager: Arc::downgrade(manager),
            commands: command_rx,
            audio: audio_rx,
            cancel: cancel.clone(),
            poll: self.poll,
        };
        let short: String = session.as_str().chars().take(8).collect();
        let handle = std::thread::Builder::new()
            .name(format!("lipcast-ctl-{short}"))
            .spawn(move || listener.run())?;

        info!(session = %session, "control route attached");
        routes.insert(
            session,
            Route {
                commands,
                audio,
                cancel,
                listener: handle,
            },
        );
        Ok(())
    }

    /// Queue a command for `session`.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session is not attached and
    /// `Channel` if its queue is full or its listener has exited.
    pub fn publish(&self, session: &SessionId, command: ControlCommand) -> Result<()> {
        let routes = self.lock_routes();
        let route = routes
            .get(session)
            .ok_or_else(|| RenderError::SessionNotFound(session.to_string()))?;
        route.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(c) => RenderError::Channel(format!("command queue full, dropped {}", c.name())),
            TrySendError::Disconnected(_) => RenderError::Channel("session listener stopped".to_owned()),
        })
    }

    /// Queue raw little-endian 16-bit capture PCM for `session`. Returns the
    /// number of chunks queued; chunks that do not fit are dropped.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session is not attached, `Config`
    /// if `bytes` is not a whole number of chunks, and `Channel` if the
    /// listener has exited.
    pub fn push_pcm(&self, session: &SessionId, bytes: &[u8]) -> Result<usize> {
        let chunks = pcm16_to_chunks(bytes, self.chunk_samples)?;
        let routes = self.lock_routes();
        let route = routes
            .get(session)
            .ok_or_else(|| RenderError::SessionNotFound(session.to_string()))?;
        let mut queued = 0;
        for chunk in chunks {
            match route.audio.try_send(chunk) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = %session, "capture queue full, dropping audio");
                    break;
                }
                Err(TrySendError::Disconnected(_)) => {
                    return Err(RenderError::Channel("session listener stopped".to_owned()));
                }
            }
        }
        Ok(queued)
    }

    /// Stop the listener for `session` and drop its queues.
    pub fn detach(&self, session: &SessionId) -> bool {
        let route = self.lock_routes().remove(session);
        let Some(route) = route else {
            return false;
        };
        route.cancel.cancel();
        drop(route.commands);
        drop(route.audio);
        if route.listener.thread().id() != std::thread::current().id() && route.listener.join().is_err() {
            warn!(session = %session, "control listener panicked");
        }
        info!(session = %session, "control route detached");
        true
    }

    /// Sessions with a live listener.
    pub fn sessions(&self) -> Vec<SessionId> {
        self.lock_routes()
            .iter()
            .filter(|(_, route)| !route.listener.is_finished())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Detach every session.
    pub fn close(&self) {
        let ids: Vec<SessionId> = self.lock_routes().keys().cloned().collect();
        for id in ids {
            self.detach(&id);
        }
    }

    fn lock_routes(&self) -> MutexGuard<'_, HashMap<SessionId, Route>> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for ControlBus {
    fn drop(&mut self) {
        for route in self.lock_routes().values() {
            route.cancel.cancel();
        }
    }
}

struct Listener {
    session: SessionId,
    manager: Weak<SessionManager>,
    commands: Receiver<ControlCommand>,
    audio: Receiver<AudioChunk>,
    cancel: CancellationToken,
    poll: Duration,
}

impl Listener {
    fn run(self) {
        debug!(session = %self.session, "control listener started");
        while !self.cancel.is_cancelled() {
            let keep_going = select! {
                recv(self.commands) -> msg => match msg {
                    Ok(command) => self.dispatch(command),
                    Err(_) => false,
                },
                recv(self.audio) -> msg => match msg {
                    Ok(chunk) => self.forward_audio(chunk),
                    Err(_) => false,
                },
                default(self.poll) => self.manager.strong_count() > 0,
            };
            if !keep_going {
                break;
            }
        }
        debug!(session = %self.session, "control listener stopped");
    }

    fn dispatch(&self, command: ControlCommand) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let shutdown = matches!(command, ControlCommand::Shutdown);
        let name = command.name();
        match manager.handle_command(&self.session, command) {
            Ok(()) => !shutdown,
            Err(RenderError::SessionNotFound(_)) => false,
            Err(e) => {
                warn!(session = %self.session, command = name, "command rejected: {e}");
                !shutdown
            }
        }
    }

    fn forward_audio(&self, chunk: AudioChunk) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        !matches!(
            manager.push_audio(&self.session, chunk),
            Err(RenderError::SessionNotFound(_))
        )
    }
}
