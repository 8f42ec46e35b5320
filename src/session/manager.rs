//! Session admission, lifecycle and control-command dispatch.
//!
//! Every session owns one [`SessionPipeline`]. Transitions on a session are
//! serialized by that session's lock; the manager-wide map lock is only held
//! long enough to admit or forget a slot. Pipeline shutdown runs with no lock
//! held so a slow worker join never stalls other sessions.

use crate::assets::{AvatarCatalog, FrameAsset, FrameAssetLibrary};
use crate::audio::ingest::wav_to_chunks;
use crate::config::LipcastConfig;
use crate::error::{RenderError, Result};
use crate::pipeline::messages::{AudioChunk, ControlCommand, PipelineEvent, SessionId};
use crate::render::{Sleeper, ThreadSleeper};
use crate::session::pipeline::{PipelineDeps, SessionPipeline};
use crate::session::state::SessionState;
use crate::transport::TransportSink;
use crate::tts::{NullSynthesizer, SpeechSynthesizer, SynthesizerFactory};
use crate::worker::{ModelFactory, model_factory};
use chrono::{DateTime, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const SUPERVISOR_POLL: Duration = Duration::from_millis(200);

/// Point-in-time view of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub state: SessionState,
    pub avatar_id: String,
    pub created_at: DateTime<Utc>,
    pub speaking: bool,
}

struct SessionSlot {
    id: SessionId,
    created_at: DateTime<Utc>,
    inner: Mutex<SlotInner>,
}

struct SlotInner {
    state: SessionState,
    avatar_id: String,
    pipeline: Option<SessionPipeline>,
}

impl SessionSlot {
    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl SlotInner {
    fn transition(&mut self, id: &SessionId, target: SessionState) -> Result<()> {
        if !self.state.can_transition_to(target) {
            return Err(RenderError::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        debug!(session = %id, from = %self.state, to = %target, "session transition");
        self.state = target;
        Ok(())
    }

    fn pipeline(&self) -> Result<&SessionPipeline> {
        self.pipeline
            .as_ref()
            .ok_or_else(|| RenderError::Worker("session has no running pipeline".to_owned()))
    }
}

/// Owns every viewer session.
pub struct SessionManager {
    config: Arc<LipcastConfig>,
    catalog: RwLock<AvatarCatalog>,
    models: ModelFactory,
    voices: SynthesizerFactory,
    sleeper: Arc<dyn Sleeper>,
    sessions: Mutex<HashMap<SessionId, Arc<SessionSlot>>>,
    events_tx: Sender<PipelineEvent>,
    events_rx: Receiver<PipelineEvent>,
    cancel: CancellationToken,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SessionManager {
    /// Manager for `config`, using the configured inference backend, a
    /// silent stand-in synthesizer and the catalog file named in the config.
    ///
    /// Call [`SessionManager::start`] to begin supervising sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the config is invalid, the inference backend is
    /// misconfigured or the catalog file is malformed.
    pub fn new(config: LipcastConfig) -> Result<Self> {
        config.validate()?;
        let models = model_factory(&config.worker)?;
        let catalog = AvatarCatalog::load(
            &config.avatar.effective_catalog_path(),
            &config.avatar.avatars_root,
        )?;
        let (events_tx, events_rx) = crossbeam_channel::bounded(64);
        Ok(Self {
            config: Arc::new(config),
            catalog: RwLock::new(catalog),
            models,
            voices: Arc::new(|| -> Box<dyn SpeechSynthesizer> { Box::new(NullSynthesizer::default()) }),
            sleeper: Arc::new(ThreadSleeper),
            sessions: Mutex::new(HashMap::new()),
            events_tx,
            events_rx,
            cancel: CancellationToken::new(),
            supervisor: Mutex::new(None),
        })
    }

    pub fn with_models(mut self, models: ModelFactory) -> Self {
        self.models = models;
        self
    }

    pub fn with_synthesizer(mut self, voices: SynthesizerFactory) -> Self {
        self.voices = voices;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_catalog(mut self, catalog: AvatarCatalog) -> Self {
        self.catalog = RwLock::new(catalog);
        self
    }

    /// Share the manager and start the supervisor thread that tears down
    /// sessions whose transport keeps failing.
    ///
    /// # Errors
    ///
    /// Returns an error if the supervisor thread cannot be spawned.
    pub fn start(self) -> Result<Arc<Self>> {
        let manager = Arc::new(self);
        let weak = Arc::downgrade(&manager);
        let events = manager.events_rx.clone();
        let cancel = manager.cancel.clone();
        let handle = std::thread::Builder::new()
            .name("lipcast-supervisor".to_owned())
            .spawn(move || supervise(weak, events, cancel))?;
        *manager.supervisor.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(manager)
    }

    pub fn config(&self) -> &LipcastConfig {
        &self.config
    }

    // --- admission ---

    /// Admit a new session bound to `sink` and build its pipeline.
    ///
    /// The session is left in `Negotiating`; call [`SessionManager::activate`]
    /// once the transport is up. With no `avatar_id` the configured default
    /// is used; if the requested avatar fails to load the default is tried
    /// before giving up.
    ///
    /// # Errors
    ///
    /// - `CapacityExceeded` if `max_sessions` sessions are not yet closed.
    /// - `InvalidAvatarId` / `AssetLoad` if no renderable avatar is found.
    /// - Worker or thread spawn failures.
    pub fn negotiate(&self, sink: Arc<dyn TransportSink>, avatar_id: Option<&str>) -> Result<SessionId> {
        let id = SessionId::new();
        let slot = self.admit(&id)?;
        let mut inner = slot.lock();

        match self.build_pipeline(&id, sink, avatar_id) {
            Ok((avatar, pipeline)) => {
                inner.avatar_id = avatar;
                inner.pipeline = Some(pipeline);
                info!(session = %id, avatar = %inner.avatar_id, "session negotiating");
                Ok(id)
            }
            Err(e) => {
                warn!(session = %id, "session setup failed: {e}");
                inner.state = SessionState::Closed;
                drop(inner);
                self.forget(&id);
                Err(e)
            }
        }
    }

    fn admit(&self, id: &SessionId) -> Result<Arc<SessionSlot>> {
        let mut sessions = self.lock_sessions();
        let max_sessions = self.config.session.max_sessions;
        if sessions.len() >= max_sessions {
            warn!(max_sessions, "session admission refused");
            return Err(RenderError::CapacityExceeded { max_sessions });
        }
        let mut inner = SlotInner {
            state: SessionState::Idle,
            avatar_id: String::new(),
            pipeline: None,
        };
        inner.transition(id, SessionState::Negotiating)?;
        let slot = Arc::new(SessionSlot {
            id: id.clone(),
            created_at: Utc::now(),
            inner: Mutex::new(inner),
        });
        sessions.insert(id.clone(), Arc::clone(&slot));
        Ok(slot)
    }

    fn build_pipeline(
        &self,
        id: &SessionId,
        sink: Arc<dyn TransportSink>,
        avatar_id: Option<&str>,
    ) -> Result<(String, SessionPipeline)> {
        let default_id = self.config.avatar.default_avatar_id.as_str();
        let requested = avatar_id.unwrap_or(default_id);
        let (avatar, asset) = match self.load_avatar(requested) {
            Ok(asset) => (requested.to_owned(), asset),
            Err(e) if requested != default_id => {
                warn!(session = %id, avatar = requested, "falling back to default avatar: {e}");
                (default_id.to_owned(), self.load_avatar(default_id)?)
            }
            Err(e) => return Err(e),
        };
        let deps = PipelineDeps {
            config: Arc::clone(&self.config),
            factory: Arc::clone(&self.models),
            synthesizer: (self.voices)(),
            sleeper: Arc::clone(&self.sleeper),
            events: self.events_tx.clone(),
        };
        let pipeline = SessionPipeline::start(id.clone(), asset, sink, deps)?;
        Ok((avatar, pipeline))
    }

    fn load_avatar(&self, avatar_id: &str) -> Result<FrameAsset> {
        let dir = self.read_catalog().resolve(avatar_id)?;
        FrameAssetLibrary::load(&dir, self.config.audio.sample_rate)
    }

    // --- lifecycle ---

    /// Transport is up: start emitting frames.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` or `InvalidTransition` if not `Negotiating`.
    pub fn activate(&self, id: &SessionId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut inner = slot.lock();
        inner.transition(id, SessionState::Active)?;
        inner.pipeline()?.resume();
        info!(session = %id, "session active");
        Ok(())
    }

    /// Dispatch one control command.
    ///
    /// # Errors
    ///
    /// Propagates the error of the underlying operation.
    pub fn handle_command(&self, id: &SessionId, command: ControlCommand) -> Result<()> {
        debug!(session = %id, command = command.name(), "control command");
        match command {
            ControlCommand::Speak { text } => self.speak(id, &text),
            ControlCommand::Interrupt => self.interrupt(id),
            ControlCommand::SwitchAvatar { avatar_id } => self.switch_avatar(id, &avatar_id),
            ControlCommand::Shutdown => self.close(id),
        }
    }

    /// Queue text for the session to speak. A paused session resumes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless `Active` or `Paused`, and
    /// `Channel` if the utterance queue is full.
    pub fn speak(&self, id: &SessionId, text: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut inner = slot.lock();
        match inner.state {
            SessionState::Active => {}
            SessionState::Paused => {
                inner.transition(id, SessionState::Active)?;
                inner.pipeline()?.resume();
            }
            state => {
                return Err(RenderError::InvalidTransition {
                    from: state.to_string(),
                    to: SessionState::Active.to_string(),
                });
            }
        }
        if !inner.pipeline()?.speak(text) {
            return Err(RenderError::Channel("utterance queue full".to_owned()));
        }
        Ok(())
    }

    /// Halt emission and clear the audio and text backlog. Interrupting a
    /// paused session flushes again and stays paused.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless `Active` or `Paused`.
    pub fn interrupt(&self, id: &SessionId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut inner = slot.lock();
        if inner.state != SessionState::Paused {
            inner.transition(id, SessionState::Paused)?;
        }
        inner.pipeline()?.interrupt();
        info!(session = %id, "session paused");
        Ok(())
    }

    /// Resume a paused session without queueing new speech.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` unless `Paused`.
    pub fn resume(&self, id: &SessionId) -> Result<()> {
        let slot = self.slot(id)?;
        let mut inner = slot.lock();
        if inner.state != SessionState::Paused {
            return Err(RenderError::InvalidTransition {
                from: inner.state.to_string(),
                to: SessionState::Active.to_string(),
            });
        }
        inner.transition(id, SessionState::Active)?;
        inner.pipeline()?.resume();
        info!(session = %id, "session resumed");
        Ok(())
    }

    /// Hot-swap the session's avatar. The state is unchanged and the
    /// previous avatar stays in place if the new one cannot be loaded.
    ///
    /// # Errors
    ///
    /// - `InvalidTransition` unless `Active` or `Paused`.
    /// - `InvalidAvatarId` if the id is not in the catalog.
    /// - `AssetLoad` if the avatar directory is unusable.
    pub fn switch_avatar(&self, id: &SessionId, avatar_id: &str) -> Result<()> {
        let slot = self.slot(id)?;
        let mut inner = slot.lock();
        if !inner.state.accepts_avatar_switch() {
            return Err(RenderError::InvalidTransition {
                from: inner.state.to_string(),
                to: "switch_avatar".to_owned(),
            });
        }
        let asset = self.load_avatar(avatar_id).inspect_err(|e| {
            warn!(session = %id, avatar = avatar_id, "avatar switch rejected: {e}");
        })?;
        let generation = inner.pipeline()?.swap_asset(asset);
        inner.avatar_id = avatar_id.to_owned();
        info!(session = %id, avatar = avatar_id, generation, "avatar switched");
        Ok(())
    }

    /// Hot-reload the session's lip-sync model weights.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` or a worker error if nothing is running.
    pub fn reload_model(&self, id: &SessionId, model_path: &Path) -> Result<()> {
        let slot = self.slot(id)?;
        let inner = slot.lock();
        inner.pipeline()?.reload_model(model_path);
        info!(session = %id, model = %model_path.display(), "model reload requested");
        Ok(())
    }

    /// Feed captured audio into the session. Dropped unless `Active`.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown sessions.
    pub fn push_audio(&self, id: &SessionId, chunk: AudioChunk) -> Result<()> {
        let slot = self.slot(id)?;
        let inner = slot.lock();
        if inner.state == SessionState::Active {
            inner.pipeline()?.push_audio(chunk);
        }
        Ok(())
    }

    /// Decode an uploaded WAV clip and feed it into the session as speech.
    /// Returns the number of chunks queued, which is zero unless `Active`.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown sessions and `AssetLoad` if the
    /// bytes are not a readable WAV stream.
    pub fn push_audio_file(&self, id: &SessionId, wav: &[u8]) -> Result<usize> {
        let slot = self.slot(id)?;
        let chunks = wav_to_chunks(wav, self.config.audio.sample_rate, self.config.audio.chunk_samples)?;
        let inner = slot.lock();
        if inner.state != SessionState::Active {
            debug!(session = %id, state = %inner.state, "dropping uploaded audio");
            return Ok(0);
        }
        let pipeline = inner.pipeline()?;
        let queued = chunks.len();
        for chunk in chunks {
            pipeline.push_audio(chunk);
        }
        info!(session = %id, chunks = queued, "uploaded audio queued");
        Ok(queued)
    }

    /// Whether the session has speech queued or in flight.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` for unknown sessions.
    pub fn is_speaking(&self, id: &SessionId) -> Result<bool> {
        let slot = self.slot(id)?;
        let inner = slot.lock();
        Ok(inner.pipeline.as_ref().is_some_and(SessionPipeline::is_speaking))
    }

    /// Tear the session down and release its slot.
    ///
    /// # Errors
    ///
    /// Returns `SessionNotFound` if the session is unknown or already
    /// closed, `InvalidTransition` if it is already closing.
    pub fn close(&self, id: &SessionId) -> Result<()> {
        let slot = self.slot(id)?;
        let pipeline = {
            let mut inner = slot.lock();
            inner.transition(id, SessionState::Closing)?;
            inner.pipeline.take()
        };
        let clean = pipeline.map(|mut p| p.stop()).unwrap_or(true);
        slot.lock().transition(id, SessionState::Closed)?;
        self.forget(id);
        info!(session = %id, clean, "session closed");
        Ok(())
    }

    /// Close every session and stop the supervisor.
    pub fn shutdown(&self) {
        let ids: Vec<SessionId> = self.lock_sessions().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.close(&id) {
                debug!(session = %id, "close during shutdown: {e}");
            }
        }
        self.cancel.cancel();
        let handle = self.supervisor.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle
            && handle.thread().id() != std::thread::current().id()
            && handle.join().is_err()
        {
            error!("supervisor thread panicked");
        }
    }

    // --- inspection ---

    pub fn state(&self, id: &SessionId) -> Result<SessionState> {
        Ok(self.slot(id)?.lock().state)
    }

    /// Snapshot of every session that still holds a slot, oldest first.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let slots: Vec<Arc<SessionSlot>> = self.lock_sessions().values().cloned().collect();
        let mut infos: Vec<SessionInfo> = slots
            .iter()
            .map(|slot| {
                let inner = slot.lock();
                SessionInfo {
                    id: slot.id.clone(),
                    state: inner.state,
                    avatar_id: inner.avatar_id.clone(),
                    created_at: slot.created_at,
                    speaking: inner.pipeline.as_ref().is_some_and(SessionPipeline::is_speaking),
                }
            })
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    pub fn session_count(&self) -> usize {
        self.lock_sessions().len()
    }

    // --- catalog ---

    /// Register (or re-point) an avatar id and persist the catalog if it
    /// has a backing file.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be saved.
    pub fn register_avatar(&self, avatar_id: &str, dir: impl Into<PathBuf>) -> Result<()> {
        let mut catalog = self.catalog.write().unwrap_or_else(|e| e.into_inner());
        catalog.insert(avatar_id, dir);
        catalog.save()
    }

    /// Re-read the catalog file.
    ///
    /// # Errors
    ///
    /// Returns `Config` on malformed JSON; the current entries are kept.
    pub fn reload_catalog(&self) -> Result<()> {
        self.catalog.write().unwrap_or_else(|e| e.into_inner()).reload()
    }

    pub fn avatar_ids(&self) -> Vec<String> {
        self.read_catalog().ids().map(str::to_owned).collect()
    }

    // --- internals ---

    fn slot(&self, id: &SessionId) -> Result<Arc<SessionSlot>> {
        self.lock_sessions()
            .get(id)
            .cloned()
            .ok_or_else(|| RenderError::SessionNotFound(id.to_string()))
    }

    fn forget(&self, id: &SessionId) {
        self.lock_sessions().remove(id);
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<SessionId, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn read_catalog(&self) -> std::sync::RwLockReadGuard<'_, AvatarCatalog> {
        self.catalog.read().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn supervise(manager: Weak<SessionManager>, events: Receiver<PipelineEvent>, cancel: CancellationToken) {
    debug!("session supervisor started");
    while !cancel.is_cancelled() {
        let event = match events.recv_timeout(SUPERVISOR_POLL) {
            Ok(event) => event,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        };
        let Some(manager) = manager.upgrade() else {
            break;
        };
        match event {
            PipelineEvent::TransportFailed { session } => {
                warn!(session = %session, "transport failing, closing session");
                if let Err(e) = manager.close(&session) {
                    debug!(session = %session, "supervisor close: {e}");
                }
            }
        }
    }
    debug!("session supervisor stopped");
}
