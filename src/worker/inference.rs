//! Isolated inference context.
//!
//! The model lives on its own thread and is only reached through a
//! request/response channel pair. Panics inside the model are caught on that
//! thread and turned into errors; an unhealthy or panicked model is dropped
//! and rebuilt from the factory on the next batch. Callers never block on the
//! model for longer than the configured inference timeout.

use crate::error::{RenderError, Result};
use crate::pipeline::messages::MelChunk;
use crate::worker::stats::InferenceStats;
use crate::worker::{KillSwitch, LipSyncModel, ModelFactory};
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use image::RgbImage;
use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

enum WorkerRequest {
    Infer {
        batch: u64,
        faces: Vec<RgbImage>,
        mels: Vec<MelChunk>,
    },
    Reload {
        model_path: PathBuf,
    },
}

struct WorkerResponse {
    batch: u64,
    elapsed: Duration,
    result: Result<Vec<RgbImage>>,
}

type KillSlot = Arc<Mutex<Option<KillSwitch>>>;

/// Handle to a session's inference thread.
pub struct InferenceWorker {
    name: String,
    factory: ModelFactory,
    model_path: PathBuf,
    timeout: Duration,
    requests: Option<Sender<WorkerRequest>>,
    responses: Receiver<WorkerResponse>,
    handle: Option<JoinHandle<()>>,
    kill: KillSlot,
    next_batch: u64,
    stats: InferenceStats,
}

impl InferenceWorker {
    /// Start the inference thread. The model itself is built lazily on that
    /// thread when the first batch arrives.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Io` if the thread cannot be spawned.
    pub fn spawn(
        name: impl Into<String>,
        factory: ModelFactory,
        model_path: PathBuf,
        timeout: Duration,
    ) -> Result<Self> {
        let kill: KillSlot = Arc::new(Mutex::new(None));
        let name = name.into();
        let (requests, responses, handle) =
            start_thread(&name, Arc::clone(&factory), model_path.clone(), Arc::clone(&kill))?;
        Ok(Self {
            name,
            factory,
            model_path,
            timeout,
            requests: Some(requests),
            responses,
            handle: Some(handle),
            kill,
            next_batch: 0,
            stats: InferenceStats::default(),
        })
    }

    /// Run one batch through the model.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Inference` if the batch is malformed, the model
    /// fails or the call exceeds the timeout, and `RenderError::Worker` if the
    /// inference thread went away (it is restarted for the next call).
    pub fn infer(&mut self, faces: Vec<RgbImage>, mels: Vec<MelChunk>) -> Result<Vec<RgbImage>> {
        if faces.len() != mels.len() {
            return Err(RenderError::Inference(format!(
                "face batch has {} entries but feature batch has {}",
                faces.len(),
                mels.len()
            )));
        }
        let frames = faces.len();
        let batch = self.next_batch;
        self.next_batch += 1;

        self.send(WorkerRequest::Infer { batch, faces, mels })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match self.responses.recv_timeout(remaining) {
                Ok(response) if response.batch == batch => {
                    let patches = response.result?;
                    if patches.len() != frames {
                        return Err(RenderError::Inference(format!(
                            "model returned {} patches for {frames} faces",
                            patches.len()
                        )));
                    }
                    self.stats.record(frames, response.elapsed);
                    return Ok(patches);
                }
                Ok(stale) => {
                    debug!(batch = stale.batch, "discarding late inference result");
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(RenderError::Inference(format!(
                        "batch {batch} timed out after {:?}",
                        self.timeout
                    )));
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.restart()?;
                    return Err(RenderError::Worker(format!(
                        "{}: inference thread exited, restarted",
                        self.name
                    )));
                }
            }
        }
    }

    /// Switch to new model weights. Takes effect before the next batch.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be delivered to the thread.
    pub fn reload(&mut self, model_path: &Path) -> Result<()> {
        self.model_path = model_path.to_path_buf();
        self.send(WorkerRequest::Reload {
            model_path: self.model_path.clone(),
        })
    }

    pub fn model_path(&self) -> &Path {
        &self.model_path
    }

    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the thread, waiting at most `join_timeout` before force-killing an
    /// out-of-process model and abandoning the thread. Returns `true` if the
    /// thread exited in time.
    pub fn shutdown(&mut self, join_timeout: Duration) -> bool {
        self.requests.take();
        let Some(handle) = self.handle.take() else {
            return true;
        };

        if wait_finished(&handle, join_timeout) {
            let _ = handle.join();
            return true;
        }

        warn!("{}: inference thread unresponsive, terminating", self.name);
        if let Some(kill) = self.kill.lock().unwrap_or_else(|e| e.into_inner()).take() {
            kill.fire();
        }
        if wait_finished(&handle, join_timeout / 4) {
            let _ = handle.join();
        } else {
            error!("{}: abandoning inference thread", self.name);
        }
        false
    }

    fn send(&mut self, request: WorkerRequest) -> Result<()> {
        if !self.is_alive() {
            self.restart()?;
        }
        let Some(tx) = &self.requests else {
            return Err(RenderError::Worker(format!("{}: worker is shut down", self.name)));
        };
        match tx.send_timeout(request, self.timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(RenderError::Inference(format!(
                "{}: inference thread busy",
                self.name
            ))),
            Err(SendTimeoutError::Disconnected(_)) => {
                self.restart()?;
                Err(RenderError::Worker(format!(
                    "{}: inference thread exited, restarted",
                    self.name
                )))
            }
        }
    }

    fn restart(&mut self) -> Result<()> {
        if self.requests.is_none() {
            return Err(RenderError::Worker(format!("{}: worker is shut down", self.name)));
        }
        warn!("{}: restarting inference thread", self.name);
        if let Some(handle) = self.handle.take()
            && handle.is_finished()
        {
            let _ = handle.join();
        }
        let (requests, responses, handle) = start_thread(
            &self.name,
            Arc::clone(&self.factory),
            self.model_path.clone(),
            Arc::clone(&self.kill),
        )?;
        self.requests = Some(requests);
        self.responses = responses;
        self.handle = Some(handle);
        Ok(())
    }
}

impl Drop for InferenceWorker {
    fn drop(&mut self) {
        self.requests.take();
    }
}

fn start_thread(
    name: &str,
    factory: ModelFactory,
    model_path: PathBuf,
    kill: KillSlot,
) -> Result<(Sender<WorkerRequest>, Receiver<WorkerResponse>, JoinHandle<()>)> {
    let (req_tx, req_rx) = crossbeam_channel::bounded(1);
    let (resp_tx, resp_rx) = crossbeam_channel::bounded(4);
    let handle = std::thread::Builder::new()
        .name(format!("{name}-infer"))
        .spawn(move || run_worker(factory, model_path, req_rx, resp_tx, kill))?;
    Ok((req_tx, resp_rx, handle))
}

fn run_worker(
    factory: ModelFactory,
    mut model_path: PathBuf,
    requests: Receiver<WorkerRequest>,
    responses: Sender<WorkerResponse>,
    kill: KillSlot,
) {
    let mut model: Option<Box<dyn LipSyncModel>> = None;

    for request in requests.iter() {
        match request {
            WorkerRequest::Reload { model_path: path } => {
                model_path = path;
                let Some(m) = model.as_mut() else {
                    continue;
                };
                match catch_unwind(AssertUnwindSafe(|| m.reload(&model_path))) {
                    Ok(Ok(())) => info!("reloaded {} model: {}", m.name(), model_path.display()),
                    Ok(Err(e)) => warn!("model reload failed, keeping previous weights: {e}"),
                    Err(panic) => {
                        error!("model panicked during reload: {}", panic_message(&panic));
                        model = None;
                    }
                }
            }
            WorkerRequest::Infer { batch, faces, mels } => {
                if model.as_ref().is_some_and(|m| !m.is_healthy()) {
                    warn!("dropping unhealthy model before batch {batch}");
                    model = None;
                }
                if model.is_none() {
                    model = build_model(&factory, &model_path, &kill);
                }

                let start = Instant::now();
                let result = match model.as_mut() {
                    Some(m) => match catch_unwind(AssertUnwindSafe(|| m.infer(&faces, &mels))) {
                        Ok(result) => result,
                        Err(panic) => {
                            let msg = panic_message(&panic);
                            error!("model panicked on batch {batch}: {msg}");
                            model = None;
                            Err(RenderError::Inference(format!("model panicked: {msg}")))
                        }
                    },
                    None => Err(RenderError::Inference("model unavailable".to_owned())),
                };

                let response = WorkerResponse {
                    batch,
                    elapsed: start.elapsed(),
                    result,
                };
                if responses.send(response).is_err() {
                    break;
                }
            }
        }
    }
    debug!("inference thread exiting");
}

fn build_model(
    factory: &ModelFactory,
    model_path: &Path,
    kill: &KillSlot,
) -> Option<Box<dyn LipSyncModel>> {
    match catch_unwind(AssertUnwindSafe(|| factory(model_path))) {
        Ok(Ok(model)) => {
            info!("{} model ready: {}", model.name(), model_path.display());
            *kill.lock().unwrap_or_else(|e| e.into_inner()) = model.kill_switch();
            Some(model)
        }
        Ok(Err(e)) => {
            error!("failed to load model {}: {e}", model_path.display());
            None
        }
        Err(panic) => {
            error!("model construction panicked: {}", panic_message(&panic));
            None
        }
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

fn wait_finished(handle: &JoinHandle<()>, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    true
}
