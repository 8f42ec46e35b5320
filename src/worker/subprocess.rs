//! Lip-sync model hosted in a child process.
//!
//! The child speaks a simple framed protocol over stdin/stdout. Every message
//! is one JSON header line, optionally followed by raw little-endian payload
//! bytes whose size the header determines.
//!
//! Requests (host → child):
//! - `{"op":"load","model_path":"..."}`
//! - `{"op":"infer","faces":[[w,h],...],"mel_rows":80,"mel_cols":16}` followed
//!   by every face as packed RGB24, then every mel window as f32.
//!
//! Responses (child → host):
//! - `{"ok":true}` for `load`
//! - `{"ok":true,"faces":[[w,h],...]}` followed by packed RGB24 patches
//! - `{"ok":false,"error":"..."}` for any failure

use crate::error::{RenderError, Result};
use crate::pipeline::messages::MelChunk;
use crate::worker::LipSyncModel;
use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request {
    Load {
        model_path: PathBuf,
    },
    Infer {
        faces: Vec<[u32; 2]>,
        mel_rows: usize,
        mel_cols: usize,
    },
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Response {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    faces: Vec<[u32; 2]>,
}

/// Clonable handle that force-terminates the child from another thread.
#[derive(Clone, Debug)]
pub struct KillSwitch {
    child: Arc<Mutex<Option<Child>>>,
}

impl KillSwitch {
    /// Kill and reap the child. Safe to call more than once.
    pub fn fire(&self) {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut child) = guard.take() {
            let _ = child.kill();
            let _ = child.wait();
            info!("inference subprocess terminated");
        }
    }

    pub fn is_alive(&self) -> bool {
        let mut guard = self.child.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }
}

/// Lip-sync backend that forwards every batch to a child process.
pub struct SubprocessModel {
    command: PathBuf,
    stdin: BufWriter<ChildStdin>,
    stdout: BufReader<ChildStdout>,
    kill: KillSwitch,
    healthy: bool,
}

impl SubprocessModel {
    /// Start the child and ask it to load `model_path`.
    ///
    /// # Errors
    ///
    /// Returns `RenderError::Worker` if the process cannot be started, or
    /// `RenderError::Inference` if it rejects the model.
    pub fn spawn(command: &Path, args: &[String], model_path: &Path) -> Result<Self> {
        let mut child = Command::new(command)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                RenderError::Worker(format!(
                    "failed to spawn inference process {}: {e}",
                    command.display()
                ))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| RenderError::Worker("failed to capture child stdin".to_owned()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RenderError::Worker("failed to capture child stdout".to_owned()))?;

        let mut model = Self {
            command: command.to_path_buf(),
            stdin: BufWriter::new(stdin),
            stdout: BufReader::new(stdout),
            kill: KillSwitch {
                child: Arc::new(Mutex::new(Some(child))),
            },
            healthy: true,
        };
        info!("inference subprocess spawned: {}", command.display());
        if let Err(e) = model.reload(model_path) {
            model.kill.fire();
            return Err(e);
        }
        Ok(model)
    }

    fn roundtrip(&mut self, request: &Request, payload: &[u8]) -> Result<Response> {
        let result = exchange(&mut self.stdin, &mut self.stdout, request, payload);
        if let Err(e) = &result
            && !matches!(e, RenderError::Inference(_))
        {
            self.healthy = false;
        }
        let response = result?;
        if !response.ok {
            return Err(RenderError::Inference(
                response
                    .error
                    .unwrap_or_else(|| "inference process reported failure".to_owned()),
            ));
        }
        Ok(response)
    }
}

impl LipSyncModel for SubprocessModel {
    fn infer(&mut self, faces: &[RgbImage], mels: &[MelChunk]) -> Result<Vec<RgbImage>> {
        if faces.len() != mels.len() {
            return Err(RenderError::Inference(format!(
                "{} faces but {} feature windows",
                faces.len(),
                mels.len()
            )));
        }
        let (request, payload) = encode_infer(faces, mels);
        let response = self.roundtrip(&request, &payload)?;
        let submitted: Vec<[u32; 2]> = faces.iter().map(|f| [f.width(), f.height()]).collect();
        // The unread patch bytes leave the stream out of step with requests.
        check_patch_dims(&submitted, &response.faces).inspect_err(|_| self.healthy = false)?;
        read_patches(&mut self.stdout, &response.faces).inspect_err(|_| self.healthy = false)
    }

    fn reload(&mut self, model_path: &Path) -> Result<()> {
        self.roundtrip(
            &Request::Load {
                model_path: model_path.to_path_buf(),
            },
            &[],
        )?;
        info!(
            "{} loaded model {}",
            self.command.display(),
            model_path.display()
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "subprocess"
    }

    fn is_healthy(&self) -> bool {
        self.healthy && self.kill.is_alive()
    }

    fn kill_switch(&self) -> Option<KillSwitch> {
        Some(self.kill.clone())
    }
}

impl Drop for SubprocessModel {
    fn drop(&mut self) {
        self.kill.fire();
    }
}

fn exchange<W: Write, R: BufRead>(
    writer: &mut W,
    reader: &mut R,
    request: &Request,
    payload: &[u8],
) -> Result<Response> {
    let header = serde_json::to_string(request)
        .map_err(|e| RenderError::Worker(format!("failed to encode request: {e}")))?;
    writer
        .write_all(header.as_bytes())
        .and_then(|()| writer.write_all(b"\n"))
        .and_then(|()| writer.write_all(payload))
        .and_then(|()| writer.flush())
        .map_err(|e| RenderError::Worker(format!("failed to write to inference process: {e}")))?;

    let mut line = String::new();
    let n = reader
        .read_line(&mut line)
        .map_err(|e| RenderError::Worker(format!("failed to read from inference process: {e}")))?;
    if n == 0 {
        return Err(RenderError::Worker(
            "inference process closed its output".to_owned(),
        ));
    }
    serde_json::from_str(line.trim()).map_err(|e| {
        warn!("unparseable inference header: {}", line.trim());
        RenderError::Worker(format!("malformed response header: {e}"))
    })
}

fn encode_infer(faces: &[RgbImage], mels: &[MelChunk]) -> (Request, Vec<u8>) {
    let (mel_rows, mel_cols) = mels.first().map_or((0, 0), |m| (m.rows, m.cols));
    let face_bytes: usize = faces.iter().map(|f| f.as_raw().len()).sum();
    let mut payload = Vec::with_capacity(face_bytes + mels.len() * mel_rows * mel_cols * 4);
    for face in faces {
        payload.extend_from_slice(face.as_raw());
    }
    for mel in mels {
        for value in &mel.data {
            payload.extend_from_slice(&value.to_le_bytes());
        }
    }
    let request = Request::Infer {
        faces: faces.iter().map(|f| [f.width(), f.height()]).collect(),
        mel_rows,
        mel_cols,
    };
    (request, payload)
}

/// Patches must match the submitted faces one for one, so the reply can
/// never size a buffer larger than what was sent.
fn check_patch_dims(submitted: &[[u32; 2]], returned: &[[u32; 2]]) -> Result<()> {
    if returned.len() != submitted.len() {
        return Err(RenderError::Inference(format!(
            "inference process returned {} patches for {} faces",
            returned.len(),
            submitted.len()
        )));
    }
    if let Some((i, (want, got))) = submitted
        .iter()
        .zip(returned)
        .enumerate()
        .find(|(_, (want, got))| want != got)
    {
        return Err(RenderError::Inference(format!(
            "patch {i} is {}x{}, expected {}x{}",
            got[0], got[1], want[0], want[1]
        )));
    }
    Ok(())
}

fn read_patches<R: Read>(reader: &mut R, dims: &[[u32; 2]]) -> Result<Vec<RgbImage>> {
    dims.iter()
        .map(|&[w, h]| {
            let mut buf = vec![0_u8; w as usize * h as usize * 3];
            reader.read_exact(&mut buf).map_err(|e| {
                RenderError::Worker(format!("truncated patch from inference process: {e}"))
            })?;
            RgbImage::from_raw(w, h, buf).ok_or_else(|| {
                RenderError::Inference(format!("invalid {w}x{h} patch from inference process"))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::io::Cursor;

    #[test]
    fn infer_request_layout() {
        let faces = vec![RgbImage::new(2, 3), RgbImage::new(2, 3)];
        let mut mel = MelChunk::zeros(4, 2);
        mel.data[0] = 1.0;
        let (request, payload) = encode_infer(&faces, &[mel.clone(), mel]);
        assert_eq!(
            request,
            Request::Infer {
                faces: vec![[2, 3], [2, 3]],
                mel_rows: 4,
                mel_cols: 2,
            }
        );
        assert_eq!(payload.len(), 2 * 18 + 2 * 8 * 4);
        assert_eq!(&payload[36..40], &1.0_f32.to_le_bytes());
    }

    #[test]
    fn request_header_is_tagged_json() {
        let json = serde_json::to_string(&Request::Load {
            model_path: PathBuf::from("m.pth"),
        })
        .unwrap();
        assert_eq!(json, r#"{"op":"load","model_path":"m.pth"}"#);
    }

    #[test]
    fn exchange_reads_header_then_patches() {
        let mut wire = br#"{"ok":true,"faces":[[1,1],[1,1]]}"#.to_vec();
        wire.push(b'\n');
        wire.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
        let mut reader = Cursor::new(wire);
        let mut sent = Vec::new();

        let (request, payload) = encode_infer(&[RgbImage::new(1, 1)], &[MelChunk::zeros(1, 1)]);
        let response = exchange(&mut sent, &mut reader, &request, &payload).unwrap();
        assert!(response.ok);
        let patches = read_patches(&mut reader, &response.faces).unwrap();
        assert_eq!(patches[1].get_pixel(0, 0).0, [4, 5, 6]);
        assert!(sent.starts_with(br#"{"op":"infer""#));
    }

    #[test]
    fn oversized_patch_header_is_rejected_before_reading() {
        let err = check_patch_dims(&[[8, 8]], &[[60_000, 60_000]]).unwrap_err();
        assert!(matches!(err, RenderError::Inference(_)));
        assert!(err.to_string().contains("60000x60000"));
        assert!(check_patch_dims(&[[8, 8], [8, 8]], &[[8, 8]]).is_err());
        assert!(check_patch_dims(&[[8, 8], [4, 2]], &[[8, 8], [4, 2]]).is_ok());
    }

    #[test]
    fn truncated_patch_is_an_error() {
        let mut reader = Cursor::new(vec![0_u8; 5]);
        assert!(read_patches(&mut reader, &[[2, 1]]).is_err());
    }

    #[test]
    fn closed_output_is_a_worker_error() {
        let mut reader = Cursor::new(Vec::new());
        let mut sink = Vec::new();
        let err = exchange(
            &mut sink,
            &mut reader,
            &Request::Load {
                model_path: PathBuf::from("m"),
            },
            &[],
        )
        .unwrap_err();
        assert!(matches!(err, RenderError::Worker(_)));
    }

    #[test]
    fn missing_executable_fails_to_spawn() {
        let result = SubprocessModel::spawn(
            Path::new("/nonexistent/lipsync-server"),
            &[],
            Path::new("m.pth"),
        );
        assert!(matches!(result, Err(RenderError::Worker(_))));
    }

    #[cfg(unix)]
    #[test]
    fn child_that_exits_immediately_is_rejected() {
        let result = SubprocessModel::spawn(
            Path::new("/bin/sh"),
            &["-c".to_owned(), "exit 0".to_owned()],
            Path::new("m.pth"),
        );
        assert!(result.is_err());
    }
}
