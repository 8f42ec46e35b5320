//! Newline-delimited JSON command reader.
//!
//! Each input line is a [`CommandEnvelope`] such as
//! `{"session":"…","command":"speak","text":"hello"}`; the `session` field
//! may be omitted to address the default session. Every line gets one
//! [`ResponseEnvelope`] line back. Stdout is reserved for responses; all
//! diagnostics go through `tracing`.

use crate::control::ControlBus;
use crate::error::{RenderError, Result};
use crate::pipeline::messages::{ControlCommand, SessionId};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// One inbound command line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandEnvelope {
    #[serde(default)]
    pub session: Option<String>,
    #[serde(flatten)]
    pub command: ControlCommand,
}

/// Reply to one command line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseEnvelope {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ResponseEnvelope {
    fn accepted(session: &SessionId, command: &str) -> Self {
        Self {
            ok: true,
            session: Some(session.to_string()),
            command: Some(command.to_owned()),
            error: None,
        }
    }

    fn rejected(session: Option<&SessionId>, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            session: session.map(ToString::to_string),
            command: None,
            error: Some(error.into()),
        }
    }
}

/// Read commands from `reader` until EOF or until the default session is
/// shut down, publishing each onto `bus`.
///
/// # Errors
///
/// Returns `Channel` if reading input or writing a response fails.
pub async fn run_command_reader<R, W>(
    reader: R,
    mut writer: W,
    bus: &ControlBus,
    default_session: &SessionId,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = reader.lines();
    loop {
        let line = lines
            .next_line()
            .await
            .map_err(|e| RenderError::Channel(format!("failed to read command input: {e}")))?;
        let Some(line) = line else {
            tracing::info!("command input closed");
            break;
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let envelope: CommandEnvelope = match serde_json::from_str(trimmed) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, raw_line = %trimmed, "unparseable command");
                let response = ResponseEnvelope::rejected(None, format!("parse error: {e}"));
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        let session = envelope
            .session
            .map(SessionId::from)
            .unwrap_or_else(|| default_session.clone());
        let name = envelope.command.name();
        let stop = name == "shutdown" && &session == default_session;

        let response = match bus.publish(&session, envelope.command) {
            Ok(()) => ResponseEnvelope::accepted(&session, name),
            Err(e) => ResponseEnvelope::rejected(Some(&session), e.to_string()),
        };
        write_response(&mut writer, &response).await?;

        if stop {
            tracing::info!(session = %session, "default session shut down, stopping reader");
            break;
        }
    }
    Ok(())
}

async fn write_response<W: AsyncWrite + Unpin>(writer: &mut W, response: &ResponseEnvelope) -> Result<()> {
    let json = serde_json::to_string(response)
        .map_err(|e| RenderError::Channel(format!("failed to serialize response: {e}")))?;
    writer
        .write_all(json.as_bytes())
        .await
        .map_err(|e| RenderError::Channel(format!("failed to write response: {e}")))?;
    writer
        .write_all(b"\n")
        .await
        .map_err(|e| RenderError::Channel(format!("failed to write response: {e}")))?;
    writer
        .flush()
        .await
        .map_err(|e| RenderError::Channel(format!("failed to flush response: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use std::time::Duration;

    fn responses(out: &[u8]) -> Vec<serde_json::Value> {
        std::str::from_utf8(out)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn envelope_parses_with_and_without_session() {
        let e: CommandEnvelope =
            serde_json::from_str(r#"{"session":"abc","command":"speak","text":"hi"}"#).unwrap();
        assert_eq!(e.session.as_deref(), Some("abc"));
        assert_eq!(e.command, ControlCommand::Speak { text: "hi".to_owned() });

        let e: CommandEnvelope =
            serde_json::from_str(r#"{"command":"switch_avatar","avatar_id":"bob"}"#).unwrap();
        assert!(e.session.is_none());
        assert_eq!(e.command.name(), "switch_avatar");
    }

    #[tokio::test]
    async fn bad_lines_and_unknown_sessions_get_error_responses() {
        let bus = ControlBus::new(320, Duration::from_millis(10));
        let input = b"not json\n\n{\"command\":\"interrupt\"}\n".as_slice();
        let mut out = Vec::new();
        run_command_reader(input, &mut out, &bus, &SessionId::from("main"))
            .await
            .unwrap();

        let replies = responses(&out);
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0]["ok"], false);
        assert!(replies[0]["error"].as_str().unwrap().starts_with("parse error"));
        assert_eq!(replies[1]["ok"], false);
        assert_eq!(replies[1]["session"], "main");
    }
}
