//! WebSocket terminal
//!
//! Bridges a client WebSocket to an interactive exec on the sandbox's
//! container. Three cooperative pumps run until any of them ends: container
//! output to client, client frames to container stdin, and a ping
//! keepalive that doubles as the liveness probe for the read deadline.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    response::{IntoResponse, Response},
};
use futures::stream::{SplitSink, StreamExt};
use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::api::http::auth;
use crate::domain::sandbox::{Sandbox, SandboxStatus};
use crate::domain::session::SessionStatus;
use crate::error::Error;
use crate::infra::docker::ExecStream;
use crate::service::sandbox::SandboxManager;
use crate::AppState;

/// Proxies and load balancers kill idle connections; ping well under
/// their windows.
const PING_INTERVAL: Duration = Duration::from_secs(30);
/// Deadline for any single write to the client
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Ping interval plus the pong grace period. A connection with no inbound
/// frames (pongs included) for this long is dead.
const READ_TIMEOUT: Duration = Duration::from_secs(40);

const INITIAL_ROWS: u16 = 24;
const INITIAL_COLS: u16 = 80;

type Sink = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// Wire frame exchanged with the terminal client
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct TerminalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
}

impl TerminalMessage {
    fn output(data: String) -> Self {
        Self {
            kind: "output".to_string(),
            data: Some(data),
            ..Default::default()
        }
    }

    fn connected() -> Self {
        Self {
            kind: "connected".to_string(),
            data: Some("Connected to sandbox terminal".to_string()),
            ..Default::default()
        }
    }

    fn error(message: &str) -> Self {
        Self {
            kind: "error".to_string(),
            data: Some(message.to_string()),
            ..Default::default()
        }
    }

    fn exit(code: i64) -> Self {
        Self {
            kind: "exit".to_string(),
            code: Some(code),
            ..Default::default()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct TerminalQuery {
    pub token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SessionTerminalQuery {
    pub session_token: Option<String>,
}

/// Admin terminal; the API key arrives as a query parameter because
/// browsers cannot set WebSocket headers.
pub async fn terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TerminalQuery>,
    headers: axum::http::HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let api_key = match query.token.or_else(|| auth::extract_api_key(&headers)) {
        Some(key) => key,
        None => return Error::Unauthorized("api key required".to_string()).into_response(),
    };
    if let Err(e) = auth::resolve_client(&state, &api_key).await {
        return e.into_response();
    }

    let sandbox = match running_sandbox(&state, &id).await {
        Ok(sandbox) => sandbox,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_terminal(socket, state, sandbox))
}

/// Public terminal; the session token must belong to an active session
/// bound to this sandbox.
pub async fn session_terminal_ws(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SessionTerminalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = match query.session_token {
        Some(token) => token,
        None => return Error::Unauthorized("session_token required".to_string()).into_response(),
    };

    let session = match state.sessions.get_by_token(&token).await {
        Ok(session) => session,
        Err(_) => return Error::Unauthorized("invalid session token".to_string()).into_response(),
    };

    if session.status != SessionStatus::Active {
        return Error::InvalidRequest("session is not active".to_string()).into_response();
    }
    if session.sandbox_id.as_deref() != Some(id.as_str()) {
        return Error::PermissionDenied(
            "sandbox does not belong to this session".to_string(),
        )
        .into_response();
    }

    let sandbox = match running_sandbox(&state, &id).await {
        Ok(sandbox) => sandbox,
        Err(e) => return e.into_response(),
    };

    ws.on_upgrade(move |socket| handle_terminal(socket, state, sandbox))
}

async fn running_sandbox(state: &AppState, id: &str) -> Result<Sandbox, Error> {
    let sandbox = state.manager.get(id).await?;
    if sandbox.status != SandboxStatus::Running {
        return Err(Error::InvalidRequest("sandbox is not running".to_string()));
    }
    Ok(sandbox)
}

async fn handle_terminal(socket: WebSocket, state: AppState, sandbox: Sandbox) {
    info!(sandbox_id = sandbox.id, "terminal connected");

    let (exec_id, exec) = match state.manager.exec_attach(&sandbox.container_id).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(sandbox_id = sandbox.id, error = %e, "failed to create exec session");
            send_raw_error(socket, "failed to connect to container").await;
            return;
        }
    };

    if let Err(e) = state
        .manager
        .exec_resize(&exec_id, INITIAL_ROWS, INITIAL_COLS)
        .await
    {
        warn!(sandbox_id = sandbox.id, error = %e, "failed to set initial terminal size");
    }

    let ExecStream {
        mut output,
        mut input,
    } = exec;
    let (sink, mut receiver) = socket.split();
    let sink: Sink = Arc::new(Mutex::new(sink));

    if send_frame(&sink, &TerminalMessage::connected()).await.is_err() {
        return;
    }

    // Container -> client
    let output_pump = {
        let sink = sink.clone();
        async move {
            while let Some(chunk) = output.next().await {
                match chunk {
                    Ok(log) => {
                        let bytes = log.into_bytes();
                        if bytes.is_empty() {
                            continue;
                        }
                        let frame =
                            TerminalMessage::output(String::from_utf8_lossy(&bytes).to_string());
                        if send_frame(&sink, &frame).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        debug!(error = %e, "exec read error");
                        return;
                    }
                }
            }
        }
    };

    // Client -> container. Any inbound frame, pongs included, resets the
    // read deadline.
    let input_pump = {
        let state = state.clone();
        let exec_id = exec_id.clone();
        async move {
            loop {
                let message = match tokio::time::timeout(READ_TIMEOUT, receiver.next()).await {
                    Err(_) => {
                        debug!("terminal read deadline elapsed");
                        return;
                    }
                    Ok(None) => return,
                    Ok(Some(Err(e))) => {
                        debug!(error = %e, "websocket read error");
                        return;
                    }
                    Ok(Some(Ok(message))) => message,
                };

                match message {
                    Message::Text(text) => {
                        let frame: TerminalMessage = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                debug!(error = %e, "invalid terminal message");
                                continue;
                            }
                        };

                        match frame.kind.as_str() {
                            "input" => {
                                let data = frame.data.unwrap_or_default();
                                if input.write_all(data.as_bytes()).await.is_err() {
                                    return;
                                }
                                let _ = input.flush().await;
                            }
                            "resize" => {
                                let (cols, rows) =
                                    (frame.cols.unwrap_or(0), frame.rows.unwrap_or(0));
                                if cols > 0 && rows > 0 {
                                    if let Err(e) =
                                        state.manager.exec_resize(&exec_id, rows, cols).await
                                    {
                                        debug!(error = %e, cols, rows, "failed to resize terminal");
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                    Message::Close(_) => return,
                    // Pong and ping frames only feed the read deadline
                    _ => {}
                }
            }
        }
    };

    // Keepalive pings
    let keepalive = {
        let sink = sink.clone();
        async move {
            let mut ticker = tokio::time::interval(PING_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let mut sink = sink.lock().await;
                let ping = sink.send(Message::Ping(Bytes::new()));
                match tokio::time::timeout(WRITE_TIMEOUT, ping).await {
                    Ok(Ok(())) => {}
                    _ => {
                        debug!("ping failed");
                        return;
                    }
                }
            }
        }
    };

    // First pump to finish tears the session down; dropping the others
    // closes the exec stream and the socket halves they own.
    tokio::select! {
        _ = output_pump => {}
        _ = input_pump => {}
        _ = keepalive => {}
    }

    // Best-effort exit report; fails silently once the client is gone
    if let Ok(Some(code)) = state.manager.exec_exit_code(&exec_id).await {
        let _ = send_frame(&sink, &TerminalMessage::exit(code)).await;
    }

    info!(sandbox_id = sandbox.id, "terminal disconnected");
}

/// Serialize and send one frame, writes behind the shared mutex with a
/// deadline.
async fn send_frame(sink: &Sink, frame: &TerminalMessage) -> Result<(), ()> {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!(error = %e, "failed to encode terminal message");
            return Err(());
        }
    };

    let mut sink = sink.lock().await;
    match tokio::time::timeout(WRITE_TIMEOUT, sink.send(Message::Text(text.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            debug!(error = %e, "failed to send terminal message");
            Err(())
        }
        Err(_) => {
            debug!("terminal write deadline elapsed");
            Err(())
        }
    }
}

/// Error frame on a socket that was never split
async fn send_raw_error(mut socket: WebSocket, message: &str) {
    if let Ok(text) = serde_json::to_string(&TerminalMessage::error(message)) {
        let _ = socket.send(Message::Text(text.into())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_frame_deserializes() {
        let frame: TerminalMessage =
            serde_json::from_str(r#"{"type":"input","data":"echo hello\n"}"#).expect("frame");
        assert_eq!(frame.kind, "input");
        assert_eq!(frame.data.as_deref(), Some("echo hello\n"));
        assert!(frame.cols.is_none());
    }

    #[test]
    fn resize_frame_deserializes() {
        let frame: TerminalMessage =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).expect("frame");
        assert_eq!(frame.kind, "resize");
        assert_eq!(frame.cols, Some(120));
        assert_eq!(frame.rows, Some(40));
    }

    #[test]
    fn output_frame_omits_absent_fields() {
        let text = serde_json::to_string(&TerminalMessage::output("hi".to_string())).expect("json");
        assert_eq!(text, r#"{"type":"output","data":"hi"}"#);

        let text = serde_json::to_string(&TerminalMessage::exit(0)).expect("json");
        assert_eq!(text, r#"{"type":"exit","code":0}"#);
    }

    #[test]
    fn unknown_frame_types_still_parse() {
        let frame: TerminalMessage =
            serde_json::from_str(r#"{"type":"ping"}"#).expect("frame");
        assert_eq!(frame.kind, "ping");
    }
}
