use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{io_err, DaemonError};
use crate::paths::socket_path;
use crate::scheduler::TriggerOutcome;

/// JSON newline-delimited request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonRequest {
    pub cmd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub confirm: bool,
}

impl DaemonRequest {
    pub fn status(scope: Option<String>) -> Self {
        Self {
            cmd: "status".to_string(),
            scope,
            confirm: false,
        }
    }

    pub fn trigger(scope: impl Into<String>, confirm: bool) -> Self {
        Self {
            cmd: "trigger".to_string(),
            scope: Some(scope.into()),
            confirm,
        }
    }

    pub fn stop() -> Self {
        Self {
            cmd: "stop".to_string(),
            ..Self::default()
        }
    }
}

/// JSON newline-delimited response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Send one JSON request to the daemon socket and return one response.
pub fn send_request(home: &Path, request: &DaemonRequest) -> Result<DaemonResponse, DaemonError> {
    let socket = socket_path(home);
    let mut stream = connect(&socket)?;

    let mut payload = serde_json::to_vec(request)?;
    payload.push(b'\n');
    stream
        .write_all(&payload)
        .and_then(|()| stream.flush())
        .map_err(|e| io_err(&socket, e))?;

    let mut line = String::new();
    let read = BufReader::new(stream)
        .read_line(&mut line)
        .map_err(|e| io_err(&socket, e))?;
    if read == 0 {
        return Err(DaemonError::Protocol(
            "daemon closed connection before responding".to_string(),
        ));
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// A missing socket or a refused connection both mean no daemon is listening.
fn connect(socket: &Path) -> Result<UnixStream, DaemonError> {
    let not_running = || DaemonError::DaemonNotRunning {
        socket: socket.to_path_buf(),
    };
    if !socket.exists() {
        return Err(not_running());
    }
    UnixStream::connect(socket).map_err(|err| match err.kind() {
        ErrorKind::NotFound | ErrorKind::ConnectionRefused | ErrorKind::ConnectionReset => {
            not_running()
        }
        _ => io_err(socket, err),
    })
}

/// Daemon status, optionally narrowed to one scope. Retries briefly so a
/// client started right after the daemon finds the socket.
pub fn request_status(home: &Path, scope: Option<String>) -> Result<Value, DaemonError> {
    const ATTEMPTS: usize = 5;
    let request = DaemonRequest::status(scope);

    let mut attempt = 1;
    loop {
        match send_request(home, &request) {
            Ok(response) => return response_into_data(response),
            Err(DaemonError::DaemonNotRunning { .. }) if attempt < ATTEMPTS => {
                attempt += 1;
                sleep(Duration::from_millis(100));
            }
            Err(err) => return Err(err),
        }
    }
}

pub fn request_stop(home: &Path) -> Result<(), DaemonError> {
    let response = send_request(home, &DaemonRequest::stop())?;
    response_into_data(response).map(drop)
}

/// Ask the daemon to reconcile `scope` soon. Returns without waiting for the
/// run.
pub fn request_trigger(home: &Path, scope: &str, confirm: bool) -> Result<TriggerOutcome, DaemonError> {
    let response = send_request(home, &DaemonRequest::trigger(scope, confirm))?;
    let data = response_into_data(response)?;
    let outcome = data
        .get("outcome")
        .cloned()
        .ok_or_else(|| DaemonError::Protocol("trigger response without outcome".to_string()))?;
    Ok(serde_json::from_value(outcome)?)
}

fn response_into_data(response: DaemonResponse) -> Result<Value, DaemonError> {
    if response.ok {
        Ok(response.data.unwrap_or(Value::Null))
    } else {
        Err(DaemonError::Protocol(
            response
                .error
                .unwrap_or_else(|| "unknown daemon error".to_string()),
        ))
    }
}
