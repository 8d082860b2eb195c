// Copyright 2022 jmjoy
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Request handler: resolves the script, invokes the engine, formats and
//! sends the response.
//!
//! A failed request produces a formatted 500 and the connection
//! continues per KEEP_CONN; nothing here retries or escalates.

use crate::{
    cgi::{self, ResponseHeaders},
    conn::FcgiConnection,
    engine::{ExecContext, ScriptEngine},
    error::ServerResult,
    meta::{ProtocolStatus, Role},
    request::FcgiRequest,
};
use std::{
    collections::HashMap,
    panic::{AssertUnwindSafe, catch_unwind},
    path::Path,
    time::SystemTime,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Outcome of one handled request, as seen by the worker.
#[derive(Debug, Clone, Copy)]
pub struct Handled {
    /// App-status sent with END_REQUEST
    pub exit_code: u32,
    /// The engine panicked; the worker must retire itself
    pub engine_panicked: bool,
}

/// Produces and sends a response for one assembled request.
#[derive(Default)]
pub struct RequestHandler {
    process_env: HashMap<String, String>,
}

impl RequestHandler {
    /// Creates a handler with no pre-registered variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a process-wide variable copied into every execution
    /// context.
    pub fn register_env(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.process_env.insert(name.into(), value.into());
    }

    /// Runs the full handling sequence for `request` and writes the
    /// response through `conn`.
    pub async fn handle<S: AsyncRead + AsyncWrite + Unpin>(
        &self, conn: &mut FcgiConnection<S>, request: &FcgiRequest,
        engine: &mut dyn ScriptEngine, cancel: CancellationToken,
    ) -> ServerResult<Handled> {
        let id = request.id;

        if request.role != Some(Role::Responder) {
            warn!(id, role = ?request.role, "Unsupported role.");
            conn.end_request(id, 1, ProtocolStatus::UnknownRole).await?;
            return Ok(Handled {
                exit_code: 1,
                engine_panicked: false,
            });
        }

        let script = match request.param("SCRIPT_FILENAME") {
            Some(script) => script.to_owned(),
            None => {
                return self
                    .fail(conn, id, "missing SCRIPT_FILENAME in request params")
                    .await;
            }
        };

        let path = Path::new(&script);
        if tokio::fs::metadata(path).await.is_err() {
            return self.fail(conn, id, "File not found").await;
        }
        let source = match tokio::fs::read(path).await {
            Ok(source) => source,
            Err(err) => {
                return self.fail(conn, id, &format!("unreadable script: {err}")).await;
            }
        };

        let program = match engine.compile(path, &source) {
            Ok(program) => program,
            Err(errors) => {
                debug!(id, count = errors.len(), "Script failed to compile.");
                let mut stderr = Vec::new();
                for error in &errors {
                    stderr.extend_from_slice(error.as_bytes());
                    stderr.push(b'\n');
                }
                let mut headers = ResponseHeaders::default();
                headers.set_status(500);
                conn.send_response(id, &headers.format(), &stderr, 1).await?;
                return Ok(Handled {
                    exit_code: 1,
                    engine_panicked: false,
                });
            }
        };

        let globals = cgi::build_globals(
            &request.params,
            &request.stdin,
            &self.process_env,
            SystemTime::now(),
        );
        let request_headers = cgi::request_headers(&request.params);
        let mut ctx = ExecContext::new(globals, request_headers, cancel);

        let mut stderr = Vec::new();
        let mut engine_panicked = false;
        match catch_unwind(AssertUnwindSafe(|| engine.execute(&program, &mut ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(message)) => {
                stderr.extend_from_slice(message.as_bytes());
                stderr.push(b'\n');
            }
            Err(panic) => {
                engine_panicked = true;
                let message = panic_message(&*panic);
                warn!(id, message, "Engine panicked.");
                stderr.extend_from_slice(message.as_bytes());
                stderr.push(b'\n');
                ctx.exit(1);
            }
        }

        let (body, headers, exit_code) = ctx.into_output();
        let mut stdout = headers.format();
        stdout.extend_from_slice(&body);

        conn.send_response(id, &stdout, &stderr, exit_code).await?;
        Ok(Handled {
            exit_code,
            engine_panicked,
        })
    }

    /// Synthesizes a 500 with a one-line stderr and exit-code 1.
    async fn fail<S: AsyncRead + AsyncWrite + Unpin>(
        &self, conn: &mut FcgiConnection<S>, id: u16, message: &str,
    ) -> ServerResult<Handled> {
        debug!(id, message, "Request failed before execution.");
        let mut headers = ResponseHeaders::default();
        headers.set_status(500);
        let mut stderr = message.as_bytes().to_vec();
        stderr.push(b'\n');
        conn.send_response(id, &headers.format(), &stderr, 1).await?;
        Ok(Handled {
            exit_code: 1,
            engine_panicked: false,
        })
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "engine panicked"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{CompiledScript, EchoEngine},
        meta::{Header, RecordType},
    };
    use tokio::io::duplex;
    use tokio_util::sync::CancellationToken;

    /// Reads records from the client side until END_REQUEST.
    async fn collect_response(
        client: &mut (impl tokio::io::AsyncRead + Unpin),
    ) -> (Vec<u8>, Vec<u8>, u32) {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        loop {
            let header = Header::new_from_stream(client).await.unwrap();
            let body = header.read_content_from_stream(client).await.unwrap();
            match header.r#type {
                RecordType::Stdout => stdout.extend_from_slice(&body),
                RecordType::Stderr => stderr.extend_from_slice(&body),
                RecordType::EndRequest => {
                    let app_status = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
                    return (stdout, stderr, app_status);
                }
                other => panic!("unexpected record type {other}"),
            }
        }
    }

    fn request_with(params: &[(&str, &str)], stdin: &[u8]) -> FcgiRequest {
        FcgiRequest {
            id: 1,
            role: Some(Role::Responder),
            flags: 0,
            params: params
                .iter()
                .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
                .collect(),
            stdin: bytes::Bytes::copy_from_slice(stdin),
        }
    }

    fn temp_script(name: &str, content: &[u8]) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("fpm-handler-{}-{name}", std::process::id()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn serves_script_output() {
        let script = temp_script("ok.php", b"OK");
        let (mut client, server) = duplex(8192);
        let mut conn = FcgiConnection::new(server);
        let mut engine = EchoEngine;

        let request = request_with(
            &[
                ("SCRIPT_FILENAME", script.to_str().unwrap()),
                ("REQUEST_METHOD", "GET"),
                ("QUERY_STRING", "a=1&b=2"),
            ],
            b"",
        );
        let handled = RequestHandler::new()
            .handle(&mut conn, &request, &mut engine, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(handled.exit_code, 0);

        let (stdout, stderr, app_status) = collect_response(&mut client).await;
        let stdout = String::from_utf8(stdout).unwrap();
        assert!(stdout.starts_with("Status: 200 OK\r\n"));
        assert!(stdout.contains("Content-Type: text/html; charset=UTF-8\r\n"));
        assert!(stdout.ends_with("\r\n\r\nOK"));
        assert!(stderr.is_empty());
        assert_eq!(app_status, 0);

        std::fs::remove_file(script).unwrap();
    }

    #[tokio::test]
    async fn missing_script_filename_is_500() {
        let (mut client, server) = duplex(8192);
        let mut conn = FcgiConnection::new(server);
        let mut engine = EchoEngine;

        let request = request_with(&[("REQUEST_METHOD", "GET")], b"");
        RequestHandler::new()
            .handle(&mut conn, &request, &mut engine, CancellationToken::new())
            .await
            .unwrap();

        let (stdout, stderr, app_status) = collect_response(&mut client).await;
        assert!(String::from_utf8(stdout).unwrap().starts_with("Status: 500"));
        assert!(!stderr.is_empty());
        assert_eq!(app_status, 1);
    }

    #[tokio::test]
    async fn nonexistent_script_is_file_not_found() {
        let (mut client, server) = duplex(8192);
        let mut conn = FcgiConnection::new(server);
        let mut engine = EchoEngine;

        let request = request_with(&[("SCRIPT_FILENAME", "/nonexistent/script.php")], b"");
        RequestHandler::new()
            .handle(&mut conn, &request, &mut engine, CancellationToken::new())
            .await
            .unwrap();

        let (stdout, stderr, app_status) = collect_response(&mut client).await;
        assert!(String::from_utf8(stdout).unwrap().starts_with("Status: 500"));
        assert_eq!(stderr, b"File not found\n");
        assert_eq!(app_status, 1);
    }

    #[tokio::test]
    async fn compile_errors_reach_stderr() {
        struct FailingCompiler;
        impl ScriptEngine for FailingCompiler {
            fn compile(
                &mut self, _path: &Path, _source: &[u8],
            ) -> Result<CompiledScript, Vec<String>> {
                Err(vec!["parse error line 1".to_owned(), "parse error line 2".to_owned()])
            }
            fn execute(
                &mut self, _script: &CompiledScript, _ctx: &mut ExecContext,
            ) -> Result<(), String> {
                unreachable!()
            }
        }

        let script = temp_script("broken.php", b"<?php <<<");
        let (mut client, server) = duplex(8192);
        let mut conn = FcgiConnection::new(server);
        let mut engine = FailingCompiler;

        let request = request_with(&[("SCRIPT_FILENAME", script.to_str().unwrap())], b"");
        RequestHandler::new()
            .handle(&mut conn, &request, &mut engine, CancellationToken::new())
            .await
            .unwrap();

        let (stdout, stderr, app_status) = collect_response(&mut client).await;
        assert!(String::from_utf8(stdout).unwrap().starts_with("Status: 500"));
        assert_eq!(stderr, b"parse error line 1\nparse error line 2\n");
        assert_eq!(app_status, 1);

        std::fs::remove_file(script).unwrap();
    }

    #[tokio::test]
    async fn engine_panic_is_contained() {
        struct PanickingEngine;
        impl ScriptEngine for PanickingEngine {
            fn compile(
                &mut self, _path: &Path, source: &[u8],
            ) -> Result<CompiledScript, Vec<String>> {
                Ok(CompiledScript::new(source.to_vec()))
            }
            fn execute(
                &mut self, _script: &CompiledScript, _ctx: &mut ExecContext,
            ) -> Result<(), String> {
                panic!("stack blown");
            }
        }

        let script = temp_script("panic.php", b"boom");
        let (mut client, server) = duplex(8192);
        let mut conn = FcgiConnection::new(server);
        let mut engine = PanickingEngine;

        let request = request_with(&[("SCRIPT_FILENAME", script.to_str().unwrap())], b"");
        let handled = RequestHandler::new()
            .handle(&mut conn, &request, &mut engine, CancellationToken::new())
            .await
            .unwrap();
        assert!(handled.engine_panicked);
        assert_eq!(handled.exit_code, 1);

        let (_, stderr, app_status) = collect_response(&mut client).await;
        assert_eq!(stderr, b"stack blown\n");
        assert_eq!(app_status, 1);

        std::fs::remove_file(script).unwrap();
    }
}
