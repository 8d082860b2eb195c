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

//! The narrow interface to the script runtime.
//!
//! The process manager has no source-language-specific dependency beyond
//! the shape of the CGI globals it populates: any runtime that can
//! compile a script and execute it against an [`ExecContext`] plugs in
//! here. Each worker owns one engine instance for its whole lifetime.

use crate::cgi::{Globals, ResponseHeaders};
use std::{any::Any, path::Path, sync::Arc};
use tokio_util::sync::CancellationToken;

/// An opaque handle to a parsed and compiled script.
pub struct CompiledScript(Box<dyn Any + Send>);

impl CompiledScript {
    /// Wraps an engine-specific program representation.
    pub fn new<T: Any + Send>(program: T) -> Self {
        Self(Box::new(program))
    }

    /// Recovers the engine-specific program representation.
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref()
    }
}

/// One script execution: globals in, stdout/headers/exit code out.
///
/// The context owns the in-memory buffer the engine's stdout is
/// redirected to, the response header store, and the cancellation token
/// fired when the request deadline elapses.
pub struct ExecContext {
    /// The CGI-like globals reachable from the script
    pub globals: Globals,
    /// The HTTP request headers extracted from the params mapping
    pub request_headers: Vec<(String, String)>,
    /// The HTTP response header store
    pub headers: ResponseHeaders,
    cancel: CancellationToken,
    stdout: Vec<u8>,
    exit_code: u32,
}

impl ExecContext {
    /// Creates a context for one request.
    pub fn new(
        globals: Globals, request_headers: Vec<(String, String)>, cancel: CancellationToken,
    ) -> Self {
        Self {
            globals,
            request_headers,
            headers: ResponseHeaders::default(),
            cancel,
            stdout: Vec::new(),
            exit_code: 0,
        }
    }

    /// Appends bytes to the captured stdout.
    pub fn echo(&mut self, bytes: &[u8]) {
        self.stdout.extend_from_slice(bytes);
    }

    /// Records an explicit exit; the code becomes the request app-status.
    pub fn exit(&mut self, code: u32) {
        self.exit_code = code;
    }

    /// Whether the request deadline has fired. Engines are expected to
    /// poll this at safe points and unwind promptly once it is set.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The exit code; nonzero only after an explicit halt.
    pub fn exit_code(&self) -> u32 {
        self.exit_code
    }

    /// Consumes the context, yielding the captured stdout and the header
    /// store.
    pub fn into_output(self) -> (Vec<u8>, ResponseHeaders, u32) {
        (self.stdout, self.headers, self.exit_code)
    }
}

/// The engine collaborator: parse/compile, then execute in a context.
pub trait ScriptEngine: Send {
    /// Parses and compiles a script. The error side carries the
    /// parse/compile error list, one message per error.
    fn compile(&mut self, path: &Path, source: &[u8]) -> Result<CompiledScript, Vec<String>>;

    /// Executes a compiled script against the context. The error side
    /// carries a runtime error message; output and headers stay in the
    /// context either way.
    fn execute(&mut self, script: &CompiledScript, ctx: &mut ExecContext) -> Result<(), String>;
}

/// Creates one engine instance per worker.
pub type EngineFactory = Arc<dyn Fn() -> Box<dyn ScriptEngine> + Send + Sync>;

/// Reference engine: "compiles" a script by retaining its source and
/// executes by echoing it with default headers. Stands in for a real
/// interpreter runtime in the binary and the test suite.
#[derive(Debug, Default)]
pub struct EchoEngine;

impl EchoEngine {
    /// An [`EngineFactory`] producing `EchoEngine` instances.
    pub fn factory() -> EngineFactory {
        Arc::new(|| Box::new(EchoEngine))
    }
}

impl ScriptEngine for EchoEngine {
    fn compile(&mut self, _path: &Path, source: &[u8]) -> Result<CompiledScript, Vec<String>> {
        Ok(CompiledScript::new(source.to_vec()))
    }

    fn execute(&mut self, script: &CompiledScript, ctx: &mut ExecContext) -> Result<(), String> {
        if ctx.is_cancelled() {
            return Err("execution cancelled before start".to_owned());
        }
        let source: &Vec<u8> = script
            .downcast_ref()
            .ok_or_else(|| "foreign program handle".to_owned())?;
        ctx.headers.set_status(200);
        ctx.echo(source);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::PathBuf;

    #[test]
    fn echo_engine_round_trip() {
        let mut engine = EchoEngine;
        let script = engine
            .compile(&PathBuf::from("/srv/ok.php"), b"OK")
            .unwrap();

        let mut ctx = ExecContext::new(
            Globals::default(),
            Vec::new(),
            CancellationToken::new(),
        );
        engine.execute(&script, &mut ctx).unwrap();

        let (stdout, headers, exit_code) = ctx.into_output();
        assert_eq!(stdout, b"OK");
        assert_eq!(headers.status(), Some(200));
        assert_eq!(exit_code, 0);
    }

    #[test]
    fn cancelled_context_reports_runtime_error() {
        let mut engine = EchoEngine;
        let script = engine.compile(&PathBuf::from("/x"), b"X").unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut ctx = ExecContext::new(Globals::default(), Vec::new(), cancel);
        assert!(engine.execute(&script, &mut ctx).is_err());
    }

    #[test]
    fn process_env_reaches_context() {
        let mut env = HashMap::new();
        env.insert("APP_ENV".to_owned(), "prod".to_owned());
        let globals = crate::cgi::build_globals(
            &HashMap::new(),
            b"",
            &env,
            std::time::SystemTime::now(),
        );
        let ctx = ExecContext::new(globals, Vec::new(), CancellationToken::new());
        assert_eq!(ctx.globals.env["APP_ENV"], "prod");
    }
}
