//! JSON page programs.
//!
//! A page program is an ordered list of steps. Synchronous steps write output or
//! throw; asynchronous steps start a runtime operation and may carry
//! `on_success` / `on_error` step lists that run when it settles. An omitted list
//! attaches no handler, an empty list attaches one that does nothing.
//!
//! ```json
//! {
//!   "schema_version": "pagert.page@0.1.0",
//!   "steps": [
//!     {"op": "read_file", "path": "motd.txt", "echo_contents": true,
//!      "on_error": [{"op": "echo", "text": "no motd: "}, {"op": "echo_error"}]}
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use pagert_contracts::PAGE_PROGRAM_SCHEMA_VERSION;
use pagert_runtime::{
    CompiledPage, Operation, PageCompiler, PageFunction, PageRuntime, ScriptError,
};
use serde::Deserialize;
use serde_json::Value;

const MAX_SLEEP_MS: u64 = 86_400_000;

#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("page program is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("page program schema_version mismatch: expected {expected} got {found:?}")]
    SchemaVersion {
        expected: &'static str,
        found: String,
    },
    #[error("{path}: {message}")]
    Step { path: String, message: String },
}

fn step_error(path: &str, message: impl Into<String>) -> CompileError {
    CompileError::Step {
        path: path.to_string(),
        message: message.into(),
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct ProgramDoc {
    schema_version: String,
    steps: Vec<Value>,
}

#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", deny_unknown_fields)]
enum RawStep {
    Echo {
        text: String,
    },
    EchoParam {
        name: String,
        #[serde(default)]
        default: String,
    },
    SetStatus {
        status: u16,
    },
    SetHeader {
        name: String,
        value: String,
    },
    Throw {
        message: String,
    },
    EchoResult {},
    EchoError {},
    ReadFile {
        path: String,
        #[serde(default)]
        echo_contents: bool,
    },
    CopyFile {
        from: String,
        to: String,
    },
    MoveFile {
        from: String,
        to: String,
    },
    DeleteFile {
        path: String,
    },
    Exists {
        path: String,
    },
    RelocateUpload {
        field: String,
        to: String,
    },
    Sleep {
        ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Page,
    OnSuccess,
    OnError,
}

#[derive(Debug, Clone)]
enum Step {
    Echo(String),
    EchoParam { name: String, default: String },
    SetStatus(u16),
    SetHeader { name: String, value: String },
    Throw { message: String, location: String },
    EchoResult,
    EchoError,
    Async { op: AsyncOp, handlers: Handlers },
}

#[derive(Debug, Clone)]
enum AsyncOp {
    ReadFile { path: String, echo_contents: bool },
    CopyFile { from: String, to: String },
    MoveFile { from: String, to: String },
    DeleteFile { path: String },
    Exists { path: String },
    RelocateUpload { field: String, to: String, location: String },
    Sleep { ms: u64 },
}

#[derive(Debug, Clone, Default)]
struct Handlers {
    on_success: Option<Arc<[Step]>>,
    on_error: Option<Arc<[Step]>>,
}

impl Handlers {
    fn is_empty(&self) -> bool {
        self.on_success.is_none() && self.on_error.is_none()
    }
}

/// A compiled page program.
#[derive(Debug, Clone)]
pub struct ProgramPage {
    steps: Arc<[Step]>,
}

impl ProgramPage {
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl PageFunction for ProgramPage {
    fn call(&self, rt: &mut PageRuntime) -> Result<(), ScriptError> {
        run_steps(rt, &self.steps, &Outcome::Page)
    }
}

/// Compiles JSON page programs into [`CompiledPage`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProgramCompiler;

impl PageCompiler for ProgramCompiler {
    type Error = CompileError;

    fn compile(&self, path: &Path, source: &[u8]) -> Result<CompiledPage, CompileError> {
        let page = compile_program(path, source)?;
        Ok(CompiledPage::new(path, page))
    }
}

pub fn compile_program(path: &Path, source: &[u8]) -> Result<ProgramPage, CompileError> {
    let doc: ProgramDoc = serde_json::from_slice(source)?;
    if doc.schema_version.trim() != PAGE_PROGRAM_SCHEMA_VERSION {
        return Err(CompileError::SchemaVersion {
            expected: PAGE_PROGRAM_SCHEMA_VERSION,
            found: doc.schema_version,
        });
    }
    let label = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let steps = compile_steps(&doc.steps, "steps", Scope::Page, &label)?;
    Ok(ProgramPage {
        steps: steps.into(),
    })
}

fn compile_steps(
    values: &[Value],
    prefix: &str,
    scope: Scope,
    label: &str,
) -> Result<Vec<Step>, CompileError> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| compile_step(value, &format!("{prefix}[{i}]"), scope, label))
        .collect()
}

fn compile_step(
    value: &Value,
    path: &str,
    scope: Scope,
    label: &str,
) -> Result<Step, CompileError> {
    let Value::Object(map) = value else {
        return Err(step_error(path, "step must be an object"));
    };
    let mut map = map.clone();
    let on_success = map.remove("on_success");
    let on_error = map.remove("on_error");
    let raw: RawStep =
        serde_json::from_value(Value::Object(map)).map_err(|e| step_error(path, e.to_string()))?;

    let handlers = Handlers {
        on_success: handler_list(on_success, path, "on_success", Scope::OnSuccess, label)?,
        on_error: handler_list(on_error, path, "on_error", Scope::OnError, label)?,
    };
    let op = match raw {
        RawStep::Echo { text } => return sync_step(Step::Echo(text), &handlers, path),
        RawStep::EchoParam { name, default } => {
            return sync_step(Step::EchoParam { name, default }, &handlers, path)
        }
        RawStep::SetStatus { status } => {
            if !(100..=599).contains(&status) {
                return Err(step_error(path, format!("status must be 100..599 (got {status})")));
            }
            return sync_step(Step::SetStatus(status), &handlers, path);
        }
        RawStep::SetHeader { name, value } => {
            if name.trim().is_empty() {
                return Err(step_error(path, "header name must be non-empty"));
            }
            return sync_step(Step::SetHeader { name, value }, &handlers, path);
        }
        RawStep::Throw { message } => {
            let location = format!("{label}:{path}");
            return sync_step(Step::Throw { message, location }, &handlers, path);
        }
        RawStep::EchoResult {} => {
            if scope != Scope::OnSuccess {
                return Err(step_error(path, "echo_result is only valid inside on_success"));
            }
            return sync_step(Step::EchoResult, &handlers, path);
        }
        RawStep::EchoError {} => {
            if scope != Scope::OnError {
                return Err(step_error(path, "echo_error is only valid inside on_error"));
            }
            return sync_step(Step::EchoError, &handlers, path);
        }
        RawStep::ReadFile {
            path: file,
            echo_contents,
        } => AsyncOp::ReadFile {
            path: file,
            echo_contents,
        },
        RawStep::CopyFile { from, to } => AsyncOp::CopyFile { from, to },
        RawStep::MoveFile { from, to } => AsyncOp::MoveFile { from, to },
        RawStep::DeleteFile { path: file } => AsyncOp::DeleteFile { path: file },
        RawStep::Exists { path: file } => AsyncOp::Exists { path: file },
        RawStep::RelocateUpload { field, to } => AsyncOp::RelocateUpload {
            field,
            to,
            location: format!("{label}:{path}"),
        },
        RawStep::Sleep { ms } => {
            if ms > MAX_SLEEP_MS {
                return Err(step_error(path, format!("sleep ms must be <= {MAX_SLEEP_MS}")));
            }
            AsyncOp::Sleep { ms }
        }
    };
    Ok(Step::Async { op, handlers })
}

fn sync_step(step: Step, handlers: &Handlers, path: &str) -> Result<Step, CompileError> {
    if handlers.is_empty() {
        Ok(step)
    } else {
        Err(step_error(path, "only asynchronous steps take on_success/on_error"))
    }
}

fn handler_list(
    value: Option<Value>,
    path: &str,
    key: &str,
    scope: Scope,
    label: &str,
) -> Result<Option<Arc<[Step]>>, CompileError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Array(items)) => {
            let steps = compile_steps(&items, &format!("{path}.{key}"), scope, label)?;
            Ok(Some(steps.into()))
        }
        Some(_) => Err(step_error(
            &format!("{path}.{key}"),
            "handler must be an array of steps",
        )),
    }
}

/// What a step list can see of the operation that triggered it.
enum Outcome<'a> {
    Page,
    Value(&'a [u8]),
    Error(&'a str),
}

fn run_steps(rt: &mut PageRuntime, steps: &[Step], outcome: &Outcome<'_>) -> Result<(), ScriptError> {
    for step in steps {
        match step {
            Step::Echo(text) => rt.echo(text.as_str()),
            Step::EchoParam { name, default } => {
                let value = rt.param(name).unwrap_or(default).to_string();
                rt.echo(value);
            }
            Step::SetStatus(status) => rt.set_status(*status),
            Step::SetHeader { name, value } => rt.set_header(name, value.clone()),
            Step::Throw { message, location } => {
                return Err(ScriptError::new(message.clone()).at(location.clone()));
            }
            Step::EchoResult => {
                if let Outcome::Value(value) = outcome {
                    rt.echo(value.to_vec());
                }
            }
            Step::EchoError => {
                if let Outcome::Error(message) = outcome {
                    rt.echo(*message);
                }
            }
            Step::Async { op, handlers } => start(rt, op, handlers)?,
        }
    }
    Ok(())
}

fn start(rt: &mut PageRuntime, op: &AsyncOp, handlers: &Handlers) -> Result<(), ScriptError> {
    match op {
        AsyncOp::ReadFile {
            path,
            echo_contents,
        } => attach(rt.read_file(path), handlers, *echo_contents, |bytes| bytes),
        AsyncOp::CopyFile { from, to } => {
            attach(rt.copy_file(from, to), handlers, false, |()| Vec::new())
        }
        AsyncOp::MoveFile { from, to } => {
            attach(rt.move_file(from, to), handlers, false, |()| Vec::new())
        }
        AsyncOp::DeleteFile { path } => {
            attach(rt.delete_file(path), handlers, false, |()| Vec::new())
        }
        AsyncOp::Exists { path } => attach(rt.exists(path), handlers, false, |found| {
            found.to_string().into_bytes()
        }),
        AsyncOp::RelocateUpload {
            field,
            to,
            location,
        } => {
            let upload = rt
                .uploads(field)
                .into_iter()
                .find(|upload| !upload.is_released());
            let Some(upload) = upload else {
                return Err(ScriptError::new(format!("no upload in field '{field}'"))
                    .at(location.clone()));
            };
            attach(
                rt.relocate_upload(&upload, to),
                handlers,
                false,
                |dest: PathBuf| dest.display().to_string().into_bytes(),
            )
        }
        AsyncOp::Sleep { ms } => attach(
            rt.sleep(Duration::from_millis(*ms)),
            handlers,
            false,
            |()| Vec::new(),
        ),
    }
    Ok(())
}

fn attach<T: Send + 'static>(
    op: Operation<T>,
    handlers: &Handlers,
    echo_value: bool,
    render: fn(T) -> Vec<u8>,
) {
    let op = if echo_value || handlers.on_success.is_some() {
        let steps = handlers.on_success.clone();
        op.on_success(move |rt, value| {
            let value = render(value);
            if echo_value {
                rt.echo(value.clone());
            }
            match &steps {
                Some(steps) => run_steps(rt, steps, &Outcome::Value(&value)),
                None => Ok(()),
            }
        })
    } else {
        op
    };
    if let Some(steps) = handlers.on_error.clone() {
        op.on_error(move |rt, err| run_steps(rt, &steps, &Outcome::Error(&err.to_string())));
    }
}
