//! Page request runtime.
//!
//! Runs a compiled page for one request, tracks every filesystem operation the
//! page starts, applies each operation's success/error handlers under
//! containment, overlays a request timeout, guards page sources inside the
//! site's content root, and finalizes exactly one response.
//!
//! - [`PageEngine`]: drives a request end to end
//! - [`PageRuntime`]: the handle pages and handlers work through
//! - [`Operation`] / [`Deferred`]: outstanding work and its handlers
//! - [`guard::permit`]: the extension access policy

pub mod body;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod guard;
pub mod ledger;
pub mod logging;
pub mod outcome;
pub mod runtime;
pub mod timeout;
pub mod uploads;

mod fsops;

pub use body::{PageRequest, Params, RequestBody};
pub use config::{SiteConfig, SiteSettings};
pub use context::{Failure, FailureKind, Response};
pub use engine::{
    CompiledPage, PageCompiler, PageEngine, PageFunction, RequestReport, ResponseSink,
};
pub use error::{BodyError, ErrorCode, OpError, ScriptError};
pub use guard::OperationKind;
pub use ledger::OpId;
pub use logging::{LogLevel, LogLine, Logger, MemoryLogger, TracingLogger};
pub use outcome::{Deferred, Operation};
pub use runtime::PageRuntime;
pub use uploads::UploadFile;
