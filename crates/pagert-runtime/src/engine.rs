//! Request execution engine.
//!
//! One call to [`PageEngine::serve`] drives a whole request: parse the body under
//! the timeout overlay, run the compiled page once, then settle operations until
//! the ledger drains or the deadline passes. Exactly one response reaches the
//! sink.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::body::{BodyParser, PageRequest, Params};
use crate::config::SiteSettings;
use crate::context::{Failure, FailureKind, FinalizeCause, RequestContext, Response};
use crate::error::ScriptError;
use crate::ledger::Settled;
use crate::logging::{LogLevel, Logger, TracingLogger};
use crate::outcome::{contain, script_failure};
use crate::runtime::PageRuntime;
use crate::timeout::TimeoutOverlay;
use crate::uploads::UploadLedger;

/// A compiled page: called once per request with the runtime handle.
pub trait PageFunction: Send + Sync {
    fn call(&self, rt: &mut PageRuntime) -> Result<(), ScriptError>;
}

impl<F> PageFunction for F
where
    F: Fn(&mut PageRuntime) -> Result<(), ScriptError> + Send + Sync,
{
    fn call(&self, rt: &mut PageRuntime) -> Result<(), ScriptError> {
        self(rt)
    }
}

#[derive(Clone)]
pub struct CompiledPage {
    pub path: PathBuf,
    pub function: Arc<dyn PageFunction>,
}

impl CompiledPage {
    pub fn new<F>(path: impl Into<PathBuf>, function: F) -> Self
    where
        F: PageFunction + 'static,
    {
        CompiledPage {
            path: path.into(),
            function: Arc::new(function),
        }
    }
}

impl std::fmt::Debug for CompiledPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPage")
            .field("path", &self.path)
            .finish()
    }
}

/// Turns page source into a [`CompiledPage`].
pub trait PageCompiler {
    type Error: std::error::Error + Send + Sync + 'static;

    fn compile(&self, path: &Path, source: &[u8]) -> Result<CompiledPage, Self::Error>;
}

/// Receives the finalized response.
pub trait ResponseSink: Send {
    fn send(&mut self, response: Response);
}

impl ResponseSink for Vec<Response> {
    fn send(&mut self, response: Response) {
        self.push(response);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestReport {
    pub status: u16,
    pub timed_out: bool,
    pub bad_request: bool,
    pub failure: Option<Failure>,
    /// Operations registered over the request, including the page body itself.
    pub operations: u64,
    /// Operations still outstanding when the response was sent.
    pub pending_at_finalize: usize,
    pub uploads: usize,
}

pub struct PageEngine {
    site: Arc<SiteSettings>,
    logger: Arc<dyn Logger>,
}

impl PageEngine {
    pub fn new(site: SiteSettings) -> Self {
        PageEngine {
            site: Arc::new(site),
            logger: Arc::new(TracingLogger),
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn site(&self) -> &SiteSettings {
        &self.site
    }

    /// Serves one request and returns the response together with its report.
    pub async fn respond(&self, page: &CompiledPage, request: PageRequest) -> (Response, RequestReport) {
        let mut sent: Vec<Response> = Vec::with_capacity(1);
        let report = self.serve(page, request, &mut sent).await;
        let response = sent.pop().unwrap_or_else(|| Response {
            status: report.status,
            headers: Default::default(),
            body: Vec::new(),
        });
        (response, report)
    }

    pub async fn serve<S: ResponseSink>(
        &self,
        page: &CompiledPage,
        mut request: PageRequest,
        sink: &mut S,
    ) -> RequestReport {
        let uploads = UploadLedger::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut overlay = TimeoutOverlay::arm(self.site.request_timeout());

        let mut rt = PageRuntime::new(
            self.site.clone(),
            self.logger.clone(),
            page.path.clone(),
            request.method.clone(),
            request.path().to_string(),
            RequestContext::new(uploads.clone()),
            tx,
        );
        let mut report = RequestReport {
            status: 0,
            timed_out: false,
            bad_request: false,
            failure: None,
            operations: 0,
            pending_at_finalize: 0,
            uploads: 0,
        };

        let mut params = Params::from_query(request.query().unwrap_or(""));
        let body = request.body.take();
        let mut parser = BodyParser::new(
            request.content_type(),
            body,
            self.site.upload_dir.clone(),
            uploads,
        );
        let parsed = tokio::select! {
            biased;
            _ = overlay.expired() => None,
            parsed = parser.parse() => Some(parsed),
        };
        match parsed {
            None => {
                let response = overlay.expire(&mut rt, Some(&mut parser));
                report.timed_out = true;
                return self.deliver(rt, response, sink, report);
            }
            Some(Err(err)) => {
                rt.log(LogLevel::Warn, &format!("rejecting request body: {err}"));
                overlay.disarm();
                let response = rt.finalize(FinalizeCause::BadRequest);
                report.bad_request = true;
                return self.deliver(rt, response, sink, report);
            }
            Some(Ok(body)) => {
                params.extend(body.params);
                rt.set_request_data(params, body.raw);
            }
        }
        drop(parser);

        // The page body is a pending operation like any other.
        let top = rt.register();
        if let Err(err) = contain(|| page.function.call(&mut rt)) {
            rt.record_failure(script_failure(FailureKind::Script, err));
        }
        let mut response = None;
        if rt.settle(top) == Settled::Drained {
            overlay.disarm();
            response = rt.finalize(FinalizeCause::Drained);
        }

        while !rt.is_finalized() {
            tokio::select! {
                biased;
                _ = overlay.expired() => {
                    response = overlay.expire(&mut rt, None);
                    report.timed_out = true;
                }
                Some(completion) = rx.recv() => {
                    let (id, failure) = completion.run(&mut rt);
                    if let Some(failure) = failure {
                        rt.record_failure(failure);
                    }
                    if rt.settle(id) == Settled::Drained {
                        overlay.disarm();
                        response = rt.finalize(FinalizeCause::Drained);
                    }
                }
                else => break,
            }
        }

        self.deliver(rt, response, sink, report)
    }

    fn deliver<S: ResponseSink>(
        &self,
        rt: PageRuntime,
        response: Option<Response>,
        sink: &mut S,
        mut report: RequestReport,
    ) -> RequestReport {
        let ctx = rt.context();
        report.failure = ctx.last_failure().cloned();
        report.operations = rt.operations_started();
        report.pending_at_finalize = rt.pending_operations();
        report.uploads = ctx.uploads().len();
        report.status = response.as_ref().map(|r| r.status).unwrap_or(ctx.status());
        match response {
            Some(response) => sink.send(response),
            None => rt.log(
                LogLevel::Error,
                "request ended without a finalized response",
            ),
        }
        report
    }
}

impl std::fmt::Debug for PageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageEngine")
            .field("site", &self.site.name)
            .finish()
    }
}
