//! The handle a compiled page (and each of its handlers) works through.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::body::Params;
use crate::config::SiteSettings;
use crate::context::{Failure, FinalizeCause, RequestContext, Response};
use crate::error::{ErrorCode, OpError};
use crate::fsops::{self, FsScope};
use crate::ledger::{OpId, PendingLedger, Settled};
use crate::logging::{runtime_error_line, LogLevel, Logger};
use crate::outcome::{CompletionSender, Deferred, Operation, Pending};
use crate::uploads::UploadFile;

pub struct PageRuntime {
    site: Arc<SiteSettings>,
    logger: Arc<dyn Logger>,
    page_path: PathBuf,
    method: String,
    url_path: String,
    params: Params,
    raw_body: Vec<u8>,
    ctx: RequestContext,
    ledger: PendingLedger,
    scope: FsScope,
    completions: CompletionSender,
}

impl PageRuntime {
    pub(crate) fn new(
        site: Arc<SiteSettings>,
        logger: Arc<dyn Logger>,
        page_path: PathBuf,
        method: String,
        url_path: String,
        ctx: RequestContext,
        completions: CompletionSender,
    ) -> Self {
        let base_dir = page_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| site.content_root.clone());
        let scope = FsScope {
            content_root: site.content_root.clone(),
            allow_executable: site.allow_executable_extensions,
            base_dir,
        };
        PageRuntime {
            site,
            logger,
            page_path,
            method,
            url_path,
            params: Params::default(),
            raw_body: Vec::new(),
            ctx,
            ledger: PendingLedger::new(),
            scope,
            completions,
        }
    }

    // Output.

    pub fn echo(&mut self, fragment: impl Into<Vec<u8>>) {
        self.ctx.write(fragment);
    }

    pub fn set_status(&mut self, status: u16) {
        self.ctx.set_status(status);
    }

    pub fn status(&self) -> u16 {
        self.ctx.status()
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.ctx.set_header(name, value);
    }

    pub fn is_finalized(&self) -> bool {
        self.ctx.is_finalized()
    }

    // Request data.

    pub fn site(&self) -> &SiteSettings {
        &self.site
    }

    pub fn page_path(&self) -> &Path {
        &self.page_path
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn url_path(&self) -> &str {
        &self.url_path
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    pub fn raw_body(&self) -> &[u8] {
        &self.raw_body
    }

    pub fn uploads(&self, field: &str) -> Vec<Arc<UploadFile>> {
        self.ctx.uploads().by_field(field)
    }

    pub fn all_uploads(&self) -> Vec<Arc<UploadFile>> {
        self.ctx.uploads().files()
    }

    pub fn pending_operations(&self) -> usize {
        self.ledger.pending()
    }

    // Operations.

    pub fn read_file(&mut self, path: impl AsRef<Path>) -> Operation<Vec<u8>> {
        let path = path.as_ref().to_path_buf();
        self.spawn_fs(move |scope| fsops::read(scope, &path))
    }

    pub fn read_to_string(&mut self, path: impl AsRef<Path>) -> Operation<String> {
        let path = path.as_ref().to_path_buf();
        self.spawn_fs(move |scope| fsops::read_to_string(scope, &path))
    }

    pub fn copy_file(&mut self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Operation<()> {
        let (from, to) = (from.as_ref().to_path_buf(), to.as_ref().to_path_buf());
        self.spawn_fs(move |scope| fsops::copy(scope, &from, &to))
    }

    pub fn move_file(&mut self, from: impl AsRef<Path>, to: impl AsRef<Path>) -> Operation<()> {
        let (from, to) = (from.as_ref().to_path_buf(), to.as_ref().to_path_buf());
        self.spawn_fs(move |scope| fsops::rename(scope, &from, &to))
    }

    pub fn delete_file(&mut self, path: impl AsRef<Path>) -> Operation<()> {
        let path = path.as_ref().to_path_buf();
        self.spawn_fs(move |scope| fsops::remove(scope, &path))
    }

    pub fn exists(&mut self, path: impl AsRef<Path>) -> Operation<bool> {
        let path = path.as_ref().to_path_buf();
        self.spawn_fs(move |scope| fsops::exists(scope, &path))
    }

    /// Moves an uploaded file to a permanent location; succeeds with the final path.
    /// The upload is consumed either way, so finalize will not delete it again.
    pub fn relocate_upload(&mut self, upload: &UploadFile, to: impl AsRef<Path>) -> Operation<PathBuf> {
        let to = to.as_ref().to_path_buf();
        let Some(temp) = upload.take() else {
            let temp_path = upload.temp_path.clone();
            return self.spawn_fs(move |_| Err(OpError::new(ErrorCode::NotFound, "rename", temp_path)));
        };
        self.spawn_fs(move |scope| fsops::relocate(scope, temp, &to))
    }

    /// A timer operation that succeeds after `duration`.
    pub fn sleep(&mut self, duration: Duration) -> Operation<()> {
        let id = self.ledger.register();
        let (pending, op) = Pending::new(id, self.completions.clone());
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            pending.finish(Ok(()));
        });
        op
    }

    /// Registers a pending operation the page completes itself, possibly from
    /// another task or thread.
    pub fn defer(&mut self) -> Deferred {
        let id = self.ledger.register();
        Deferred::new(id, self.completions.clone())
    }

    fn spawn_fs<T, W>(&mut self, work: W) -> Operation<T>
    where
        T: Send + 'static,
        W: FnOnce(&FsScope) -> Result<T, OpError> + Send + 'static,
    {
        let id = self.ledger.register();
        let (pending, op) = Pending::new(id, self.completions.clone());
        let scope = self.scope.clone();
        tokio::task::spawn_blocking(move || pending.finish(work(&scope)));
        op
    }

    // Engine-facing.

    pub(crate) fn set_request_data(&mut self, params: Params, raw_body: Vec<u8>) {
        self.params = params;
        self.raw_body = raw_body;
    }

    pub(crate) fn register(&mut self) -> OpId {
        self.ledger.register()
    }

    pub(crate) fn settle(&mut self, id: OpId) -> Settled {
        self.ledger.settle(id)
    }

    pub(crate) fn operations_started(&self) -> u64 {
        self.ledger.registered()
    }

    pub(crate) fn context(&self) -> &RequestContext {
        &self.ctx
    }

    /// Records (and logs) a failure. The most recent failure wins.
    pub(crate) fn record_failure(&mut self, failure: Failure) {
        if self.ctx.is_finalized() {
            return;
        }
        let line = runtime_error_line(&self.site.name, &self.page_path, &failure.cause());
        self.log(LogLevel::Error, &line);
        self.ctx.record_failure(failure);
    }

    pub(crate) fn log(&self, level: LogLevel, line: &str) {
        self.logger.log(level, &self.site.name, line);
    }

    pub(crate) fn purge_uploads(&self) -> usize {
        self.ctx.uploads().purge(self.logger.as_ref(), &self.site.name)
    }

    pub(crate) fn finalize(&mut self, cause: FinalizeCause) -> Option<Response> {
        self.ctx
            .finalize(cause, self.logger.as_ref(), &self.site.name)
    }
}

impl std::fmt::Debug for PageRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRuntime")
            .field("site", &self.site.name)
            .field("page_path", &self.page_path)
            .field("method", &self.method)
            .field("url_path", &self.url_path)
            .field("pending", &self.ledger.pending())
            .field("finalized", &self.ctx.is_finalized())
            .finish()
    }
}
