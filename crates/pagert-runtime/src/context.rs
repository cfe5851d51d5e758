//! Per-request response state and the one-shot finalize procedure.

use std::collections::BTreeMap;

use crate::ledger::FinalizeLatch;
use crate::logging::Logger;
use crate::uploads::UploadLedger;

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;
pub const STATUS_PAYLOAD_TOO_LARGE: u16 = 413;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

const FAILURE_BODY: &str = "500 Internal Server Error";
const TIMEOUT_BODY: &str = "413 Request Entity Too Large";
const BAD_REQUEST_BODY: &str = "400 Bad Request";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The page function threw.
    Script,
    /// An operation failed with no error handler attached.
    Operation,
    /// An onSuccess/onError handler or deferred callback threw.
    Handler,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Script => "script",
            FailureKind::Operation => "operation",
            FailureKind::Handler => "handler",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: FailureKind,
    pub message: String,
    pub location: Option<String>,
}

impl Failure {
    pub fn cause(&self) -> String {
        match &self.location {
            Some(loc) => format!("{} (at {loc})", self.message),
            None => self.message.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeCause {
    /// The pending-operation set drained.
    Drained,
    /// The request timeout fired.
    Timeout,
    /// The request body could not be parsed; the page never ran.
    BadRequest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Per-request response state. Mutations are ignored once finalized.
#[derive(Debug)]
pub struct RequestContext {
    output: Vec<Vec<u8>>,
    headers: BTreeMap<String, String>,
    status: u16,
    last_failure: Option<Failure>,
    uploads: UploadLedger,
    finalized: FinalizeLatch,
}

impl RequestContext {
    pub fn new(uploads: UploadLedger) -> Self {
        RequestContext {
            output: Vec::new(),
            headers: BTreeMap::new(),
            status: STATUS_OK,
            last_failure: None,
            uploads,
            finalized: FinalizeLatch::new(),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_closed()
    }

    pub fn write(&mut self, fragment: impl Into<Vec<u8>>) {
        if self.is_finalized() {
            return;
        }
        self.output.push(fragment.into());
    }

    pub fn set_status(&mut self, status: u16) {
        if self.is_finalized() {
            return;
        }
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        if self.is_finalized() {
            return;
        }
        self.headers
            .insert(name.trim().to_ascii_lowercase(), value.into());
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.trim().to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn output_len(&self) -> usize {
        self.output.iter().map(Vec::len).sum()
    }

    /// Overwrites any earlier failure: the most recently recorded one wins.
    pub fn record_failure(&mut self, failure: Failure) {
        if self.is_finalized() {
            return;
        }
        self.last_failure = Some(failure);
    }

    pub fn last_failure(&self) -> Option<&Failure> {
        self.last_failure.as_ref()
    }

    pub fn uploads(&self) -> &UploadLedger {
        &self.uploads
    }

    /// Runs the finalize procedure. Only the first call produces a response.
    pub fn finalize(
        &mut self,
        cause: FinalizeCause,
        logger: &dyn Logger,
        site: &str,
    ) -> Option<Response> {
        if !self.finalized.close() {
            return None;
        }

        self.uploads.purge(logger, site);

        let output = std::mem::take(&mut self.output);
        let response = match cause {
            FinalizeCause::Timeout => generic_response(STATUS_PAYLOAD_TOO_LARGE, TIMEOUT_BODY),
            FinalizeCause::BadRequest => generic_response(STATUS_BAD_REQUEST, BAD_REQUEST_BODY),
            FinalizeCause::Drained if self.last_failure.is_some() => {
                generic_response(STATUS_INTERNAL_ERROR, FAILURE_BODY)
            }
            FinalizeCause::Drained => Response {
                status: self.status,
                headers: std::mem::take(&mut self.headers),
                body: output.concat(),
            },
        };
        self.status = response.status;
        Some(response)
    }
}

fn generic_response(status: u16, body: &str) -> Response {
    let mut headers = BTreeMap::new();
    headers.insert(
        "content-type".to_string(),
        "text/plain; charset=utf-8".to_string(),
    );
    Response {
        status,
        headers,
        body: body.as_bytes().to_vec(),
    }
}
