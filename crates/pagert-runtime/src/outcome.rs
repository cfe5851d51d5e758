//! Operation outcome contract.
//!
//! | outcome | onSuccess | onError | effect                                           |
//! |---------|-----------|---------|--------------------------------------------------|
//! | success | yes       | -       | run onSuccess; a throw becomes the last failure  |
//! | success | no        | -       | nothing                                          |
//! | failure | -         | yes     | run onError; a throw becomes the last failure    |
//! | failure | -         | no      | the operation error becomes the last failure     |
//!
//! Each handler runs contained: a throw or panic only affects the request's last
//! failure. A throw inside onSuccess is never routed to onError. The operation is
//! settled afterwards whatever the handler did.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;

use crate::context::{Failure, FailureKind};
use crate::error::{OpError, ScriptError};
use crate::ledger::OpId;
use crate::runtime::PageRuntime;

pub type SuccessHandler<T> =
    Box<dyn FnOnce(&mut PageRuntime, T) -> Result<(), ScriptError> + Send + 'static>;
pub type ErrorHandler =
    Box<dyn FnOnce(&mut PageRuntime, OpError) -> Result<(), ScriptError> + Send + 'static>;

struct Handlers<T> {
    on_success: Option<SuccessHandler<T>>,
    on_error: Option<ErrorHandler>,
}

type Slot<T> = Arc<Mutex<Handlers<T>>>;

fn new_slot<T>() -> Slot<T> {
    Arc::new(Mutex::new(Handlers {
        on_success: None,
        on_error: None,
    }))
}

fn take_handlers<T>(slot: &Slot<T>) -> Handlers<T> {
    let mut guard = match slot.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    Handlers {
        on_success: guard.on_success.take(),
        on_error: guard.on_error.take(),
    }
}

/// Handle to a started operation. Handlers may be attached until the operation
/// settles; they are read only at settlement time.
pub struct Operation<T> {
    id: OpId,
    slot: Slot<T>,
}

impl<T> Operation<T> {
    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn on_success<F>(self, handler: F) -> Self
    where
        F: FnOnce(&mut PageRuntime, T) -> Result<(), ScriptError> + Send + 'static,
    {
        self.with_handlers(|h| h.on_success = Some(Box::new(handler)));
        self
    }

    pub fn on_error<F>(self, handler: F) -> Self
    where
        F: FnOnce(&mut PageRuntime, OpError) -> Result<(), ScriptError> + Send + 'static,
    {
        self.with_handlers(|h| h.on_error = Some(Box::new(handler)));
        self
    }

    fn with_handlers(&self, f: impl FnOnce(&mut Handlers<T>)) {
        match self.slot.lock() {
            Ok(mut guard) => f(&mut guard),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }
}

impl<T> std::fmt::Debug for Operation<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation").field("id", &self.id).finish()
    }
}

type SettleFn = Box<dyn FnOnce(&mut PageRuntime) -> Option<Failure> + Send + 'static>;

/// A settled operation on its way back to the request loop.
pub(crate) struct Completion {
    pub(crate) id: OpId,
    settle: SettleFn,
}

impl Completion {
    /// Applies the outcome contract and returns the failure to record, if any.
    pub(crate) fn run(self, rt: &mut PageRuntime) -> (OpId, Option<Failure>) {
        let failure = (self.settle)(rt);
        (self.id, failure)
    }
}

pub(crate) type CompletionSender = UnboundedSender<Completion>;

/// Pairs an operation handle with the sender half its worker uses to report back.
pub(crate) struct Pending<T> {
    id: OpId,
    slot: Slot<T>,
    tx: CompletionSender,
}

impl<T: Send + 'static> Pending<T> {
    pub(crate) fn new(id: OpId, tx: CompletionSender) -> (Self, Operation<T>) {
        let slot = new_slot();
        let op = Operation {
            id,
            slot: slot.clone(),
        };
        (Pending { id, slot, tx }, op)
    }

    /// Reports the result. A send error means the request already finalized.
    pub(crate) fn finish(self, result: Result<T, OpError>) {
        let slot = self.slot;
        let _ = self.tx.send(Completion {
            id: self.id,
            settle: Box::new(move |rt| resolve(rt, take_handlers(&slot), result)),
        });
    }
}

fn resolve<T>(rt: &mut PageRuntime, handlers: Handlers<T>, result: Result<T, OpError>) -> Option<Failure> {
    match result {
        Ok(value) => {
            let handler = handlers.on_success?;
            contain(|| handler(rt, value))
                .err()
                .map(|e| script_failure(FailureKind::Handler, e))
        }
        Err(err) => match handlers.on_error {
            Some(handler) => contain(|| handler(rt, err))
                .err()
                .map(|e| script_failure(FailureKind::Handler, e)),
            None => Some(Failure {
                kind: FailureKind::Operation,
                message: err.to_string(),
                location: None,
            }),
        },
    }
}

/// Runs page code, turning a panic into a [`ScriptError`].
pub(crate) fn contain<F>(f: F) -> Result<(), ScriptError>
where
    F: FnOnce() -> Result<(), ScriptError>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(panic) => {
            let message = if let Some(message) = panic.downcast_ref::<&str>() {
                format!("panic: {message}")
            } else if let Some(message) = panic.downcast_ref::<String>() {
                format!("panic: {message}")
            } else {
                "panic".to_string()
            };
            Err(ScriptError::new(message))
        }
    }
}

pub(crate) fn script_failure(kind: FailureKind, err: ScriptError) -> Failure {
    Failure {
        kind,
        message: err.message,
        location: err.location,
    }
}

/// Deferred-completion registrar: a pending operation the page completes itself.
///
/// `complete` runs its callback under the same containment as operation handlers
/// and then settles. Dropping a `Deferred` without completing it settles the
/// operation with no callback.
pub struct Deferred {
    id: OpId,
    tx: Option<CompletionSender>,
}

impl Deferred {
    pub(crate) fn new(id: OpId, tx: CompletionSender) -> Self {
        Deferred { id, tx: Some(tx) }
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    pub fn complete<F>(mut self, callback: F)
    where
        F: FnOnce(&mut PageRuntime) -> Result<(), ScriptError> + Send + 'static,
    {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Completion {
                id: self.id,
                settle: Box::new(move |rt| {
                    contain(|| callback(rt))
                        .err()
                        .map(|e| script_failure(FailureKind::Handler, e))
                }),
            });
        }
    }
}

impl Drop for Deferred {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Completion {
                id: self.id,
                settle: Box::new(|_| None),
            });
        }
    }
}

impl std::fmt::Debug for Deferred {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("id", &self.id)
            .field("completed", &self.tx.is_none())
            .finish()
    }
}
