//! Request timeout overlay.
//!
//! Bounds how long a request may stay unfinalized, chiefly to cut off slow body
//! uploads. When it fires it wins against every operation still in flight.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tokio::time::Sleep;

use crate::body::BodyParser;
use crate::context::{FinalizeCause, Response};
use crate::logging::{timeout_line, LogLevel};
use crate::runtime::PageRuntime;

pub struct TimeoutOverlay {
    sleep: Option<Pin<Box<Sleep>>>,
    limit_seconds: u64,
    fired: bool,
}

impl TimeoutOverlay {
    /// Arms the overlay; `None` never fires.
    pub fn arm(limit: Option<Duration>) -> Self {
        TimeoutOverlay {
            sleep: limit.map(|d| Box::pin(tokio::time::sleep(d))),
            limit_seconds: limit.map(|d| d.as_secs()).unwrap_or(0),
            fired: false,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.sleep.is_some()
    }

    pub fn has_fired(&self) -> bool {
        self.fired
    }

    pub fn disarm(&mut self) {
        self.sleep = None;
    }

    /// Resolves when the deadline passes. Pending forever once disarmed.
    pub fn expired(&mut self) -> impl Future<Output = ()> + '_ {
        std::future::poll_fn(move |cx| match self.sleep.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx),
            None => std::task::Poll::Pending,
        })
    }

    /// Cancels the body read, purges uploads, logs, and finalizes with 413,
    /// bypassing the pending-operation ledger.
    pub(crate) fn expire(
        &mut self,
        rt: &mut PageRuntime,
        body: Option<&mut BodyParser>,
    ) -> Option<Response> {
        self.fired = true;
        self.disarm();
        if let Some(parser) = body {
            parser.cancel();
        }
        rt.purge_uploads();
        rt.log(LogLevel::Warn, &timeout_line(self.limit_seconds));
        rt.finalize(FinalizeCause::Timeout)
    }
}

impl std::fmt::Debug for TimeoutOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutOverlay")
            .field("armed", &self.is_armed())
            .field("limit_seconds", &self.limit_seconds)
            .field("fired", &self.fired)
            .finish()
    }
}
