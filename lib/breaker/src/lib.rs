//! Client-side throttling after the Google SRE book: instead of a binary
//! open/closed state, requests are rejected with a probability that grows
//! with the observed failure rate, so recovery is continuous and needs no
//! half-open machinery.

#[macro_use]
extern crate tracing;

mod google;
mod proba;
mod window;

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::panic::resume_unwind;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use parking_lot::Mutex;

use crate::google::GoogleBreaker;
use crate::window::ErrorWindow;

/// Returned when the breaker rejects a request outright.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct ServiceUnavailable;

/// The error of a guarded call: either the breaker refused to run it, or
/// the underlying request failed on its own.
#[derive(Debug, thiserror::Error)]
pub enum CallError<E> {
    #[error("circuit breaker is open")]
    Open,
    #[error("{0}")]
    Inner(E),
}

/// A per-endpoint client-side throttle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Breaker {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    google: GoogleBreaker,
    err_win: ErrorWindow,
}

impl Breaker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                google: GoogleBreaker::new(),
                err_win: ErrorWindow::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Checks if a request may proceed. On success the caller must resolve
    /// the returned promise with `accept` or `reject`.
    pub fn allow(&self) -> Result<Promise, ServiceUnavailable> {
        match self.inner.google.accept() {
            Ok(()) => Ok(Promise {
                inner: Arc::clone(&self.inner),
            }),
            Err(err) => {
                self.log_open();
                Err(err)
            }
        }
    }

    /// Runs `req` under the breaker. `acceptable` decides whether an error
    /// still counts as a successful call (e.g. a business-level rejection).
    /// A panic inside `req` is recorded as a failure and resumed.
    pub async fn call<T, E, F, A>(&self, req: F, acceptable: A) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
        A: Fn(&E) -> bool,
        E: Display,
    {
        self.call_with_fallback(req, None::<fn(ServiceUnavailable) -> Result<T, E>>, acceptable)
            .await
    }

    /// Like [`Breaker::call`], but when the breaker is open the fallback
    /// produces the result instead of `CallError::Open`.
    pub async fn call_with_fallback<T, E, F, FB, A>(
        &self,
        req: F,
        fallback: Option<FB>,
        acceptable: A,
    ) -> Result<T, CallError<E>>
    where
        F: Future<Output = Result<T, E>>,
        FB: FnOnce(ServiceUnavailable) -> Result<T, E>,
        A: Fn(&E) -> bool,
        E: Display,
    {
        if let Err(open) = self.inner.google.accept() {
            self.log_open();
            return match fallback {
                Some(fallback) => fallback(open).map_err(CallError::Inner),
                None => Err(CallError::Open),
            };
        }

        match std::panic::AssertUnwindSafe(req).catch_unwind().await {
            Err(panic) => {
                self.inner.google.mark_failure();
                resume_unwind(panic);
            }
            Ok(Ok(value)) => {
                self.inner.google.mark_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                if acceptable(&err) {
                    self.inner.google.mark_success();
                } else {
                    self.inner.err_win.add(&err.to_string());
                    self.inner.google.mark_failure();
                }
                Err(CallError::Inner(err))
            }
        }
    }

    fn log_open(&self) {
        // if the breaker is open the error window cannot be empty
        error!(
            message = "breaker is open, requests dropped",
            name = %self.inner.name,
            last_errors = %self.inner.err_win,
        );
    }
}

/// The caller-side half of an admitted request. Exactly one of `accept`
/// or `reject` must be called.
pub struct Promise {
    inner: Arc<Inner>,
}

impl Promise {
    pub fn accept(self) {
        self.inner.google.mark_success();
    }

    pub fn reject(self, reason: &str) {
        self.inner.err_win.add(reason);
        self.inner.google.mark_failure();
    }
}

static BREAKERS: OnceLock<Mutex<HashMap<String, Breaker>>> = OnceLock::new();

/// Returns the process-wide breaker registered under `name`, creating it
/// on first use. Callers hitting the same endpoint share throttle state.
pub fn get_or_create(name: &str) -> Breaker {
    let breakers = BREAKERS.get_or_init(|| Mutex::new(HashMap::new()));
    let mut breakers = breakers.lock();
    match breakers.get(name) {
        Some(breaker) => breaker.clone(),
        None => {
            let breaker = Breaker::new(name);
            breakers.insert(name.to_string(), breaker.clone());
            breaker
        }
    }
}
