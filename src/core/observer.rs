use serde_json::Value;

use super::message::Failure;

/// Receives the items of a payload sequence.
///
/// `on_complete` fires when one envelope's payload ends, not when the
/// listener itself goes away. Failures only reach observers that report
/// `handles_errors()`.
pub trait Observer: Send + Sync {
    fn on_next(&self, value: &Value);

    fn on_error(&self, _error: &Failure) {}

    fn on_complete(&self) {}

    fn handles_errors(&self) -> bool {
        false
    }
}

type NextFn = Box<dyn Fn(&Value) + Send + Sync>;
type ErrorFn = Box<dyn Fn(&Failure) + Send + Sync>;
type CompleteFn = Box<dyn Fn() + Send + Sync>;

/// Closure-backed [`Observer`].
///
/// ```
/// use waltz::core::Listener;
///
/// let listener = Listener::new(|value| println!("got {value}"))
///     .with_error(|error| eprintln!("failed: {error}"));
/// ```
pub struct Listener {
    next: NextFn,
    error: Option<ErrorFn>,
    complete: Option<CompleteFn>,
}

impl Listener {
    pub fn new<F>(next: F) -> Self
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        Self {
            next: Box::new(next),
            error: None,
            complete: None,
        }
    }

    /// Attach an error handler; without one, error envelopes are not delivered.
    pub fn with_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Failure) + Send + Sync + 'static,
    {
        self.error = Some(Box::new(handler));
        self
    }

    pub fn with_complete<F>(mut self, handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.complete = Some(Box::new(handler));
        self
    }
}

impl Observer for Listener {
    fn on_next(&self, value: &Value) {
        (self.next)(value);
    }

    fn on_error(&self, error: &Failure) {
        if let Some(handler) = &self.error {
            handler(error);
        }
    }

    fn on_complete(&self) {
        if let Some(handler) = &self.complete {
            handler();
        }
    }

    fn handles_errors(&self) -> bool {
        self.error.is_some()
    }
}
