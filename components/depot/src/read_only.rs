use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::err::{Error, ReadOnlySnafu, Result};

type Listener = Box<dyn Fn(&Error) + Send + Sync>;

/// Tracks whether the depot has hit an unrecoverable error.
///
/// The first error wins and is kept forever; every later mutating call
/// fails with [`Error::ReadOnly`] wrapping it. Listeners run once, when
/// the mode is entered.
#[derive(Default)]
pub struct ReadOnlyNotifier {
    error:     Mutex<Option<Arc<Error>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl ReadOnlyNotifier {
    pub fn new() -> Arc<Self> { Arc::new(Self::default()) }

    pub fn is_read_only(&self) -> bool { self.error.lock().is_some() }

    pub fn error(&self) -> Option<Arc<Error>> { self.error.lock().clone() }

    /// Register `listener`. If already read-only it is told immediately.
    pub fn listen(&self, listener: impl Fn(&Error) + Send + Sync + 'static) {
        if let Some(err) = self.error() {
            listener(&err);
        }
        self.listeners.lock().push(Box::new(listener));
    }

    /// Enter read-only mode because of `err`. Returns the error to hand
    /// back to the caller.
    pub fn enter(&self, err: Error) -> Error {
        let shared = {
            let mut slot = self.error.lock();
            if let Some(first) = slot.as_ref() {
                return ReadOnlySnafu {
                    cause: first.clone(),
                }
                .build();
            }
            let shared = Arc::new(err);
            *slot = Some(shared.clone());
            shared
        };
        error!("entering read-only mode: {shared}");
        for listener in self.listeners.lock().iter() {
            listener(&shared);
        }
        ReadOnlySnafu { cause: shared }.build()
    }

    /// Fail if read-only.
    pub fn check(&self) -> Result<()> {
        match self.error() {
            Some(cause) => ReadOnlySnafu { cause }.fail(),
            None => Ok(()),
        }
    }
}
