use std::sync::{Arc, Mutex};

use crate::error::LinkError;

type DoneCallback = Box<dyn FnOnce(Result<(), LinkError>) + Send + 'static>;

/// A one-shot completion handle.
///
/// Operations that accept a completion settle it exactly once, with success
/// or with a `LinkError`. Done-callbacks added before settlement run at
/// settlement; ones added after run immediately. Callbacks run on whichever
/// thread settles the completion, which for this stack means on the event
/// loop.
#[derive(Clone, Default)]
pub struct Completion {
    inner: Arc<Mutex<CompletionInner>>,
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.done())
            .finish()
    }
}

impl PartialEq for Completion {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[derive(Default)]
struct CompletionInner {
    result: Option<Result<(), LinkError>>,
    callbacks: Vec<DoneCallback>,
}

impl Completion {
    pub fn new() -> Self {
        Completion::default()
    }

    pub fn done(&self) -> bool {
        self.inner.lock().unwrap().result.is_some()
    }

    pub fn result(&self) -> Option<Result<(), LinkError>> {
        self.inner.lock().unwrap().result.clone()
    }

    /// Settle with success. Returns false if already settled.
    pub fn resolve(&self) -> bool {
        self.settle(Ok(()))
    }

    /// Settle with an error. Returns false if already settled.
    pub fn fail(&self, error: LinkError) -> bool {
        self.settle(Err(error))
    }

    pub fn on_done(&self, callback: impl FnOnce(Result<(), LinkError>) + Send + 'static) {
        let mut callback = Some(callback);
        let existing = {
            let mut inner = self.inner.lock().unwrap();
            match &inner.result {
                Some(result) => Some(result.clone()),
                None => {
                    inner.callbacks.push(Box::new(callback.take().unwrap()));
                    None
                }
            }
        };
        if let Some(result) = existing {
            (callback.take().unwrap())(result);
        }
    }

    fn settle(&self, result: Result<(), LinkError>) -> bool {
        let callbacks = {
            let mut inner = self.inner.lock().unwrap();
            if inner.result.is_some() {
                return false;
            }
            inner.result = Some(result.clone());
            std::mem::take(&mut inner.callbacks)
        };
        for callback in callbacks {
            callback(result.clone());
        }
        true
    }
}

/// True if the handle exists and can still take a result.
pub fn completion_ready(completion: Option<&Completion>) -> bool {
    completion.is_some_and(|c| !c.done())
}

/// The wrapper rule shared by device and interface operations: pass a
/// caller's completion through; otherwise mint one when the component was
/// configured to always return one; otherwise fire-and-forget.
pub(crate) fn ensure_completion(
    supplied: Option<Completion>,
    return_future: bool,
) -> Option<Completion> {
    match supplied {
        Some(completion) => Some(completion),
        None if return_future => Some(Completion::new()),
        None => None,
    }
}

/// Ordered collection of completions settled together, used for the open and
/// close queues of a KISS device.
#[derive(Default)]
pub struct CompletionQueue {
    completions: Vec<Completion>,
}

impl CompletionQueue {
    pub fn push(&mut self, completion: Completion) {
        self.completions.push(completion);
    }

    pub fn len(&self) -> usize {
        self.completions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completions.is_empty()
    }

    pub fn resolve_all(&mut self) {
        for completion in self.completions.drain(..) {
            completion.resolve();
        }
    }

    pub fn fail_all(&mut self, error: LinkError) {
        for completion in self.completions.drain(..) {
            completion.fail(error.clone());
        }
    }
}
