//! Collaborator capability slots
//!
//! A connection does not know what its collaborator does with messages. The
//! collaborator fills in the slots it supports; an empty text or binary slot
//! reports `UnsupportedMethod` when a frame of that kind arrives.

use crate::errors::StreamError;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::rc::Rc;
use tickstream_core::dispatch::{self, LocalTask, TaskOutcome};

/// Decoded text frame
#[derive(Debug, Clone, PartialEq)]
pub enum TextPayload {
    Json(Value),
    /// Text that failed to parse as JSON, passed through untouched
    Raw(String),
}

impl TextPayload {
    pub fn decode(text: String) -> Self {
        match serde_json::from_str::<Value>(&text) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(text),
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }
}

type ConnectedFn = Rc<dyn Fn() -> LocalTask>;
type TextFn = Rc<dyn Fn(TextPayload) -> LocalTask>;
type BinaryFn = Rc<dyn Fn(Vec<u8>) -> LocalTask>;

#[derive(Clone, Default)]
pub struct Handlers {
    connected: Option<ConnectedFn>,
    text: Option<TextFn>,
    binary: Option<BinaryFn>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called after every successful connect, reconnects included
    pub fn on_connected<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn() -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: TaskOutcome,
    {
        self.connected = Some(Rc::new(move || dispatch::boxed(f())));
        self
    }

    pub fn on_text<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(TextPayload) -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: TaskOutcome,
    {
        self.text = Some(Rc::new(move |payload| dispatch::boxed(f(payload))));
        self
    }

    pub fn on_binary<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + 'static,
        Fut: Future + 'static,
        Fut::Output: TaskOutcome,
    {
        self.binary = Some(Rc::new(move |data| dispatch::boxed(f(data))));
        self
    }

    pub(crate) fn connected(&self) -> LocalTask {
        match &self.connected {
            Some(f) => f(),
            None => Box::pin(async { Ok(()) }),
        }
    }

    pub(crate) fn text(&self, payload: TextPayload) -> LocalTask {
        match &self.text {
            Some(f) => f(payload),
            None => unsupported("process_text"),
        }
    }

    pub(crate) fn binary(&self, data: Vec<u8>) -> LocalTask {
        match &self.binary {
            Some(f) => f(data),
            None => unsupported("process_binary"),
        }
    }
}

fn unsupported(method: &'static str) -> LocalTask {
    Box::pin(async move { Err(StreamError::UnsupportedMethod(method.to_string()).into()) })
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_connected", &self.connected.is_some())
            .field("on_text", &self.text.is_some())
            .field("on_binary", &self.binary.is_some())
            .finish()
    }
}
