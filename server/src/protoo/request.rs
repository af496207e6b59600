use crate::protoo::Message;
use futures::channel::mpsc::UnboundedSender;
use log::*;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};

/// An inbound client request together with its one-shot reply path.
///
/// Exactly one of [`Request::accept`] or [`Request::reject`] sends the matching response;
/// further calls are logged and dropped.
pub struct Request {
    id: u32,
    method: String,
    data: Value,
    sender: UnboundedSender<String>,
    replied: AtomicBool,
}

impl Request {
    pub fn new(id: u32, method: String, data: Value, sender: UnboundedSender<String>) -> Self {
        Self {
            id,
            method,
            data,
            sender,
            replied: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn accept(&self, data: Value) {
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!(
                "accept() | request already replied [method:{}, id:{}]",
                self.method, self.id,
            );
            return;
        }

        let response = Message::ResponseSuccess { id: self.id, data };
        if self.sender.unbounded_send(response.to_json()).is_err() {
            warn!(
                "accept() | response could not be sent [method:{}, id:{}]",
                self.method, self.id,
            );
        }
    }

    pub fn reject(&self, error_code: i64, error_reason: &str) {
        if self.replied.swap(true, Ordering::SeqCst) {
            warn!(
                "reject() | request already replied [method:{}, id:{}]",
                self.method, self.id,
            );
            return;
        }

        let response = Message::ResponseError {
            id: self.id,
            error_code,
            error_reason: error_reason.to_string(),
        };
        if self.sender.unbounded_send(response.to_json()).is_err() {
            warn!(
                "reject() | response could not be sent [method:{}, id:{}]",
                self.method, self.id,
            );
        }
    }
}
