//! Send operation state machine
//!
//! `Idle -> Sending -> {Sent | Failed} -> Idle`. Only one send may be in
//! flight; the operation owns a single timeout and a cancellation token.
//! Cancelling only resets client state, it does not abort the request.

use crate::error::{Error, Result};
use crate::message::{FileAttachment, Message};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Observable phase of the send operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Idle,
    Sending,
}

/// A send that has been accepted and must now be delivered
#[derive(Debug, Clone)]
pub struct PendingSend {
    pub placeholder: Message,
    pub cancel: CancellationToken,
}

impl PendingSend {
    pub fn temp_id(&self) -> &str {
        &self.placeholder.id
    }
}

/// How a delivery attempt ended
#[derive(Debug)]
pub enum SendOutcome {
    Sent(Message),
    TimedOut,
    Cancelled,
    Failed(Error),
}

impl SendOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self, SendOutcome::Sent(_))
    }
}

#[derive(Debug)]
enum State {
    Idle,
    Sending {
        temp_id: String,
        text: String,
        cancel: CancellationToken,
    },
}

/// Guards the one in-flight send and remembers what to restore on failure
#[derive(Debug)]
pub struct SendController {
    state: State,
    next_seq: u64,
}

impl Default for SendController {
    fn default() -> Self {
        Self::new()
    }
}

impl SendController {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            next_seq: 0,
        }
    }

    pub fn phase(&self) -> SendPhase {
        match self.state {
            State::Idle => SendPhase::Idle,
            State::Sending { .. } => SendPhase::Sending,
        }
    }

    pub fn is_sending(&self) -> bool {
        self.phase() == SendPhase::Sending
    }

    /// Temp id of the send in flight
    pub fn in_flight(&self) -> Option<&str> {
        match &self.state {
            State::Idle => None,
            State::Sending { temp_id, .. } => Some(temp_id),
        }
    }

    /// Start a send; `None` if one is already in flight or there is nothing to send
    pub fn begin(
        &mut self,
        text: &str,
        file: Option<FileAttachment>,
        now: DateTime<Utc>,
    ) -> Option<PendingSend> {
        if self.is_sending() {
            debug!("send already in flight, ignoring submit");
            return None;
        }
        let text = text.trim();
        if text.is_empty() && file.is_none() {
            return None;
        }

        self.next_seq += 1;
        let placeholder = Message::placeholder(text, file, now, self.next_seq);
        let cancel = CancellationToken::new();
        self.state = State::Sending {
            temp_id: placeholder.id.clone(),
            text: text.to_string(),
            cancel: cancel.clone(),
        };
        debug!(temp_id = %placeholder.id, "send started");

        Some(PendingSend { placeholder, cancel })
    }

    /// Server acknowledged; returns false for a stale temp id
    pub fn complete(&mut self, temp_id: &str) -> bool {
        if self.in_flight() != Some(temp_id) {
            warn!(temp_id, "completion for a send that is no longer in flight");
            return false;
        }
        self.state = State::Idle;
        info!(temp_id, "send confirmed");
        true
    }

    /// Send failed or timed out; hands back the text for the input box
    pub fn fail(&mut self, temp_id: &str) -> Option<String> {
        if self.in_flight() != Some(temp_id) {
            return None;
        }
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Sending { text, .. } => Some(text),
            State::Idle => None,
        }
    }

    /// Client-side reset of the send in flight
    pub fn cancel(&mut self) -> Option<String> {
        match std::mem::replace(&mut self.state, State::Idle) {
            State::Sending { temp_id, text, cancel } => {
                cancel.cancel();
                info!(temp_id = %temp_id, "send cancelled");
                Some(text)
            }
            State::Idle => None,
        }
    }
}

/// Drive one delivery with the operation's single timer
pub async fn run_with_timeout<F>(fut: F, timeout: Duration, cancel: CancellationToken) -> SendOutcome
where
    F: Future<Output = Result<Message>>,
{
    tokio::select! {
        _ = cancel.cancelled() => SendOutcome::Cancelled,
        result = tokio::time::timeout(timeout, fut) => match result {
            Ok(Ok(message)) => SendOutcome::Sent(message),
            Ok(Err(e)) => SendOutcome::Failed(e),
            Err(_) => SendOutcome::TimedOut,
        },
    }
}
