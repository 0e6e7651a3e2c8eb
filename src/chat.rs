//! Chat conversation state and the session loop that feeds it
//!
//! `ChatView` is the single owner of the displayed message list. The session
//! loop serializes history, push, poll and send completions onto it, so each
//! reconciliation step is atomic even though the sources race.

use crate::api::ApiClient;
use crate::config::Config;
use crate::error::Result;
use crate::hub::{ConnectionStatus, HubConnection, HubEvent};
use crate::message::{FileAttachment, Message, RawMessage};
use crate::reconciler::{self, OwnMessagePolicy, Source};
use crate::send::{self, PendingSend, SendController, SendOutcome};
use chrono::{DateTime, Utc};
use std::future::Future;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Data access the session needs from the backend
pub trait ChatBackend: Clone + Send + Sync + 'static {
    fn fetch_history(&self, peer_id: &str) -> impl Future<Output = Option<Vec<Message>>> + Send;
    fn send_message(
        &self,
        receiver_id: &str,
        text: &str,
        file: Option<&FileAttachment>,
    ) -> impl Future<Output = Result<Message>> + Send;
    fn online_status(&self, user_id: &str) -> impl Future<Output = bool> + Send;
}

impl ChatBackend for ApiClient {
    fn fetch_history(&self, peer_id: &str) -> impl Future<Output = Option<Vec<Message>>> + Send {
        ApiClient::fetch_history(self, peer_id)
    }

    fn send_message(
        &self,
        receiver_id: &str,
        text: &str,
        file: Option<&FileAttachment>,
    ) -> impl Future<Output = Result<Message>> + Send {
        ApiClient::send_message(self, receiver_id, text, file)
    }

    fn online_status(&self, user_id: &str) -> impl Future<Output = bool> + Send {
        ApiClient::online_status(self, user_id)
    }
}

/// One conversation with a peer
#[derive(Debug)]
pub struct ChatView {
    me: String,
    peer: String,
    messages: Vec<Message>,
    sender: SendController,
    draft: String,
    connection: ConnectionStatus,
    peer_online: bool,
    policy: OwnMessagePolicy,
    last_error: Option<String>,
}

/// Render-ready copy of the view
#[derive(Debug, Clone, PartialEq)]
pub struct ChatSnapshot {
    pub messages: Vec<Message>,
    pub pending_id: Option<String>,
    pub draft: String,
    pub sending: bool,
    pub connection: ConnectionStatus,
    pub peer_online: bool,
    pub last_error: Option<String>,
}

impl Default for ChatSnapshot {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            pending_id: None,
            draft: String::new(),
            sending: false,
            connection: ConnectionStatus::Disconnected,
            peer_online: false,
            last_error: None,
        }
    }
}

impl ChatView {
    pub fn new(me: impl Into<String>, peer: impl Into<String>, policy: OwnMessagePolicy) -> Self {
        Self {
            me: me.into(),
            peer: peer.into(),
            messages: Vec::new(),
            sender: SendController::new(),
            draft: String::new(),
            connection: ConnectionStatus::Disconnected,
            peer_online: false,
            policy,
            last_error: None,
        }
    }

    pub fn me(&self) -> &str {
        &self.me
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The optimistic entry of the send in flight
    pub fn pending(&self) -> Option<&Message> {
        let temp_id = self.sender.in_flight()?;
        self.messages.iter().find(|m| m.id == temp_id)
    }

    pub fn draft(&self) -> &str {
        &self.draft
    }

    pub fn is_sending(&self) -> bool {
        self.sender.is_sending()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.connection
    }

    pub fn peer_online(&self) -> bool {
        self.peer_online
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn snapshot(&self) -> ChatSnapshot {
        ChatSnapshot {
            messages: self.messages.clone(),
            pending_id: self.sender.in_flight().map(str::to_string),
            draft: self.draft.clone(),
            sending: self.is_sending(),
            connection: self.connection,
            peer_online: self.peer_online,
            last_error: self.last_error.clone(),
        }
    }

    /// Initial load; a placeholder in flight survives the replacement
    pub fn apply_history(&mut self, batch: Option<Vec<Message>>) {
        if batch.is_none() {
            return;
        }
        let pending = self.pending().cloned();
        self.messages = reconciler::merge(&self.messages, batch, Source::History, self.policy);
        if let Some(placeholder) = pending {
            self.messages = reconciler::insert_local(&self.messages, placeholder);
        }
        debug!(count = self.messages.len(), "history applied");
    }

    /// Pushed message; messages of other conversations are dropped
    pub fn apply_push(&mut self, raw: RawMessage, now: DateTime<Utc>) {
        if let Some(sender_id) = raw.sender_id.as_deref() {
            if sender_id != self.peer && sender_id != self.me {
                debug!(sender = %sender_id, "push for another conversation");
                return;
            }
        }
        let msg = raw.into_message(&self.me, now);
        self.messages = reconciler::merge(&self.messages, Some(vec![msg]), Source::Push, self.policy);
    }

    pub fn apply_poll(&mut self, batch: Option<Vec<Message>>) {
        self.messages = reconciler::merge(&self.messages, batch, Source::Poll, self.policy);
    }

    pub fn apply_presence(&mut self, user_id: &str, online: bool) {
        if user_id == self.peer {
            self.peer_online = online;
        }
    }

    pub fn set_peer_online(&mut self, online: bool) {
        self.peer_online = online;
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        if self.connection != status {
            info!(from = %self.connection, to = %status, "chat hub status changed");
        }
        self.connection = status;
    }

    /// User pressed send; `None` when ignored
    pub fn submit(
        &mut self,
        text: &str,
        file: Option<FileAttachment>,
        now: DateTime<Utc>,
    ) -> Option<PendingSend> {
        let pending = self.sender.begin(text, file, now)?;
        self.messages = reconciler::insert_local(&self.messages, pending.placeholder.clone());
        self.draft.clear();
        self.last_error = None;
        Some(pending)
    }

    /// Apply the result of a delivery attempt
    pub fn on_send_outcome(&mut self, temp_id: &str, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Sent(confirmed) => {
                self.sender.complete(temp_id);
                self.messages = reconciler::confirm(&self.messages, temp_id, confirmed);
            }
            failure => {
                let reason = match &failure {
                    SendOutcome::TimedOut => "send timed out".to_string(),
                    SendOutcome::Cancelled => "send cancelled".to_string(),
                    SendOutcome::Failed(e) => format!("send failed: {}", e),
                    SendOutcome::Sent(_) => unreachable!(),
                };
                warn!(temp_id, %reason, "send did not go through");
                self.messages = reconciler::discard(&self.messages, temp_id);
                if let Some(text) = self.sender.fail(temp_id) {
                    self.draft = text;
                    self.last_error = Some(reason);
                }
            }
        }
    }

    /// Client-side reset of a stuck send
    pub fn cancel_send(&mut self) {
        let temp_id = self.sender.in_flight().map(str::to_string);
        if let Some(text) = self.sender.cancel() {
            if let Some(temp_id) = temp_id {
                self.messages = reconciler::discard(&self.messages, &temp_id);
            }
            self.draft = text;
        }
    }
}

/// Input from the user side of the session
#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Send(String),
    /// Already uploaded file, with an optional caption
    SendFile { file: FileAttachment, caption: String },
    Cancel,
    Quit,
}

enum Completion {
    Poll(Option<Vec<Message>>),
    Presence(bool),
    Send { temp_id: String, outcome: SendOutcome },
}

enum HubUpdate {
    Event(HubEvent),
    Status(ConnectionStatus),
    Closed,
}

/// Drives one `ChatView` from all sources
pub struct ChatSession<B: ChatBackend> {
    backend: B,
    config: Config,
    view: ChatView,
}

impl<B: ChatBackend> ChatSession<B> {
    pub fn new(backend: B, config: &Config, me: &str, peer: &str) -> Self {
        let policy = if config.adopt_own_from_poll {
            OwnMessagePolicy::AdoptFromOtherDevices
        } else {
            OwnMessagePolicy::KeepLocal
        };
        Self {
            backend,
            config: config.clone(),
            view: ChatView::new(me, peer, policy),
        }
    }

    /// Run until `Quit` or the command channel closes; returns the final view
    pub async fn run(
        mut self,
        mut commands: mpsc::Receiver<ChatCommand>,
        mut hub: Option<HubConnection>,
        updates: watch::Sender<ChatSnapshot>,
    ) -> ChatView {
        let peer = self.view.peer().to_string();
        info!(peer = %peer, "chat session starting");

        if let Some(h) = &hub {
            self.view.set_connection_status(h.status());
        }
        let history = self.backend.fetch_history(&peer).await;
        self.view.apply_history(history);
        let online = self.backend.online_status(&peer).await;
        self.view.set_peer_online(online);
        let _ = updates.send(self.view.snapshot());

        let (done_tx, mut done_rx) = mpsc::channel::<Completion>(16);
        let mut message_poll = tokio::time::interval(self.config.message_poll_interval());
        let mut status_poll = tokio::time::interval(self.config.status_poll_interval());
        message_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        status_poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // first ticks fire immediately and the initial load already happened
        message_poll.tick().await;
        status_poll.tick().await;

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(ChatCommand::Send(text)) => self.start_send(&text, None, &done_tx),
                    Some(ChatCommand::SendFile { file, caption }) => {
                        self.start_send(&caption, Some(file), &done_tx)
                    }
                    Some(ChatCommand::Cancel) => self.view.cancel_send(),
                    Some(ChatCommand::Quit) | None => break,
                },
                update = next_hub_update(&mut hub) => match update {
                    HubUpdate::Event(HubEvent::Message(raw)) => self.view.apply_push(raw, Utc::now()),
                    HubUpdate::Event(HubEvent::Presence { user_id, online }) => {
                        self.view.apply_presence(&user_id, online)
                    }
                    HubUpdate::Status(status) => self.view.set_connection_status(status),
                    HubUpdate::Closed => {
                        if let Some(h) = hub.take() {
                            self.view.set_connection_status(h.status());
                            h.close().await;
                        }
                    }
                },
                _ = message_poll.tick() => {
                    let backend = self.backend.clone();
                    let tx = done_tx.clone();
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        let batch = backend.fetch_history(&peer).await;
                        let _ = tx.send(Completion::Poll(batch)).await;
                    });
                }
                _ = status_poll.tick() => {
                    let backend = self.backend.clone();
                    let tx = done_tx.clone();
                    let peer = peer.clone();
                    tokio::spawn(async move {
                        let online = backend.online_status(&peer).await;
                        let _ = tx.send(Completion::Presence(online)).await;
                    });
                }
                Some(done) = done_rx.recv() => match done {
                    Completion::Poll(batch) => self.view.apply_poll(batch),
                    Completion::Presence(online) => self.view.set_peer_online(online),
                    Completion::Send { temp_id, outcome } => self.view.on_send_outcome(&temp_id, outcome),
                },
            }
            let _ = updates.send(self.view.snapshot());
        }

        self.view.cancel_send();
        if let Some(h) = hub {
            h.close().await;
        }
        info!(peer = %peer, "chat session ended");
        self.view
    }

    fn start_send(
        &mut self,
        text: &str,
        file: Option<FileAttachment>,
        done: &mpsc::Sender<Completion>,
    ) {
        let Some(pending) = self.view.submit(text, file, Utc::now()) else {
            return;
        };

        let backend = self.backend.clone();
        let tx = done.clone();
        let peer = self.view.peer().to_string();
        let timeout = self.config.send_timeout();
        let temp_id = pending.temp_id().to_string();
        let body = pending.placeholder.text.clone();
        let file = pending.placeholder.file.clone();
        tokio::spawn(async move {
            let outcome = send::run_with_timeout(
                backend.send_message(&peer, &body, file.as_ref()),
                timeout,
                pending.cancel,
            )
            .await;
            let _ = tx.send(Completion::Send { temp_id, outcome }).await;
        });
    }
}

async fn next_hub_update(hub: &mut Option<HubConnection>) -> HubUpdate {
    let Some(h) = hub.as_mut() else {
        return std::future::pending().await;
    };
    let status_changed = tokio::select! {
        event = h.events.recv() => {
            return match event {
                Some(event) => HubUpdate::Event(event),
                None => HubUpdate::Closed,
            };
        }
        changed = h.status.changed() => changed.is_ok(),
    };
    if status_changed {
        HubUpdate::Status(*h.status.borrow_and_update())
    } else {
        HubUpdate::Closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::message::{Sender, Status};
    use chrono::{Duration, TimeZone};
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn msg(id: &str, secs: i64, sender: Sender) -> Message {
        Message {
            id: id.to_string(),
            text: format!("text {}", id),
            sent_at: Some(t(secs)),
            received_at: t(0),
            sender,
            status: Status::Sent,
            file: None,
        }
    }

    fn raw(value: serde_json::Value) -> RawMessage {
        serde_json::from_value(value).unwrap()
    }

    fn view() -> ChatView {
        ChatView::new("me", "peer", OwnMessagePolicy::KeepLocal)
    }

    #[test]
    fn test_submit_while_sending_is_noop() {
        let mut v = view();
        v.apply_history(Some(vec![msg("1", 1, Sender::Other)]));
        assert!(v.submit("first", None, t(10)).is_some());
        let before = v.messages().to_vec();

        assert!(v.submit("second", None, t(11)).is_none());
        assert_eq!(v.messages(), before.as_slice());
        assert_eq!(v.messages().iter().filter(|m| m.is_temporary()).count(), 1);
    }

    #[test]
    fn test_send_confirmation_replaces_placeholder() {
        let mut v = view();
        let pending = v.submit("hello", None, t(5)).unwrap();
        assert_eq!(v.pending().map(|m| m.id.as_str()), Some(pending.temp_id()));

        v.on_send_outcome(pending.temp_id(), SendOutcome::Sent(msg("X", 5, Sender::Me)));
        assert_eq!(v.messages().iter().filter(|m| m.id == "X").count(), 1);
        assert!(!v.messages().iter().any(|m| m.is_temporary()));
        assert!(!v.is_sending());
        assert!(v.pending().is_none());
    }

    #[test]
    fn test_send_failure_restores_draft() {
        let mut v = view();
        let pending = v.submit("did it work", None, t(5)).unwrap();
        v.on_send_outcome(pending.temp_id(), SendOutcome::TimedOut);
        assert!(v.messages().is_empty());
        assert_eq!(v.draft(), "did it work");
        assert_eq!(v.last_error(), Some("send timed out"));
        assert!(!v.is_sending());

        let pending = v.submit("again", None, t(6)).unwrap();
        v.on_send_outcome(pending.temp_id(), SendOutcome::Failed(Error::Unauthorized));
        assert!(v.last_error().unwrap().contains("Unauthorized"));
    }

    #[test]
    fn test_cancel_send_resets() {
        let mut v = view();
        v.submit("stuck", None, t(5)).unwrap();
        v.cancel_send();
        assert!(!v.is_sending());
        assert!(v.messages().is_empty());
        assert_eq!(v.draft(), "stuck");
    }

    #[test]
    fn test_stale_cancel_outcome_leaves_resubmitted_send_alone() {
        let mut v = view();
        let first = v.submit("one", None, t(5)).unwrap();
        v.cancel_send();
        let second = v.submit("two", None, t(5)).unwrap();
        assert_ne!(first.temp_id(), second.temp_id());

        v.on_send_outcome(first.temp_id(), SendOutcome::Cancelled);
        assert!(v.is_sending());
        assert_eq!(v.pending().map(|m| m.id.as_str()), Some(second.temp_id()));
        assert_eq!(v.messages().len(), 1);
        assert_eq!(v.draft(), "");
        assert!(v.last_error().is_none());
    }

    #[test]
    fn test_late_confirmation_after_cancel_still_lands_once() {
        let mut v = view();
        let pending = v.submit("slow", None, t(5)).unwrap();
        v.cancel_send();
        v.on_send_outcome(pending.temp_id(), SendOutcome::Sent(msg("S", 5, Sender::Me)));
        let ids: Vec<_> = v.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["S"]);
    }

    #[test]
    fn test_history_keeps_pending_placeholder() {
        let mut v = view();
        let pending = v.submit("hi", None, t(50)).unwrap();
        v.apply_history(Some(vec![msg("1", 1, Sender::Other)]));
        assert_eq!(v.messages().len(), 2);
        assert_eq!(v.messages()[1].id, pending.temp_id());
    }

    #[test]
    fn test_malformed_history_keeps_list() {
        let mut v = view();
        v.apply_history(Some(vec![msg("1", 1, Sender::Other)]));
        v.apply_history(None);
        v.apply_poll(None);
        assert_eq!(v.messages().len(), 1);
    }

    #[test]
    fn test_push_filters_other_conversations_and_self() {
        let mut v = view();
        v.apply_push(raw(json!({"id": 1, "senderId": "stranger", "content": "x"})), t(1));
        assert!(v.messages().is_empty());

        v.apply_push(raw(json!({"id": 2, "senderId": "me", "content": "echo"})), t(2));
        assert!(v.messages().is_empty());

        v.apply_push(raw(json!({"id": 3, "senderId": "peer", "content": "hey"})), t(3));
        v.apply_push(raw(json!({"id": 3, "senderId": "peer", "content": "hey"})), t(3));
        assert_eq!(v.messages().len(), 1);
        assert_eq!(v.messages()[0].sender, Sender::Other);
    }

    #[test]
    fn test_push_and_poll_race_no_duplicates() {
        let mut v = view();
        v.apply_poll(Some(vec![msg("7", 7, Sender::Other)]));
        v.apply_push(raw(json!({"id": 7, "senderId": "peer", "sentAt": "2024-06-03T10:00:07Z"})), t(8));
        v.apply_poll(Some(vec![msg("7", 7, Sender::Other)]));
        assert_eq!(v.messages().len(), 1);
    }

    #[test]
    fn test_presence_only_for_peer() {
        let mut v = view();
        v.apply_presence("someone", true);
        assert!(!v.peer_online());
        v.apply_presence("peer", true);
        assert!(v.peer_online());
    }

    #[derive(Clone)]
    struct FakeBackend {
        history: Arc<Mutex<Vec<Message>>>,
        next_id: Arc<Mutex<u32>>,
        online: bool,
    }

    impl FakeBackend {
        fn new(history: Vec<Message>) -> Self {
            Self {
                history: Arc::new(Mutex::new(history)),
                next_id: Arc::new(Mutex::new(100)),
                online: true,
            }
        }
    }

    impl ChatBackend for FakeBackend {
        fn fetch_history(&self, _peer_id: &str) -> impl Future<Output = Option<Vec<Message>>> + Send {
            let history = self.history.lock().unwrap().clone();
            async move { Some(history) }
        }

        fn send_message(
            &self,
            _receiver_id: &str,
            text: &str,
            file: Option<&FileAttachment>,
        ) -> impl Future<Output = Result<Message>> + Send {
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            let stored = Message {
                id: next.to_string(),
                text: text.to_string(),
                sent_at: Some(Utc::now()),
                received_at: Utc::now(),
                sender: Sender::Me,
                status: Status::Sent,
                file: file.cloned(),
            };
            self.history.lock().unwrap().push(stored.clone());
            async move { Ok(stored) }
        }

        fn online_status(&self, _user_id: &str) -> impl Future<Output = bool> + Send {
            let online = self.online;
            async move { online }
        }
    }

    #[tokio::test]
    async fn test_session_loads_history_and_sends() {
        let temp = std::env::temp_dir();
        let config = Config::for_test(&temp);
        let backend = FakeBackend::new(vec![msg("1", 1, Sender::Other)]);
        let session = ChatSession::new(backend, &config, "me", "peer");

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (update_tx, mut update_rx) = watch::channel(ChatSnapshot::default());
        let handle = tokio::spawn(session.run(cmd_rx, None, update_tx));

        update_rx
            .wait_for(|s| s.messages.len() == 1 && s.peer_online)
            .await
            .unwrap();

        cmd_tx.send(ChatCommand::Send("hello".to_string())).await.unwrap();
        let snapshot = update_rx
            .wait_for(|s| s.messages.iter().any(|m| m.id == "101"))
            .await
            .unwrap()
            .clone();
        assert!(!snapshot.sending);
        assert!(!snapshot.messages.iter().any(|m| m.is_temporary()));

        cmd_tx.send(ChatCommand::Quit).await.unwrap();
        let view = handle.await.unwrap();
        assert_eq!(view.messages().len(), 2);
    }

    #[tokio::test]
    async fn test_session_sends_attachment_without_caption() {
        let config = Config::for_test(&std::env::temp_dir());
        let session = ChatSession::new(FakeBackend::new(Vec::new()), &config, "me", "peer");

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let (update_tx, mut update_rx) = watch::channel(ChatSnapshot::default());
        let handle = tokio::spawn(session.run(cmd_rx, None, update_tx));

        let file = FileAttachment {
            name: "cv.pdf".to_string(),
            size: 2048,
            mime_type: "application/pdf".to_string(),
            url: "https://cdn.example.com/uploads/cv.pdf".to_string(),
        };
        cmd_tx
            .send(ChatCommand::SendFile {
                file: file.clone(),
                caption: String::new(),
            })
            .await
            .unwrap();
        let snapshot = update_rx
            .wait_for(|s| s.messages.iter().any(|m| m.id == "101"))
            .await
            .unwrap()
            .clone();
        assert_eq!(snapshot.messages[0].file.as_ref(), Some(&file));
        assert_eq!(snapshot.messages[0].text, "");

        cmd_tx.send(ChatCommand::Quit).await.unwrap();
        handle.await.unwrap();
    }
}
