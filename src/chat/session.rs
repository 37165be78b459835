use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

use super::{HistorySource, Message, OrderingPolicy, Transcript};
use crate::credentials::Credential;
use crate::error::{ChatError, Result};
use crate::hub::{HubEvent, HubTransport, InboundMessage};

/// The two ends of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub local_user_id: String,
    pub remote_user_id: String,
}

impl SessionKey {
    pub fn new(local_user_id: impl Into<String>, remote_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            remote_user_id: remote_user_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.local_user_id, self.remote_user_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    NotRequested,
    Loading,
    Loaded(usize),
    Unavailable,
}

/// Something the shell may want to tell the user about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    HistoryLoaded(usize),
    HistoryUnavailable(String),
    MessageReceived,
    Reconnecting(String),
    Reconnected,
    Closed(Option<String>),
}

type HistoryResult = (u64, Result<Vec<Message>>);

/// One live conversation: its connection, its history fetch and its transcript.
pub struct Session<T, H> {
    key: SessionKey,
    transport: T,
    history: Arc<H>,
    state: watch::Sender<SessionState>,
    reconnecting: bool,
    transcript: Transcript,
    history_state: HistoryState,
    // Bumped on every disconnect; results tagged with an older epoch are stale.
    epoch: u64,
    events: Option<mpsc::UnboundedReceiver<HubEvent>>,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    history_rx: mpsc::UnboundedReceiver<HistoryResult>,
}

impl<T, H> Session<T, H>
where
    T: HubTransport,
    H: HistorySource + 'static,
{
    pub fn new(key: SessionKey, transport: T, history: Arc<H>, policy: OrderingPolicy) -> Self {
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            key,
            transport,
            history,
            state,
            reconnecting: false,
            transcript: Transcript::new(policy),
            history_state: HistoryState::NotRequested,
            epoch: 0,
            events: None,
            history_tx,
            history_rx,
        }
    }

    /// Kick off the history fetch, then connect without waiting for it.
    pub async fn start(&mut self, credential: &Credential) -> Result<()> {
        if !self.transcript.is_seeded() && self.history_state != HistoryState::Loading {
            self.load_history(credential);
        }
        self.connect(credential).await
    }

    pub async fn connect(&mut self, credential: &Credential) -> Result<()> {
        if self.state() == SessionState::Connected {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        info!("opening chat session {}", self.key);

        match self.transport.connect(&self.key.local_user_id, credential).await {
            Ok(events) => {
                self.events = Some(events);
                self.reconnecting = false;
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("chat session {} failed to connect: {}", self.key, e);
                self.events = None;
                self.set_state(SessionState::Failed(e.to_string()));
                Err(ChatError::Connect(e))
            }
        }
    }

    /// Tear the connection down. Always ends in `Idle`, whatever the starting state.
    pub async fn disconnect(&mut self) {
        self.events = None;
        self.transport.disconnect().await;
        self.epoch += 1;
        self.reconnecting = false;
        if self.history_state == HistoryState::Loading {
            self.history_state = HistoryState::NotRequested;
        }
        if self.state() != SessionState::Idle {
            info!("closed chat session {}", self.key);
        }
        self.set_state(SessionState::Idle);
    }

    /// Fetch history in the background. The result is applied by `pump` or `await_history`.
    pub fn load_history(&mut self, credential: &Credential) {
        self.history_state = HistoryState::Loading;

        let epoch = self.epoch;
        let history = self.history.clone();
        let tx = self.history_tx.clone();
        let credential = credential.clone();
        let local = self.key.local_user_id.clone();
        let remote = self.key.remote_user_id.clone();

        tokio::spawn(async move {
            let result = history.load_history(&local, &remote, &credential).await;
            let _ = tx.send((epoch, result));
        });
    }

    /// Send `text` to the remote user and show it locally once the hub accepted it.
    ///
    /// Returns `Ok(None)` without touching the hub when the text is blank or the session is
    /// not connected (including while the hub is reconnecting).
    pub async fn send(&mut self, text: &str) -> Result<Option<Message>> {
        if text.trim().is_empty() {
            return Ok(None);
        }
        if !self.can_send() {
            debug!("not connected, ignoring send");
            return Ok(None);
        }

        let time_sent = Utc::now();
        let key = &self.key;
        if let Err(e) = self
            .transport
            .send_message(&key.remote_user_id, &key.local_user_id, text, &time_sent)
            .await
        {
            warn!("message to {} not sent: {}", key.remote_user_id, e);
            return Err(ChatError::Send(e));
        }

        let message = Message::local(&key.local_user_id, &key.remote_user_id, text, time_sent);
        self.transcript.append_local(message.clone());
        Ok(Some(message))
    }

    /// Apply whatever arrived since the last call without waiting.
    pub fn pump(&mut self) -> Vec<SessionUpdate> {
        let mut updates = Vec::new();

        while let Ok((epoch, result)) = self.history_rx.try_recv() {
            updates.extend(self.apply_history(epoch, result));
        }

        loop {
            let Some(events) = self.events.as_mut() else {
                break;
            };
            match events.try_recv() {
                Ok(event) => updates.extend(self.apply_event(event)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    updates.extend(self.apply_event(HubEvent::Closed(Some(
                        "connection ended".to_string(),
                    ))));
                    break;
                }
            }
        }

        updates
    }

    /// Wait for the pending history fetch of the current epoch, if any.
    pub async fn await_history(&mut self) -> Option<SessionUpdate> {
        while self.history_state == HistoryState::Loading {
            let (epoch, result) = self.history_rx.recv().await?;
            if let Some(update) = self.apply_history(epoch, result) {
                return Some(update);
            }
        }
        None
    }

    fn apply_history(&mut self, epoch: u64, result: Result<Vec<Message>>) -> Option<SessionUpdate> {
        if epoch != self.epoch {
            debug!("discarding history from stale session epoch {}", epoch);
            return None;
        }

        match result {
            Ok(messages) => {
                let added = self.transcript.seed(messages);
                self.history_state = HistoryState::Loaded(added);
                Some(SessionUpdate::HistoryLoaded(added))
            }
            Err(e) => {
                warn!("history for {} unavailable: {}", self.key, e);
                self.history_state = HistoryState::Unavailable;
                Some(SessionUpdate::HistoryUnavailable(e.to_string()))
            }
        }
    }

    fn apply_event(&mut self, event: HubEvent) -> Option<SessionUpdate> {
        match event {
            HubEvent::Message(inbound) => self.receive(inbound),
            HubEvent::Reconnecting(reason) => {
                self.reconnecting = true;
                Some(SessionUpdate::Reconnecting(reason))
            }
            HubEvent::Reconnected => {
                self.reconnecting = false;
                Some(SessionUpdate::Reconnected)
            }
            HubEvent::Closed(reason) => {
                self.events = None;
                self.reconnecting = false;
                match &reason {
                    Some(reason) => self.set_state(SessionState::Failed(reason.clone())),
                    None => self.set_state(SessionState::Idle),
                }
                Some(SessionUpdate::Closed(reason))
            }
        }
    }

    fn receive(&mut self, inbound: InboundMessage) -> Option<SessionUpdate> {
        if inbound.sender_id == self.key.local_user_id {
            // Our own send echoed back; the local copy is already shown.
            return None;
        }
        if inbound.sender_id != self.key.remote_user_id {
            debug!("message from {} is not part of {}", inbound.sender_id, self.key);
            return None;
        }

        let message = Message {
            id: None,
            sender_id: inbound.sender_id,
            recipient_id: self.key.local_user_id.clone(),
            content: inbound.content,
            time_sent: inbound.time_sent,
        };
        self.transcript
            .append_live(message)
            .then_some(SessionUpdate::MessageReceived)
    }

    fn set_state(&self, state: SessionState) {
        self.state.send_replace(state);
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Follow state changes from elsewhere (the shell's status line).
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn history_state(&self) -> HistoryState {
        self.history_state
    }

    pub fn is_reconnecting(&self) -> bool {
        self.reconnecting
    }

    pub fn can_send(&self) -> bool {
        self.state() == SessionState::Connected && !self.reconnecting
    }

    pub fn has_listener(&self) -> bool {
        self.events.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use tokio::sync::oneshot;

    use super::*;
    use crate::hub::HubError;

    #[derive(Default)]
    struct Recorder {
        listener: Mutex<Option<mpsc::UnboundedSender<HubEvent>>>,
        sent: Mutex<Vec<(String, String, String)>>,
        connects: Mutex<usize>,
        disconnects: Mutex<usize>,
    }

    impl Recorder {
        fn push(&self, event: HubEvent) {
            if let Some(listener) = self.listener.lock().unwrap().as_ref() {
                let _ = listener.send(event);
            }
        }

        fn active_listeners(&self) -> usize {
            self.listener
                .lock()
                .unwrap()
                .as_ref()
                .map_or(0, |l| usize::from(!l.is_closed()))
        }

        fn sent(&self) -> Vec<(String, String, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[derive(Default)]
    struct FakeHub {
        recorder: Arc<Recorder>,
        refuse_connect: Option<String>,
        refuse_send: bool,
        gate: Option<oneshot::Receiver<()>>,
    }

    #[async_trait]
    impl HubTransport for FakeHub {
        async fn connect(
            &mut self,
            _user_id: &str,
            _credential: &Credential,
        ) -> std::result::Result<mpsc::UnboundedReceiver<HubEvent>, HubError> {
            if let Some(gate) = self.gate.take() {
                let _ = gate.await;
            }
            *self.recorder.connects.lock().unwrap() += 1;
            if let Some(reason) = &self.refuse_connect {
                return Err(HubError::Handshake(reason.clone()));
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.recorder.listener.lock().unwrap() = Some(tx);
            Ok(rx)
        }

        async fn send_message(
            &self,
            recipient_id: &str,
            sender_id: &str,
            content: &str,
            _time_sent: &DateTime<Utc>,
        ) -> std::result::Result<(), HubError> {
            if self.refuse_send {
                return Err(HubError::Invocation("rejected".to_string()));
            }
            self.recorder.sent.lock().unwrap().push((
                recipient_id.to_string(),
                sender_id.to_string(),
                content.to_string(),
            ));
            Ok(())
        }

        async fn disconnect(&mut self) {
            *self.recorder.disconnects.lock().unwrap() += 1;
            self.recorder.listener.lock().unwrap().take();
        }
    }

    /// Hands out queued answers; a gated answer waits until the test releases it.
    #[derive(Default)]
    struct FakeHistory {
        answers: Mutex<VecDeque<(Option<oneshot::Receiver<()>>, std::result::Result<Vec<Message>, String>)>>,
    }

    impl FakeHistory {
        fn answering(answer: std::result::Result<Vec<Message>, String>) -> Arc<Self> {
            let history = Self::default();
            history.answers.lock().unwrap().push_back((None, answer));
            Arc::new(history)
        }

        fn gated(&self, answer: Vec<Message>) -> oneshot::Sender<()> {
            let (tx, rx) = oneshot::channel();
            self.answers.lock().unwrap().push_back((Some(rx), Ok(answer)));
            tx
        }

        fn then(&self, answer: Vec<Message>) {
            self.answers.lock().unwrap().push_back((None, Ok(answer)));
        }
    }

    #[async_trait]
    impl HistorySource for FakeHistory {
        async fn load_history(&self, _: &str, _: &str, _: &Credential) -> Result<Vec<Message>> {
            let next = self.answers.lock().unwrap().pop_front();
            let Some((gate, answer)) = next else {
                return Ok(Vec::new());
            };
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            answer.map_err(ChatError::History)
        }
    }

    fn hi_from_expert() -> Message {
        Message {
            id: Some("1".to_string()),
            sender_id: "E1".to_string(),
            recipient_id: "S1".to_string(),
            content: "Hi".to_string(),
            time_sent: Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap(),
        }
    }

    fn inbound(sender: &str, content: &str) -> HubEvent {
        HubEvent::Message(InboundMessage {
            sender_id: sender.to_string(),
            content: content.to_string(),
            time_sent: Utc::now(),
        })
    }

    fn credential() -> Credential {
        Credential::new("jwt").unwrap()
    }

    fn session(hub: FakeHub, history: Arc<FakeHistory>) -> Session<FakeHub, FakeHistory> {
        Session::new(SessionKey::new("S1", "E1"), hub, history, OrderingPolicy::Arrival)
    }

    #[tokio::test]
    async fn connect_passes_through_connecting_and_registers_one_listener() {
        let recorder = Arc::new(Recorder::default());
        let (open_gate, gate) = oneshot::channel();
        let hub = FakeHub {
            recorder: recorder.clone(),
            gate: Some(gate),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));
        assert_eq!(session.state(), SessionState::Idle);

        let credential = credential();
        let mut states = session.watch_state();
        let observe = async {
            states
                .wait_for(|s| *s == SessionState::Connecting)
                .await
                .unwrap();
            open_gate.send(()).unwrap();
        };
        let (result, _) = tokio::join!(session.connect(&credential), observe);

        result.unwrap();
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.has_listener());
        assert_eq!(recorder.active_listeners(), 1);
    }

    #[tokio::test]
    async fn disconnect_twice_ends_idle() {
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));
        session.connect(&credential()).await.unwrap();

        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Idle);
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Idle);

        assert!(!session.has_listener());
        assert_eq!(recorder.active_listeners(), 0);
        assert_eq!(*recorder.disconnects.lock().unwrap(), 2);
        assert_eq!(*recorder.connects.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn disconnect_from_idle_is_harmless() {
        let mut session = session(FakeHub::default(), FakeHistory::answering(Ok(vec![])));
        session.disconnect().await;
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test]
    async fn blank_sends_never_reach_the_hub() {
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));
        session.connect(&credential()).await.unwrap();

        assert_eq!(session.send("").await.unwrap(), None);
        assert_eq!(session.send("   ").await.unwrap(), None);

        assert!(session.transcript().is_empty());
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn history_then_send_builds_expected_transcript() {
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![hi_from_expert()])));

        session.start(&credential()).await.unwrap();
        assert_eq!(session.await_history().await, Some(SessionUpdate::HistoryLoaded(1)));
        assert_eq!(session.transcript().messages(), &[hi_from_expert()]);

        let before = Utc::now();
        let sent = session.send("Hello").await.unwrap().unwrap();

        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0], hi_from_expert());
        assert_eq!(messages[1], sent);
        assert_eq!(sent.sender_id, "S1");
        assert_eq!(sent.recipient_id, "E1");
        assert_eq!(sent.content, "Hello");
        assert!(sent.id.is_none());
        assert!(sent.time_sent >= before);
        assert_eq!(
            recorder.sent(),
            vec![("E1".to_string(), "S1".to_string(), "Hello".to_string())]
        );
    }

    #[tokio::test]
    async fn failed_connect_blocks_sending() {
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            refuse_connect: Some("unauthorized".to_string()),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));

        let err = session.connect(&credential()).await.unwrap_err();
        assert!(err.is_blocking());
        assert!(matches!(session.state(), SessionState::Failed(_)));

        assert_eq!(session.send("anyone?").await.unwrap(), None);
        assert!(session.transcript().is_empty());
        assert!(recorder.sent().is_empty());
    }

    #[tokio::test]
    async fn history_failure_does_not_stop_the_session() {
        let mut session = session(
            FakeHub::default(),
            FakeHistory::answering(Err("connection refused".to_string())),
        );

        session.start(&credential()).await.unwrap();
        let update = session.await_history().await;

        assert!(matches!(update, Some(SessionUpdate::HistoryUnavailable(_))));
        assert_eq!(session.state(), SessionState::Connected);
        assert!(session.transcript().is_empty());
        assert_eq!(session.history_state(), HistoryState::Unavailable);
    }

    #[tokio::test]
    async fn failed_send_is_not_shown() {
        let hub = FakeHub {
            refuse_send: true,
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));
        session.connect(&credential()).await.unwrap();

        assert!(matches!(session.send("hello").await, Err(ChatError::Send(_))));
        assert!(session.transcript().is_empty());
    }

    #[tokio::test]
    async fn live_pushes_are_filtered_to_the_pair() {
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));
        session.connect(&credential()).await.unwrap();

        recorder.push(inbound("E1", "from expert"));
        recorder.push(inbound("S1", "echo of mine"));
        recorder.push(inbound("X9", "someone else"));
        let updates = session.pump();

        assert_eq!(updates, vec![SessionUpdate::MessageReceived]);
        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "from expert");
        assert_eq!(messages[0].recipient_id, "S1");
    }

    #[tokio::test]
    async fn late_history_goes_before_live_and_local_messages() {
        let history = Arc::new(FakeHistory::default());
        let release = history.gated(vec![hi_from_expert()]);
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            ..FakeHub::default()
        };
        let mut session = session(hub, history);

        session.start(&credential()).await.unwrap();
        recorder.push(inbound("E1", "live"));
        session.pump();
        session.send("mine").await.unwrap();

        release.send(()).unwrap();
        session.await_history().await;

        let contents: Vec<&str> = session
            .transcript()
            .messages()
            .iter()
            .map(|m| m.content.as_str())
            .collect();
        assert_eq!(contents, vec!["Hi", "live", "mine"]);
    }

    #[tokio::test]
    async fn history_from_a_torn_down_epoch_is_discarded() {
        let history = Arc::new(FakeHistory::default());
        let release = history.gated(vec![hi_from_expert()]);
        let mut fresh = hi_from_expert();
        fresh.id = Some("2".to_string());
        fresh.content = "fresh".to_string();
        history.then(vec![fresh.clone()]);

        let mut session = session(FakeHub::default(), history);
        session.start(&credential()).await.unwrap();
        session.disconnect().await;
        assert_eq!(session.history_state(), HistoryState::NotRequested);

        release.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(session.pump().is_empty());
        assert!(!session.transcript().is_seeded());

        session.start(&credential()).await.unwrap();
        session.await_history().await;
        assert_eq!(session.transcript().messages(), &[fresh]);
    }

    #[tokio::test]
    async fn sends_wait_out_a_reconnect() {
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));
        session.connect(&credential()).await.unwrap();

        recorder.push(HubEvent::Reconnecting("socket reset".to_string()));
        session.pump();
        assert_eq!(session.send("while away").await.unwrap(), None);
        assert!(recorder.sent().is_empty());
        assert!(session.transcript().is_empty());

        recorder.push(HubEvent::Reconnected);
        session.pump();
        assert!(session.send("back again").await.unwrap().is_some());
        assert_eq!(recorder.sent().len(), 1);
    }

    #[tokio::test]
    async fn hub_giving_up_fails_the_session() {
        let recorder = Arc::new(Recorder::default());
        let hub = FakeHub {
            recorder: recorder.clone(),
            ..FakeHub::default()
        };
        let mut session = session(hub, FakeHistory::answering(Ok(vec![])));
        session.connect(&credential()).await.unwrap();

        recorder.push(HubEvent::Reconnecting("socket reset".to_string()));
        session.pump();
        assert!(session.is_reconnecting());
        assert!(!session.can_send());

        recorder.push(HubEvent::Closed(Some("gave up reconnecting".to_string())));
        session.pump();
        assert_eq!(
            session.state(),
            SessionState::Failed("gave up reconnecting".to_string())
        );
        assert_eq!(session.send("hello?").await.unwrap(), None);
    }
}
