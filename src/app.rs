use std::sync::Arc;

use anyhow::Result;
use crossterm::event::{Event, KeyCode, KeyEvent, KeyEventKind};
use tracing::{info, warn};

use bridgeit_chat::chat::{
    HistoryState, HttpHistoryLoader, Message, OrderingPolicy, Session, SessionKey, SessionState,
    SessionUpdate,
};
use bridgeit_chat::credentials::Credential;
use bridgeit_chat::hub::{HubConnection, HubOptions};
use bridgeit_chat::ChatError;

pub type ChatSession = Session<HubConnection, HttpHistoryLoader>;

#[derive(Debug, Clone, PartialEq)]
pub enum InputMode {
    Normal,
    Editing,
}

/// Everything needed to open sessions, resolved from config and CLI.
pub struct AppSettings {
    pub user_id: String,
    pub credential: Option<Credential>,
    pub hub_options: HubOptions,
    pub http: reqwest::Client,
    pub history: Arc<HttpHistoryLoader>,
    pub ordering: OrderingPolicy,
}

pub struct App {
    pub should_quit: bool,
    pub input_mode: InputMode,
    pub input: String,
    pub cursor_position: usize,
    /// Messages scrolled up from the newest one; 0 follows new messages.
    pub scroll_offset: usize,

    pub settings: AppSettings,
    pub session: Option<ChatSession>,
    /// Set when the chat cannot work at all (signed out, connection refused).
    pub blocking_error: Option<String>,
    pub status_messages: Vec<String>,
}

impl App {
    pub async fn new(settings: AppSettings, peer: Option<&str>) -> Result<Self> {
        let mut app = Self {
            should_quit: false,
            input_mode: InputMode::Normal,
            input: String::new(),
            cursor_position: 0,
            scroll_offset: 0,

            settings,
            session: None,
            blocking_error: None,
            status_messages: Vec::new(),
        };

        app.add_status_message(format!(
            "BridgeIT chat v{} - signed in as {}",
            env!("CARGO_PKG_VERSION"),
            app.settings.user_id
        ));

        if app.settings.credential.is_none() {
            app.fail(ChatError::AuthMissing.to_string());
        }

        match peer {
            Some(peer) => app.open_conversation(peer).await,
            None => app.add_status_message("Use /chat <userId> to open a conversation.".to_string()),
        }

        Ok(app)
    }

    pub async fn handle_input(&mut self, event: Event) -> Result<()> {
        if let Event::Key(key) = event {
            if key.kind == KeyEventKind::Press {
                self.handle_key_event(key).await?;
            }
        }
        Ok(())
    }

    async fn handle_key_event(&mut self, key: KeyEvent) -> Result<()> {
        match self.input_mode {
            InputMode::Normal => match key.code {
                KeyCode::Char('q') => self.should_quit = true,
                KeyCode::Char('i') => self.input_mode = InputMode::Editing,
                KeyCode::Up => self.scroll_offset += 1,
                KeyCode::Down => self.scroll_offset = self.scroll_offset.saturating_sub(1),
                KeyCode::PageUp => self.scroll_offset += 10,
                KeyCode::PageDown => self.scroll_offset = self.scroll_offset.saturating_sub(10),
                KeyCode::End => self.scroll_offset = 0,
                _ => {}
            },
            InputMode::Editing => match key.code {
                KeyCode::Enter => {
                    if self.submit_input().await {
                        self.input.clear();
                        self.cursor_position = 0;
                        self.scroll_offset = 0;
                    }
                }
                KeyCode::Char(c) => {
                    let at = self.byte_index();
                    self.input.insert(at, c);
                    self.cursor_position += 1;
                }
                KeyCode::Backspace => {
                    if self.cursor_position > 0 {
                        self.cursor_position -= 1;
                        let at = self.byte_index();
                        self.input.remove(at);
                    }
                }
                KeyCode::Delete => {
                    if self.cursor_position < self.input.chars().count() {
                        let at = self.byte_index();
                        self.input.remove(at);
                    }
                }
                KeyCode::Left => self.cursor_position = self.cursor_position.saturating_sub(1),
                KeyCode::Right => {
                    if self.cursor_position < self.input.chars().count() {
                        self.cursor_position += 1;
                    }
                }
                KeyCode::Home => self.cursor_position = 0,
                KeyCode::End => self.cursor_position = self.input.chars().count(),
                KeyCode::Esc => self.input_mode = InputMode::Normal,
                _ => {}
            },
        }
        Ok(())
    }

    fn byte_index(&self) -> usize {
        self.input
            .char_indices()
            .nth(self.cursor_position)
            .map_or(self.input.len(), |(i, _)| i)
    }

    /// Returns true when the input line was consumed and can be cleared.
    async fn submit_input(&mut self) -> bool {
        let input = self.input.trim().to_string();
        if input.is_empty() {
            return false;
        }

        if input.starts_with('/') {
            self.handle_command(&input).await;
            return true;
        }

        let Some(session) = self.session.as_mut() else {
            self.add_status_message("No conversation open. Use /chat <userId> first.".to_string());
            return false;
        };

        match session.send(&self.input).await {
            Ok(Some(_)) => true,
            Ok(None) => {
                self.add_status_message("Not connected; message not sent.".to_string());
                false
            }
            Err(e) => {
                self.add_status_message(format!("{} (press Enter to retry)", e));
                false
            }
        }
    }

    async fn handle_command(&mut self, input: &str) {
        let parts: Vec<&str> = input[1..].split_whitespace().collect();
        let Some(command) = parts.first() else {
            return;
        };

        match command.to_lowercase().as_str() {
            "chat" | "c" => {
                if parts.len() != 2 {
                    self.add_status_message("Usage: /chat <userId>".to_string());
                    return;
                }
                self.open_conversation(parts[1]).await;
            }
            "reconnect" | "r" => self.reconnect().await,
            "help" | "h" => self.show_help(),
            "quit" | "q" | "exit" => self.should_quit = true,
            other => {
                self.add_status_message(format!("Unknown command: {}. Type /help for available commands.", other));
            }
        }
    }

    /// Close the current conversation (if any) and open one with `peer`.
    pub async fn open_conversation(&mut self, peer: &str) {
        if peer == self.settings.user_id {
            self.add_status_message("You cannot chat with yourself.".to_string());
            return;
        }

        if let Some(mut previous) = self.session.take() {
            previous.disconnect().await;
            self.add_status_message(format!("Left conversation with {}", previous.key().remote_user_id));
        }

        let key = SessionKey::new(self.settings.user_id.clone(), peer);
        let transport = HubConnection::new(self.settings.hub_options.clone(), self.settings.http.clone());
        let session = Session::new(
            key,
            transport,
            self.settings.history.clone(),
            self.settings.ordering,
        );
        self.session = Some(session);
        self.scroll_offset = 0;
        self.start_session().await;
    }

    async fn reconnect(&mut self) {
        match self.session.as_mut() {
            Some(session) => {
                session.disconnect().await;
                self.start_session().await;
            }
            None => self.add_status_message("No conversation to reconnect.".to_string()),
        }
    }

    async fn start_session(&mut self) {
        let Some(credential) = self.settings.credential.clone() else {
            self.fail(ChatError::AuthMissing.to_string());
            return;
        };
        let Some(peer) = self.session.as_ref().map(|s| s.key().remote_user_id.clone()) else {
            return;
        };
        self.add_status_message(format!("Connecting to chat with {}...", peer));

        let Some(session) = self.session.as_mut() else {
            return;
        };
        match session.start(&credential).await {
            Ok(()) => {
                self.blocking_error = None;
                info!("chat with {} ready", peer);
                self.add_status_message(format!("Connected. Chatting with {}", peer));
            }
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn fail(&mut self, reason: String) {
        warn!("{}", reason);
        self.add_status_message(format!("Error: {}", reason));
        self.blocking_error = Some(reason);
    }

    fn show_help(&mut self) {
        let help_text = [
            "BridgeIT chat commands:",
            "/chat <userId> - Open a conversation (closes the current one)",
            "/reconnect - Reconnect the current conversation",
            "/help - Show this help",
            "/quit - Exit",
            "",
            "Keyboard: i=input mode, Esc=normal mode, q=quit (normal mode)",
            "Up/Down/PageUp/PageDown=scroll, End=jump to newest",
        ];
        for line in help_text {
            self.add_status_message(line.to_string());
        }
    }

    pub fn add_status_message(&mut self, message: String) {
        self.status_messages.push(format!(
            "[{}] {}",
            chrono::Local::now().format("%H:%M:%S"),
            message
        ));

        if self.status_messages.len() > 1000 {
            self.status_messages.remove(0);
        }
    }

    pub async fn on_tick(&mut self) -> Result<()> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };

        for update in session.pump() {
            match update {
                SessionUpdate::HistoryLoaded(count) => {
                    self.add_status_message(format!("Loaded {} earlier messages", count))
                }
                SessionUpdate::HistoryUnavailable(_) => {
                    self.add_status_message("Chat history unavailable".to_string())
                }
                SessionUpdate::MessageReceived => {}
                SessionUpdate::Reconnecting(reason) => {
                    self.add_status_message(format!("Connection lost ({}), reconnecting...", reason))
                }
                SessionUpdate::Reconnected => self.add_status_message("Reconnected".to_string()),
                SessionUpdate::Closed(Some(reason)) => self.fail(format!("connection closed: {}", reason)),
                SessionUpdate::Closed(None) => self.add_status_message("Disconnected".to_string()),
            }
        }

        Ok(())
    }

    pub async fn shutdown(&mut self) {
        if let Some(session) = self.session.as_mut() {
            session.disconnect().await;
        }
    }

    pub fn status_label(&self) -> String {
        if let Some(error) = &self.blocking_error {
            return error.clone();
        }
        match self.session.as_ref() {
            None => "no conversation".to_string(),
            Some(session) if session.is_reconnecting() => "reconnecting...".to_string(),
            Some(session) => match session.state() {
                SessionState::Idle => "disconnected".to_string(),
                SessionState::Connecting => "connecting...".to_string(),
                SessionState::Connected => "connected".to_string(),
                SessionState::Failed(reason) => reason,
            },
        }
    }

    pub fn history_loading(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |s| s.history_state() == HistoryState::Loading)
    }

    pub fn can_send(&self) -> bool {
        self.blocking_error.is_none() && self.session.as_ref().map_or(false, |s| s.can_send())
    }

    /// Messages up to the scroll position; the pane shows as many of the newest as fit.
    pub fn get_visible_messages(&self) -> &[Message] {
        let Some(session) = self.session.as_ref() else {
            return &[];
        };
        let messages = session.transcript().messages();
        let end = messages.len() - self.scroll_offset.min(messages.len());
        &messages[..end]
    }

    pub fn get_visible_status_messages(&self, height: usize) -> Vec<&String> {
        let start = self.status_messages.len().saturating_sub(height);
        self.status_messages[start..].iter().collect()
    }
}
