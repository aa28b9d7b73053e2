//! Per-connection state machine
//!
//! `Connected → Subscribed(topics) → Closed`. The session never touches the
//! socket or the hub; it turns each inbound frame into a list of actions the
//! connection runner carries out in order.

use super::protocol::{ClientMessage, ProtocolError, ServerMessage, Topic};
use std::collections::BTreeSet;

/// Connection lifecycle state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// Open, no topics
    Connected,
    /// Open with a non-empty topic set
    Subscribed(BTreeSet<Topic>),
    Closed,
}

/// What the runner must do in response to one frame
#[derive(Debug, Clone)]
pub enum Action {
    /// Send this message to the client
    Send(ServerMessage),
    /// Compute and send the current value of a topic
    Snapshot(Topic),
    /// Compute and send the per-service status
    ServicesStatus,
}

/// One client connection's protocol state
#[derive(Debug)]
pub struct Session {
    id: u64,
    state: SessionState,
}

impl Session {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: SessionState::Connected,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Current topic set (empty unless subscribed)
    pub fn topics(&self) -> BTreeSet<Topic> {
        match &self.state {
            SessionState::Subscribed(topics) => topics.clone(),
            _ => BTreeSet::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Closed
    }

    /// Handle one text frame
    pub fn handle_text(&mut self, text: &str) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        match ClientMessage::parse(text) {
            Ok(msg) => self.handle(msg),
            Err(e) => vec![Action::Send(ServerMessage::error(&e))],
        }
    }

    /// Handle one binary frame
    pub fn handle_binary(&mut self) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        vec![Action::Send(ServerMessage::error(&ProtocolError::BinaryFrame))]
    }

    /// Handle a parsed message
    pub fn handle(&mut self, msg: ClientMessage) -> Vec<Action> {
        if self.is_closed() {
            return Vec::new();
        }
        match msg {
            ClientMessage::Subscribe { channels } => {
                let requested = parse_topics(&channels);
                let previous = self.topics();
                let mut actions: Vec<Action> = requested
                    .difference(&previous)
                    .filter(|topic| topic.has_snapshot())
                    .map(|topic| Action::Snapshot(*topic))
                    .collect();
                self.set_topics(requested);
                actions.push(Action::Send(ServerMessage::subscription_update(self.topics())));
                actions
            }
            ClientMessage::Unsubscribe { channels } => {
                let mut topics = self.topics();
                for topic in parse_topics(&channels) {
                    topics.remove(&topic);
                }
                self.set_topics(topics);
                vec![Action::Send(ServerMessage::subscription_update(self.topics()))]
            }
            ClientMessage::Ping => vec![Action::Send(ServerMessage::pong())],
            ClientMessage::GetServicesStatus => vec![Action::ServicesStatus],
        }
    }

    /// Transition to Closed; further frames are ignored
    pub fn close(&mut self) {
        self.state = SessionState::Closed;
    }

    fn set_topics(&mut self, topics: BTreeSet<Topic>) {
        self.state = if topics.is_empty() {
            SessionState::Connected
        } else {
            SessionState::Subscribed(topics)
        };
    }
}

/// Keep only valid topic names; unknown entries are dropped silently
fn parse_topics(channels: &[String]) -> BTreeSet<Topic> {
    channels.iter().filter_map(|c| Topic::parse(c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(actions: &[Action]) -> Vec<String> {
        actions
            .iter()
            .map(|a| match a {
                Action::Send(msg) => msg.kind().to_string(),
                Action::Snapshot(topic) => format!("snapshot:{}", topic),
                Action::ServicesStatus => "services-status".to_string(),
            })
            .collect()
    }

    #[test]
    fn test_new_session_is_connected() {
        let session = Session::new(1);
        assert_eq!(session.id(), 1);
        assert_eq!(session.state(), &SessionState::Connected);
        assert!(session.topics().is_empty());
    }

    #[test]
    fn test_subscribe_sends_snapshot_before_update() {
        let mut session = Session::new(1);
        let actions = session.handle_text(r#"{"type":"subscribe","channels":["system"]}"#);
        assert_eq!(kinds(&actions), vec!["snapshot:system", "subscription-update"]);
        assert_eq!(
            session.state(),
            &SessionState::Subscribed(BTreeSet::from([Topic::System]))
        );
    }

    #[test]
    fn test_subscribe_snapshots_in_topic_order() {
        let mut session = Session::new(1);
        let actions = session.handle_text(
            r#"{"type":"subscribe","channels":["services","notifications","system","database"]}"#,
        );
        assert_eq!(
            kinds(&actions),
            vec![
                "snapshot:system",
                "snapshot:database",
                "snapshot:services",
                "subscription-update"
            ]
        );
        assert_eq!(session.topics().len(), 4);
    }

    #[test]
    fn test_subscribe_empty_or_invalid_leaves_no_topics() {
        let mut session = Session::new(1);
        let actions = session.handle_text(r#"{"type":"subscribe","channels":[]}"#);
        assert_eq!(kinds(&actions), vec!["subscription-update"]);
        assert_eq!(session.state(), &SessionState::Connected);

        let actions = session.handle_text(r#"{"type":"subscribe","channels":["weather","x"]}"#);
        assert_eq!(kinds(&actions), vec!["subscription-update"]);
        assert!(session.topics().is_empty());
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let mut session = Session::new(1);
        let msg = r#"{"type":"subscribe","channels":["system","database"]}"#;
        session.handle_text(msg);
        let first = session.topics();
        let actions = session.handle_text(msg);
        assert_eq!(session.topics(), first);
        // Nothing new, so no catch-up snapshots
        assert_eq!(kinds(&actions), vec!["subscription-update"]);
    }

    #[test]
    fn test_subscribe_replaces_set() {
        let mut session = Session::new(1);
        session.handle_text(r#"{"type":"subscribe","channels":["system","database"]}"#);
        let actions = session.handle_text(r#"{"type":"subscribe","channels":["database","services"]}"#);
        assert_eq!(kinds(&actions), vec!["snapshot:services", "subscription-update"]);
        assert_eq!(
            session.topics(),
            BTreeSet::from([Topic::Database, Topic::Services])
        );
    }

    #[test]
    fn test_unsubscribe() {
        let mut session = Session::new(1);
        session.handle_text(r#"{"type":"subscribe","channels":["system","database"]}"#);
        let actions = session.handle_text(r#"{"type":"unsubscribe","channels":["system"]}"#);
        assert_eq!(kinds(&actions), vec!["subscription-update"]);
        assert_eq!(session.topics(), BTreeSet::from([Topic::Database]));

        session.handle_text(r#"{"type":"unsubscribe","channels":["database"]}"#);
        assert_eq!(session.state(), &SessionState::Connected);
    }

    #[test]
    fn test_ping_always_one_pong() {
        let mut session = Session::new(1);
        assert_eq!(kinds(&session.handle_text(r#"{"type":"ping"}"#)), vec!["pong"]);
        session.handle_text(r#"{"type":"subscribe","channels":["system"]}"#);
        assert_eq!(kinds(&session.handle_text(r#"{"type":"ping"}"#)), vec!["pong"]);
    }

    #[test]
    fn test_get_services_status_needs_no_subscription() {
        let mut session = Session::new(1);
        let actions = session.handle_text(r#"{"type":"get-services-status"}"#);
        assert_eq!(kinds(&actions), vec!["services-status"]);
    }

    #[test]
    fn test_bad_frames_reply_error_and_stay_open() {
        let mut session = Session::new(1);
        session.handle_text(r#"{"type":"subscribe","channels":["system"]}"#);

        assert_eq!(kinds(&session.handle_text("{oops")), vec!["error"]);
        assert_eq!(kinds(&session.handle_text(r#"{"type":"dance"}"#)), vec!["error"]);
        assert_eq!(kinds(&session.handle_binary()), vec!["error"]);

        assert!(!session.is_closed());
        assert_eq!(session.topics(), BTreeSet::from([Topic::System]));
    }

    #[test]
    fn test_closed_session_ignores_frames() {
        let mut session = Session::new(1);
        session.handle_text(r#"{"type":"subscribe","channels":["system"]}"#);
        session.close();
        assert!(session.is_closed());
        assert!(session.topics().is_empty());
        assert!(session.handle_text(r#"{"type":"ping"}"#).is_empty());
        assert!(session.handle_binary().is_empty());
    }
}
