//! Per-connection session state machine
//!
//! Mirrors the milter event order: connect, helo, envelope, headers, body,
//! end-of-message. The handler owns its message exclusively; a new MAIL FROM
//! resets it, an abort tears it down. At end-of-message the aggregated score
//! becomes an action decision plus the added `X-ZPAM-*` headers.
//!
//! Scoring runs on its own task so a panicking component fails only the
//! current message (to tempfail) and never takes the acceptor down.

use crate::{
    EventOutcome, EventStream, MilterAction, MilterEvent, MilterError, Mutation,
    ACTION_ADD_HEADERS, ACTION_ADD_RCPT, ACTION_CHANGE_BODY, ACTION_CHANGE_FROM,
    ACTION_CHANGE_HEADERS, ACTION_DELETE_RCPT, ACTION_QUARANTINE, PROTOCOL_NO_BODY,
    PROTOCOL_NO_DATA, PROTOCOL_NO_HELO, PROTOCOL_NO_RCPT,
};
use std::net::IpAddr;
use std::sync::Arc;
use zpam_common::config::MilterConfig;
use zpam_filter::{Message, MessageBuilder, ScoreEngine, ScoreOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Greeted,
    Envelope,
    Headers,
    Body,
    Done,
}

pub struct SessionHandler {
    engine: Arc<ScoreEngine>,
    config: MilterConfig,
    state: SessionState,
    peer_host: Option<String>,
    peer_addr: Option<IpAddr>,
    helo: String,
    builder: Option<MessageBuilder>,
}

impl SessionHandler {
    pub fn new(engine: Arc<ScoreEngine>, config: MilterConfig) -> Self {
        Self {
            engine,
            config,
            state: SessionState::Idle,
            peer_host: None,
            peer_addr: None,
            helo: String::new(),
            builder: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session until the peer quits or the stream closes.
    pub async fn run<S: EventStream>(&mut self, stream: &mut S) -> Result<(), MilterError> {
        while let Some(event) = stream.next_event().await? {
            let quit = event == MilterEvent::Quit;
            if let Some(outcome) = self.handle_event(event).await {
                stream.respond(outcome).await?;
            }
            if quit {
                break;
            }
        }
        self.teardown();
        Ok(())
    }

    /// Process one event. `None` means the event takes no reply
    /// (abort and quit).
    pub async fn handle_event(&mut self, event: MilterEvent) -> Option<EventOutcome> {
        match event {
            MilterEvent::Negotiate { version, .. } => {
                tracing::debug!(mta_version = version, "negotiating milter options");
                Some(EventOutcome::action(MilterAction::Negotiate {
                    actions: self.negotiated_actions(),
                    protocol: self.negotiated_protocol(),
                }))
            }
            MilterEvent::Connect {
                hostname,
                port: _,
                address,
            } => {
                self.peer_host = Some(hostname);
                self.peer_addr = address;
                self.state = SessionState::Connected;
                Some(EventOutcome::cont())
            }
            MilterEvent::Helo(name) => {
                self.helo = name;
                self.state = SessionState::Greeted;
                Some(EventOutcome::cont())
            }
            MilterEvent::MailFrom { sender, .. } => {
                // New envelope: any previous message state is discarded.
                let mut builder = MessageBuilder::new(
                    self.peer_host.clone(),
                    self.peer_addr,
                    self.helo.clone(),
                );
                builder.set_sender(&sender);
                self.builder = Some(builder);
                self.state = SessionState::Envelope;
                Some(EventOutcome::cont())
            }
            MilterEvent::RcptTo { recipient, .. } => {
                if let Some(builder) = self.builder.as_mut() {
                    builder.add_recipient(&recipient);
                }
                self.state = SessionState::Envelope;
                Some(EventOutcome::cont())
            }
            MilterEvent::Data => {
                self.state = SessionState::Headers;
                Some(EventOutcome::cont())
            }
            MilterEvent::Header { name, value } => {
                if let Some(builder) = self.builder.as_mut() {
                    builder.add_header(&name, &value);
                }
                self.state = SessionState::Headers;
                Some(EventOutcome::cont())
            }
            MilterEvent::EndOfHeaders => {
                self.state = SessionState::Body;
                Some(EventOutcome::cont())
            }
            MilterEvent::BodyChunk(chunk) => {
                if let Some(builder) = self.builder.as_mut() {
                    builder.append_body(&chunk);
                }
                self.state = SessionState::Body;
                Some(EventOutcome::cont())
            }
            MilterEvent::EndOfMessage => {
                self.state = SessionState::Done;
                let outcome = self.end_of_message().await;
                // Ready for the next MAIL FROM on this connection.
                self.state = SessionState::Greeted;
                Some(outcome)
            }
            MilterEvent::Abort => {
                self.builder = None;
                self.state = SessionState::Idle;
                None
            }
            MilterEvent::Quit => None,
        }
    }

    async fn end_of_message(&mut self) -> EventOutcome {
        let Some(builder) = self.builder.take() else {
            return EventOutcome::cont();
        };
        let message = Arc::new(builder.finalize());

        let engine = Arc::clone(&self.engine);
        let scored = Arc::clone(&message);
        let outcome = match tokio::spawn(async move { engine.evaluate(scored).await }).await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(
                    message_id = %message.id,
                    sender = %message.envelope.sender,
                    "scoring task failed: {}",
                    e
                );
                return EventOutcome::action(MilterAction::TempFail);
            }
        };

        self.decide(&message, outcome)
    }

    fn decide(&self, message: &Message, outcome: ScoreOutcome) -> EventOutcome {
        tracing::info!(
            message_id = %message.id,
            sender = %message.envelope.sender,
            raw = outcome.raw_score,
            normalized = outcome.normalized,
            spam = outcome.is_spam,
            duration_ms = outcome.duration_ms,
            "message scored"
        );

        // Strictly above the reject threshold: bounce at the SMTP level.
        if outcome.normalized > self.config.reject_threshold {
            self.engine.record_rejected();
            return EventOutcome::action(MilterAction::Reject {
                code: self.config.reject_code,
                message: self.config.reject_message.clone(),
            });
        }

        let mut mutations = Vec::new();
        let quarantined = self.config.quarantine_enabled
            && outcome.normalized >= self.config.quarantine_threshold;
        if quarantined {
            self.engine.record_quarantined();
        }

        if self.config.actions.add_headers {
            let prefix = &self.config.header_prefix;
            mutations.push(Mutation::AddHeader {
                name: format!("{}Status", prefix),
                value: if outcome.is_spam { "Spam" } else { "Clean" }.to_string(),
            });
            mutations.push(Mutation::AddHeader {
                name: format!("{}Score", prefix),
                value: format!("{}/5", outcome.normalized),
            });
            mutations.push(Mutation::AddHeader {
                name: format!("{}Score-Raw", prefix),
                value: format!("{:.2}", outcome.raw_score),
            });
            mutations.push(Mutation::AddHeader {
                name: format!("{}Info", prefix),
                value: format!(
                    "ZPAM v{}; {}ms",
                    env!("CARGO_PKG_VERSION"),
                    outcome.duration_ms
                ),
            });
            if quarantined {
                mutations.push(Mutation::AddHeader {
                    name: format!("{}Quarantine", prefix),
                    value: "true".to_string(),
                });
            }
        }
        if quarantined && self.config.actions.quarantine {
            mutations.push(Mutation::Quarantine {
                reason: format!("spam score {}/5", outcome.normalized),
            });
        }

        EventOutcome {
            action: MilterAction::Continue,
            mutations,
        }
    }

    fn negotiated_actions(&self) -> u32 {
        let flags = &self.config.actions;
        let mut bits = 0;
        if flags.add_headers {
            bits |= ACTION_ADD_HEADERS;
        }
        if flags.change_headers {
            bits |= ACTION_CHANGE_HEADERS;
        }
        if flags.quarantine {
            bits |= ACTION_QUARANTINE;
        }
        if flags.change_body {
            bits |= ACTION_CHANGE_BODY;
        }
        if flags.add_recipients {
            bits |= ACTION_ADD_RCPT;
        }
        if flags.remove_recipients {
            bits |= ACTION_DELETE_RCPT;
        }
        if flags.change_from {
            bits |= ACTION_CHANGE_FROM;
        }
        bits
    }

    fn negotiated_protocol(&self) -> u32 {
        let skip = &self.config.skip;
        let mut bits = 0;
        if skip.helo {
            bits |= PROTOCOL_NO_HELO;
        }
        if skip.rcpt_to {
            bits |= PROTOCOL_NO_RCPT;
        }
        if skip.body {
            bits |= PROTOCOL_NO_BODY;
        }
        if skip.data {
            bits |= PROTOCOL_NO_DATA;
        }
        bits
    }

    fn teardown(&mut self) {
        self.builder = None;
        self.state = SessionState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use zpam_common::config::ZpamConfig;
    use zpam_dns::{DnsCache, DnsCacheConfig, StaticResolver};

    struct TestStream {
        events: VecDeque<MilterEvent>,
        outcomes: Vec<EventOutcome>,
    }

    impl TestStream {
        fn new(events: Vec<MilterEvent>) -> Self {
            Self {
                events: events.into(),
                outcomes: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl EventStream for TestStream {
        async fn next_event(&mut self) -> Result<Option<MilterEvent>, MilterError> {
            Ok(self.events.pop_front())
        }

        async fn respond(&mut self, outcome: EventOutcome) -> Result<(), MilterError> {
            self.outcomes.push(outcome);
            Ok(())
        }
    }

    fn engine(resolver: StaticResolver, mutate: impl FnOnce(&mut ZpamConfig)) -> Arc<ScoreEngine> {
        let mut config = ZpamConfig::default();
        mutate(&mut config);
        let dns = DnsCache::new(Arc::new(resolver), DnsCacheConfig::default());
        Arc::new(ScoreEngine::new(config, dns, None))
    }

    fn handler(
        resolver: StaticResolver,
        mutate: impl FnOnce(&mut ZpamConfig),
    ) -> SessionHandler {
        let engine = engine(resolver, mutate);
        let config = engine.config().milter.clone();
        SessionHandler::new(engine, config)
    }

    fn clean_events() -> Vec<MilterEvent> {
        vec![
            MilterEvent::Connect {
                hostname: "mail.corp.example".into(),
                port: 4321,
                address: "192.0.2.1".parse().ok(),
            },
            MilterEvent::Helo("mail.corp.example".into()),
            MilterEvent::MailFrom {
                sender: "<alice@corp.example>".into(),
                args: vec![],
            },
            MilterEvent::RcptTo {
                recipient: "<bob@other.example>".into(),
                args: vec![],
            },
            MilterEvent::Data,
            MilterEvent::Header {
                name: "From".into(),
                value: "alice@corp.example".into(),
            },
            MilterEvent::Header {
                name: "Subject".into(),
                value: "Weekly sync notes".into(),
            },
            MilterEvent::Header {
                name: "Date".into(),
                value: chrono::Utc::now().to_rfc2822(),
            },
            MilterEvent::Header {
                name: "Message-ID".into(),
                value: "<n1@corp.example>".into(),
            },
            MilterEvent::EndOfHeaders,
            MilterEvent::BodyChunk(b"Plain minutes from the weekly meeting.".to_vec()),
            MilterEvent::EndOfMessage,
            MilterEvent::Quit,
        ]
    }

    fn spam_events() -> Vec<MilterEvent> {
        vec![
            MilterEvent::Connect {
                hostname: "blast.cheap.example".into(),
                port: 9999,
                address: "203.0.113.9".parse().ok(),
            },
            MilterEvent::Helo("blast.cheap.example".into()),
            MilterEvent::MailFrom {
                sender: "<win@cheap.example>".into(),
                args: vec![],
            },
            MilterEvent::RcptTo {
                recipient: "<victim@other.example>".into(),
                args: vec![],
            },
            MilterEvent::Header {
                name: "From".into(),
                value: "win@cheap.example".into(),
            },
            MilterEvent::Header {
                name: "Subject".into(),
                value: "CONGRATULATIONS! YOU HAVE WON $1,000,000!!!".into(),
            },
            MilterEvent::EndOfHeaders,
            MilterEvent::BodyChunk(
                b"LOTTERY winner! free money!! click here http://a.xx click here http://b.xx now http://c.xx!!!"
                    .to_vec(),
            ),
            MilterEvent::EndOfMessage,
            MilterEvent::Quit,
        ]
    }

    #[tokio::test]
    async fn test_clean_message_continues_with_clean_headers() {
        let mut handler = handler(
            StaticResolver::new().txt("corp.example", &["v=spf1 ip4:192.0.2.1 -all"]),
            |config| config.lists.trusted_domains.push("corp.example".into()),
        );
        let mut stream = TestStream::new(clean_events());
        handler.run(&mut stream).await.unwrap();

        let eom = stream.outcomes.last().unwrap();
        assert_eq!(eom.action, MilterAction::Continue);
        let status = eom
            .mutations
            .iter()
            .find_map(|m| match m {
                Mutation::AddHeader { name, value } if name == "X-ZPAM-Status" => {
                    Some(value.clone())
                }
                _ => None,
            })
            .unwrap();
        assert_eq!(status, "Clean");
        assert!(eom.mutations.iter().any(|m| matches!(
            m,
            Mutation::AddHeader { name, value } if name == "X-ZPAM-Score" && value == "1/5"
        )));
        assert!(eom.mutations.iter().any(|m| matches!(
            m,
            Mutation::AddHeader { name, value } if name == "X-ZPAM-Info" && value.starts_with("ZPAM v")
        )));
    }

    #[tokio::test]
    async fn test_spam_is_rejected_when_threshold_allows() {
        let mut handler = handler(
            StaticResolver::new().txt("cheap.example", &["v=spf1 -all"]),
            |config| {
                config.milter.reject_threshold = 4;
                config.milter.quarantine_threshold = 3;
            },
        );
        let mut stream = TestStream::new(spam_events());
        handler.run(&mut stream).await.unwrap();

        let eom = stream.outcomes.last().unwrap();
        assert_eq!(
            eom.action,
            MilterAction::Reject {
                code: 550,
                message: "Message rejected as spam".into(),
            }
        );
        assert!(eom.mutations.is_empty());
    }

    #[tokio::test]
    async fn test_score_at_reject_threshold_is_not_rejected() {
        // Default reject threshold is 5; a saturated score of exactly 5 must
        // quarantine, not reject (strict > comparison).
        let mut handler = handler(
            StaticResolver::new().txt("cheap.example", &["v=spf1 -all"]),
            |_| {},
        );
        let mut stream = TestStream::new(spam_events());
        handler.run(&mut stream).await.unwrap();

        let eom = stream.outcomes.last().unwrap();
        assert_eq!(eom.action, MilterAction::Continue);
        assert!(eom
            .mutations
            .iter()
            .any(|m| matches!(m, Mutation::Quarantine { .. })));
        assert!(eom.mutations.iter().any(|m| matches!(
            m,
            Mutation::AddHeader { name, value } if name == "X-ZPAM-Status" && value == "Spam"
        )));
    }

    #[tokio::test]
    async fn test_abort_discards_message_state() {
        let mut handler = handler(StaticResolver::new(), |_| {});

        assert!(handler
            .handle_event(MilterEvent::Connect {
                hostname: "h".into(),
                port: 0,
                address: None,
            })
            .await
            .is_some());
        handler
            .handle_event(MilterEvent::MailFrom {
                sender: "<a@b.c>".into(),
                args: vec![],
            })
            .await;
        assert_eq!(handler.state(), SessionState::Envelope);

        // Abort takes no reply and resets the session.
        assert!(handler.handle_event(MilterEvent::Abort).await.is_none());
        assert_eq!(handler.state(), SessionState::Idle);
        assert!(handler.builder.is_none());

        // End-of-message with no envelope is a bare continue.
        let outcome = handler.handle_event(MilterEvent::EndOfMessage).await.unwrap();
        assert_eq!(outcome.action, MilterAction::Continue);
        assert!(outcome.mutations.is_empty());
    }

    #[tokio::test]
    async fn test_negotiation_reflects_configured_capabilities() {
        let mut handler = handler(StaticResolver::new(), |config| {
            config.milter.skip.helo = true;
            config.milter.actions.quarantine = false;
        });
        let outcome = handler
            .handle_event(MilterEvent::Negotiate {
                version: 6,
                actions: 0xff,
                protocol: 0x3ff,
            })
            .await
            .unwrap();

        match outcome.action {
            MilterAction::Negotiate { actions, protocol } => {
                assert!(actions & ACTION_ADD_HEADERS != 0);
                assert!(actions & ACTION_QUARANTINE == 0);
                assert!(protocol & PROTOCOL_NO_HELO != 0);
            }
            other => panic!("expected negotiate, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_custom_header_prefix() {
        let mut handler = handler(
            StaticResolver::new().txt("corp.example", &["v=spf1 ip4:192.0.2.1 -all"]),
            |config| config.milter.header_prefix = "X-Filter-".into(),
        );
        let mut stream = TestStream::new(clean_events());
        handler.run(&mut stream).await.unwrap();

        let eom = stream.outcomes.last().unwrap();
        assert!(eom.mutations.iter().any(|m| matches!(
            m,
            Mutation::AddHeader { name, .. } if name.starts_with("X-Filter-")
        )));
    }

    #[tokio::test]
    async fn test_two_messages_on_one_connection() {
        let mut handler = handler(
            StaticResolver::new().txt("corp.example", &["v=spf1 ip4:192.0.2.1 -all"]),
            |_| {},
        );
        let mut events = clean_events();
        events.pop(); // drop Quit
        let mut second = clean_events();
        second.drain(0..2); // connection is already up
        events.extend(second);

        let mut stream = TestStream::new(events);
        handler.run(&mut stream).await.unwrap();

        let continues = stream
            .outcomes
            .iter()
            .filter(|o| !o.mutations.is_empty())
            .count();
        assert_eq!(continues, 2, "both messages produced header mutations");
    }
}
