//! ZPAM milter front-end
//!
//! Consumes milter events from the MTA, drives the per-connection session
//! state machine, and returns action decisions plus header mutations. The
//! session handler is written against the `EventStream` trait so the wire
//! codec stays swappable and tests can drive sessions in memory.

use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

pub mod acceptor;
pub mod codec;
pub mod session;

pub use acceptor::Acceptor;
pub use codec::MilterCodecStream;
pub use session::{SessionHandler, SessionState};

#[derive(Error, Debug)]
pub enum MilterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("read timed out")]
    Timeout,
}

/// One milter callback from the MTA
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilterEvent {
    /// Capability negotiation at connect time
    Negotiate {
        version: u32,
        actions: u32,
        protocol: u32,
    },
    Connect {
        hostname: String,
        port: u16,
        address: Option<IpAddr>,
    },
    Helo(String),
    MailFrom {
        sender: String,
        args: Vec<String>,
    },
    RcptTo {
        recipient: String,
        args: Vec<String>,
    },
    Data,
    Header {
        name: String,
        value: String,
    },
    EndOfHeaders,
    BodyChunk(Vec<u8>),
    EndOfMessage,
    Abort,
    Quit,
}

/// Response token returned to the MTA for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MilterAction {
    Continue,
    Accept,
    Reject { code: u16, message: String },
    TempFail,
    Discard,
    /// Reply to capability negotiation
    Negotiate { actions: u32, protocol: u32 },
}

/// Message mutation instruction sent alongside the end-of-message action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddHeader { name: String, value: String },
    ChangeHeader { name: String, index: u32, value: String },
    Quarantine { reason: String },
}

/// What the session hands back for one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventOutcome {
    pub action: MilterAction,
    pub mutations: Vec<Mutation>,
}

impl EventOutcome {
    pub fn action(action: MilterAction) -> Self {
        Self {
            action,
            mutations: Vec::new(),
        }
    }

    pub fn cont() -> Self {
        Self::action(MilterAction::Continue)
    }
}

/// Transport the session handler is driven by.
///
/// The production implementation is [`MilterCodecStream`]; tests use an
/// in-memory queue.
#[async_trait]
pub trait EventStream: Send {
    /// Next event, or `None` when the peer closed the connection.
    async fn next_event(&mut self) -> Result<Option<MilterEvent>, MilterError>;

    async fn respond(&mut self, outcome: EventOutcome) -> Result<(), MilterError>;
}

// Milter action capability bits (SMFIF_*)
pub const ACTION_ADD_HEADERS: u32 = 0x01;
pub const ACTION_CHANGE_BODY: u32 = 0x02;
pub const ACTION_ADD_RCPT: u32 = 0x04;
pub const ACTION_DELETE_RCPT: u32 = 0x08;
pub const ACTION_CHANGE_HEADERS: u32 = 0x10;
pub const ACTION_QUARANTINE: u32 = 0x20;
pub const ACTION_CHANGE_FROM: u32 = 0x40;

// Milter protocol skip bits (SMFIP_*)
pub const PROTOCOL_NO_HELO: u32 = 0x02;
pub const PROTOCOL_NO_RCPT: u32 = 0x08;
pub const PROTOCOL_NO_BODY: u32 = 0x10;
pub const PROTOCOL_NO_DATA: u32 = 0x200;

/// Milter protocol version this implementation speaks
pub const MILTER_VERSION: u32 = 6;
