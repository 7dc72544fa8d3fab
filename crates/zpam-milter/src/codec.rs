//! Milter wire codec
//!
//! Length-prefixed frames: a big-endian u32 length covering the command byte
//! and payload, then the command byte, then the payload. Strings inside
//! payloads are NUL-terminated. Only the commands the session consumes are
//! decoded; macro frames are skipped, unknown frames are ignored.

use crate::{EventOutcome, EventStream, MilterAction, MilterError, MilterEvent, Mutation};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on one frame; anything larger is a protocol error
const MAX_FRAME: usize = 8 * 1024 * 1024;

// Commands from the MTA (SMFIC_*)
const CMD_ABORT: u8 = b'A';
const CMD_BODY: u8 = b'B';
const CMD_CONNECT: u8 = b'C';
const CMD_MACRO: u8 = b'D';
const CMD_BODY_END: u8 = b'E';
const CMD_HELO: u8 = b'H';
const CMD_HEADER: u8 = b'L';
const CMD_MAIL: u8 = b'M';
const CMD_EOH: u8 = b'N';
const CMD_OPTNEG: u8 = b'O';
const CMD_QUIT: u8 = b'Q';
const CMD_RCPT: u8 = b'R';
const CMD_DATA: u8 = b'T';

// Responses to the MTA (SMFIR_*)
const RESP_ACCEPT: u8 = b'a';
const RESP_CONTINUE: u8 = b'c';
const RESP_DISCARD: u8 = b'd';
const RESP_ADD_HEADER: u8 = b'h';
const RESP_CHANGE_HEADER: u8 = b'm';
const RESP_QUARANTINE: u8 = b'q';
const RESP_REJECT: u8 = b'r';
const RESP_TEMPFAIL: u8 = b't';
const RESP_REPLY_CODE: u8 = b'y';
const RESP_OPTNEG: u8 = b'O';

pub struct MilterCodecStream<S> {
    stream: S,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl<S: AsyncRead + AsyncWrite + Unpin + Send> MilterCodecStream<S> {
    pub fn new(stream: S, read_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            stream,
            read_timeout,
            write_timeout,
        }
    }

    async fn read_frame(&mut self) -> Result<Option<(u8, Vec<u8>)>, MilterError> {
        let mut len_buf = [0u8; 4];
        match self.stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        if len == 0 || len > MAX_FRAME {
            return Err(MilterError::Protocol(format!("bad frame length {}", len)));
        }
        let mut frame = vec![0u8; len];
        self.stream.read_exact(&mut frame).await?;
        let payload = frame.split_off(1);
        Ok(Some((frame[0], payload)))
    }

    async fn write_frame(&mut self, cmd: u8, payload: &[u8]) -> Result<(), MilterError> {
        let len = (payload.len() + 1) as u32;
        let write = async {
            self.stream.write_all(&len.to_be_bytes()).await?;
            self.stream.write_all(&[cmd]).await?;
            self.stream.write_all(payload).await?;
            self.stream.flush().await?;
            Ok::<(), std::io::Error>(())
        };
        tokio::time::timeout(self.write_timeout, write)
            .await
            .map_err(|_| MilterError::Timeout)??;
        Ok(())
    }

    fn decode(cmd: u8, payload: Vec<u8>) -> Result<Option<MilterEvent>, MilterError> {
        let event = match cmd {
            CMD_MACRO => return Ok(None),
            CMD_OPTNEG => {
                if payload.len() < 12 {
                    return Err(MilterError::Protocol("short optneg frame".into()));
                }
                MilterEvent::Negotiate {
                    version: read_u32(&payload[0..4]),
                    actions: read_u32(&payload[4..8]),
                    protocol: read_u32(&payload[8..12]),
                }
            }
            CMD_CONNECT => decode_connect(&payload)?,
            CMD_HELO => MilterEvent::Helo(read_cstr(&payload, 0).0),
            CMD_MAIL => {
                let mut args = split_cstrs(&payload);
                let sender = if args.is_empty() {
                    String::new()
                } else {
                    args.remove(0)
                };
                MilterEvent::MailFrom { sender, args }
            }
            CMD_RCPT => {
                let mut args = split_cstrs(&payload);
                let recipient = if args.is_empty() {
                    String::new()
                } else {
                    args.remove(0)
                };
                MilterEvent::RcptTo { recipient, args }
            }
            CMD_DATA => MilterEvent::Data,
            CMD_HEADER => {
                let (name, next) = read_cstr(&payload, 0);
                let (value, _) = read_cstr(&payload, next);
                MilterEvent::Header { name, value }
            }
            CMD_EOH => MilterEvent::EndOfHeaders,
            CMD_BODY => MilterEvent::BodyChunk(payload),
            CMD_BODY_END => MilterEvent::EndOfMessage,
            CMD_ABORT => MilterEvent::Abort,
            CMD_QUIT => MilterEvent::Quit,
            other => {
                tracing::debug!("ignoring unknown milter command {:#x}", other);
                return Ok(None);
            }
        };
        Ok(Some(event))
    }
}

fn decode_connect(payload: &[u8]) -> Result<MilterEvent, MilterError> {
    let (hostname, next) = read_cstr(payload, 0);
    let Some(&family) = payload.get(next) else {
        return Err(MilterError::Protocol("truncated connect frame".into()));
    };
    let event = match family {
        b'4' | b'6' => {
            let port_start = next + 1;
            if payload.len() < port_start + 2 {
                return Err(MilterError::Protocol("truncated connect frame".into()));
            }
            let port = u16::from_be_bytes([payload[port_start], payload[port_start + 1]]);
            let (addr, _) = read_cstr(payload, port_start + 2);
            MilterEvent::Connect {
                hostname,
                port,
                address: addr.parse().ok(),
            }
        }
        // Unix socket or unknown family: no port, no address.
        _ => MilterEvent::Connect {
            hostname,
            port: 0,
            address: None,
        },
    };
    Ok(event)
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// NUL-terminated string starting at `from`; returns the string and the
/// offset just past its terminator.
fn read_cstr(payload: &[u8], from: usize) -> (String, usize) {
    let slice = &payload[from.min(payload.len())..];
    match slice.iter().position(|&b| b == 0) {
        Some(end) => (
            String::from_utf8_lossy(&slice[..end]).into_owned(),
            from + end + 1,
        ),
        None => (String::from_utf8_lossy(slice).into_owned(), payload.len()),
    }
}

fn split_cstrs(payload: &[u8]) -> Vec<String> {
    payload
        .split(|&b| b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect()
}

fn cstr(value: &str) -> Vec<u8> {
    let mut bytes = value.as_bytes().to_vec();
    bytes.push(0);
    bytes
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Unpin + Send> EventStream for MilterCodecStream<S> {
    async fn next_event(&mut self) -> Result<Option<MilterEvent>, MilterError> {
        loop {
            let frame = tokio::time::timeout(self.read_timeout, self.read_frame())
                .await
                .map_err(|_| MilterError::Timeout)??;
            let Some((cmd, payload)) = frame else {
                return Ok(None);
            };
            if let Some(event) = Self::decode(cmd, payload)? {
                return Ok(Some(event));
            }
        }
    }

    async fn respond(&mut self, outcome: EventOutcome) -> Result<(), MilterError> {
        for mutation in &outcome.mutations {
            match mutation {
                Mutation::AddHeader { name, value } => {
                    let mut payload = cstr(name);
                    payload.extend_from_slice(&cstr(value));
                    self.write_frame(RESP_ADD_HEADER, &payload).await?;
                }
                Mutation::ChangeHeader { name, index, value } => {
                    let mut payload = index.to_be_bytes().to_vec();
                    payload.extend_from_slice(&cstr(name));
                    payload.extend_from_slice(&cstr(value));
                    self.write_frame(RESP_CHANGE_HEADER, &payload).await?;
                }
                Mutation::Quarantine { reason } => {
                    self.write_frame(RESP_QUARANTINE, &cstr(reason)).await?;
                }
            }
        }

        match &outcome.action {
            MilterAction::Continue => self.write_frame(RESP_CONTINUE, &[]).await,
            MilterAction::Accept => self.write_frame(RESP_ACCEPT, &[]).await,
            MilterAction::TempFail => self.write_frame(RESP_TEMPFAIL, &[]).await,
            MilterAction::Discard => self.write_frame(RESP_DISCARD, &[]).await,
            MilterAction::Reject { code, message } => {
                if message.is_empty() {
                    self.write_frame(RESP_REJECT, &[]).await
                } else {
                    let payload = cstr(&format!("{} {}", code, message));
                    self.write_frame(RESP_REPLY_CODE, &payload).await
                }
            }
            MilterAction::Negotiate { actions, protocol } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&crate::MILTER_VERSION.to_be_bytes());
                payload.extend_from_slice(&actions.to_be_bytes());
                payload.extend_from_slice(&protocol.to_be_bytes());
                self.write_frame(RESP_OPTNEG, &payload).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn frame(cmd: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = ((payload.len() + 1) as u32).to_be_bytes().to_vec();
        out.push(cmd);
        out.extend_from_slice(payload);
        out
    }

    #[tokio::test]
    async fn test_decode_event_sequence() {
        let (mut mta, engine_side) = duplex(4096);
        let mut codec = MilterCodecStream::new(engine_side, Duration::from_secs(5), Duration::from_secs(5));

        let mut connect = cstr("mail.example.com");
        connect.push(b'4');
        connect.extend_from_slice(&4321u16.to_be_bytes());
        connect.extend_from_slice(&cstr("192.0.2.9"));

        let mut header = cstr("Subject");
        header.extend_from_slice(&cstr("hello"));

        mta.write_all(&frame(CMD_CONNECT, &connect)).await.unwrap();
        mta.write_all(&frame(CMD_MACRO, &cstr("j"))).await.unwrap();
        mta.write_all(&frame(CMD_HELO, &cstr("client.example")))
            .await
            .unwrap();
        mta.write_all(&frame(CMD_MAIL, &cstr("<a@b.c>"))).await.unwrap();
        mta.write_all(&frame(CMD_HEADER, &header)).await.unwrap();
        mta.write_all(&frame(CMD_BODY, b"chunk")).await.unwrap();

        assert_eq!(
            codec.next_event().await.unwrap(),
            Some(MilterEvent::Connect {
                hostname: "mail.example.com".into(),
                port: 4321,
                address: "192.0.2.9".parse().ok(),
            })
        );
        // Macro frame is transparently skipped.
        assert_eq!(
            codec.next_event().await.unwrap(),
            Some(MilterEvent::Helo("client.example".into()))
        );
        assert_eq!(
            codec.next_event().await.unwrap(),
            Some(MilterEvent::MailFrom {
                sender: "<a@b.c>".into(),
                args: vec![],
            })
        );
        assert_eq!(
            codec.next_event().await.unwrap(),
            Some(MilterEvent::Header {
                name: "Subject".into(),
                value: "hello".into(),
            })
        );
        assert_eq!(
            codec.next_event().await.unwrap(),
            Some(MilterEvent::BodyChunk(b"chunk".to_vec()))
        );

        drop(mta);
        assert_eq!(codec.next_event().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_respond_writes_mutations_then_action() {
        let (engine_side, mut mta) = duplex(4096);
        let mut codec = MilterCodecStream::new(engine_side, Duration::from_secs(5), Duration::from_secs(5));

        codec
            .respond(EventOutcome {
                action: MilterAction::Continue,
                mutations: vec![Mutation::AddHeader {
                    name: "X-ZPAM-Status".into(),
                    value: "Clean".into(),
                }],
            })
            .await
            .unwrap();

        let mut header_payload = cstr("X-ZPAM-Status");
        header_payload.extend_from_slice(&cstr("Clean"));
        let mut expected = frame(RESP_ADD_HEADER, &header_payload);
        expected.extend_from_slice(&frame(RESP_CONTINUE, &[]));

        let mut got = vec![0u8; expected.len()];
        mta.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_reject_with_code_uses_reply_code_frame() {
        let (engine_side, mut mta) = duplex(4096);
        let mut codec = MilterCodecStream::new(engine_side, Duration::from_secs(5), Duration::from_secs(5));

        codec
            .respond(EventOutcome::action(MilterAction::Reject {
                code: 550,
                message: "Message rejected as spam".into(),
            }))
            .await
            .unwrap();

        let expected = frame(RESP_REPLY_CODE, &cstr("550 Message rejected as spam"));
        let mut got = vec![0u8; expected.len()];
        mta.read_exact(&mut got).await.unwrap();
        assert_eq!(got, expected);
    }

    #[tokio::test]
    async fn test_read_timeout_surfaces() {
        let (_mta, engine_side) = duplex(64);
        let mut codec = MilterCodecStream::new(engine_side, Duration::from_millis(20), Duration::from_secs(5));
        assert!(matches!(
            codec.next_event().await,
            Err(MilterError::Timeout)
        ));
    }
}
