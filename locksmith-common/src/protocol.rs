//! Wire protocol shared by clients, leaders and followers.
//!
//! Every logical message is a single length-delimited frame carrying the text
//! `channel::senderId::payload`. The length prefix is what gives the byte
//! stream its message boundaries; the textual envelope inside is the one the
//! command client and both node kinds speak.

use std::fmt;
use std::io;
use std::str::FromStr;

use thiserror::Error;
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Separator between the three envelope fields.
pub const SEPARATOR: &str = "::";

/// Default upper bound for a single frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024;

/// Sender id used on control messages that carry no client context.
pub const NO_CLIENT: u64 = 0;

/// Identity handed to a client by the leader's session registry.
pub type ClientId = u64;

/// Identity handed to a follower by the leader's session registry.
pub type FollowerId = u64;

/// A payload or envelope that could not be understood.
///
/// These never close a connection: the offending message is logged and
/// dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("expected 3 fields separated by '::', found {found}: {raw:?}")]
    FieldCount { found: usize, raw: String },

    #[error("unknown channel {0:?}")]
    UnknownChannel(String),

    #[error("invalid sender id {0:?}")]
    InvalidSender(String),

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("unknown command in payload {0:?}")]
    UnknownCommand(String),

    #[error("invalid arguments for {command}: {payload:?}")]
    InvalidArguments {
        command: &'static str,
        payload: String,
    },
}

/// Direction of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Request flowing toward the leader, or replication flowing to a follower.
    Op,
    /// Response or notification flowing toward a client.
    Msg,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Op => "op",
            Channel::Msg => "msg",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "op" => Ok(Channel::Op),
            "msg" => Ok(Channel::Msg),
            other => Err(ProtocolError::UnknownChannel(other.to_string())),
        }
    }
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub channel: Channel,
    pub sender: u64,
    pub payload: String,
}

impl Message {
    /// A message headed for the leader.
    pub fn op(sender: u64, payload: impl fmt::Display) -> Self {
        Self {
            channel: Channel::Op,
            sender,
            payload: payload.to_string(),
        }
    }

    /// A message headed for a client.
    pub fn msg(sender: u64, payload: impl fmt::Display) -> Self {
        Self {
            channel: Channel::Msg,
            sender,
            payload: payload.to_string(),
        }
    }

    /// Parse the textual envelope of a frame.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let fields: Vec<&str> = text.split(SEPARATOR).collect();
        if fields.len() != 3 {
            return Err(ProtocolError::FieldCount {
                found: fields.len(),
                raw: text.to_string(),
            });
        }

        let channel = fields[0].parse()?;
        let sender = fields[1]
            .parse()
            .map_err(|_| ProtocolError::InvalidSender(fields[1].to_string()))?;

        Ok(Self {
            channel,
            sender,
            payload: fields[2].to_string(),
        })
    }

    fn from_frame(frame: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(frame).map_err(|_| ProtocolError::InvalidUtf8)?;
        Self::parse(text)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}{SEPARATOR}{}",
            self.channel, self.sender, self.payload
        )
    }
}

fn split_args(payload: &str) -> (&str, Vec<&str>) {
    let mut tokens = payload.split_whitespace();
    let command = tokens.next().unwrap_or_default();
    (command, tokens.collect())
}

fn parse_id(command: &'static str, payload: &str, raw: &str) -> Result<u64, ProtocolError> {
    raw.parse().map_err(|_| ProtocolError::InvalidArguments {
        command,
        payload: payload.to_string(),
    })
}

/// Commands a client (or a follower on its behalf) sends to the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    NewClient,
    NewServer,
    Check { name: String },
    TryLock { name: String, client: ClientId },
    TryUnLock { name: String, client: ClientId },
}

impl Request {
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let (command, args) = split_args(payload);
        let invalid = |command: &'static str| ProtocolError::InvalidArguments {
            command,
            payload: payload.to_string(),
        };

        match (command, args.as_slice()) {
            ("NewClient", []) => Ok(Request::NewClient),
            ("NewServer", []) => Ok(Request::NewServer),
            ("Check", [name]) => Ok(Request::Check {
                name: name.to_string(),
            }),
            ("TryLock", [name, client]) => Ok(Request::TryLock {
                name: name.to_string(),
                client: parse_id("TryLock", payload, client)?,
            }),
            ("TryUnLock", [name, client]) => Ok(Request::TryUnLock {
                name: name.to_string(),
                client: parse_id("TryUnLock", payload, client)?,
            }),
            ("NewClient", _) => Err(invalid("NewClient")),
            ("NewServer", _) => Err(invalid("NewServer")),
            ("Check", _) => Err(invalid("Check")),
            ("TryLock", _) => Err(invalid("TryLock")),
            ("TryUnLock", _) => Err(invalid("TryUnLock")),
            _ => Err(ProtocolError::UnknownCommand(payload.to_string())),
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Request::NewClient => f.write_str("NewClient"),
            Request::NewServer => f.write_str("NewServer"),
            Request::Check { name } => write!(f, "Check {name}"),
            Request::TryLock { name, client } => write!(f, "TryLock {name} {client}"),
            Request::TryUnLock { name, client } => write!(f, "TryUnLock {name} {client}"),
        }
    }
}

/// Lock-table mutations the leader pushes down a follower's control channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replication {
    UpdateLock { name: String, owner: ClientId },
    DeleteLock { name: String, owner: ClientId },
}

impl Replication {
    /// Returns `Ok(None)` when the payload is not a replication command at all.
    pub fn parse(payload: &str) -> Result<Option<Self>, ProtocolError> {
        let (command, args) = split_args(payload);
        let command: &'static str = match command {
            "UpdateLock" => "UpdateLock",
            "DeleteLock" => "DeleteLock",
            _ => return Ok(None),
        };

        let [name, owner] = args.as_slice() else {
            return Err(ProtocolError::InvalidArguments {
                command,
                payload: payload.to_string(),
            });
        };
        let name = name.to_string();
        let owner = parse_id(command, payload, owner)?;

        Ok(Some(if command == "UpdateLock" {
            Replication::UpdateLock { name, owner }
        } else {
            Replication::DeleteLock { name, owner }
        }))
    }

    pub fn name(&self) -> &str {
        match self {
            Replication::UpdateLock { name, .. } | Replication::DeleteLock { name, .. } => name,
        }
    }
}

impl fmt::Display for Replication {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replication::UpdateLock { name, owner } => write!(f, "UpdateLock {name} {owner}"),
            Replication::DeleteLock { name, owner } => write!(f, "DeleteLock {name} {owner}"),
        }
    }
}

const LOCK_HELD: &str = "There is a lock named ";
const LOCK_ABSENT: &str = "There doesn't exist lock named ";
const PREEMPT_SUCCESS: &str = "PreemptLock Success";
const PREEMPT_CONFLICT: &str = "PreemptLock Failed, LOCK EXISTS {LOCKNAME: ";
const PREEMPT_UNAVAILABLE: &str = "PreemptLock Failed, LEADER UNAVAILABLE";
const RELEASE_SUCCESS: &str = "ReleaseLock Success";
const RELEASE_MISSING: &str = "ReleaseLock Failed ERROR: LOCK DOESN'T EXISTS";
const RELEASE_NOT_OWNER: &str = "ReleaseLock Failed CAN'T ACCESS THIS LOCK OWNED BY CLIENT ";
const RELEASE_UNAVAILABLE: &str = "ReleaseLock Failed ERROR: LEADER UNAVAILABLE";

/// Human-readable reply payloads sent toward a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    ClientId(ClientId),
    ServerId(FollowerId),
    LockHeld { name: String, owner: ClientId },
    LockAbsent { name: String },
    Acquired,
    Conflict { name: String, owner: ClientId },
    Released,
    NotFound,
    NotOwner { owner: ClientId },
    /// A follower refusing `TryLock` while its control channel is down.
    AcquireUnavailable,
    /// A follower refusing `TryUnLock` while its control channel is down.
    ReleaseUnavailable,
}

impl Reply {
    pub fn parse(payload: &str) -> Result<Self, ProtocolError> {
        let unknown = || ProtocolError::UnknownCommand(payload.to_string());

        match payload {
            PREEMPT_SUCCESS => return Ok(Reply::Acquired),
            PREEMPT_UNAVAILABLE => return Ok(Reply::AcquireUnavailable),
            RELEASE_SUCCESS => return Ok(Reply::Released),
            RELEASE_MISSING => return Ok(Reply::NotFound),
            RELEASE_UNAVAILABLE => return Ok(Reply::ReleaseUnavailable),
            _ => {}
        }

        if let Some(id) = payload.strip_prefix("ClientId ") {
            return Ok(Reply::ClientId(parse_id("ClientId", payload, id)?));
        }
        if let Some(id) = payload.strip_prefix("ServerId ") {
            return Ok(Reply::ServerId(parse_id("ServerId", payload, id)?));
        }
        if let Some(rest) = payload.strip_prefix(LOCK_HELD) {
            let (name, owner) = rest.rsplit_once(" owned by ").ok_or_else(unknown)?;
            return Ok(Reply::LockHeld {
                name: name.to_string(),
                owner: parse_id("Check", payload, owner)?,
            });
        }
        if let Some(name) = payload.strip_prefix(LOCK_ABSENT) {
            return Ok(Reply::LockAbsent {
                name: name.to_string(),
            });
        }
        if let Some(rest) = payload.strip_prefix(PREEMPT_CONFLICT) {
            let rest = rest.strip_suffix('}').ok_or_else(unknown)?;
            let (name, owner) = rest.rsplit_once(" OWNER: ").ok_or_else(unknown)?;
            return Ok(Reply::Conflict {
                name: name.to_string(),
                owner: parse_id("TryLock", payload, owner)?,
            });
        }
        if let Some(owner) = payload.strip_prefix(RELEASE_NOT_OWNER) {
            return Ok(Reply::NotOwner {
                owner: parse_id("TryUnLock", payload, owner)?,
            });
        }

        Err(unknown())
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::ClientId(id) => write!(f, "ClientId {id}"),
            Reply::ServerId(id) => write!(f, "ServerId {id}"),
            Reply::LockHeld { name, owner } => write!(f, "{LOCK_HELD}{name} owned by {owner}"),
            Reply::LockAbsent { name } => write!(f, "{LOCK_ABSENT}{name}"),
            Reply::Acquired => f.write_str(PREEMPT_SUCCESS),
            Reply::Conflict { name, owner } => write!(f, "{PREEMPT_CONFLICT}{name} OWNER: {owner}}}"),
            Reply::Released => f.write_str(RELEASE_SUCCESS),
            Reply::NotFound => f.write_str(RELEASE_MISSING),
            Reply::NotOwner { owner } => write!(f, "{RELEASE_NOT_OWNER}{owner}"),
            Reply::AcquireUnavailable => f.write_str(PREEMPT_UNAVAILABLE),
            Reply::ReleaseUnavailable => f.write_str(RELEASE_UNAVAILABLE),
        }
    }
}

/// Frames [`Message`]s with a big-endian `u32` length prefix.
///
/// A malformed envelope inside a well-delimited frame decodes to
/// `Some(Err(ProtocolError))` so the stream keeps going. Transport failures,
/// including an oversize length prefix, are `io::Error` and end the stream.
#[derive(Debug, Clone)]
pub struct WireCodec {
    frames: LengthDelimitedCodec,
}

impl WireCodec {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame_length)
                .new_codec(),
        }
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WireCodec {
    type Item = Result<Message, ProtocolError>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        Ok(self
            .frames
            .decode(src)?
            .map(|frame| Message::from_frame(&frame)))
    }
}

impl Encoder<Message> for WireCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> io::Result<()> {
        self.frames.encode(Bytes::from(item.to_string()), dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_envelope() {
        let msg = Message::op(3, Request::TryLock {
            name: "foo".into(),
            client: 3,
        });
        assert_eq!(msg.to_string(), "op::3::TryLock foo 3");
        assert_eq!(Message::parse("op::3::TryLock foo 3").unwrap(), msg);
    }

    #[test]
    fn test_message_rejects_bad_envelopes() {
        assert!(matches!(
            Message::parse("op::1"),
            Err(ProtocolError::FieldCount { found: 2, .. })
        ));
        assert!(matches!(
            Message::parse("op::1::Check a::b"),
            Err(ProtocolError::FieldCount { found: 4, .. })
        ));
        assert_eq!(
            Message::parse("rpc::1::NewClient"),
            Err(ProtocolError::UnknownChannel("rpc".into()))
        );
        assert_eq!(
            Message::parse("op::-1::NewClient"),
            Err(ProtocolError::InvalidSender("-1".into()))
        );
    }

    #[test]
    fn test_request_parsing() {
        assert_eq!(Request::parse("NewClient").unwrap(), Request::NewClient);
        assert_eq!(Request::parse("NewServer").unwrap(), Request::NewServer);
        assert_eq!(
            Request::parse("Check bar").unwrap(),
            Request::Check { name: "bar".into() }
        );
        assert_eq!(
            Request::parse("TryUnLock foo 7").unwrap(),
            Request::TryUnLock {
                name: "foo".into(),
                client: 7
            }
        );
    }

    #[test]
    fn test_request_parsing_errors() {
        assert!(matches!(
            Request::parse("Check"),
            Err(ProtocolError::InvalidArguments { command: "Check", .. })
        ));
        assert!(matches!(
            Request::parse("TryLock foo bar"),
            Err(ProtocolError::InvalidArguments { command: "TryLock", .. })
        ));
        assert!(matches!(
            Request::parse("NewClient extra"),
            Err(ProtocolError::InvalidArguments { .. })
        ));
        assert!(matches!(
            Request::parse("Steal foo"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert!(matches!(Request::parse(""), Err(ProtocolError::UnknownCommand(_))));
    }

    #[test]
    fn test_replication_parsing() {
        assert_eq!(
            Replication::parse("UpdateLock foo 2").unwrap(),
            Some(Replication::UpdateLock {
                name: "foo".into(),
                owner: 2
            })
        );
        assert_eq!(
            Replication::parse("DeleteLock foo 2").unwrap().unwrap().name(),
            "foo"
        );
        assert_eq!(Replication::parse("PreemptLock Success").unwrap(), None);
        assert!(Replication::parse("UpdateLock foo").is_err());
    }

    #[test]
    fn test_reply_text() {
        assert_eq!(
            Reply::Conflict {
                name: "foo".into(),
                owner: 1
            }
            .to_string(),
            "PreemptLock Failed, LOCK EXISTS {LOCKNAME: foo OWNER: 1}"
        );
        assert_eq!(
            Reply::NotOwner { owner: 4 }.to_string(),
            "ReleaseLock Failed CAN'T ACCESS THIS LOCK OWNED BY CLIENT 4"
        );
        assert_eq!(
            Reply::NotFound.to_string(),
            "ReleaseLock Failed ERROR: LOCK DOESN'T EXISTS"
        );
        assert_eq!(
            Reply::LockHeld {
                name: "foo".into(),
                owner: 2
            }
            .to_string(),
            "There is a lock named foo owned by 2"
        );
        assert_eq!(
            Reply::LockAbsent { name: "bar".into() }.to_string(),
            "There doesn't exist lock named bar"
        );
    }

    #[test]
    fn test_reply_parsing() {
        for reply in [
            Reply::ClientId(12),
            Reply::ServerId(1),
            Reply::LockHeld {
                name: "a".into(),
                owner: 3,
            },
            Reply::LockAbsent { name: "a".into() },
            Reply::Acquired,
            Reply::Conflict {
                name: "a".into(),
                owner: 3,
            },
            Reply::Released,
            Reply::NotFound,
            Reply::NotOwner { owner: 9 },
            Reply::AcquireUnavailable,
            Reply::ReleaseUnavailable,
        ] {
            assert_eq!(Reply::parse(&reply.to_string()).unwrap(), reply);
        }
        assert!(Reply::parse("Hello").is_err());
    }

    #[test]
    fn test_codec_handles_coalesced_frames() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Message::op(0, "NewClient"), &mut buf).unwrap();
        codec.encode(Message::op(1, "Check foo"), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(first.payload, "NewClient");
        assert_eq!(second.payload, "Check foo");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_codec_waits_for_fragmented_frame() {
        let mut codec = WireCodec::new();
        let mut whole = BytesMut::new();
        codec.encode(Message::msg(1, Reply::Acquired), &mut whole).unwrap();

        let mut buf = BytesMut::from(&whole[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&whole[6..]);
        let msg = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(msg, Message::msg(1, "PreemptLock Success"));
    }

    #[test]
    fn test_codec_keeps_stream_on_malformed_envelope() {
        let mut codec = WireCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&5u32.to_be_bytes());
        buf.extend_from_slice(b"hello");
        codec.encode(Message::op(0, "NewServer"), &mut buf).unwrap();

        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Err(ProtocolError::FieldCount { found: 1, .. }))
        ));
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().unwrap().payload,
            "NewServer"
        );
    }

    #[test]
    fn test_codec_rejects_oversize_frame() {
        let mut codec = WireCodec::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1024u32.to_be_bytes());
        buf.extend_from_slice(&[b'x'; 32]);
        assert!(codec.decode(&mut buf).is_err());
    }
}
