//! Shoal wire format — everything that crosses a socket.
//!
//! Two framings share one event vocabulary:
//!
//! * Datagrams carry an [`Envelope`] `{event, payload}` encoded with bincode
//!   as a single packet. Used for multicast gossip, locate and ping traffic.
//! * Streams carry a [`StreamEnvelope`] `{command, sequence, message}`
//!   preceded by a 2-byte big-endian length, optionally followed by a raw
//!   body that runs until the writer closes the connection.
//!
//! The payload bytes inside both envelopes are the bincode encoding of the
//! event-specific struct, selected by the event name.

use serde::{Deserialize, Serialize};

use crate::record::{Capacity, DownVote};

// ── Event names ───────────────────────────────────────────────────────────────

pub const EVENT_ANNOUNCE: &str = "announce";
pub const EVENT_BOOT: &str = "boot";
pub const EVENT_LOCATE: &str = "locate";
pub const EVENT_PING: &str = "ping";
pub const EVENT_PONG: &str = "pong";
pub const EVENT_VOTE: &str = "vote";
pub const EVENT_MARK_UP: &str = "markup";

/// Locate replies are addressed by query token: the event name is
/// `found:{token}`, so only the initiator holding that token listens for it.
pub const LOCATE_REPLY_PREFIX: &str = "found:";

// ── Service names ─────────────────────────────────────────────────────────────

/// Advertised by nodes that hold content bytes.
pub const SERVICE_STORE: &str = "store";
/// Advertised by routing-tier nodes.
pub const SERVICE_GATEWAY: &str = "gateway";
pub const SERVICE_IMPORT: &str = "import";
pub const SERVICE_EXPORT: &str = "export";

// ── Constants ─────────────────────────────────────────────────────────────────

/// Largest datagram we are willing to emit. Announces are a few hundred bytes.
pub const MAX_DATAGRAM: usize = 8192;

/// Largest stream envelope the 2-byte length prefix can describe.
pub const MAX_FRAME: usize = u16::MAX as usize;

/// Length of a stream frame header.
pub const FRAME_HEADER_LEN: usize = 2;

// ── Payloads ──────────────────────────────────────────────────────────────────

/// Lifecycle state advertised in every announce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    /// Still absorbing the cluster snapshot after a boot request.
    #[default]
    Booting,
    /// Serving traffic.
    Ready,
    /// Shutting down; peers should stop routing here.
    Draining,
}

/// Periodic self-description broadcast by every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Announce {
    /// Sender wall clock, unix milliseconds.
    pub sent: u64,
    pub hostname: String,
    pub ready_state: ReadyState,
    pub peer_count: u32,
    pub disk_free: u64,
    pub disk_total: u64,
    pub cpu_used: f32,
    pub cpu_count: u32,
    pub memory_free: u64,
    pub memory_total: u64,
    pub available_capacity: u8,
    pub services: Vec<String>,
    /// Routing domain (gateway name) a store sits behind.
    pub domain: Option<String>,
    pub writable: bool,
    pub port_import: u16,
    pub port_export: u16,
    pub port_prism: u16,
    pub port_announce: u16,
    pub port_ping: u16,
    pub net_speed: u64,
    pub net_in_bps: u64,
    pub net_out_bps: u64,
    pub import_hits: u64,
}

impl Announce {
    /// Capacity metrics carried by this announce.
    pub fn capacity(&self) -> Capacity {
        Capacity {
            disk_free: self.disk_free,
            disk_total: self.disk_total,
            cpu_used: self.cpu_used,
            cpu_count: self.cpu_count,
            memory_free: self.memory_free,
            memory_total: self.memory_total,
            net_speed: self.net_speed,
            net_in_bps: self.net_in_bps,
            net_out_bps: self.net_out_bps,
        }
    }

    /// Ports for the services this announce advertises, keyed by port name.
    pub fn ports(&self) -> Vec<(&'static str, u16)> {
        let mut ports = vec![("announce", self.port_announce), ("ping", self.port_ping)];
        if self.services.iter().any(|s| s == SERVICE_IMPORT) {
            ports.push(("import", self.port_import));
        }
        if self.services.iter().any(|s| s == SERVICE_EXPORT) {
            ports.push(("export", self.port_export));
        }
        if self.services.iter().any(|s| s == SERVICE_GATEWAY) {
            ports.push(("prism", self.port_prism));
        }
        ports
    }
}

/// Sent once by a starting node; every peer answers with its announce.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootRequest {
    pub hostname: String,
    /// Stream port the booting node accepts announce replies on.
    pub port_announce: u16,
}

/// Scatter half of a locate query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateRequest {
    pub token: String,
    pub hash: String,
}

/// Gather half of a locate query. The token travels in the event name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocateReply {
    #[serde(skip)]
    pub token: String,
    pub peer: String,
    pub exists: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub token: String,
    /// Requester wall clock, unix milliseconds.
    pub sent_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub token: String,
    pub peer: String,
}

/// A restarted node vouching for itself; peers purge the votes against it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkUp {
    pub hostname: String,
}

// ── Events ────────────────────────────────────────────────────────────────────

/// Every message the cluster exchanges, decoded from either framing.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Announce(Announce),
    Boot(BootRequest),
    Locate(LocateRequest),
    LocateReply(LocateReply),
    Ping(Ping),
    Pong(Pong),
    Vote(DownVote),
    MarkUp(MarkUp),
}

impl Event {
    /// Event name used for routing. Locate replies embed their token.
    pub fn name(&self) -> String {
        match self {
            Event::Announce(_) => EVENT_ANNOUNCE.to_string(),
            Event::Boot(_) => EVENT_BOOT.to_string(),
            Event::Locate(_) => EVENT_LOCATE.to_string(),
            Event::LocateReply(r) => format!("{LOCATE_REPLY_PREFIX}{}", r.token),
            Event::Ping(_) => EVENT_PING.to_string(),
            Event::Pong(_) => EVENT_PONG.to_string(),
            Event::Vote(_) => EVENT_VOTE.to_string(),
            Event::MarkUp(_) => EVENT_MARK_UP.to_string(),
        }
    }

    /// Routing kind: like [`Event::name`] but without the reply token.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Announce(_) => EVENT_ANNOUNCE,
            Event::Boot(_) => EVENT_BOOT,
            Event::Locate(_) => EVENT_LOCATE,
            Event::LocateReply(_) => LOCATE_REPLY_PREFIX,
            Event::Ping(_) => EVENT_PING,
            Event::Pong(_) => EVENT_PONG,
            Event::Vote(_) => EVENT_VOTE,
            Event::MarkUp(_) => EVENT_MARK_UP,
        }
    }

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        let bytes = match self {
            Event::Announce(p) => bincode::serialize(p),
            Event::Boot(p) => bincode::serialize(p),
            Event::Locate(p) => bincode::serialize(p),
            Event::LocateReply(p) => bincode::serialize(p),
            Event::Ping(p) => bincode::serialize(p),
            Event::Pong(p) => bincode::serialize(p),
            Event::Vote(p) => bincode::serialize(p),
            Event::MarkUp(p) => bincode::serialize(p),
        };
        bytes.map_err(|e| WireError::Encode(e.to_string()))
    }

    fn decode_payload(name: &str, payload: &[u8]) -> Result<Self, WireError> {
        fn de<T: for<'de> Deserialize<'de>>(name: &str, payload: &[u8]) -> Result<T, WireError> {
            bincode::deserialize(payload).map_err(|e| WireError::Malformed {
                event: name.to_string(),
                reason: e.to_string(),
            })
        }

        if let Some(token) = name.strip_prefix(LOCATE_REPLY_PREFIX) {
            if token.is_empty() {
                return Err(WireError::MissingToken);
            }
            let mut reply: LocateReply = de(name, payload)?;
            reply.token = token.to_string();
            return Ok(Event::LocateReply(reply));
        }

        match name {
            EVENT_ANNOUNCE => Ok(Event::Announce(de(name, payload)?)),
            EVENT_BOOT => Ok(Event::Boot(de(name, payload)?)),
            EVENT_LOCATE => {
                let req: LocateRequest = de(name, payload)?;
                if req.token.is_empty() {
                    return Err(WireError::MissingToken);
                }
                Ok(Event::Locate(req))
            }
            EVENT_PING => Ok(Event::Ping(de(name, payload)?)),
            EVENT_PONG => Ok(Event::Pong(de(name, payload)?)),
            EVENT_VOTE => Ok(Event::Vote(de(name, payload)?)),
            EVENT_MARK_UP => Ok(Event::MarkUp(de(name, payload)?)),
            other => Err(WireError::UnknownEvent(other.to_string())),
        }
    }
}

// ── Datagram envelope ─────────────────────────────────────────────────────────

/// `{event, payload}` — the unit of datagram transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn from_event(event: &Event) -> Result<Self, WireError> {
        Ok(Self {
            event: event.name(),
            payload: event.encode_payload()?,
        })
    }

    pub fn into_event(self) -> Result<Event, WireError> {
        Event::decode_payload(&self.event, &self.payload)
    }
}

/// Serialize an event into a single datagram.
pub fn encode_datagram(event: &Event) -> Result<Vec<u8>, WireError> {
    let envelope = Envelope::from_event(event)?;
    let bytes = bincode::serialize(&envelope).map_err(|e| WireError::Encode(e.to_string()))?;
    if bytes.len() > MAX_DATAGRAM {
        return Err(WireError::TooLarge {
            len: bytes.len(),
            max: MAX_DATAGRAM,
        });
    }
    Ok(bytes)
}

/// Parse a received datagram.
pub fn decode_datagram(bytes: &[u8]) -> Result<Event, WireError> {
    let envelope: Envelope = bincode::deserialize(bytes).map_err(|e| WireError::Malformed {
        event: "<envelope>".to_string(),
        reason: e.to_string(),
    })?;
    envelope.into_event()
}

// ── Stream envelope ───────────────────────────────────────────────────────────

/// `{command, sequence, message}` — the unit of stream transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub command: String,
    pub sequence: u64,
    pub message: Vec<u8>,
}

impl StreamEnvelope {
    pub fn from_event(event: &Event, sequence: u64) -> Result<Self, WireError> {
        Ok(Self {
            command: event.name(),
            sequence,
            message: event.encode_payload()?,
        })
    }

    pub fn into_event(self) -> Result<Event, WireError> {
        Event::decode_payload(&self.command, &self.message)
    }
}

/// Encode a stream envelope as `len (u16 BE) || bincode(envelope)`.
pub fn encode_frame(envelope: &StreamEnvelope) -> Result<Vec<u8>, WireError> {
    let body = bincode::serialize(envelope).map_err(|e| WireError::Encode(e.to_string()))?;
    if body.len() > MAX_FRAME {
        return Err(WireError::TooLarge {
            len: body.len(),
            max: MAX_FRAME,
        });
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u16).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Length announced by a frame header.
pub fn frame_len(header: [u8; FRAME_HEADER_LEN]) -> usize {
    u16::from_be_bytes(header) as usize
}

/// Decode the envelope bytes that follow a frame header.
pub fn decode_frame_body(body: &[u8]) -> Result<StreamEnvelope, WireError> {
    bincode::deserialize(body).map_err(|e| WireError::Malformed {
        event: "<stream>".to_string(),
        reason: e.to_string(),
    })
}

// ── Tokens ────────────────────────────────────────────────────────────────────

/// Fresh random query/ping token: 16 random bytes, hex encoded.
pub fn new_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when encoding or interpreting wire data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown event: {0}")]
    UnknownEvent(String),

    #[error("malformed {event} payload: {reason}")]
    Malformed { event: String, reason: String },

    #[error("message is missing its token")]
    MissingToken,

    #[error("encoded length {len} exceeds maximum {max}")]
    TooLarge { len: usize, max: usize },

    #[error("failed to encode: {0}")]
    Encode(String),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
