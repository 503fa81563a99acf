//! # Telex Envelope Model
//!
//! A telex is one UDP datagram carrying a JSON object. Top-level entries
//! are classified by the first character of their value text:
//!
//! | Prefix | Category | Example |
//! |--------|----------|---------|
//! | `.`    | Command  | `".see": ".1.2.3.4:5678"` |
//! | `+`    | Signal   | `"+end": "+a9993e364706816aba3e25717850c26c9cd0d89d"` |
//! | `_`    | Header   | `"_ring": "_17902"` |
//!
//! Everything else is application payload. Classification happens once,
//! while parsing a received datagram: qualifying entries are moved out of
//! the object in encounter order, commands first, then signals, then
//! headers, and what remains is the payload. Outbound telexes are never
//! classified; the payload ships exactly as the caller built it.
//!
//! Key order is protocol-visible, so the payload keeps entries in the
//! order they appeared on the wire.

use std::fmt;
use std::net::SocketAddr;

use serde_json::{Map, Value};

/// Maximum UTF-8 encoded size of a telex datagram.
/// Chosen to fit a UDP payload into typical path MTUs without fragmentation.
pub const MAX_TELEX_SIZE: usize = 1400;

/// Value prefix marking a protocol command.
const COMMAND_PREFIX: char = '.';

/// Value prefix marking a protocol signal.
const SIGNAL_PREFIX: char = '+';

/// Value prefix marking a protocol header.
const HEADER_PREFIX: char = '_';

/// Raw datagram text could not be understood as a telex.
#[derive(Debug)]
pub enum MalformedTelex {
    /// The text is not valid JSON.
    Syntax(serde_json::Error),
    /// The text is valid JSON but not an object.
    NotAnObject,
}

impl fmt::Display for MalformedTelex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedTelex::Syntax(err) => write!(f, "telex is not valid JSON: {}", err),
            MalformedTelex::NotAnObject => write!(f, "telex is not a JSON object"),
        }
    }
}

impl std::error::Error for MalformedTelex {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MalformedTelex::Syntax(err) => Some(err),
            MalformedTelex::NotAnObject => None,
        }
    }
}

/// One telex message: the application payload plus the protocol-special
/// entries extracted from it, and the destination for outbound telexes.
#[derive(Clone, Debug)]
pub struct Telex {
    payload: Map<String, Value>,
    commands: Vec<(String, String)>,
    signals: Vec<(String, String)>,
    headers: Vec<(String, String)>,
    endpoint: Option<SocketAddr>,
}

impl Telex {
    /// Build a telex for sending.
    ///
    /// `payload_json` must be a JSON object; it is stored verbatim and no
    /// command/signal/header extraction is performed. Protocol-special
    /// entries the caller embedded stay in the payload and ship as-is.
    pub fn outbound(payload_json: &str, destination: SocketAddr) -> Result<Self, MalformedTelex> {
        let payload = parse_object(payload_json)?;
        Ok(Self {
            payload,
            commands: Vec::new(),
            signals: Vec::new(),
            headers: Vec::new(),
            endpoint: Some(destination),
        })
    }

    /// Parse a received datagram into a telex.
    ///
    /// Trailing NUL padding from fixed-size receive buffers is stripped
    /// before parsing. Extraction runs in three passes over the top-level
    /// entries, commands first, then signals, then headers. Each pass
    /// scans in original key order and moves qualifying entries out of
    /// the object, so the remaining payload never contains a
    /// protocol-special value.
    pub fn parse(raw: &str) -> Result<Self, MalformedTelex> {
        let mut object = parse_object(raw)?;
        let commands = extract(&mut object, COMMAND_PREFIX);
        let signals = extract(&mut object, SIGNAL_PREFIX);
        let headers = extract(&mut object, HEADER_PREFIX);
        Ok(Self {
            payload: object,
            commands,
            signals,
            headers,
            endpoint: None,
        })
    }

    /// The application payload with protocol-special entries removed.
    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Commands in wire encounter order.
    pub fn commands(&self) -> &[(String, String)] {
        &self.commands
    }

    /// Signals in wire encounter order.
    pub fn signals(&self) -> &[(String, String)] {
        &self.signals
    }

    /// Headers in wire encounter order.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    /// Destination address; only set on outbound telexes.
    pub fn endpoint(&self) -> Option<SocketAddr> {
        self.endpoint
    }

    /// Look up a command value by its key.
    pub fn command(&self, key: &str) -> Option<&str> {
        lookup(&self.commands, key)
    }

    /// Look up a signal value by its key.
    pub fn signal(&self, key: &str) -> Option<&str> {
        lookup(&self.signals, key)
    }

    /// Look up a header value by its key.
    pub fn header(&self, key: &str) -> Option<&str> {
        lookup(&self.headers, key)
    }

    /// The payload rendered as compact JSON. This is the wire form of an
    /// outbound telex.
    pub fn payload_json(&self) -> String {
        serde_json::to_string(&self.payload).expect("object serialization cannot fail")
    }
}

/// Log rendering: payload JSON concatenated with the command, signal,
/// and header lists in that order. Not valid JSON and not re-parseable;
/// the wire form of a telex is [`Telex::payload_json`].
impl fmt::Display for Telex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:?}{:?}{:?}",
            self.payload_json(),
            self.commands,
            self.signals,
            self.headers
        )
    }
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, MalformedTelex> {
    let trimmed = raw.trim_matches('\0');
    let value: Value = serde_json::from_str(trimmed).map_err(MalformedTelex::Syntax)?;
    match value {
        Value::Object(object) => Ok(object),
        _ => Err(MalformedTelex::NotAnObject),
    }
}

/// Move every entry whose value text starts with `prefix` out of the
/// object, preserving encounter order on both sides of the split.
fn extract(object: &mut Map<String, Value>, prefix: char) -> Vec<(String, String)> {
    let mut extracted = Vec::new();
    let mut remaining = Map::new();
    for (key, value) in std::mem::take(object) {
        let text = value_text(&value);
        if text.starts_with(prefix) {
            extracted.push((key, text));
        } else {
            remaining.insert(key, value);
        }
    }
    *object = remaining;
    extracted
}

/// The text a value is classified by: a string's own content, any other
/// JSON type's compact rendering.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|(entry_key, _)| entry_key == key)
        .map(|(_, value)| value.as_str())
}
