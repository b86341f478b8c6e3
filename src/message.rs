//! Wire message codec. A message travels as one text line of the form
//! `OPCODE C_TYPE <payload>`, where both OPCODE and C_TYPE are exactly two
//! ASCII digits and the payload shape is determined by C_TYPE:
//!
//! | C_TYPE        | payload                 |
//! |---------------|-------------------------|
//! | 10 ENTRY      | `TS_B64 KEY DATA_B64`   |
//! | 20 KEY        | `KEY`                   |
//! | 30 KEYS       | `N KEY1 ... KEYN`       |
//! | 40 VALUE      | `TS_B64 DATA_B64`       |
//! | 50 RESULT     | `INT`                   |
//! | 60 TIMESTAMP  | `TS_B64`                |
//!
//! Every timestamp is carried as the standard base64 encoding of its decimal
//! representation; data payloads are standard base64 (an empty payload
//! encodes as the empty string).

use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};

use crate::utils::QuorumKvError;

/// Logical timestamp type: `round * 1000 + client_id`; 0 means never written.
pub type Timestamp = u64;

/// Message operation code. Every reply code is its request code plus one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Put,
    PutReply,
    Get,
    GetReply,
    Del,
    DelReply,
    Size,
    SizeReply,
    GetKeys,
    GetKeysReply,
    GetTs,
    GetTsReply,
    Error,
}

impl Opcode {
    /// Numeric code on the wire.
    pub fn code(&self) -> u8 {
        match self {
            Opcode::Put => 10,
            Opcode::PutReply => 11,
            Opcode::Get => 20,
            Opcode::GetReply => 21,
            Opcode::Del => 30,
            Opcode::DelReply => 31,
            Opcode::Size => 40,
            Opcode::SizeReply => 41,
            Opcode::GetKeys => 50,
            Opcode::GetKeysReply => 51,
            Opcode::GetTs => 60,
            Opcode::GetTsReply => 61,
            Opcode::Error => 99,
        }
    }

    /// Parses a numeric code; `None` if unknown.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            10 => Some(Opcode::Put),
            11 => Some(Opcode::PutReply),
            20 => Some(Opcode::Get),
            21 => Some(Opcode::GetReply),
            30 => Some(Opcode::Del),
            31 => Some(Opcode::DelReply),
            40 => Some(Opcode::Size),
            41 => Some(Opcode::SizeReply),
            50 => Some(Opcode::GetKeys),
            51 => Some(Opcode::GetKeysReply),
            60 => Some(Opcode::GetTs),
            61 => Some(Opcode::GetTsReply),
            99 => Some(Opcode::Error),
            _ => None,
        }
    }

    /// The reply opcode matching this request opcode, or `None` if this is
    /// not a request.
    pub fn reply(&self) -> Option<Self> {
        match self {
            Opcode::Put => Some(Opcode::PutReply),
            Opcode::Get => Some(Opcode::GetReply),
            Opcode::Del => Some(Opcode::DelReply),
            Opcode::Size => Some(Opcode::SizeReply),
            Opcode::GetKeys => Some(Opcode::GetKeysReply),
            Opcode::GetTs => Some(Opcode::GetTsReply),
            _ => None,
        }
    }
}

/// Typed message content, one variant per C_TYPE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Entry {
        key: String,
        payload: Vec<u8>,
        ts: Timestamp,
    },
    Key(String),
    Keys(Vec<String>),
    Value {
        payload: Vec<u8>,
        ts: Timestamp,
    },
    Result(i32),
    Timestamp(Timestamp),
}

impl Content {
    /// Numeric content type code on the wire.
    pub fn c_type(&self) -> u8 {
        match self {
            Content::Entry { .. } => 10,
            Content::Key(_) => 20,
            Content::Keys(_) => 30,
            Content::Value { .. } => 40,
            Content::Result(_) => 50,
            Content::Timestamp(_) => 60,
        }
    }
}

/// A request or reply message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub content: Content,
}

/// Returns true if `key` is usable as a table key: non-empty and free of
/// whitespace (keys are space-delimited on the wire).
pub fn valid_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(char::is_whitespace)
}

/// Base64 of the decimal representation of `ts`.
pub(crate) fn encode_ts(ts: Timestamp) -> String {
    BASE64.encode(ts.to_string())
}

pub(crate) fn decode_ts(s: &str) -> Result<Timestamp, QuorumKvError> {
    let decimal = String::from_utf8(BASE64.decode(s)?)?;
    Ok(decimal.parse::<Timestamp>()?)
}

pub(crate) fn decode_key(s: &str) -> Result<String, QuorumKvError> {
    if !valid_key(s) {
        return Err(QuorumKvError(format!("invalid key '{}'", s)));
    }
    Ok(s.to_string())
}

/// Parses a field of exactly two ASCII digits.
fn decode_two_digits(s: &str) -> Result<u8, QuorumKvError> {
    if s.len() != 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(QuorumKvError(format!("invalid code field '{}'", s)));
    }
    Ok(s.parse::<u8>()?)
}

impl Message {
    pub fn new(opcode: Opcode, content: Content) -> Self {
        Message { opcode, content }
    }

    /// The generic failure reply: `99 50 -1`.
    pub fn error() -> Self {
        Message::new(Opcode::Error, Content::Result(-1))
    }

    /// Serializes into the wire text line.
    pub fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parses a wire text line. Rejects unknown codes, malformed payloads,
    /// and invalid keys.
    pub fn decode(bytes: &[u8]) -> Result<Self, QuorumKvError> {
        let line = String::from_utf8(bytes.to_vec())?;
        let mut segs = line.splitn(3, ' ');
        let opcode_str = segs.next().unwrap_or("");
        let c_type_str = segs.next().unwrap_or("");
        let body = segs.next().unwrap_or("");

        let code = decode_two_digits(opcode_str)?;
        let opcode = Opcode::from_code(code).ok_or_else(|| {
            QuorumKvError(format!("unknown opcode {}", code))
        })?;
        let c_type = decode_two_digits(c_type_str)?;

        let content = match c_type {
            10 => {
                let mut parts = body.splitn(3, ' ');
                let ts = decode_ts(parts.next().unwrap_or(""))?;
                let key = decode_key(parts.next().unwrap_or(""))?;
                let payload = BASE64.decode(parts.next().unwrap_or(""))?;
                Content::Entry { key, payload, ts }
            }
            20 => Content::Key(decode_key(body)?),
            30 => {
                let mut parts = body.split(' ');
                let count = parts.next().unwrap_or("").parse::<usize>()?;
                let keys = parts
                    .filter(|k| !k.is_empty())
                    .map(decode_key)
                    .collect::<Result<Vec<_>, _>>()?;
                if keys.len() != count {
                    return Err(QuorumKvError(format!(
                        "keys count {} mismatches {} keys given",
                        count,
                        keys.len()
                    )));
                }
                Content::Keys(keys)
            }
            40 => {
                let mut parts = body.splitn(2, ' ');
                let ts = decode_ts(parts.next().unwrap_or(""))?;
                let payload = BASE64.decode(parts.next().unwrap_or(""))?;
                Content::Value { payload, ts }
            }
            50 => Content::Result(body.parse::<i32>().map_err(|e| {
                QuorumKvError(format!("invalid result '{}': {}", body, e))
            })?),
            60 => Content::Timestamp(decode_ts(body)?),
            _ => {
                return Err(QuorumKvError(format!(
                    "unknown content type {}",
                    c_type
                )))
            }
        };

        Ok(Message { opcode, content })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:02} {:02}", self.opcode.code(), self.content.c_type())?;
        match &self.content {
            Content::Entry { key, payload, ts } => write!(
                f,
                " {} {} {}",
                encode_ts(*ts),
                key,
                BASE64.encode(payload)
            ),
            Content::Key(key) => write!(f, " {}", key),
            Content::Keys(keys) => {
                write!(f, " {}", keys.len())?;
                for key in keys {
                    write!(f, " {}", key)?;
                }
                Ok(())
            }
            Content::Value { payload, ts } => {
                write!(f, " {} {}", encode_ts(*ts), BASE64.encode(payload))
            }
            Content::Result(result) => write!(f, " {}", result),
            Content::Timestamp(ts) => write!(f, " {}", encode_ts(*ts)),
        }
    }
}
