//! Typed requests and replies.
//!
//! The wire layer only knows opcodes and positional fields. This module gives each
//! opcode a typed request, and gives every reply the shape
//! `[status, ...]` where status is `T` on success or `F` followed by a
//! [`FailureReason`].

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::catalog_store::{CatalogError, NodeAddress, SongId};
use crate::wire_protocol::{Field, Message, Opcode};

/// Status tag for a successful reply
pub const STATUS_OK: &str = "T";

/// Status tag for a failed reply
pub const STATUS_FAILED: &str = "F";

/// Affirmative payload of a `vrf` reply
pub const VERIFY_FOUND: &str = "found";

/// Why a request was refused. Each variant has a stable wire string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureReason {
    UnknownUsername,
    WrongPassword,
    SongNotFound,
    SongUnavailable,
    SongExists,
    UserExists,
    UnknownUser,
    AlreadyInPlaylist,
    NotInPlaylist,
    NoActiveNodes,
    TokenExpired,
    InvalidToken,
    Unauthorized,
    NotAuthenticated,
    Forbidden,
    NotFound,
    Lost,
    IoError,
    BadRequest,
    Internal,
}

impl FailureReason {
    const ALL: [FailureReason; 20] = [
        FailureReason::UnknownUsername,
        FailureReason::WrongPassword,
        FailureReason::SongNotFound,
        FailureReason::SongUnavailable,
        FailureReason::SongExists,
        FailureReason::UserExists,
        FailureReason::UnknownUser,
        FailureReason::AlreadyInPlaylist,
        FailureReason::NotInPlaylist,
        FailureReason::NoActiveNodes,
        FailureReason::TokenExpired,
        FailureReason::InvalidToken,
        FailureReason::Unauthorized,
        FailureReason::NotAuthenticated,
        FailureReason::Forbidden,
        FailureReason::NotFound,
        FailureReason::Lost,
        FailureReason::IoError,
        FailureReason::BadRequest,
        FailureReason::Internal,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            FailureReason::UnknownUsername => "unknown_username",
            FailureReason::WrongPassword => "wrong_password",
            FailureReason::SongNotFound => "song_not_found",
            FailureReason::SongUnavailable => "song_unavailable",
            FailureReason::SongExists => "song_exists",
            FailureReason::UserExists => "user_exists",
            FailureReason::UnknownUser => "unknown_user",
            FailureReason::AlreadyInPlaylist => "already_in_playlist",
            FailureReason::NotInPlaylist => "not_in_playlist",
            FailureReason::NoActiveNodes => "no_active_nodes",
            FailureReason::TokenExpired => "token_expired",
            FailureReason::InvalidToken => "invalid_token",
            FailureReason::Unauthorized => "unauthorized",
            FailureReason::NotAuthenticated => "not_authenticated",
            FailureReason::Forbidden => "forbidden",
            FailureReason::NotFound => "not_found",
            FailureReason::Lost => "lost",
            FailureReason::IoError => "io_error",
            FailureReason::BadRequest => "bad_request",
            FailureReason::Internal => "internal",
        }
    }

    /// Token failures that send a catalog connection back to the login phase
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            FailureReason::TokenExpired | FailureReason::InvalidToken | FailureReason::Unauthorized
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FailureReason {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| RequestError::UnknownReason {
                reason: s.to_string(),
            })
    }
}

impl From<&CatalogError> for FailureReason {
    fn from(error: &CatalogError) -> Self {
        match error {
            CatalogError::SongNotFound { .. } => FailureReason::SongNotFound,
            CatalogError::SongUnavailable { .. } => FailureReason::SongUnavailable,
            CatalogError::SongExists { .. } => FailureReason::SongExists,
            CatalogError::UserExists { .. } => FailureReason::UserExists,
            CatalogError::UnknownUsername { .. } => FailureReason::UnknownUsername,
            CatalogError::WrongPassword { .. } => FailureReason::WrongPassword,
            CatalogError::UnknownUser { .. } => FailureReason::UnknownUser,
            CatalogError::AlreadyInPlaylist { .. } => FailureReason::AlreadyInPlaylist,
            CatalogError::NotInPlaylist { .. } => FailureReason::NotInPlaylist,
            CatalogError::NoActiveNodes => FailureReason::NoActiveNodes,
            _ => FailureReason::Internal,
        }
    }
}

/// A well-framed message whose fields do not fit its opcode
#[derive(Error, Debug)]
pub enum RequestError {
    #[error("Framing error: {reason}")]
    Framing { reason: String },

    #[error("Opcode {opcode} is not handled here")]
    UnexpectedOpcode { opcode: Opcode },

    #[error("{opcode}: expected {expected} fields, got {actual}")]
    FieldCount {
        opcode: Opcode,
        expected: usize,
        actual: usize,
    },

    #[error("{opcode}: field {index} must be {expected}")]
    FieldType {
        opcode: Opcode,
        index: usize,
        expected: &'static str,
    },

    #[error("{opcode}: field {index} has invalid value {value:?}")]
    InvalidValue {
        opcode: Opcode,
        index: usize,
        value: String,
    },

    #[error("Invalid reply status {status:?}")]
    InvalidStatus { status: String },

    #[error("Unknown failure reason {reason:?}")]
    UnknownReason { reason: String },
}

/// Result type for request parsing
pub type RequestResult<T> = Result<T, RequestError>;

/// Consumes a message's fields in order
pub struct FieldReader {
    opcode: Opcode,
    fields: std::vec::IntoIter<Field>,
    index: usize,
}

impl FieldReader {
    /// Start reading, requiring exactly `expected` fields
    pub fn exact(message: Message, expected: usize) -> RequestResult<Self> {
        if message.fields.len() != expected {
            return Err(RequestError::FieldCount {
                opcode: message.opcode,
                expected,
                actual: message.fields.len(),
            });
        }
        Ok(Self::new(message))
    }

    pub fn new(message: Message) -> Self {
        Self {
            opcode: message.opcode,
            fields: message.fields.into_iter(),
            index: 0,
        }
    }

    pub fn remaining(&self) -> usize {
        self.fields.len()
    }

    fn next_field(&mut self) -> RequestResult<(usize, Field)> {
        let index = self.index;
        let field = self.fields.next().ok_or(RequestError::FieldCount {
            opcode: self.opcode,
            expected: index + 1,
            actual: index,
        })?;
        self.index += 1;
        Ok((index, field))
    }

    pub fn text(&mut self) -> RequestResult<String> {
        match self.next_field()? {
            (_, Field::Text(text)) => Ok(text),
            (index, Field::Binary(_)) => Err(RequestError::FieldType {
                opcode: self.opcode,
                index,
                expected: "text",
            }),
        }
    }

    pub fn binary(&mut self) -> RequestResult<Vec<u8>> {
        match self.next_field()? {
            (_, Field::Binary(bytes)) => Ok(bytes),
            (index, Field::Text(_)) => Err(RequestError::FieldType {
                opcode: self.opcode,
                index,
                expected: "binary",
            }),
        }
    }

    /// Read a text field and parse it
    pub fn parse<T: FromStr>(&mut self) -> RequestResult<T> {
        let index = self.index;
        let text = self.text()?;
        text.parse().map_err(|_| RequestError::InvalidValue {
            opcode: self.opcode,
            index,
            value: text,
        })
    }
}

/// Requests handled by the catalog server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogRequest {
    Signup {
        username: String,
        password: String,
    },
    Login {
        username: String,
        password: String,
    },
    GetAddress {
        token: String,
        song_id: SongId,
    },
    AddSong {
        token: String,
        name: String,
        artist: String,
    },
    Refresh {
        token: String,
    },
    AddToPlaylist {
        token: String,
        username: String,
        playlist: String,
        song_id: SongId,
    },
    RemoveFromPlaylist {
        token: String,
        username: String,
        playlist: String,
        song_id: SongId,
    },
    Relogin {
        token: String,
    },
    Exit {
        token: Option<String>,
    },
}

impl CatalogRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            CatalogRequest::Signup { .. } => Opcode::Signup,
            CatalogRequest::Login { .. } => Opcode::Login,
            CatalogRequest::GetAddress { .. } => Opcode::GetAddress,
            CatalogRequest::AddSong { .. } => Opcode::AddSong,
            CatalogRequest::Refresh { .. } => Opcode::Refresh,
            CatalogRequest::AddToPlaylist { .. } => Opcode::AddToPlaylist,
            CatalogRequest::RemoveFromPlaylist { .. } => Opcode::RemoveFromPlaylist,
            CatalogRequest::Relogin { .. } => Opcode::Relogin,
            CatalogRequest::Exit { .. } => Opcode::Exit,
        }
    }

    /// Session token carried by the request, if any
    pub fn token(&self) -> Option<&str> {
        match self {
            CatalogRequest::Signup { .. } | CatalogRequest::Login { .. } => None,
            CatalogRequest::GetAddress { token, .. }
            | CatalogRequest::AddSong { token, .. }
            | CatalogRequest::Refresh { token }
            | CatalogRequest::AddToPlaylist { token, .. }
            | CatalogRequest::RemoveFromPlaylist { token, .. }
            | CatalogRequest::Relogin { token } => Some(token),
            CatalogRequest::Exit { token } => token.as_deref(),
        }
    }

    pub fn from_message(message: Message) -> RequestResult<Self> {
        if let Some(reason) = message.error_reason() {
            return Err(RequestError::Framing {
                reason: reason.to_string(),
            });
        }

        let request = match message.opcode {
            Opcode::Signup | Opcode::Login => {
                let opcode = message.opcode;
                let mut reader = FieldReader::exact(message, 2)?;
                let username = reader.text()?;
                let password = reader.text()?;
                if opcode == Opcode::Signup {
                    CatalogRequest::Signup { username, password }
                } else {
                    CatalogRequest::Login { username, password }
                }
            }
            Opcode::GetAddress => {
                let mut reader = FieldReader::exact(message, 2)?;
                CatalogRequest::GetAddress {
                    token: reader.text()?,
                    song_id: reader.parse()?,
                }
            }
            Opcode::AddSong => {
                let mut reader = FieldReader::exact(message, 3)?;
                CatalogRequest::AddSong {
                    token: reader.text()?,
                    name: reader.text()?,
                    artist: reader.text()?,
                }
            }
            Opcode::Refresh => {
                let mut reader = FieldReader::exact(message, 1)?;
                CatalogRequest::Refresh {
                    token: reader.text()?,
                }
            }
            Opcode::AddToPlaylist | Opcode::RemoveFromPlaylist => {
                let opcode = message.opcode;
                let mut reader = FieldReader::exact(message, 4)?;
                let token = reader.text()?;
                let username = reader.text()?;
                let playlist = reader.text()?;
                let song_id = reader.parse()?;
                if opcode == Opcode::AddToPlaylist {
                    CatalogRequest::AddToPlaylist {
                        token,
                        username,
                        playlist,
                        song_id,
                    }
                } else {
                    CatalogRequest::RemoveFromPlaylist {
                        token,
                        username,
                        playlist,
                        song_id,
                    }
                }
            }
            Opcode::Relogin => {
                let mut reader = FieldReader::exact(message, 1)?;
                CatalogRequest::Relogin {
                    token: reader.text()?,
                }
            }
            Opcode::Exit => {
                let mut reader = FieldReader::new(message);
                let token = match reader.remaining() {
                    0 => None,
                    1 => Some(reader.text()?),
                    actual => {
                        return Err(RequestError::FieldCount {
                            opcode: Opcode::Exit,
                            expected: 1,
                            actual,
                        })
                    }
                };
                CatalogRequest::Exit { token }
            }
            opcode => return Err(RequestError::UnexpectedOpcode { opcode }),
        };

        Ok(request)
    }

    pub fn into_message(self) -> Message {
        let opcode = self.opcode();
        let fields: Vec<Field> = match self {
            CatalogRequest::Signup { username, password }
            | CatalogRequest::Login { username, password } => {
                vec![username.into(), password.into()]
            }
            CatalogRequest::GetAddress { token, song_id } => {
                vec![token.into(), song_id.0.into()]
            }
            CatalogRequest::AddSong {
                token,
                name,
                artist,
            } => vec![token.into(), name.into(), artist.into()],
            CatalogRequest::Refresh { token } | CatalogRequest::Relogin { token } => {
                vec![token.into()]
            }
            CatalogRequest::AddToPlaylist {
                token,
                username,
                playlist,
                song_id,
            }
            | CatalogRequest::RemoveFromPlaylist {
                token,
                username,
                playlist,
                song_id,
            } => vec![
                token.into(),
                username.into(),
                playlist.into(),
                song_id.0.into(),
            ],
            CatalogRequest::Exit { token } => token.into_iter().map(Field::from).collect(),
        };
        Message::new(opcode, fields)
    }
}

/// Requests handled by a storage node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRequest {
    Get {
        token: String,
        song_id: SongId,
    },
    Post {
        token: String,
        song_id: SongId,
        data: Vec<u8>,
    },
    Hello {
        token: String,
    },
    Verify {
        token: String,
        song_id: SongId,
    },
    Relay {
        token: String,
        ingest_token: String,
        song_id: SongId,
        destination: NodeAddress,
    },
    Ingest {
        token: String,
        song_id: SongId,
        data: Vec<u8>,
    },
}

impl NodeRequest {
    pub fn opcode(&self) -> Opcode {
        match self {
            NodeRequest::Get { .. } => Opcode::Get,
            NodeRequest::Post { .. } => Opcode::Post,
            NodeRequest::Hello { .. } => Opcode::Hello,
            NodeRequest::Verify { .. } => Opcode::Verify,
            NodeRequest::Relay { .. } => Opcode::Relay,
            NodeRequest::Ingest { .. } => Opcode::Ingest,
        }
    }

    pub fn token(&self) -> &str {
        match self {
            NodeRequest::Get { token, .. }
            | NodeRequest::Post { token, .. }
            | NodeRequest::Hello { token }
            | NodeRequest::Verify { token, .. }
            | NodeRequest::Relay { token, .. }
            | NodeRequest::Ingest { token, .. } => token,
        }
    }

    pub fn from_message(message: Message) -> RequestResult<Self> {
        if let Some(reason) = message.error_reason() {
            return Err(RequestError::Framing {
                reason: reason.to_string(),
            });
        }

        let request = match message.opcode {
            Opcode::Get | Opcode::Verify => {
                let opcode = message.opcode;
                let mut reader = FieldReader::exact(message, 2)?;
                let token = reader.text()?;
                let song_id = reader.parse()?;
                if opcode == Opcode::Get {
                    NodeRequest::Get { token, song_id }
                } else {
                    NodeRequest::Verify { token, song_id }
                }
            }
            Opcode::Post | Opcode::Ingest => {
                let opcode = message.opcode;
                let mut reader = FieldReader::exact(message, 3)?;
                let token = reader.text()?;
                let song_id = reader.parse()?;
                let data = reader.binary()?;
                if opcode == Opcode::Post {
                    NodeRequest::Post {
                        token,
                        song_id,
                        data,
                    }
                } else {
                    NodeRequest::Ingest {
                        token,
                        song_id,
                        data,
                    }
                }
            }
            Opcode::Hello => {
                let mut reader = FieldReader::exact(message, 1)?;
                NodeRequest::Hello {
                    token: reader.text()?,
                }
            }
            Opcode::Relay => {
                let mut reader = FieldReader::exact(message, 5)?;
                let token = reader.text()?;
                let ingest_token = reader.text()?;
                let song_id = reader.parse()?;
                let host = reader.text()?;
                let port = reader.parse()?;
                NodeRequest::Relay {
                    token,
                    ingest_token,
                    song_id,
                    destination: NodeAddress::new(host, port),
                }
            }
            opcode => return Err(RequestError::UnexpectedOpcode { opcode }),
        };

        Ok(request)
    }

    pub fn into_message(self) -> Message {
        let opcode = self.opcode();
        let fields: Vec<Field> = match self {
            NodeRequest::Get { token, song_id } | NodeRequest::Verify { token, song_id } => {
                vec![token.into(), song_id.0.into()]
            }
            NodeRequest::Post {
                token,
                song_id,
                data,
            }
            | NodeRequest::Ingest {
                token,
                song_id,
                data,
            } => vec![token.into(), song_id.0.into(), data.into()],
            NodeRequest::Hello { token } => vec![token.into()],
            NodeRequest::Relay {
                token,
                ingest_token,
                song_id,
                destination,
            } => vec![
                token.into(),
                ingest_token.into(),
                song_id.0.into(),
                destination.host.into(),
                destination.port.into(),
            ],
        };
        Message::new(opcode, fields)
    }
}

/// Outcome of a request, echoing its opcode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub opcode: Opcode,
    pub outcome: Result<Vec<Field>, FailureReason>,
}

impl Reply {
    pub fn ok(opcode: Opcode, fields: Vec<Field>) -> Self {
        Self {
            opcode,
            outcome: Ok(fields),
        }
    }

    pub fn failed(opcode: Opcode, reason: FailureReason) -> Self {
        Self {
            opcode,
            outcome: Err(reason),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn into_message(self) -> Message {
        let fields = match self.outcome {
            Ok(payload) => {
                let mut fields = Vec::with_capacity(payload.len() + 1);
                fields.push(Field::from(STATUS_OK));
                fields.extend(payload);
                fields
            }
            Err(reason) => vec![Field::from(STATUS_FAILED), Field::from(reason.as_str())],
        };
        Message::new(self.opcode, fields)
    }

    pub fn from_message(message: Message) -> RequestResult<Self> {
        if let Some(reason) = message.error_reason() {
            return Err(RequestError::Framing {
                reason: reason.to_string(),
            });
        }

        let opcode = message.opcode;
        let mut reader = FieldReader::new(message);
        let status = reader.text()?;
        match status.as_str() {
            STATUS_OK => {
                let payload: Vec<Field> = reader.fields.collect();
                Ok(Reply::ok(opcode, payload))
            }
            STATUS_FAILED => {
                let reason: FailureReason = reader.text()?.parse()?;
                Ok(Reply::failed(opcode, reason))
            }
            _ => Err(RequestError::InvalidStatus { status }),
        }
    }

    /// Payload reader for a successful reply
    pub fn into_reader(self) -> Result<FieldReader, FailureReason> {
        let opcode = self.opcode;
        self.outcome
            .map(|fields| FieldReader::new(Message::new(opcode, fields)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_strings() {
        for reason in FailureReason::ALL {
            assert_eq!(reason.as_str().parse::<FailureReason>().unwrap(), reason);
        }
        assert!("nope".parse::<FailureReason>().is_err());
        assert_eq!(FailureReason::WrongPassword.to_string(), "wrong_password");
    }

    #[test]
    fn test_catalog_error_mapping() {
        let song_id = SongId(1);
        assert_eq!(
            FailureReason::from(&CatalogError::SongNotFound { song_id }),
            FailureReason::SongNotFound
        );
        assert_eq!(
            FailureReason::from(&CatalogError::SongUnavailable { song_id }),
            FailureReason::SongUnavailable
        );
        assert_eq!(
            FailureReason::from(&CatalogError::LockPoisoned),
            FailureReason::Internal
        );
    }

    #[test]
    fn test_catalog_request_round_trip() {
        let requests = vec![
            CatalogRequest::Signup {
                username: "alice".to_string(),
                password: "pw1".to_string(),
            },
            CatalogRequest::GetAddress {
                token: "t".to_string(),
                song_id: SongId(12),
            },
            CatalogRequest::AddToPlaylist {
                token: "t".to_string(),
                username: "alice".to_string(),
                playlist: "liked_song".to_string(),
                song_id: SongId(3),
            },
            CatalogRequest::Exit { token: None },
            CatalogRequest::Exit {
                token: Some("t".to_string()),
            },
        ];

        for request in requests {
            let parsed = CatalogRequest::from_message(request.clone().into_message()).unwrap();
            assert_eq!(parsed, request);
        }
    }

    #[test]
    fn test_node_request_relay_layout() {
        let request = NodeRequest::Relay {
            token: "src".to_string(),
            ingest_token: "dst".to_string(),
            song_id: SongId(5),
            destination: NodeAddress::new("10.0.0.2", 9002),
        };
        let message = request.clone().into_message();
        assert_eq!(message.opcode, Opcode::Relay);
        assert_eq!(message.fields.len(), 5);
        assert_eq!(message.fields[3], Field::from("10.0.0.2"));
        assert_eq!(message.fields[4], Field::from("9002"));
        assert_eq!(NodeRequest::from_message(message).unwrap(), request);
    }

    #[test]
    fn test_bad_requests() {
        let missing = Message::new(Opcode::GetAddress, vec![Field::from("t")]);
        assert!(matches!(
            CatalogRequest::from_message(missing),
            Err(RequestError::FieldCount {
                expected: 2,
                actual: 1,
                ..
            })
        ));

        let not_a_number = Message::new(
            Opcode::GetAddress,
            vec![Field::from("t"), Field::from("seven")],
        );
        assert!(matches!(
            CatalogRequest::from_message(not_a_number),
            Err(RequestError::InvalidValue { index: 1, .. })
        ));

        let binary_token = Message::new(Opcode::Hello, vec![Field::Binary(vec![1])]);
        assert!(matches!(
            NodeRequest::from_message(binary_token),
            Err(RequestError::FieldType { index: 0, .. })
        ));

        let wrong_endpoint = Message::new(Opcode::Hello, vec![Field::from("t")]);
        assert!(matches!(
            CatalogRequest::from_message(wrong_endpoint),
            Err(RequestError::UnexpectedOpcode {
                opcode: Opcode::Hello
            })
        ));

        assert!(matches!(
            NodeRequest::from_message(Message::error("truncated")),
            Err(RequestError::Framing { .. })
        ));
    }

    #[test]
    fn test_reply_encoding() {
        let ok = Reply::ok(Opcode::GetAddress, vec!["127.0.0.1".into(), 9001u16.into()]);
        let message = ok.clone().into_message();
        assert_eq!(message.fields[0], Field::from(STATUS_OK));
        assert_eq!(message.fields.len(), 3);
        assert_eq!(Reply::from_message(message).unwrap(), ok);

        let failed = Reply::failed(Opcode::Login, FailureReason::WrongPassword);
        let message = failed.clone().into_message();
        assert_eq!(
            message.fields,
            vec![Field::from("F"), Field::from("wrong_password")]
        );
        assert_eq!(Reply::from_message(message).unwrap(), failed);
    }

    #[test]
    fn test_reply_rejects_unknown_status() {
        let message = Message::new(Opcode::Hello, vec![Field::from("maybe")]);
        assert!(matches!(
            Reply::from_message(message),
            Err(RequestError::InvalidStatus { .. })
        ));
    }
}
