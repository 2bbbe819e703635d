//! Wire Protocol Module
//!
//! This module defines the framing shared by the catalog server, the storage nodes
//! and their clients. A message is laid out as:
//!
//! ```text
//! OPCODE(3 bytes) COUNT(1 ASCII digit) { TAG(1 byte) LEN(ASCII decimal) '!' PAYLOAD(LEN bytes) } x COUNT
//! ```
//!
//! `TAG` is `s` for UTF-8 text and `b` for raw binary. The single count digit caps a
//! message at nine fields; encoding a tenth field is rejected rather than wrapped.
//!
//! Decoding reads exactly the declared byte counts and never past them, so several
//! messages can be read back to back from one stream.

use std::fmt;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Maximum number of fields a single message can carry (one ASCII digit).
pub const MAX_FIELDS: usize = 9;

/// Largest payload a single field may declare. Servers pass a tighter limit
/// to [`try_decode_with_limit`] for what they actually accept.
pub const MAX_FIELD_LEN: usize = 1 << 30;

/// Maximum number of decimal digits accepted in a field length.
const MAX_LENGTH_DIGITS: usize = 10;

/// Delimiter between a field length and its payload
const LENGTH_DELIMITER: u8 = b'!';

const TEXT_TAG: u8 = b's';
const BINARY_TAG: u8 = b'b';

/// Initial buffer reservation when reading a payload; grows as bytes actually arrive.
const PAYLOAD_PREALLOC_LIMIT: usize = 64 * 1024;

/// Opcodes understood by the catalog server and the storage nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// `sig`: create an account and open a session
    Signup,
    /// `log`: log in to an existing account
    Login,
    /// `gad`: resolve the storage node serving a song
    GetAddress,
    /// `pad`: register a new song and get its upload node
    AddSong,
    /// `rfs`: fetch a fresh catalog snapshot
    Refresh,
    /// `atp`: add a song to a playlist
    AddToPlaylist,
    /// `rfp`: remove a song from a playlist
    RemoveFromPlaylist,
    /// `lgu`: drop the current session and log in again
    Relogin,
    /// `ext`: close the connection
    Exit,
    /// `get`: download a blob from a storage node
    Get,
    /// `pst`: upload a blob to a storage node
    Post,
    /// `hlo`: liveness probe
    Hello,
    /// `vrf`: replica existence probe
    Verify,
    /// `bkg`: instruct a node to relay a blob to a peer
    Relay,
    /// `bkp`: peer-to-peer blob ingest
    Ingest,
    /// Decoder failure sentinel. Never appears on the wire.
    Error,
}

impl Opcode {
    /// Every opcode that can be framed on the wire
    pub const WIRE: [Opcode; 15] = [
        Opcode::Signup,
        Opcode::Login,
        Opcode::GetAddress,
        Opcode::AddSong,
        Opcode::Refresh,
        Opcode::AddToPlaylist,
        Opcode::RemoveFromPlaylist,
        Opcode::Relogin,
        Opcode::Exit,
        Opcode::Get,
        Opcode::Post,
        Opcode::Hello,
        Opcode::Verify,
        Opcode::Relay,
        Opcode::Ingest,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Opcode::Signup => "sig",
            Opcode::Login => "log",
            Opcode::GetAddress => "gad",
            Opcode::AddSong => "pad",
            Opcode::Refresh => "rfs",
            Opcode::AddToPlaylist => "atp",
            Opcode::RemoveFromPlaylist => "rfp",
            Opcode::Relogin => "lgu",
            Opcode::Exit => "ext",
            Opcode::Get => "get",
            Opcode::Post => "pst",
            Opcode::Hello => "hlo",
            Opcode::Verify => "vrf",
            Opcode::Relay => "bkg",
            Opcode::Ingest => "bkp",
            Opcode::Error => "error",
        }
    }

    /// Look up a wire opcode from its three bytes
    pub fn from_wire(bytes: &[u8; 3]) -> Option<Self> {
        Self::WIRE
            .iter()
            .copied()
            .find(|opcode| opcode.as_str().as_bytes() == bytes)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single decoded field
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Text(String),
    Binary(Vec<u8>),
}

impl Field {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Field::Text(text) => Some(text),
            Field::Binary(_) => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Field::Binary(bytes) => Some(bytes),
            Field::Text(_) => None,
        }
    }

    /// Payload length in bytes (not characters)
    pub fn len(&self) -> usize {
        self.payload().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn tag(&self) -> u8 {
        match self {
            Field::Text(_) => TEXT_TAG,
            Field::Binary(_) => BINARY_TAG,
        }
    }

    fn payload(&self) -> &[u8] {
        match self {
            Field::Text(text) => text.as_bytes(),
            Field::Binary(bytes) => bytes,
        }
    }
}

impl From<String> for Field {
    fn from(value: String) -> Self {
        Field::Text(value)
    }
}

impl From<&str> for Field {
    fn from(value: &str) -> Self {
        Field::Text(value.to_string())
    }
}

impl From<&String> for Field {
    fn from(value: &String) -> Self {
        Field::Text(value.clone())
    }
}

impl From<Vec<u8>> for Field {
    fn from(value: Vec<u8>) -> Self {
        Field::Binary(value)
    }
}

impl From<&[u8]> for Field {
    fn from(value: &[u8]) -> Self {
        Field::Binary(value.to_vec())
    }
}

impl From<u16> for Field {
    fn from(value: u16) -> Self {
        Field::Text(value.to_string())
    }
}

impl From<i64> for Field {
    fn from(value: i64) -> Self {
        Field::Text(value.to_string())
    }
}

impl From<u64> for Field {
    fn from(value: u64) -> Self {
        Field::Text(value.to_string())
    }
}

/// A framed message: opcode plus up to nine typed fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub opcode: Opcode,
    pub fields: Vec<Field>,
}

impl Message {
    pub fn new(opcode: Opcode, fields: Vec<Field>) -> Self {
        Self { opcode, fields }
    }

    /// The decoder failure sentinel: `("error", [reason])`
    pub fn error<S: Into<String>>(reason: S) -> Self {
        Self {
            opcode: Opcode::Error,
            fields: vec![Field::Text(reason.into())],
        }
    }

    /// Whether this is the decoder failure sentinel. Check before branching on `opcode`.
    pub fn is_error(&self) -> bool {
        self.opcode == Opcode::Error
    }

    /// Failure reason carried by the sentinel
    pub fn error_reason(&self) -> Option<&str> {
        if !self.is_error() {
            return None;
        }
        self.fields.first().and_then(Field::as_text)
    }

    /// Encode this message into a byte buffer
    pub fn encode(&self) -> WireResult<Vec<u8>> {
        encode(self.opcode, &self.fields)
    }
}

/// Log-friendly rendering: text fields verbatim, binary fields as a byte count.
impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for field in &self.fields {
            match field {
                Field::Text(text) => write!(f, ", {}", text)?,
                Field::Binary(bytes) => write!(f, ", <{} bytes>", bytes.len())?,
            }
        }
        Ok(())
    }
}

/// Errors that can occur while framing or unframing a message
#[derive(Error, Debug)]
pub enum WireError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Unexpected end of stream: field declared {expected} bytes, got {actual}")]
    UnexpectedEof { expected: usize, actual: usize },

    #[error("Unknown opcode: {opcode:?}")]
    UnknownOpcode { opcode: String },

    #[error("Invalid field count byte: {byte:#04x}")]
    InvalidFieldCount { byte: u8 },

    #[error("Too many fields: {count} exceeds the maximum of {MAX_FIELDS}")]
    TooManyFields { count: usize },

    #[error("Invalid field tag: {tag:#04x}")]
    InvalidTag { tag: u8 },

    #[error("Invalid field length: {reason}")]
    InvalidLength { reason: String },

    #[error("Field too large: {length} bytes exceeds maximum {limit} bytes")]
    FieldTooLarge { length: usize, limit: usize },

    #[error("Text field is not valid UTF-8")]
    InvalidUtf8,

    #[error("The decoder failure sentinel cannot be encoded")]
    SentinelNotEncodable,
}

/// Result type for wire operations
pub type WireResult<T> = Result<T, WireError>;

/// Frame an opcode and its fields.
///
/// Text fields are tagged `s`, binary fields `b`. More than nine fields, or any
/// field above [`MAX_FIELD_LEN`], is rejected without producing output.
pub fn encode(opcode: Opcode, fields: &[Field]) -> WireResult<Vec<u8>> {
    if opcode == Opcode::Error {
        return Err(WireError::SentinelNotEncodable);
    }

    if fields.len() > MAX_FIELDS {
        return Err(WireError::TooManyFields {
            count: fields.len(),
        });
    }

    let payload_total: usize = fields.iter().map(|field| field.len() + 12).sum();
    let mut buffer = Vec::with_capacity(4 + payload_total);

    buffer.extend_from_slice(opcode.as_str().as_bytes());
    buffer.push(b'0' + fields.len() as u8);

    for field in fields {
        if field.len() > MAX_FIELD_LEN {
            return Err(WireError::FieldTooLarge {
                length: field.len(),
                limit: MAX_FIELD_LEN,
            });
        }
        buffer.push(field.tag());
        buffer.extend_from_slice(field.len().to_string().as_bytes());
        buffer.push(LENGTH_DELIMITER);
        buffer.extend_from_slice(field.payload());
    }

    Ok(buffer)
}

/// Read one message, returning the typed framing error on failure
pub async fn try_decode<R>(reader: &mut R) -> WireResult<Message>
where
    R: AsyncRead + Unpin,
{
    try_decode_with_limit(reader, MAX_FIELD_LEN).await
}

/// Like [`try_decode`], but any field declaring more than `max_field_len` bytes
/// fails with [`WireError::FieldTooLarge`] before its payload is read.
pub async fn try_decode_with_limit<R>(reader: &mut R, max_field_len: usize) -> WireResult<Message>
where
    R: AsyncRead + Unpin,
{
    let max_field_len = max_field_len.min(MAX_FIELD_LEN);
    let mut opcode_buf = [0u8; 3];
    opcode_buf[0] = match reader.read_u8().await {
        Ok(byte) => byte,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(WireError::ConnectionClosed)
        }
        Err(e) => return Err(e.into()),
    };
    reader.read_exact(&mut opcode_buf[1..]).await?;

    let opcode = Opcode::from_wire(&opcode_buf).ok_or_else(|| WireError::UnknownOpcode {
        opcode: String::from_utf8_lossy(&opcode_buf).into_owned(),
    })?;

    let count_byte = reader.read_u8().await?;
    if !count_byte.is_ascii_digit() {
        return Err(WireError::InvalidFieldCount { byte: count_byte });
    }
    let count = (count_byte - b'0') as usize;

    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        fields.push(read_field(reader, max_field_len).await?);
    }

    Ok(Message { opcode, fields })
}

/// Read one message. Any I/O or framing failure comes back as the
/// `("error", [reason])` sentinel instead of an `Err`.
pub async fn decode<R>(reader: &mut R) -> Message
where
    R: AsyncRead + Unpin,
{
    decode_with_limit(reader, MAX_FIELD_LEN).await
}

/// Sentinel-returning counterpart of [`try_decode_with_limit`]
pub async fn decode_with_limit<R>(reader: &mut R, max_field_len: usize) -> Message
where
    R: AsyncRead + Unpin,
{
    match try_decode_with_limit(reader, max_field_len).await {
        Ok(message) => message,
        Err(e) => {
            debug!("Decode failed: {}", e);
            Message::error(e.to_string())
        }
    }
}

/// Encode and write a message, flushing the writer
pub async fn write_message<W>(writer: &mut W, message: &Message) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn read_field<R>(reader: &mut R, max_field_len: usize) -> WireResult<Field>
where
    R: AsyncRead + Unpin,
{
    let tag = reader.read_u8().await?;
    if tag != TEXT_TAG && tag != BINARY_TAG {
        return Err(WireError::InvalidTag { tag });
    }

    let length = read_length(reader, max_field_len).await?;

    let mut payload = Vec::with_capacity(length.min(PAYLOAD_PREALLOC_LIMIT));
    (&mut *reader)
        .take(length as u64)
        .read_to_end(&mut payload)
        .await?;
    if payload.len() != length {
        return Err(WireError::UnexpectedEof {
            expected: length,
            actual: payload.len(),
        });
    }

    if tag == TEXT_TAG {
        String::from_utf8(payload)
            .map(Field::Text)
            .map_err(|_| WireError::InvalidUtf8)
    } else {
        Ok(Field::Binary(payload))
    }
}

async fn read_length<R>(reader: &mut R, max_field_len: usize) -> WireResult<usize>
where
    R: AsyncRead + Unpin,
{
    let mut digits = 0usize;
    let mut length: u64 = 0;

    loop {
        let byte = reader.read_u8().await?;
        if byte == LENGTH_DELIMITER {
            break;
        }
        if !byte.is_ascii_digit() {
            return Err(WireError::InvalidLength {
                reason: format!("unexpected byte {:#04x}", byte),
            });
        }
        digits += 1;
        if digits > MAX_LENGTH_DIGITS {
            return Err(WireError::InvalidLength {
                reason: format!("more than {} digits", MAX_LENGTH_DIGITS),
            });
        }
        length = length * 10 + u64::from(byte - b'0');
    }

    if digits == 0 {
        return Err(WireError::InvalidLength {
            reason: "empty length".to_string(),
        });
    }

    if length > max_field_len as u64 {
        return Err(WireError::FieldTooLarge {
            length: length as usize,
            limit: max_field_len,
        });
    }

    Ok(length as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn decode_bytes(bytes: &[u8]) -> Message {
        let mut reader = bytes;
        decode(&mut reader).await
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(
            Opcode::GetAddress,
            &[Field::from("tok"), Field::Binary(vec![1, 2])],
        )
        .unwrap();

        let mut expected = b"gad2s3!tokb2!".to_vec();
        expected.extend_from_slice(&[1, 2]);
        assert_eq!(bytes, expected);
    }

    #[test]
    fn test_text_length_counts_bytes() {
        // "héllo" is five characters but six bytes
        let bytes = encode(Opcode::Signup, &[Field::from("héllo")]).unwrap();
        assert!(bytes.starts_with(b"sig1s6!"));
    }

    #[tokio::test]
    async fn test_round_trip_mixed_fields() {
        let fields = vec![
            Field::from("token.with!bang"),
            Field::from(42i64),
            Field::Binary(vec![0, 159, 146, 150, b'!', b's']),
            Field::from(""),
            Field::Binary(Vec::new()),
            Field::from("ünïcode ✓"),
        ];
        let bytes = encode(Opcode::Ingest, &fields).unwrap();

        let message = decode_bytes(&bytes).await;
        assert!(!message.is_error());
        assert_eq!(message.opcode, Opcode::Ingest);
        assert_eq!(message.fields, fields);
    }

    #[tokio::test]
    async fn test_round_trip_every_opcode() {
        for opcode in Opcode::WIRE {
            let bytes = encode(opcode, &[]).unwrap();
            let message = decode_bytes(&bytes).await;
            assert_eq!(message, Message::new(opcode, Vec::new()));
        }
    }

    #[tokio::test]
    async fn test_nine_fields_accepted() {
        let fields: Vec<Field> = (0..MAX_FIELDS as i64).map(Field::from).collect();
        let bytes = encode(Opcode::Relay, &fields).unwrap();
        let message = decode_bytes(&bytes).await;
        assert_eq!(message.fields.len(), MAX_FIELDS);
        assert_eq!(message.fields, fields);
    }

    #[test]
    fn test_tenth_field_rejected() {
        let fields: Vec<Field> = (0..10i64).map(Field::from).collect();
        let result = encode(Opcode::Relay, &fields);
        assert!(matches!(
            result,
            Err(WireError::TooManyFields { count: 10 })
        ));
    }

    #[tokio::test]
    async fn test_write_message_rejects_tenth_field_without_writing() {
        let fields: Vec<Field> = (0..10i64).map(Field::from).collect();
        let message = Message::new(Opcode::Post, fields);
        let mut sink: Vec<u8> = Vec::new();

        let result = write_message(&mut sink, &message).await;
        assert!(result.is_err());
        assert!(sink.is_empty());
    }

    #[test]
    fn test_sentinel_not_encodable() {
        let result = Message::error("boom").encode();
        assert!(matches!(result, Err(WireError::SentinelNotEncodable)));
    }

    #[tokio::test]
    async fn test_does_not_read_past_declared_lengths() {
        let mut bytes = encode(Opcode::Hello, &[Field::from("a")]).unwrap();
        bytes.extend(encode(Opcode::Verify, &[Field::from("b"), Field::from("7")]).unwrap());

        let mut reader: &[u8] = &bytes;
        let first = decode(&mut reader).await;
        assert_eq!(first.opcode, Opcode::Hello);

        let second = decode(&mut reader).await;
        assert_eq!(second.opcode, Opcode::Verify);
        assert_eq!(second.fields[1], Field::from("7"));
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_truncated_payload_yields_sentinel() {
        let bytes = b"get2s5!tok".to_vec();
        let message = decode_bytes(&bytes).await;
        assert!(message.is_error());
        assert!(message.error_reason().is_some());

        let mut reader: &[u8] = b"get1s5!tok";
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::UnexpectedEof {
                expected: 5,
                actual: 3
            })
        ));
    }

    #[tokio::test]
    async fn test_empty_stream_is_connection_closed() {
        let mut reader: &[u8] = &[];
        let result = try_decode(&mut reader).await;
        assert!(matches!(result, Err(WireError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_unknown_opcode() {
        let mut reader: &[u8] = b"zzz0";
        let result = try_decode(&mut reader).await;
        assert!(matches!(result, Err(WireError::UnknownOpcode { .. })));
    }

    #[tokio::test]
    async fn test_invalid_count_and_tag() {
        let mut reader: &[u8] = b"hloX";
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::InvalidFieldCount { byte: b'X' })
        ));

        let mut reader: &[u8] = b"hlo1x1!a";
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::InvalidTag { tag: b'x' })
        ));
    }

    #[tokio::test]
    async fn test_invalid_lengths() {
        let mut reader: &[u8] = b"hlo1s!";
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::InvalidLength { .. })
        ));

        let mut reader: &[u8] = b"hlo1s1a!x";
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::InvalidLength { .. })
        ));

        let mut reader: &[u8] = b"hlo1s99999999999!";
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::InvalidLength { .. })
        ));

        let mut reader: &[u8] = b"hlo1b9999999999!";
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::FieldTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_field_limit_rejects_before_payload() {
        let mut bytes = b"pst2s5!token".to_vec();
        bytes.extend_from_slice(b"b4096!");
        bytes.extend_from_slice(&[0u8; 4096]);

        let mut reader: &[u8] = &bytes;
        assert!(matches!(
            try_decode_with_limit(&mut reader, 1024).await,
            Err(WireError::FieldTooLarge {
                length: 4096,
                limit: 1024
            })
        ));
        // Stopped right after the oversized length; the payload is never consumed
        assert_eq!(reader.len(), 4096);

        let mut reader: &[u8] = &bytes;
        let message = try_decode_with_limit(&mut reader, 4096).await.unwrap();
        assert_eq!(message.fields[1].len(), 4096);

        let mut reader: &[u8] = &bytes;
        assert!(decode_with_limit(&mut reader, 16).await.is_error());
    }

    #[tokio::test]
    async fn test_invalid_utf8_text() {
        let mut bytes = b"hlo1s2!".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe]);
        let mut reader: &[u8] = &bytes;
        assert!(matches!(
            try_decode(&mut reader).await,
            Err(WireError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn test_duplex_stream_round_trip() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = vec![7u8; 4096];
        let message = Message::new(
            Opcode::Post,
            vec![Field::from("tok"), Field::from(3i64), Field::Binary(payload)],
        );

        let expected = message.clone();
        let writer = tokio::spawn(async move {
            write_message(&mut client, &message).await.unwrap();
        });

        let received = decode(&mut server).await;
        writer.await.unwrap();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_display_hides_binary() {
        let message = Message::new(
            Opcode::Get,
            vec![Field::from("T"), Field::Binary(vec![1, 2, 3])],
        );
        assert_eq!(message.to_string(), "get, T, <3 bytes>");
    }
}
