use anyhow::{Result, bail, ensure};
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ErrorCode, RelayError, RelayResult};

/// ASCII magic bytes that open every Tether frame.
const MAGIC: &[u8; 5] = b"TETHR";
/// Protocol version understood by this build.
const VERSION: u8 = 0x01;
/// Total header size: magic(5) + version(1) + type(1) + flags(2) + length(4).
const HEADER_LEN: usize = 13;
/// Upper bound on a single frame payload to protect against malicious peers.
/// Signaling payloads (SDP offers in particular) can be large, but bulk data
/// never travels in frames.
const MAX_PAYLOAD_LEN: usize = 256 * 1024;

const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 5;
const OFF_TYPE: usize = 6;
const OFF_FLAGS: usize = 7;
const OFF_LENGTH: usize = 9;

/// Ephemeral identifier of one live signaling channel.
pub type ConnectionId = u64;

/// Protocol-level message type codes (v1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Opens a signaling channel (client → server, first frame).
    Hello = 0x01,
    /// Accepts a signaling channel (server → client).
    HelloAck = 0x02,
    /// A control-plane call (client → server, may be the first frame).
    Control = 0x10,
    /// A signaling-channel call (client → server).
    Request = 0x20,
    /// The answer to a `Control` or `Request` frame (server → client).
    Response = 0x21,
    /// A routed notification (server → client).
    Event = 0x30,
    /// Fatal channel error, sent right before the server closes.
    Error = 0x7F,
}

impl TryFrom<u8> for MessageType {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::HelloAck),
            0x10 => Ok(Self::Control),
            0x20 => Ok(Self::Request),
            0x21 => Ok(Self::Response),
            0x30 => Ok(Self::Event),
            0x7F => Ok(Self::Error),
            other => bail!("unknown message type: 0x{other:02X}"),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(mt: MessageType) -> u8 {
        mt as u8
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub version: u8,
    pub msg_type: MessageType,
    /// Reserved flags. MUST be `0x0000` in v1.
    pub flags: u16,
    pub payload_length: u32,
}

/// A fully decoded frame (header + payload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

/// Attempts to decode one complete frame from the front of `buf`.
///
/// * `Ok(Some(frame))`: a full frame was present; its bytes have been consumed
///   from `buf`.
/// * `Ok(None)`: not enough bytes yet; `buf` is left untouched.  The caller
///   should read more data and try again.
/// * `Err(..)`: protocol violation (bad magic, unsupported version, unknown
///   message type, oversized payload).  The caller should close the connection.
///
/// # Errors
///
/// Returns an error on protocol violations: bad magic, unsupported version,
/// unknown message type, or payload exceeding [`MAX_PAYLOAD_LEN`].
///
/// # Panics
///
/// Cannot panic. The `expect` calls on slice conversions are guarded by the
/// `HEADER_LEN` check at the top of the function.
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<Frame>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    ensure!(
        &buf[OFF_MAGIC..OFF_MAGIC + MAGIC.len()] == MAGIC,
        "bad magic: expected TETHR"
    );

    let version = buf[OFF_VERSION];
    ensure!(version == VERSION, "unsupported version: 0x{version:02X}");

    let msg_type = MessageType::try_from(buf[OFF_TYPE])?;

    let flags = u16::from_be_bytes([buf[OFF_FLAGS], buf[OFF_FLAGS + 1]]);

    let payload_len = u32::from_be_bytes([
        buf[OFF_LENGTH],
        buf[OFF_LENGTH + 1],
        buf[OFF_LENGTH + 2],
        buf[OFF_LENGTH + 3],
    ]) as usize;

    ensure!(
        payload_len <= MAX_PAYLOAD_LEN,
        "payload too large: {payload_len} bytes (max {MAX_PAYLOAD_LEN})"
    );

    if buf.len() < HEADER_LEN + payload_len {
        return Ok(None);
    }

    buf.advance(HEADER_LEN);
    let payload = buf.split_to(payload_len).to_vec();

    let header = Header {
        version,
        msg_type,
        flags,
        #[allow(clippy::cast_possible_truncation)] // guarded by MAX_PAYLOAD_LEN (fits in u32)
        payload_length: payload_len as u32,
    };

    Ok(Some(Frame { header, payload }))
}

/// Encodes a frame into `buf`.
///
/// Appends the 13-byte header followed by `payload` to the buffer.
pub fn encode_frame(msg_type: MessageType, payload: &[u8], buf: &mut BytesMut) {
    buf.reserve(HEADER_LEN + payload.len());
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(msg_type.into());
    buf.put_u16(0x0000);
    #[allow(clippy::cast_possible_truncation)] // frame payloads are bounded by MAX_PAYLOAD_LEN
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
}

/// Convenience wrapper that allocates and returns a new `BytesMut`.
#[must_use]
pub fn encode_frame_to_bytes(msg_type: MessageType, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    encode_frame(msg_type, payload, &mut buf);
    buf
}

/// Encodes a serializable payload into a protocol frame stored in a new
/// [`BytesMut`].
///
/// # Errors
///
/// Returns an error if JSON serialization fails.
pub fn encode_payload_frame<T: Serialize>(msg_type: MessageType, payload: &T) -> Result<BytesMut> {
    let json = serde_json::to_vec(payload)?;
    Ok(encode_frame_to_bytes(msg_type, &json))
}

/// Decodes a frame's payload bytes into the requested type.
///
/// # Errors
///
/// Returns an error if the payload is not valid JSON or does not match `T`.
pub fn decode_payload<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(Into::into)
}

// ── Shared enums ────────────────────────────────────────────────────

/// Which side of a session a connection speaks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Client,
}

impl Role {
    #[must_use]
    pub const fn peer(self) -> Self {
        match self {
            Self::Host => Self::Client,
            Self::Client => Self::Host,
        }
    }
}

/// Media-negotiation message kinds. The `data` they carry is opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    State,
}

/// A media-negotiation envelope, relayed verbatim to the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub data: Value,
}

/// Remote-input categories produced by the host's capture layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    Mouse,
    Keyboard,
    Clipboard,
    Command,
}

/// A serialized input action, relayed verbatim to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputPayload {
    pub kind: InputKind,
    pub data: Value,
}

// ── Handshake payloads ──────────────────────────────────────────────

/// Payload for [`MessageType::Hello`] (client → server).
///
/// `token` is an externally issued bearer token; the server resolves it to
/// a user id before the channel is bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloPayload {
    pub session_id: String,
    pub token: String,
}

/// Base64-encoded ephemeral P-256 key pair handed to a freshly bound
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyPairPayload {
    /// SEC1 uncompressed point.
    pub public_key: String,
    /// Raw 32-byte scalar.
    pub private_key: String,
}

/// Payload for [`MessageType::HelloAck`] (server → client).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAckPayload {
    pub connection_id: ConnectionId,
    pub session_id: String,
    pub user_id: String,
    pub role: Role,
    pub key_pair: KeyPairPayload,
}

/// Payload for [`MessageType::Error`] (server → client, fatal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

// ── Signaling channel requests ──────────────────────────────────────

/// Calls a bound connection may make on its signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ChannelRequest {
    SendInput {
        session_id: String,
        payload: InputPayload,
    },
    SendSignal {
        session_id: String,
        signal: SignalEnvelope,
    },
    ExchangePublicKey {
        session_id: String,
        peer_id: String,
        public_key: String,
    },
    CompleteKeyExchange {
        session_id: String,
        peer_id: String,
        private_key: String,
        peer_public_key: String,
    },
    /// `plaintext` is base64.
    EncryptMessage {
        session_id: String,
        plaintext: String,
    },
    /// `ciphertext` is base64 of `nonce ‖ ciphertext ‖ tag`.
    DecryptMessage {
        session_id: String,
        ciphertext: String,
    },
    ReportError {
        error: Value,
    },
    AcceptFileTransfer {
        transfer_id: String,
    },
    RejectFileTransfer {
        transfer_id: String,
    },
    NotifyFileTransferProgress {
        session_id: String,
        transfer_id: String,
        progress: u8,
    },
    NotifyFileTransferCompleted {
        session_id: String,
        transfer_id: String,
    },
}

/// Payload for [`MessageType::Request`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestPayload {
    pub request_id: u64,
    #[serde(flatten)]
    pub request: ChannelRequest,
}

// ── Control plane requests ──────────────────────────────────────────

/// Request/response calls that do not need a bound signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    StartSession,
    JoinSession {
        session_id: String,
    },
    StopSession {
        session_id: String,
    },
    ActiveSessions,
    InitiateTcpTransfer {
        session_id: String,
        file_name: String,
        file_size: u64,
    },
    ConnectToReceiver {
        session_id: String,
    },
    CompleteTransfer {
        transfer_id: String,
        bytes_received: u64,
    },
    GetTransfer {
        transfer_id: String,
    },
}

/// Payload for [`MessageType::Control`]. Every control call carries its
/// own bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPayload {
    pub request_id: u64,
    pub token: String,
    #[serde(flatten)]
    pub request: ControlRequest,
}

// ── Responses ───────────────────────────────────────────────────────

/// The uniform `{success, message, code, data}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ApiResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            code: None,
            data: None,
        }
    }

    /// A successful response carrying `data`.
    ///
    /// Serialization failures degrade to an `INTERNAL` failure envelope.
    pub fn ok_with<T: Serialize>(message: impl Into<String>, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                data: Some(value),
                ..Self::ok(message)
            },
            Err(e) => Self::failure(&RelayError::internal(e)),
        }
    }

    #[must_use]
    pub fn failure(err: &RelayError) -> Self {
        Self {
            success: false,
            message: err.message.clone(),
            code: Some(err.code),
            data: None,
        }
    }

    /// Folds a domain result into an envelope.
    pub fn from_result<T: Serialize>(result: RelayResult<T>, message: impl Into<String>) -> Self {
        match result {
            Ok(data) => Self::ok_with(message, &data),
            Err(e) => Self::failure(&e),
        }
    }

    /// Decodes `data` into `T`.
    ///
    /// # Errors
    ///
    /// Returns an error if the response failed, carries no data, or the data
    /// does not match `T`.
    pub fn into_data<T: for<'de> Deserialize<'de>>(self) -> Result<T> {
        if !self.success {
            let code = self.code.map_or("UNKNOWN", ErrorCode::as_str);
            bail!("request failed ({code}): {}", self.message);
        }
        let Some(data) = self.data else {
            bail!("response carries no data");
        };
        serde_json::from_value(data).map_err(Into::into)
    }
}

/// Payload for [`MessageType::Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponsePayload {
    pub request_id: u64,
    #[serde(flatten)]
    pub response: ApiResponse,
}

// ── Routed events ───────────────────────────────────────────────────

/// Notifications pushed to a bound connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    PeerConnected {
        session_id: String,
        user_id: String,
        role: Role,
    },
    PeerDisconnected {
        session_id: String,
        user_id: String,
        role: Role,
    },
    Input {
        session_id: String,
        payload: InputPayload,
    },
    Signal {
        session_id: String,
        from_user_id: String,
        signal: SignalEnvelope,
    },
    PublicKeyOffered {
        session_id: String,
        from_user_id: String,
        public_key: String,
    },
    TransferRequested {
        session_id: String,
        transfer_id: String,
        sender_user_id: String,
        file_name: String,
        file_size: u64,
    },
    TransferAccepted {
        session_id: String,
        transfer_id: String,
    },
    TransferRejected {
        session_id: String,
        transfer_id: String,
    },
    /// The sender is connected; the receiver should call
    /// `connect_to_receiver` and dial the returned port.
    ReceiverConnectRequested {
        session_id: String,
        transfer_id: String,
    },
    TransferProgress {
        session_id: String,
        transfer_id: String,
        progress: u8,
        bytes_transferred: u64,
    },
    TransferCompleted {
        session_id: String,
        transfer_id: String,
    },
    TransferFailed {
        session_id: String,
        transfer_id: String,
        reason: String,
    },
    SessionEnded {
        session_id: String,
    },
}
