use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use tether_core::error::{ErrorCode, RelayError, RelayResult};
use tether_core::listener::ListenerFactory;
use tether_core::protocol::{ApiResponse, ChannelRequest, ConnectionId, ControlRequest};

use crate::control::ControlPlane;
use crate::router::Router;

/// `data` of a successful `encrypt_message` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedData {
    /// Base64 of `nonce ‖ ciphertext ‖ tag`.
    pub ciphertext: String,
}

/// `data` of a successful `decrypt_message` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptedData {
    /// Base64.
    pub plaintext: String,
}

/// Dispatches one signaling-channel call made by `connection_id` and folds
/// the outcome into a response envelope.
pub fn process_request(
    router: &Router,
    connection_id: ConnectionId,
    request: ChannelRequest,
) -> ApiResponse {
    debug!(connection_id, op = request_op(&request), "Processing request");

    match request {
        ChannelRequest::SendInput {
            session_id,
            payload,
        } => unit(router.send_input(connection_id, &session_id, payload), "input forwarded"),
        ChannelRequest::SendSignal { session_id, signal } => unit(
            router.send_signal(connection_id, &session_id, signal),
            "signal forwarded",
        ),
        ChannelRequest::ExchangePublicKey {
            session_id,
            peer_id,
            public_key,
        } => unit(
            router.exchange_public_key(connection_id, &session_id, &peer_id, public_key),
            "public key forwarded",
        ),
        ChannelRequest::CompleteKeyExchange {
            session_id,
            peer_id,
            private_key,
            peer_public_key,
        } => unit(
            router.complete_key_exchange(
                connection_id,
                &session_id,
                &peer_id,
                &private_key,
                &peer_public_key,
            ),
            "session key established",
        ),
        ChannelRequest::EncryptMessage {
            session_id,
            plaintext,
        } => ApiResponse::from_result(
            router
                .encrypt_message(connection_id, &session_id, &plaintext)
                .map(|ciphertext| EncryptedData { ciphertext }),
            "message encrypted",
        ),
        ChannelRequest::DecryptMessage {
            session_id,
            ciphertext,
        } => ApiResponse::from_result(
            router
                .decrypt_message(connection_id, &session_id, &ciphertext)
                .map(|plaintext| DecryptedData { plaintext }),
            "message decrypted",
        ),
        ChannelRequest::ReportError { error } => {
            unit(router.report_error(connection_id, error), "error recorded")
        }
        ChannelRequest::AcceptFileTransfer { transfer_id } => ApiResponse::from_result(
            router.accept_transfer(connection_id, &transfer_id),
            "transfer accepted",
        ),
        ChannelRequest::RejectFileTransfer { transfer_id } => ApiResponse::from_result(
            router.reject_transfer(connection_id, &transfer_id),
            "transfer rejected",
        ),
        ChannelRequest::NotifyFileTransferProgress {
            session_id,
            transfer_id,
            progress,
        } => unit(
            router.notify_progress(connection_id, &session_id, &transfer_id, progress),
            "progress forwarded",
        ),
        ChannelRequest::NotifyFileTransferCompleted {
            session_id,
            transfer_id,
        } => unit(
            router.notify_completed(connection_id, &session_id, &transfer_id),
            "completion forwarded",
        ),
    }
}

/// Dispatches one control-plane call on behalf of an authenticated user.
pub async fn process_control<F: ListenerFactory>(
    control: &ControlPlane<F>,
    user_id: &str,
    request: ControlRequest,
) -> ApiResponse {
    debug!(user = %user_id, request = ?request, "Processing control request");

    match request {
        ControlRequest::StartSession => {
            ApiResponse::from_result(control.start_session(user_id), "session started")
        }
        ControlRequest::JoinSession { session_id } => ApiResponse::from_result(
            control.join_session(&session_id, user_id),
            "session joined",
        ),
        ControlRequest::StopSession { session_id } => ApiResponse::from_result(
            control.stop_session(&session_id, user_id),
            "session stopped",
        ),
        ControlRequest::ActiveSessions => {
            ApiResponse::from_result(control.active_sessions(user_id), "active sessions")
        }
        ControlRequest::InitiateTcpTransfer {
            session_id,
            file_name,
            file_size,
        } => ApiResponse::from_result(
            control
                .initiate_tcp_transfer(&session_id, user_id, &file_name, file_size)
                .await,
            "port allocated",
        ),
        ControlRequest::ConnectToReceiver { session_id } => ApiResponse::from_result(
            control.connect_to_receiver(&session_id, user_id).await,
            "port allocated",
        ),
        ControlRequest::CompleteTransfer {
            transfer_id,
            bytes_received,
        } => ApiResponse::from_result(
            control.complete_transfer(&transfer_id, user_id, bytes_received),
            "transfer completed",
        ),
        ControlRequest::GetTransfer { transfer_id } => ApiResponse::from_result(
            control.transfer(&transfer_id, user_id),
            "transfer found",
        ),
    }
}

/// Envelope for a payload that could not be decoded. The request id is
/// salvaged from the raw JSON when present so the caller can still match
/// the answer; `0` otherwise.
#[must_use]
pub fn invalid_request(payload: &[u8], err: &anyhow::Error) -> (u64, ApiResponse) {
    let request_id = serde_json::from_slice::<Value>(payload)
        .ok()
        .and_then(|v| v.get("request_id").and_then(Value::as_u64))
        .unwrap_or(0);
    let response = ApiResponse::failure(&RelayError::new(
        ErrorCode::InvalidRequest,
        format!("malformed request: {err}"),
    ));
    (request_id, response)
}

fn unit(result: RelayResult<()>, message: &str) -> ApiResponse {
    match result {
        Ok(()) => ApiResponse::ok(message),
        Err(e) => ApiResponse::failure(&e),
    }
}

const fn request_op(request: &ChannelRequest) -> &'static str {
    match request {
        ChannelRequest::SendInput { .. } => "send_input",
        ChannelRequest::SendSignal { .. } => "send_signal",
        ChannelRequest::ExchangePublicKey { .. } => "exchange_public_key",
        ChannelRequest::CompleteKeyExchange { .. } => "complete_key_exchange",
        ChannelRequest::EncryptMessage { .. } => "encrypt_message",
        ChannelRequest::DecryptMessage { .. } => "decrypt_message",
        ChannelRequest::ReportError { .. } => "report_error",
        ChannelRequest::AcceptFileTransfer { .. } => "accept_file_transfer",
        ChannelRequest::RejectFileTransfer { .. } => "reject_file_transfer",
        ChannelRequest::NotifyFileTransferProgress { .. } => "notify_file_transfer_progress",
        ChannelRequest::NotifyFileTransferCompleted { .. } => "notify_file_transfer_completed",
    }
}
