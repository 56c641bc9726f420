//! Chat service client.

use tracing::{debug, info};

use super::{delegate_lifecycle, GrpcConnector, ResilientClient, Result};
use crate::config::RpcClientConfig;
use crate::proto::chat::chat_service_client::ChatServiceClient;
use crate::proto::chat::{
    CreateRoomRequest, CreateRoomResponse, SendMessageRequest, SendMessageResponse,
};

/// Name reported in status snapshots.
pub const SERVICE_NAME: &str = "chat";
/// Fully qualified gRPC service name, used for health probes.
pub const GRPC_SERVICE: &str = "veza.chat.ChatService";

/// Client for room and message creation on the chat service.
pub struct ChatClient {
    inner: ResilientClient<GrpcConnector>,
}

impl ChatClient {
    /// Create a disconnected client. The first call connects.
    pub fn new(config: RpcClientConfig) -> Self {
        Self {
            inner: ResilientClient::new(SERVICE_NAME, GRPC_SERVICE, config, GrpcConnector),
        }
    }

    #[tracing::instrument(name = "chat.create_room", skip_all, fields(name = %request.name, created_by = request.created_by))]
    pub async fn create_room(&self, request: CreateRoomRequest) -> Result<CreateRoomResponse> {
        let response = self
            .inner
            .call("create_room", |channel| async move {
                ChatServiceClient::new(channel).create_room(request).await
            })
            .await?;
        self.inner.check_rejected(&response.error).await?;

        info!(room_id = %response.room_id, "Room created");
        Ok(response)
    }

    #[tracing::instrument(name = "chat.send_message", skip_all, fields(room_id = %request.room_id, user_id = request.user_id))]
    pub async fn send_message(&self, request: SendMessageRequest) -> Result<SendMessageResponse> {
        let response = self
            .inner
            .call("send_message", |channel| async move {
                ChatServiceClient::new(channel).send_message(request).await
            })
            .await?;
        self.inner.check_rejected(&response.error).await?;

        debug!(message_id = %response.message_id, "Message sent");
        Ok(response)
    }
}

impl Default for ChatClient {
    fn default() -> Self {
        Self::new(RpcClientConfig::chat_defaults())
    }
}

delegate_lifecycle!(ChatClient);
