//! Stream service client.

use tracing::info;

use super::{delegate_lifecycle, GrpcConnector, ResilientClient, Result};
use crate::config::RpcClientConfig;
use crate::proto::stream::stream_service_client::StreamServiceClient;
use crate::proto::stream::{
    CreateStreamRequest, CreateStreamResponse, StartStreamRequest, StartStreamResponse,
};

/// Name reported in status snapshots.
pub const SERVICE_NAME: &str = "stream";
/// Fully qualified gRPC service name, used for health probes.
pub const GRPC_SERVICE: &str = "veza.stream.StreamService";

/// Client for stream creation and start on the stream service.
pub struct StreamClient {
    inner: ResilientClient<GrpcConnector>,
}

impl StreamClient {
    /// Create a disconnected client. The first call connects.
    pub fn new(config: RpcClientConfig) -> Self {
        Self {
            inner: ResilientClient::new(SERVICE_NAME, GRPC_SERVICE, config, GrpcConnector),
        }
    }

    #[tracing::instrument(name = "stream.create_stream", skip_all, fields(title = %request.title, created_by = request.created_by))]
    pub async fn create_stream(&self, request: CreateStreamRequest) -> Result<CreateStreamResponse> {
        let response = self
            .inner
            .call("create_stream", |channel| async move {
                StreamServiceClient::new(channel).create_stream(request).await
            })
            .await?;
        self.inner.check_rejected(&response.error).await?;

        info!(stream_id = %response.stream_id, "Stream created");
        Ok(response)
    }

    /// Start a stream. A response with `success == false` and no error
    /// message is returned as is.
    #[tracing::instrument(name = "stream.start_stream", skip_all, fields(stream_id = %request.stream_id))]
    pub async fn start_stream(&self, request: StartStreamRequest) -> Result<StartStreamResponse> {
        let response = self
            .inner
            .call("start_stream", |channel| async move {
                StreamServiceClient::new(channel).start_stream(request).await
            })
            .await?;
        self.inner.check_rejected(&response.error).await?;

        info!(stream_url = %response.stream_url, success = response.success, "Stream started");
        Ok(response)
    }
}

impl Default for StreamClient {
    fn default() -> Self {
        Self::new(RpcClientConfig::stream_defaults())
    }
}

delegate_lifecycle!(StreamClient);
