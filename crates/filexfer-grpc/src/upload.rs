//! The upload service: client-streaming file uploads and metadata lookup.

use std::sync::Arc;

use futures::StreamExt;
use tonic::{Request, Response, Status, Streaming};

use filexfer::TransferContext;

use crate::convert::{
    credential, error_from_status, frame_from_upload, record_to_proto, status_from,
    upload_response,
};
use crate::proto::{self, GetFileMetadataRequest, UploadFileRequest, UploadFileResponse};

/// gRPC handler for the `FileUpload` service.
#[derive(Clone, Debug)]
pub struct UploadService {
    ctx: Arc<TransferContext>,
}

impl UploadService {
    /// Create a service over a shared context.
    pub fn new(ctx: Arc<TransferContext>) -> Self {
        Self { ctx }
    }
}

#[tonic::async_trait]
impl proto::file_upload_server::FileUpload for UploadService {
    async fn upload_file(
        &self,
        request: Request<Streaming<UploadFileRequest>>,
    ) -> Result<Response<UploadFileResponse>, Status> {
        let principal = self
            .ctx
            .authenticate(credential(&request))
            .map_err(status_from)?;

        let frames = request.into_inner().map(|msg| match msg {
            Ok(msg) => frame_from_upload(msg),
            Err(status) => Err(error_from_status(&status)),
        });

        // Runs detached so a dropped call future still reaches cleanup or commit
        let ctx = Arc::clone(&self.ctx);
        let task = tokio::spawn(async move { ctx.receiver().receive(&principal, frames).await });

        let record = task
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "upload task failed");
                Status::internal("upload task failed")
            })?
            .map_err(status_from)?;

        Ok(Response::new(upload_response(&record)))
    }

    async fn get_file_metadata(
        &self,
        request: Request<GetFileMetadataRequest>,
    ) -> Result<Response<proto::FileMetadata>, Status> {
        let principal = self
            .ctx
            .authenticate(credential(&request))
            .map_err(status_from)?;
        let file_id = request.into_inner().file_id;

        let record = self
            .ctx
            .sender()
            .metadata(&principal, &file_id)
            .await
            .map_err(status_from)?;
        Ok(Response::new(record_to_proto(&record)))
    }
}
