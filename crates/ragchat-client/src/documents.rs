//! Non-streaming REST calls: health and document management.

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use ragchat_core::types::{DocumentContent, DocumentList, Health, RebuildResult, UploadResult};
use ragchat_core::wire::{
    WireDocumentContent, WireDocumentList, WireErrorDetail, WireHealth, WireRebuildResult,
    WireUploadResult,
};

use crate::{BackendClient, ClientError};

/// Turn a non-success response into [`ClientError::Api`], using its `detail` if any.
async fn check(response: reqwest::Response, operation: &str) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let detail = serde_json::from_str::<WireErrorDetail>(&body)
        .map(|d| d.detail)
        .unwrap_or_else(|_| format!("{operation} failed"));
    debug!(%status, operation, %detail, "Backend rejected request");

    Err(ClientError::Api {
        status: status.as_u16(),
        detail,
    })
}

async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

impl BackendClient {
    /// `GET /api/health`
    pub async fn health(&self) -> Result<Health, ClientError> {
        let response = self.http.get(self.url("/api/health")).send().await?;
        let response = check(response, "Health check").await?;
        Ok(read_json::<WireHealth>(response).await?.into())
    }

    /// `GET /api/documents`
    pub async fn list_documents(&self) -> Result<DocumentList, ClientError> {
        let response = self.http.get(self.url("/api/documents")).send().await?;
        let response = check(response, "Listing documents").await?;
        Ok(read_json::<WireDocumentList>(response).await?.into())
    }

    /// `POST /api/documents/upload` with the file in multipart field `file`.
    pub async fn upload_document(
        &self,
        filename: &str,
        bytes: Vec<u8>,
    ) -> Result<UploadResult, ClientError> {
        let mime = mime_guess::from_path(filename).first_or_text_plain();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str(mime.essence_str())?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .http
            .post(self.url("/api/documents/upload"))
            .multipart(form)
            .send()
            .await?;
        let response = check(response, "Upload").await?;
        let result: WireUploadResult = read_json(response).await?;
        info!(id = %result.id, filename = %result.filename, "Document uploaded");
        Ok(result)
    }

    /// `DELETE /api/documents/{id}`
    pub async fn delete_document(&self, id: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/documents/{id}")))
            .send()
            .await?;
        check(response, "Delete").await?;
        info!(id, "Document deleted");
        Ok(())
    }

    /// `GET /api/documents/{id}/content`
    pub async fn document_content(&self, id: &str) -> Result<DocumentContent, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/documents/{id}/content")))
            .send()
            .await?;
        let response = check(response, "Loading document").await?;
        Ok(read_json::<WireDocumentContent>(response).await?.into())
    }

    /// `POST /api/documents/rebuild`
    pub async fn rebuild_index(&self) -> Result<RebuildResult, ClientError> {
        let response = self
            .http
            .post(self.url("/api/documents/rebuild"))
            .send()
            .await?;
        let response = check(response, "Rebuild").await?;
        let result: RebuildResult = read_json::<WireRebuildResult>(response).await?.into();
        info!(chunk_count = result.chunk_count, "Index rebuilt");
        Ok(result)
    }
}
