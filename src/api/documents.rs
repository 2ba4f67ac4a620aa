// =============================================================================
// api/documents.rs — MULTIPART, THE HARD WAY
// =============================================================================
//
// `POST /api/documents?organizationId=...` with every file as its own `files`
// part. The backend enqueues a scoring job as a side effect, which is why the
// Upload Gate restarts the tracker after a successful call.
// =============================================================================

use std::fmt;
use std::path::Path;

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::ApiError;
use super::ApiClient;
use crate::models::OrganizationId;

pub const DOCUMENTS_PATH: &str = "/api/documents";

/// One file the user picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            bytes,
        }
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Lowercased extension, if the name has one.
    pub fn extension(&self) -> Option<String> {
        Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }

    fn mime(&self) -> Option<&'static str> {
        match self.extension()?.as_str() {
            "pdf" => Some("application/pdf"),
            "csv" => Some("text/csv"),
            "json" => Some("application/json"),
            "doc" => Some("application/msword"),
            "docx" => Some(
                "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
            ),
            "xlsx" => Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
            _ => None,
        }
    }

    fn part(&self) -> Part {
        let part = Part::bytes(self.bytes.clone()).file_name(self.name.clone());
        match self.mime() {
            Some(mime) => part
                .mime_str(mime)
                .unwrap_or_else(|_| Part::bytes(self.bytes.clone()).file_name(self.name.clone())),
            None => part,
        }
    }
}

/// What kind of document the batch is. Sent as the `documentType` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    AnnualReport,
    SustainabilityReport,
    FinancialStatement,
    PolicyDocument,
    RegulatoryFiling,
    ImpactReport,
    Other,
}

impl DocumentType {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentType::AnnualReport => "annual_report",
            DocumentType::SustainabilityReport => "sustainability_report",
            DocumentType::FinancialStatement => "financial_statement",
            DocumentType::PolicyDocument => "policy_document",
            DocumentType::RegulatoryFiling => "regulatory_filing",
            DocumentType::ImpactReport => "impact_report",
            DocumentType::Other => "other",
        }
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct DocumentsClient {
    api: ApiClient,
}

impl DocumentsClient {
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }

    /// Upload a batch. No validation happens here; that is the Upload Gate's
    /// job. Returns whatever JSON the backend acknowledged with.
    pub async fn upload(
        &self,
        organization: &OrganizationId,
        files: &[UploadFile],
        document_type: Option<DocumentType>,
    ) -> Result<serde_json::Value, ApiError> {
        let url = self.api.endpoint(DOCUMENTS_PATH, Some(organization))?;
        let build_form = || {
            let form = files
                .iter()
                .fold(Form::new(), |form, file| form.part("files", file.part()));
            match document_type {
                Some(kind) => form.text("documentType", kind.as_str()),
                None => form,
            }
        };

        let response = self
            .api
            .send(|http| http.post(url.clone()).multipart(build_form()))
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_response(response).await);
        }

        info!(org = %organization, files = files.len(), "Documents accepted by backend");
        let text = response.text().await?;
        if text.trim().is_empty() {
            return Ok(serde_json::Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_is_lowercased() {
        assert_eq!(
            UploadFile::new("Report.PDF", vec![]).extension().as_deref(),
            Some("pdf")
        );
        assert_eq!(UploadFile::new("README", vec![]).extension(), None);
    }

    #[test]
    fn document_type_wire_names() {
        assert_eq!(DocumentType::SustainabilityReport.to_string(), "sustainability_report");
        let parsed: DocumentType = serde_json::from_str("\"impact_report\"").unwrap();
        assert_eq!(parsed, DocumentType::ImpactReport);
    }
}
