use serde::{Deserialize, Serialize};

use crate::errors::AppError;
use crate::generation::Tone;
use crate::jobs::model::{JobId, JobState, MessagePayload};
use crate::jobs::JobStatus;

/// Request body for `POST /api/messages`.
///
/// Fields default to empty so a missing field is reported by `validate` the same way
/// as a blank one.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubmitMessageRequest {
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tone: String,
}

impl SubmitMessageRequest {
    pub fn validate(self) -> Result<MessagePayload, AppError> {
        let summary = self.summary.trim();
        if summary.is_empty() {
            return Err(AppError::Validation("summary cannot be empty".to_string()));
        }
        if self.tone.trim().is_empty() {
            return Err(AppError::Validation("tone is required".to_string()));
        }
        let tone = self
            .tone
            .trim()
            .parse::<Tone>()
            .map_err(|e| AppError::Validation(e.to_string()))?;

        Ok(MessagePayload {
            summary: summary.to_string(),
            tone,
        })
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitMessageResponse {
    #[serde(rename = "jobId")]
    pub job_id: JobId,
}

#[derive(Debug, Serialize)]
pub struct MessageResult {
    pub message: String,
}

/// Response body for `GET /api/messages/:job_id`. Shape depends on the job's state:
/// `result` only when completed, `error` only when failed.
#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub id: JobId,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<MessageResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobStatusResponse {
    pub fn from_status(id: JobId, status: JobStatus) -> Result<Self, AppError> {
        let response = match status {
            JobStatus::Pending => Self {
                id,
                state: JobState::Pending,
                result: None,
                error: None,
            },
            JobStatus::Completed {
                message: Some(message),
            } => Self {
                id,
                state: JobState::Completed,
                result: Some(MessageResult { message }),
                error: None,
            },
            JobStatus::Completed { message: None } => {
                return Err(AppError::NotFound(
                    "Message expired or not found".to_string(),
                ))
            }
            JobStatus::Failed { reason } => Self {
                id,
                state: JobState::Failed,
                result: None,
                error: Some(reason),
            },
        };
        Ok(response)
    }
}
