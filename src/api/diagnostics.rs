//! Diagnosis API handlers
//!
//! Upload (multipart), partial update, retraction, and the flat/scoped
//! opinion listings.

use axum::{
    extract::{Multipart, Path, Query, State},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::diagnoses;
use crate::error::{ApiError, ApiResult};
use crate::fingerprint::Fingerprint;
use crate::models::{DiagnosisRecord, SlotPosition};
use crate::services::consensus::{
    Disposition, Reviewer, Submission, SubmissionContent, SubmissionOutcome,
};
use crate::AppState;

/// POST /api/diagnostics response
#[derive(Debug, Serialize)]
pub struct CreateDiagnosticResponse {
    pub status: Disposition,
    pub message: String,
    pub record_id: Uuid,
    pub fingerprint: Fingerprint,
    /// Canonical storage path of the image
    pub image_path: String,
    /// Total opinions now attached to the image
    pub opinions: usize,
}

/// One opinion in a flat listing.
#[derive(Debug, Serialize)]
pub struct OpinionView {
    pub record_id: Uuid,
    pub slot: SlotPosition,
    pub fingerprint: Fingerprint,
    pub image_path: String,
    pub reviewer_id: i64,
    pub reviewer_name: String,
    pub disease_name: String,
    pub disease_type: String,
    pub diagnosed_at: chrono::DateTime<chrono::Utc>,
}

/// Collected multipart fields of an upload request.
#[derive(Default)]
struct UploadForm {
    file: Option<(Vec<u8>, String)>,
    fingerprint: Option<String>,
    disease_name: Option<String>,
    disease_type: Option<String>,
    reviewer_id: Option<String>,
    reviewer_name: Option<String>,
    second_reviewer_id: Option<String>,
    second_reviewer_name: Option<String>,
}

impl UploadForm {
    async fn read(mut multipart: Multipart) -> ApiResult<Self> {
        let mut form = Self::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(|e| ApiError::BadRequest(format!("malformed multipart body: {}", e)))?
        {
            let name = field.name().unwrap_or_default().to_string();
            match name.as_str() {
                "file" => {
                    let filename = field.file_name().unwrap_or("upload").to_string();
                    let bytes = field.bytes().await.map_err(|e| {
                        ApiError::BadRequest(format!("failed to read upload: {}", e))
                    })?;
                    form.file = Some((bytes.to_vec(), filename));
                }
                other => {
                    let value = field.text().await.map_err(|e| {
                        ApiError::BadRequest(format!("failed to read field {}: {}", other, e))
                    })?;
                    match other {
                        "fingerprint" => form.fingerprint = Some(value),
                        "disease_name" => form.disease_name = Some(value),
                        "disease_type" => form.disease_type = Some(value),
                        "reviewer_id" => form.reviewer_id = Some(value),
                        "reviewer_name" => form.reviewer_name = Some(value),
                        "second_reviewer_id" => form.second_reviewer_id = Some(value),
                        "second_reviewer_name" => form.second_reviewer_name = Some(value),
                        unknown => {
                            tracing::debug!(field = unknown, "Ignoring unknown form field");
                        }
                    }
                }
            }
        }

        Ok(form)
    }

    fn required(value: Option<String>, field: &str) -> ApiResult<String> {
        value.ok_or_else(|| ApiError::BadRequest(format!("missing required field: {}", field)))
    }

    fn reviewer_id(value: &str, field: &str) -> ApiResult<i64> {
        value
            .trim()
            .parse()
            .map_err(|_| ApiError::BadRequest(format!("{} must be a numeric id", field)))
    }
}

/// POST /api/diagnostics
///
/// Multipart upload: `file` (or `fingerprint` of an already-stored
/// image), `disease_name`, `disease_type`, `reviewer_id`,
/// `reviewer_name`, and optionally `second_reviewer_id`/`_name` for a
/// joint session co-signing the same labels.
pub async fn create_diagnostic(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<CreateDiagnosticResponse>> {
    let form = UploadForm::read(multipart).await?;

    let disease_name = UploadForm::required(form.disease_name, "disease_name")?;
    let disease_type = form.disease_type.unwrap_or_default();
    let reviewer_id =
        UploadForm::reviewer_id(&UploadForm::required(form.reviewer_id, "reviewer_id")?, "reviewer_id")?;
    let reviewer_name = UploadForm::required(form.reviewer_name, "reviewer_name")?;

    let content = match (form.file, form.fingerprint) {
        (Some((bytes, filename)), _) => SubmissionContent::Upload { bytes, filename },
        (None, Some(fp)) => SubmissionContent::Existing(Fingerprint::parse(&fp)?),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "either an image file or a fingerprint is required".to_string(),
            ))
        }
    };

    let outcome = state
        .engine
        .submit(Submission {
            content,
            disease_name: disease_name.clone(),
            disease_type: disease_type.clone(),
            reviewer: Reviewer {
                id: reviewer_id,
                name: reviewer_name,
            },
        })
        .await?;

    // Joint session: the second reviewer co-signs the same labels as an
    // independent opinion on the now-known fingerprint.
    let outcome = match (form.second_reviewer_id, form.second_reviewer_name) {
        (Some(id), Some(name)) => {
            let second_id = UploadForm::reviewer_id(&id, "second_reviewer_id")?;
            state
                .engine
                .submit(Submission {
                    content: SubmissionContent::Existing(outcome.fingerprint.clone()),
                    disease_name,
                    disease_type,
                    reviewer: Reviewer {
                        id: second_id,
                        name,
                    },
                })
                .await?
        }
        (None, None) => outcome,
        _ => {
            return Err(ApiError::BadRequest(
                "second_reviewer_id and second_reviewer_name must be given together".to_string(),
            ))
        }
    };

    Ok(Json(respond(outcome)))
}

fn respond(outcome: SubmissionOutcome) -> CreateDiagnosticResponse {
    let message = match outcome.disposition {
        Disposition::Created => "diagnosis recorded for new image",
        Disposition::Attached => "opinion attached to existing image",
        Disposition::Updated => "opinion updated in place",
    };

    CreateDiagnosticResponse {
        status: outcome.disposition,
        message: message.to_string(),
        record_id: outcome.record_id,
        fingerprint: outcome.fingerprint,
        image_path: outcome.class_path,
        opinions: outcome.opinions,
    }
}

/// PUT /api/diagnostics/:id request
#[derive(Debug, Deserialize)]
pub struct UpdateDiagnosticRequest {
    pub slot: SlotPosition,
    pub reviewer_id: i64,
    #[serde(default)]
    pub disease_name: Option<String>,
    #[serde(default)]
    pub disease_type: Option<String>,
}

/// PUT /api/diagnostics/:id
///
/// Partial-field update of one opinion slot by its owning reviewer.
pub async fn update_diagnostic(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateDiagnosticRequest>,
) -> ApiResult<Json<Vec<OpinionView>>> {
    let record = state
        .engine
        .update(
            id,
            request.slot,
            request.reviewer_id,
            request.disease_name,
            request.disease_type,
        )
        .await?;

    Ok(Json(flatten(&[record])))
}

/// DELETE /api/diagnostics/:id query parameters
#[derive(Debug, Deserialize)]
pub struct RetractQuery {
    pub slot: SlotPosition,
    pub reviewer_id: i64,
}

/// DELETE /api/diagnostics/:id?slot=...&reviewer_id=...
///
/// Retraction per the consensus rules; deletes the stored image only
/// when the last referencing record disappears.
pub async fn delete_diagnostic(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<RetractQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    state.engine.retract(id, query.slot, query.reviewer_id).await?;

    Ok(Json(serde_json::json!({
        "status": "deleted",
        "message": "opinion retracted",
    })))
}

/// GET /api/diagnostics
///
/// Flat list of all opinions, newest records first.
pub async fn list_diagnostics(State(state): State<AppState>) -> ApiResult<Json<Vec<OpinionView>>> {
    let records = diagnoses::load_all(&state.db).await.map_err(ApiError::from)?;
    Ok(Json(flatten(&records)))
}

/// GET /api/diagnostics/reviewer/:reviewer_id
///
/// Opinions held by one reviewer in either slot.
pub async fn list_reviewer_diagnostics(
    State(state): State<AppState>,
    Path(reviewer_id): Path<i64>,
) -> ApiResult<Json<Vec<OpinionView>>> {
    let records = diagnoses::load_by_reviewer(&state.db, reviewer_id)
        .await
        .map_err(ApiError::from)?;

    let views = flatten(&records)
        .into_iter()
        .filter(|v| v.reviewer_id == reviewer_id)
        .collect();
    Ok(Json(views))
}

fn flatten(records: &[DiagnosisRecord]) -> Vec<OpinionView> {
    records
        .iter()
        .flat_map(|record| {
            record.opinions().map(move |(slot, opinion)| OpinionView {
                record_id: record.id,
                slot,
                fingerprint: record.fingerprint.clone(),
                image_path: record.class_path.clone(),
                reviewer_id: opinion.reviewer_id,
                reviewer_name: opinion.reviewer_name.clone(),
                disease_name: opinion.disease_name.clone(),
                disease_type: opinion.disease_type.clone(),
                diagnosed_at: opinion.diagnosed_at,
            })
        })
        .collect()
}

/// Build diagnosis routes
pub fn diagnostic_routes() -> Router<AppState> {
    Router::new()
        .route("/api/diagnostics", post(create_diagnostic).get(list_diagnostics))
        .route(
            "/api/diagnostics/:id",
            put(update_diagnostic).delete(delete_diagnostic),
        )
        .route(
            "/api/diagnostics/reviewer/:reviewer_id",
            get(list_reviewer_diagnostics),
        )
}
