//! `POST /join`: put the agent into an interview room.
//!
//! Idempotent per `roomName`; a repeat call answers with the identity already in the room.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest {
    #[serde(default)]
    pub room_name: Option<String>,
    #[serde(default)]
    pub problem_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    pub message: &'static str,
    pub room_name: String,
    pub identity: String,
}

/// Malformed bodies get the same JSON error shape as every other failure.
pub fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .error_handler(|err, _req| AppError::BadRequest(err.to_string()).into())
}

pub async fn join_room(
    state: web::Data<AppState>,
    body: web::Json<JoinRequest>,
) -> AppResult<HttpResponse> {
    let JoinRequest {
        room_name,
        problem_id,
    } = body.into_inner();

    let room_name = room_name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::BadRequest("Missing roomName".to_string()))?;
    let problem_id = problem_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| state.config.problems.default_problem_id.clone());

    let outcome = state.registry.join(&room_name, &problem_id).await?;
    info!(room = %room_name, identity = %outcome.identity, created = outcome.created, "Join handled");

    Ok(HttpResponse::Ok().json(JoinResponse {
        message: if outcome.created {
            "Joined room"
        } else {
            "Already joined"
        },
        room_name,
        identity: outcome.identity,
    }))
}
