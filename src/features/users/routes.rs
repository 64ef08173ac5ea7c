use crate::features::auth::models::{Principal, Role, UserResponse};
use crate::features::auth::service::AuthError;
use crate::features::users::service::UserService;
use axum::{
    extract::{Path, Query, State},
    routing::{get, put},
    Extension, Json, Router,
};
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

pub fn users_routes() -> Router<UserService> {
    Router::new()
        .route("/organizations/:org_id/users", get(list_users_handler))
        .route(
            "/organizations/:org_id/users/:user_id/role",
            put(set_role_handler),
        )
        .route(
            "/organizations/:org_id/users/:user_id/status",
            put(set_status_handler),
        )
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    25
}

#[derive(Debug, Deserialize)]
struct RoleUpdateRequest {
    role: String,
}

#[derive(Debug, Deserialize)]
struct StatusUpdateRequest {
    is_active: bool,
}

async fn list_users_handler(
    State(users): State<UserService>,
    Path(org_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<UserResponse>>, AuthError> {
    let rows = users.list_org_users(org_id, page.page, page.page_size).await?;
    Ok(Json(rows.iter().map(UserResponse::from).collect()))
}

async fn set_role_handler(
    State(users): State<UserService>,
    Extension(principal): Extension<Principal>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<RoleUpdateRequest>,
) -> Result<Json<UserResponse>, AuthError> {
    let role = Role::from_str(&req.role)
        .map_err(|_| AuthError::InvalidInput(format!("unknown role: {}", req.role)))?;
    let updated = users.set_role(&principal, org_id, user_id, role).await?;
    Ok(Json(UserResponse::from(&updated)))
}

async fn set_status_handler(
    State(users): State<UserService>,
    Extension(principal): Extension<Principal>,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
    Json(req): Json<StatusUpdateRequest>,
) -> Result<Json<UserResponse>, AuthError> {
    let updated = users
        .set_active(&principal, org_id, user_id, req.is_active)
        .await?;
    Ok(Json(UserResponse::from(&updated)))
}
