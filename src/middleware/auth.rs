use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::error::AppError;
use crate::models::CurrentUser;
use crate::services::auth::AuthService;
use crate::AppState;

/// Authentication middleware
/// Extracts and validates the access JWT from the Authorization header
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let auth_header = request
        .headers()
        .get("Authorization")
        .and_then(|h| h.to_str().ok());

    let token = match auth_header {
        Some(header) if header.starts_with("Bearer ") => &header[7..],
        _ => {
            return Err(AppError::Unauthorized(
                "Missing or invalid Authorization header".to_string(),
            ));
        }
    };

    let email = AuthService::decode_token(&state.config, token, "access")
        .ok_or_else(|| AppError::Unauthorized("Invalid token".to_string()))?;

    // The account must still exist; a deleted user's tokens die with it.
    let user = AuthService::find_by_email(&state.db, &email)
        .await
        .map_err(|_| AppError::Unauthorized("Invalid token".to_string()))?
        .ok_or_else(|| AppError::Unauthorized("Invalid token".to_string()))?;

    let current_user = CurrentUser {
        id: user.id,
        email: user.email,
        is_admin: user.is_admin,
    };

    request.extensions_mut().insert(current_user);

    Ok(next.run(request).await)
}

/// Guard for the admin-only routes, layered after `auth_middleware`.
pub async fn require_admin(request: Request, next: Next) -> Result<Response, AppError> {
    let is_admin = request
        .extensions()
        .get::<CurrentUser>()
        .map(|u| u.is_admin)
        .unwrap_or(false);
    if !is_admin {
        return Err(AppError::Forbidden("Admin access required".to_string()));
    }
    Ok(next.run(request).await)
}
