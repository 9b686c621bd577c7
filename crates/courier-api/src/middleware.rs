use axum::{
    RequestExt,
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
};
use tracing::{debug, error};

use courier_gateway::auth::AuthError;

use crate::AppState;

/// Resolve the bearer token to a live user and stash it in the request
/// extensions as `UserOut`.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let TypedHeader(Authorization(bearer)) = req
        .extract_parts::<TypedHeader<Authorization<Bearer>>>()
        .await
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let gateway = &state.gateway;
    let user = match gateway.verifier.verify(&gateway.db, Some(bearer.token())).await {
        Ok(user) => user,
        Err(AuthError::Storage(e)) => {
            error!("Token check failed: {:#}", e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
        Err(e) => {
            debug!("Rejected bearer token: {}", e);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    req.extensions_mut().insert(user);
    Ok(next.run(req).await)
}
