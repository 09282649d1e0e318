use std::convert::Infallible;

use tracing::debug;
use warp::{
    http::{header::AUTHORIZATION, HeaderMap},
    Filter, Rejection,
};

use crate::{auth::Auth, error::AuthError, types::Identity};

/// Require a valid bearer token. Extracts the caller's [`Identity`]; anything
/// else is rejected with an [`AuthError`] before the wrapped handler runs.
pub fn with_auth(auth: &Auth) -> impl Filter<Extract = (Identity,), Error = Rejection> + Clone {
    warp::header::headers_cloned()
        .and(with_auth_state(auth.clone()))
        .and_then(user_auth_check)
}

/// The token of an `Authorization: Bearer <token>` header. The scheme name is
/// matched case-insensitively; any other scheme counts as no token at all.
pub fn bearer_token(header: &str) -> Option<&str> {
    const SCHEME: &str = "bearer ";

    let scheme = header.get(..SCHEME.len())?;
    if !scheme.eq_ignore_ascii_case(SCHEME) {
        return None;
    }

    let token = header[SCHEME.len()..].trim();
    (!token.is_empty()).then_some(token)
}

async fn user_auth_check(headers: HeaderMap, auth: Auth) -> Result<Identity, Rejection> {
    // a header that isn't valid text can't hold a bearer token either
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or(AuthError::MissingToken)?;

    match auth.authenticate(token) {
        Ok(identity) => Ok(identity),
        Err(err) => {
            debug!("rejected bearer token: {err}");
            Err(err.into())
        }
    }
}

// functor that adds a handle to the auth state into the filter chain
pub(crate) fn with_auth_state(
    auth: Auth,
) -> impl Filter<Extract = (Auth,), Error = Infallible> + Clone {
    warp::any().map(move || auth.clone())
}
