use serde::{Deserialize, Serialize};
use tracing::error;
use warp::{
    filters::body::BodyDeserializeError,
    http::StatusCode,
    path,
    reject::{LengthRequired, PayloadTooLarge},
    Filter, Rejection, Reply,
};

use crate::{
    auth::Auth,
    error::AuthError,
    middleware::{with_auth, with_auth_state},
    types::Identity,
};

/// Largest JSON body accepted by the account endpoints.
const MAX_BODY_BYTES: u64 = 16 * 1024;

/// `POST /api/auth/register` and `POST /api/auth/login`.
pub fn build_api_route_filter(
    auth: &Auth,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    let register = path!("api" / "auth" / "register")
        .and(warp::post())
        .and(credentials_body())
        .and(with_auth_state(auth.clone()))
        .and_then(user_register);

    let login = path!("api" / "auth" / "login")
        .and(warp::post())
        .and(credentials_body())
        .and(with_auth_state(auth.clone()))
        .and_then(user_login);

    register.or(login)
}

/// `GET /api/protected`: greets whoever the bearer token belongs to.
pub fn protected_route(
    auth: &Auth,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    path!("api" / "protected")
        .and(warp::get())
        .and(with_auth(auth))
        .map(|identity: Identity| {
            warp::reply::json(&MessageResponse {
                message: format!(
                    "Hello {}, you have access to this protected route",
                    identity.username.0
                ),
            })
        })
}

/// Every endpoint, with auth failures turned into JSON responses.
pub fn build_routes(
    auth: &Auth,
) -> impl Filter<Extract = impl Reply, Error = Rejection> + Clone {
    build_api_route_filter(auth)
        .or(protected_route(auth))
        .recover(handle_auth_errors)
}

pub async fn handle_auth_errors(err: Rejection) -> Result<impl Reply, Rejection> {
    if let Some(auth_error) = err.find::<AuthError>() {
        if auth_error.is_internal() {
            // the client only ever sees a generic message
            error!("request failed: {auth_error:?}");
        }

        let (status, message) = match auth_error {
            AuthError::MissingFields => (
                StatusCode::BAD_REQUEST,
                "Username and password are required",
            ),
            AuthError::UsernameAlreadyTaken => (StatusCode::BAD_REQUEST, "Username already taken"),
            AuthError::LoginFailed => (StatusCode::BAD_REQUEST, "Invalid credentials"),
            AuthError::MissingToken => (
                StatusCode::UNAUTHORIZED,
                "Access denied. No token provided.",
            ),
            AuthError::TokenError { .. } => (StatusCode::UNAUTHORIZED, "Invalid token"),
            AuthError::HashingError { .. }
            | AuthError::SigningError { .. }
            | AuthError::DatabaseError { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };
        return Ok(message_reply(message, status));
    }

    if err.find::<BodyDeserializeError>().is_some() {
        return Ok(message_reply(
            "Request body must be a JSON object",
            StatusCode::BAD_REQUEST,
        ));
    }

    if err.find::<LengthRequired>().is_some() {
        return Ok(message_reply(
            "Content-Length header is required",
            StatusCode::LENGTH_REQUIRED,
        ));
    }

    if err.find::<PayloadTooLarge>().is_some() {
        return Ok(message_reply(
            "Request body is too large",
            StatusCode::PAYLOAD_TOO_LARGE,
        ));
    }

    Err(err)
}

fn message_reply(message: &str, status: StatusCode) -> warp::reply::WithStatus<warp::reply::Json> {
    warp::reply::with_status(
        warp::reply::json(&MessageResponse {
            message: message.to_owned(),
        }),
        status,
    )
}

/// Body of both account endpoints. Absent, null and empty fields are all
/// reported as missing.
#[derive(Debug, Default, Deserialize)]
pub struct CredentialsQuery {
    pub username: Option<String>,
    pub password: Option<String>,
}

impl CredentialsQuery {
    fn fields(&self) -> (&str, &str) {
        (
            self.username.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default(),
        )
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub message: String,
    pub token: String,
}

fn credentials_body() -> impl Filter<Extract = (CredentialsQuery,), Error = Rejection> + Clone {
    warp::body::content_length_limit(MAX_BODY_BYTES).and(warp::body::json())
}

async fn user_register(input: CredentialsQuery, auth: Auth) -> Result<impl Reply, Rejection> {
    let (username, password) = input.fields();

    let registration = auth.register(username, password).await?;

    Ok(warp::reply::json(&TokenResponse {
        message: "User registered successfully".into(),
        token: registration.token,
    }))
}

async fn user_login(input: CredentialsQuery, auth: Auth) -> Result<impl Reply, Rejection> {
    let (username, password) = input.fields();

    let token = auth.login(username, password).await?;

    Ok(warp::reply::json(&TokenResponse {
        message: "Login successful".into(),
        token,
    }))
}
