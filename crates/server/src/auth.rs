//! Request authentication and method-based privilege checks.
//!
//! Every method maps to a required privilege: reads for GET/HEAD,
//! nothing for OPTIONS, writes for POST/PATCH/PUT, deletes for DELETE.
//! Credentials are bearer tokens resolved by an [`Authenticator`]; a
//! server without one configured is open.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// What a credential is allowed to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    None,
    Read,
    Write,
    Delete,
    All,
}

impl Privilege {
    /// Whether this privilege satisfies the `required` one.
    pub fn grants(self, required: Privilege) -> bool {
        match required {
            Privilege::None => true,
            Privilege::All => self == Privilege::All,
            _ => self == required || self == Privilege::All,
        }
    }
}

/// Privilege a request method requires.
pub fn required_privilege(method: &Method) -> Privilege {
    match *method {
        Method::GET | Method::HEAD => Privilege::Read,
        Method::OPTIONS => Privilege::None,
        Method::POST | Method::PATCH | Method::PUT => Privilege::Write,
        Method::DELETE => Privilege::Delete,
        _ => Privilege::All,
    }
}

/// Resolves a bearer token to its privilege.
pub trait Authenticator: Send + Sync {
    fn privilege(&self, token: &str) -> Option<Privilege>;
}

/// In-memory token table.
pub struct TokenAuthenticator {
    tokens: HashMap<String, Privilege>,
}

impl TokenAuthenticator {
    pub fn new(tokens: HashMap<String, Privilege>) -> Self {
        Self { tokens }
    }
}

impl Authenticator for TokenAuthenticator {
    fn privilege(&self, token: &str) -> Option<Privilege> {
        self.tokens.get(token).copied()
    }
}

/// Middleware enforcing the per-method privilege.
pub async fn require_privilege(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(auth) = &state.auth else {
        return next.run(request).await;
    };
    let required = required_privilege(request.method());

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(token) = token else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match auth.privilege(token) {
        None => StatusCode::UNAUTHORIZED.into_response(),
        Some(p) if p.grants(required) => next.run(request).await,
        Some(_) => StatusCode::FORBIDDEN.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_privileges() {
        assert_eq!(required_privilege(&Method::GET), Privilege::Read);
        assert_eq!(required_privilege(&Method::OPTIONS), Privilege::None);
        assert_eq!(required_privilege(&Method::POST), Privilege::Write);
        assert_eq!(required_privilege(&Method::PUT), Privilege::Write);
        assert_eq!(required_privilege(&Method::DELETE), Privilege::Delete);
    }

    #[test]
    fn grants_are_exact_or_all() {
        assert!(Privilege::Read.grants(Privilege::Read));
        assert!(!Privilege::Read.grants(Privilege::Write));
        assert!(Privilege::All.grants(Privilege::Delete));
        assert!(Privilege::Write.grants(Privilege::None));
    }
}
