use axum::extract::{FromRequestParts, Request as AxumExtractRequest};
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;
use std::convert::Infallible;

/// The gateway authenticates the caller and asserts the verified identity in
/// this header; this service never inspects credentials itself.
pub const PRINCIPAL_HEADER: &str = "x-user-id";

pub const ANONYMOUS: &str = "anonymous";

/// The context-carried caller identity. Resolution order: context value,
/// then the request's own `user_id` field, then `anonymous`.
#[derive(Debug, Clone, Default)]
pub struct Principal(Option<String>);

impl Principal {
    pub fn resolve(&self, request_user: &str) -> String {
        if let Some(user) = self.0.as_deref()
            && !user.is_empty()
        {
            return user.to_string();
        }
        if !request_user.is_empty() {
            return request_user.to_string();
        }
        ANONYMOUS.to_string()
    }
}

pub async fn principal_context(mut request: AxumExtractRequest, next: Next) -> Response {
    let principal = request
        .headers()
        .get(PRINCIPAL_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_owned);
    request.extensions_mut().insert(Principal(principal));
    next.run(request).await
}

impl<S> FromRequestParts<S> for Principal
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _: &S) -> Result<Self, Infallible> {
        Ok(parts.extensions.get::<Principal>().cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_value_wins_over_request_field() {
        let principal = Principal(Some("alice".into()));
        assert_eq!(principal.resolve("bob"), "alice");
        assert_eq!(principal.resolve(""), "alice");
    }

    #[test]
    fn request_field_wins_over_anonymous() {
        let principal = Principal(None);
        assert_eq!(principal.resolve("bob"), "bob");
        assert_eq!(principal.resolve(""), ANONYMOUS);
        // an empty context value does not shadow the request field
        let principal = Principal(Some(String::new()));
        assert_eq!(principal.resolve("bob"), "bob");
    }
}
