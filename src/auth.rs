//! Credential collaborator for the live channel.
//!
//! The channel authenticates by appending a token to the endpoint URL as a
//! query parameter. The token is read once per `connect()`, so a provider can
//! hand out a refreshed token for every new session.

/// Secret string types that redact values in debug output for security.
pub use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::Result;
use crate::ws::WsError;

/// Query parameter carrying the auth token.
pub const TOKEN_QUERY_PARAM: &str = "token";

/// Supplies the current auth token, if any.
pub trait TokenProvider: Send + Sync + 'static {
    fn token(&self) -> Option<SecretString>;
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<SecretString> + Send + Sync + 'static,
{
    fn token(&self) -> Option<SecretString> {
        self()
    }
}

/// A token that never changes.
#[derive(Clone, Debug)]
pub struct StaticToken(SecretString);

impl StaticToken {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self(SecretString::from(token))
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<SecretString> {
        Some(self.0.clone())
    }
}

/// Connect without credentials.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default)]
pub struct Anonymous;

impl TokenProvider for Anonymous {
    fn token(&self) -> Option<SecretString> {
        None
    }
}

/// Build the URL for one connection attempt.
///
/// The result embeds the token and must never be logged.
pub(crate) fn endpoint_url(endpoint: &str, token: Option<&SecretString>) -> Result<Url> {
    let mut url = Url::parse(endpoint)?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(WsError::InvalidEndpoint(format!(
            "unsupported scheme `{}`, expected ws or wss",
            url.scheme()
        ))
        .into());
    }

    if let Some(token) = token {
        url.query_pairs_mut()
            .append_pair(TOKEN_QUERY_PARAM, token.expose_secret());
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Kind;

    #[test]
    fn token_is_appended_as_query_parameter() {
        let token = SecretString::from("abc 123");
        let url = endpoint_url("wss://live.example.com/ws/groups", Some(&token)).unwrap();

        assert_eq!(url.as_str(), "wss://live.example.com/ws/groups?token=abc+123");
    }

    #[test]
    fn existing_query_is_preserved() {
        let token = SecretString::from("t");
        let url = endpoint_url("ws://127.0.0.1:9000/ws?v=2", Some(&token)).unwrap();

        assert_eq!(url.query(), Some("v=2&token=t"));
    }

    #[test]
    fn no_token_leaves_url_untouched() {
        let url = endpoint_url("ws://127.0.0.1:9000/ws", None).unwrap();
        assert_eq!(url.query(), None);
    }

    #[test]
    fn http_scheme_is_rejected() {
        let err = endpoint_url("https://live.example.com/ws", None).unwrap_err();

        assert_eq!(err.kind(), Kind::WebSocket);
        assert!(matches!(
            err.downcast_ref::<WsError>(),
            Some(WsError::InvalidEndpoint(_))
        ));
    }

    #[test]
    fn garbage_endpoint_is_rejected() {
        let err = endpoint_url("::not a url::", None).unwrap_err();
        assert_eq!(err.kind(), Kind::Validation);
    }

    #[test]
    fn providers() {
        assert!(Anonymous.token().is_none());
        assert_eq!(
            StaticToken::new("s3cret".to_owned())
                .token()
                .unwrap()
                .expose_secret(),
            "s3cret"
        );

        let closure = || Some(SecretString::from("fresh"));
        assert_eq!(closure.token().unwrap().expose_secret(), "fresh");
    }
}
