use crate::error::AppError;
use url::Url;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const GUEST_ROLE: &str = "guest";

const BASE_URL_ENV: &str = "TERMINAL_API_BASE_URL";
const TOKEN_ENV: &str = "TERMINAL_API_TOKEN";
const ROLE_ENV: &str = "TERMINAL_ROLE";
const EMAIL_ENV: &str = "TERMINAL_EMAIL";

/// Credentials and endpoint of the signed-in user, handed to every component
/// that talks to the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    base_url: Url,
    token: Option<String>,
    role: String,
    email: Option<String>,
}

impl Session {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let mut base_url = Url::parse(base_url.trim())?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(AppError::InvalidArgument(format!(
                "api base url must be http(s), got '{}'",
                base_url.scheme()
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        Ok(Self {
            base_url,
            token: None,
            role: GUEST_ROLE.to_string(),
            email: None,
        })
    }

    pub fn from_env() -> Result<Self, AppError> {
        let env_value = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let base_url = env_value(BASE_URL_ENV).unwrap_or_else(|| DEFAULT_API_BASE_URL.to_string());
        let session = Self::new(&base_url)?;
        Ok(match env_value(TOKEN_ENV) {
            Some(token) => session.signed_in(
                token,
                env_value(ROLE_ENV).unwrap_or_else(|| GUEST_ROLE.to_string()),
                env_value(EMAIL_ENV),
            ),
            None => session,
        })
    }

    pub fn signed_in(mut self, token: String, role: String, email: Option<String>) -> Self {
        self.token = Some(token);
        self.role = role;
        self.email = email;
        self
    }

    pub fn is_authenticated(&self) -> bool {
        self.token.is_some()
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn bearer(&self) -> Option<String> {
        self.token.as_ref().map(|token| format!("Bearer {token}"))
    }

    /// Resolves `path` (no leading slash) against the API base.
    pub fn endpoint(&self, path: &str) -> Result<Url, AppError> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// socket.io endpoint on the same host, Engine.IO v4 over websocket.
    pub fn realtime_endpoint(&self) -> Result<Url, AppError> {
        let mut url = self.base_url.join("socket.io/")?;
        let scheme = if self.base_url.scheme() == "https" {
            "wss"
        } else {
            "ws"
        };
        url.set_scheme(scheme)
            .map_err(|_| AppError::InvalidArgument(format!("cannot use scheme '{scheme}'")))?;
        url.query_pairs_mut()
            .append_pair("EIO", "4")
            .append_pair("transport", "websocket");
        Ok(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_is_guest() {
        let session = Session::new("https://exchange.example").expect("valid url");
        assert!(!session.is_authenticated());
        assert_eq!(session.role(), GUEST_ROLE);
        assert!(session.bearer().is_none());
    }

    #[test]
    fn signed_in_session_carries_bearer_token() {
        let session = Session::new("https://exchange.example")
            .expect("valid url")
            .signed_in(
                "abc".to_string(),
                "admin".to_string(),
                Some("a@b.c".to_string()),
            );

        assert_eq!(session.bearer().as_deref(), Some("Bearer abc"));
        assert_eq!(session.role(), "admin");
        assert_eq!(session.email(), Some("a@b.c"));
    }

    #[test]
    fn endpoints_keep_base_path() {
        let session = Session::new("https://exchange.example/v2").expect("valid url");
        let endpoint = session.endpoint("/api/trade/candles").expect("joins");
        assert_eq!(endpoint.as_str(), "https://exchange.example/v2/api/trade/candles");
    }

    #[test]
    fn realtime_endpoint_switches_to_websocket_scheme() {
        let secure = Session::new("https://exchange.example").expect("valid url");
        let endpoint = secure.realtime_endpoint().expect("realtime url");
        assert_eq!(
            endpoint.as_str(),
            "wss://exchange.example/socket.io/?EIO=4&transport=websocket"
        );

        let plain = Session::new("http://localhost:8080").expect("valid url");
        assert!(plain
            .realtime_endpoint()
            .expect("realtime url")
            .as_str()
            .starts_with("ws://localhost:8080/socket.io/"));
    }

    #[test]
    fn rejects_non_http_base_url() {
        assert!(Session::new("ftp://exchange.example").is_err());
    }
}
