use std::{path::PathBuf, time::Duration};

use chatsync_core::{Credentials, SignupRequest};
use clap::Parser;
use thiserror::Error;
use url::Url;

use crate::{connection::ConnectionConfig, persist::default_session_path};

const MAX_TIMEOUT: Duration = Duration::from_secs(300);
const MIN_PASSWORD_LEN: usize = 6;

#[derive(Parser, Debug, Clone)]
#[command(name = "chatsync", about = "Headless chat client")]
pub struct ClientArgs {
    /// Base URL of the REST API.
    #[arg(long, env = "CHATSYNC_API_URL", default_value = "http://127.0.0.1:5001/api")]
    pub api_url: String,
    /// Realtime endpoint; the user id is appended as `userId`.
    #[arg(long, env = "CHATSYNC_SOCKET_URL", default_value = "ws://127.0.0.1:8080/ws")]
    pub socket_url: String,
    #[arg(long, env = "CHATSYNC_SESSION_FILE")]
    pub session_file: Option<PathBuf>,
    /// Keep the identity in memory only.
    #[arg(long, default_value_t = false)]
    pub no_persist: bool,
    #[arg(long, env = "CHATSYNC_EMAIL")]
    pub email: Option<String>,
    #[arg(long, env = "CHATSYNC_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    /// Create an account with this display name instead of logging in.
    #[arg(long)]
    pub signup_name: Option<String>,
    /// Peer whose conversation is opened at start.
    #[arg(long)]
    pub peer: Option<String>,
    #[arg(long, env = "CHATSYNC_LOG_FILE")]
    pub log_file: Option<PathBuf>,
    #[arg(long, default_value_t = 15)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 12)]
    pub connect_timeout_secs: u64,
    #[arg(long, default_value_t = 200)]
    pub reconnect_base_ms: u64,
    #[arg(long, default_value_t = 10_000)]
    pub reconnect_max_ms: u64,
    /// Give up after this many failed reconnects. Unlimited when unset.
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid API URL {url:?}: {reason}")]
    ApiUrl { url: String, reason: String },
    #[error("invalid socket URL {url:?}: {reason}")]
    SocketUrl { url: String, reason: String },
    #[error("{name} must be between 1 and {max} seconds")]
    Timeout { name: &'static str, max: u64 },
    #[error("reconnect backoff base ({base_ms}ms) must be positive and not exceed the max ({max_ms}ms)")]
    Backoff { base_ms: u64, max_ms: u64 },
    #[error("--email and --password must be given together")]
    PartialCredentials,
    #[error("password must be at least {0} characters")]
    PasswordTooShort(usize),
    #[error("--signup-name requires --email and --password")]
    SignupWithoutCredentials,
    #[error("{0} must not be blank")]
    Blank(&'static str),
}

/// How the client authenticates when no valid session exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginPlan {
    Login(Credentials),
    Signup(SignupRequest),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub api_url: Url,
    pub session_path: Option<PathBuf>,
    pub login: Option<LoginPlan>,
    pub peer: Option<String>,
    pub log_file: Option<PathBuf>,
    pub request_timeout: Duration,
    pub connection: ConnectionConfig,
}

fn timeout_secs(name: &'static str, secs: u64) -> Result<Duration, ConfigError> {
    let duration = Duration::from_secs(secs);
    if secs == 0 || duration > MAX_TIMEOUT {
        return Err(ConfigError::Timeout {
            name,
            max: MAX_TIMEOUT.as_secs(),
        });
    }
    Ok(duration)
}

fn non_blank(name: &'static str, value: Option<String>) -> Result<Option<String>, ConfigError> {
    match value {
        Some(value) if value.trim().is_empty() => Err(ConfigError::Blank(name)),
        Some(value) => Ok(Some(value.trim().to_owned())),
        None => Ok(None),
    }
}

impl ClientArgs {
    pub fn into_config(self) -> Result<ClientConfig, ConfigError> {
        let api_url = Url::parse(&self.api_url).map_err(|err| ConfigError::ApiUrl {
            url: self.api_url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(api_url.scheme(), "http" | "https") || api_url.cannot_be_a_base() {
            return Err(ConfigError::ApiUrl {
                url: self.api_url,
                reason: "expected an http(s) base URL".to_owned(),
            });
        }

        let socket_url = Url::parse(&self.socket_url).map_err(|err| ConfigError::SocketUrl {
            url: self.socket_url.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(socket_url.scheme(), "ws" | "wss") {
            return Err(ConfigError::SocketUrl {
                url: self.socket_url,
                reason: "expected a ws(s) URL".to_owned(),
            });
        }

        let request_timeout = timeout_secs("request timeout", self.request_timeout_secs)?;
        let connect_timeout = timeout_secs("connect timeout", self.connect_timeout_secs)?;
        if self.reconnect_base_ms == 0 || self.reconnect_base_ms > self.reconnect_max_ms {
            return Err(ConfigError::Backoff {
                base_ms: self.reconnect_base_ms,
                max_ms: self.reconnect_max_ms,
            });
        }

        let email = non_blank("email", self.email)?;
        let signup_name = non_blank("signup name", self.signup_name)?;
        let login = match (email, self.password) {
            (Some(email), Some(password)) => {
                if password.len() < MIN_PASSWORD_LEN {
                    return Err(ConfigError::PasswordTooShort(MIN_PASSWORD_LEN));
                }
                Some(match signup_name {
                    Some(full_name) => LoginPlan::Signup(SignupRequest {
                        full_name,
                        email,
                        password,
                    }),
                    None => LoginPlan::Login(Credentials { email, password }),
                })
            }
            (None, None) if signup_name.is_some() => {
                return Err(ConfigError::SignupWithoutCredentials);
            }
            (None, None) => None,
            _ => return Err(ConfigError::PartialCredentials),
        };

        let session_path = if self.no_persist {
            None
        } else {
            Some(self.session_file.unwrap_or_else(default_session_path))
        };

        Ok(ClientConfig {
            api_url,
            session_path,
            login,
            peer: non_blank("peer", self.peer)?,
            log_file: self.log_file,
            request_timeout,
            connection: ConnectionConfig {
                socket_url: socket_url.into(),
                connect_timeout,
                backoff_base: Duration::from_millis(self.reconnect_base_ms),
                backoff_max: Duration::from_millis(self.reconnect_max_ms),
                max_reconnect_attempts: self.max_reconnect_attempts,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> ClientArgs {
        ClientArgs::try_parse_from(std::iter::once("chatsync").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn defaults_validate() {
        let config = parse(&["--no-persist"]).into_config().unwrap();
        assert_eq!(config.api_url.as_str(), "http://127.0.0.1:5001/api");
        assert_eq!(config.connection.socket_url, "ws://127.0.0.1:8080/ws");
        assert_eq!(config.connection.max_reconnect_attempts, None);
        assert_eq!(config.session_path, None);
        assert_eq!(config.login, None);
    }

    #[test]
    fn credentials_become_login_or_signup() {
        let config = parse(&["--email", " a@b.c ", "--password", "secret1"])
            .into_config()
            .unwrap();
        assert!(matches!(
            config.login,
            Some(LoginPlan::Login(Credentials { ref email, .. })) if email == "a@b.c"
        ));

        let config = parse(&[
            "--email",
            "a@b.c",
            "--password",
            "secret1",
            "--signup-name",
            "Ada",
        ])
        .into_config()
        .unwrap();
        assert!(matches!(config.login, Some(LoginPlan::Signup(_))));
    }

    #[test]
    fn rejects_bad_urls_and_bounds() {
        let err = parse(&["--api-url", "ftp://x"]).into_config().unwrap_err();
        assert!(matches!(err, ConfigError::ApiUrl { .. }));

        let err = parse(&["--socket-url", "http://x/ws"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::SocketUrl { .. }));

        let err = parse(&["--connect-timeout-secs", "0"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Timeout { .. }));

        let err = parse(&["--reconnect-base-ms", "5000", "--reconnect-max-ms", "100"])
            .into_config()
            .unwrap_err();
        assert!(matches!(err, ConfigError::Backoff { .. }));
    }

    #[test]
    fn rejects_incomplete_credentials() {
        let err = parse(&["--email", "a@b.c"]).into_config().unwrap_err();
        assert_eq!(err, ConfigError::PartialCredentials);

        let err = parse(&["--email", "a@b.c", "--password", "123"])
            .into_config()
            .unwrap_err();
        assert_eq!(err, ConfigError::PasswordTooShort(MIN_PASSWORD_LEN));

        let err = parse(&["--signup-name", "Ada"]).into_config().unwrap_err();
        assert_eq!(err, ConfigError::SignupWithoutCredentials);
    }
}
