use crate::error::RelayError;
use std::fmt;

pub const MQTT_SCHEME: &str = "mqtt://";
pub const MQTTS_SCHEME: &str = "mqtts://";

const DEFAULT_MQTT_PORT: u16 = 1883;
const DEFAULT_MQTTS_PORT: u16 = 8883;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scheme {
    Mqtt,
    Mqtts,
}

impl Scheme {
    fn default_port(self) -> u16 {
        match self {
            Scheme::Mqtt => DEFAULT_MQTT_PORT,
            Scheme::Mqtts => DEFAULT_MQTTS_PORT,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            Scheme::Mqtt => MQTT_SCHEME,
            Scheme::Mqtts => MQTTS_SCHEME,
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

// Passwords never end up in logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// True if `url` starts with one of the schemes the relay can connect to
pub fn has_known_scheme(url: &str) -> bool {
    url.starts_with(MQTT_SCHEME) || url.starts_with(MQTTS_SCHEME)
}

/// Where to connect, parsed from an `mqtt://` or `mqtts://` URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl BrokerEndpoint {
    /// Accepts `scheme://[user[:pass]@]host[:port][/...]`.
    /// A bracketed IPv6 host (`[::1]:1883`) is supported.
    pub fn parse(url: &str) -> Result<Self, RelayError> {
        let url = url.trim();
        let (scheme, rest) = if let Some(rest) = url.strip_prefix(MQTTS_SCHEME) {
            (Scheme::Mqtts, rest)
        } else if let Some(rest) = url.strip_prefix(MQTT_SCHEME) {
            (Scheme::Mqtt, rest)
        } else {
            return Err(RelayError::InvalidUrl(format!(
                "`{}` must start with {} or {}",
                url, MQTT_SCHEME, MQTTS_SCHEME
            )));
        };

        let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();

        let (credentials, host_port) = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                let credentials = match userinfo.split_once(':') {
                    Some((user, pass)) => Credentials::new(user, pass),
                    None => Credentials::new(userinfo, ""),
                };
                (Some(credentials), host_port)
            }
            None => (None, authority),
        };

        let (host, port) = split_host_port(host_port, scheme.default_port())
            .ok_or_else(|| RelayError::InvalidUrl(format!("`{}` has no usable host/port", url)))?;

        Ok(Self {
            scheme,
            host,
            port,
            credentials,
        })
    }

    /// Explicit credentials win over ones embedded in the URL
    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        if credentials.is_some() {
            self.credentials = credentials;
        }
        self
    }

    pub fn uses_tls(&self) -> bool {
        self.scheme == Scheme::Mqtts
    }

    /// URL without credentials, suitable for status output and logs
    pub fn display_url(&self) -> String {
        if self.host.contains(':') {
            format!("{}[{}]:{}", self.scheme.prefix(), self.host, self.port)
        } else {
            format!("{}{}:{}", self.scheme.prefix(), self.host, self.port)
        }
    }
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_url())
    }
}

fn split_host_port(host_port: &str, default_port: u16) -> Option<(String, u16)> {
    if let Some(bracketed) = host_port.strip_prefix('[') {
        let (host, rest) = bracketed.split_once(']')?;
        let port = match rest.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if rest.is_empty() => default_port,
            None => return None,
        };
        return (!host.is_empty() && port != 0).then(|| (host.to_string(), port));
    }

    let (host, port) = match host_port.split_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (host_port, default_port),
    };
    if host.is_empty() || port == 0 {
        return None;
    }
    Some((host.to_string(), port))
}
