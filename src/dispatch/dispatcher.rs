use super::directive::{usage_of, Directive, DirectiveParser, UsageError, USAGE};
use crate::error::RelayError;
use crate::mqtt::{ConnectionManager, Credentials};
use crate::registry::SubscriptionRegistry;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Executes directives against the connection manager and the registry
///
/// Stateless per call: every guard is evaluated against the current connection and
/// registry state. Every directive produces exactly one response string; errors
/// never escape.
pub struct Dispatcher {
    parser: DirectiveParser,
    connection: Arc<ConnectionManager>,
    registry: Arc<SubscriptionRegistry>,
}

impl Dispatcher {
    pub fn new(
        parser: DirectiveParser,
        connection: Arc<ConnectionManager>,
        registry: Arc<SubscriptionRegistry>,
    ) -> Self {
        Self {
            parser,
            connection,
            registry,
        }
    }

    /// Parses and executes `input` from `user`
    ///
    /// Returns `None` if the text does not start with the command prefix.
    pub async fn handle(&self, user: &str, input: &str) -> Option<String> {
        let parsed = self.parser.parse(input)?;
        let response = match parsed {
            Ok(directive) => self.dispatch(user, directive).await,
            Err(e) => {
                self.registry.session(user).await;
                debug!("Rejected directive from {}: {}", user, e);
                render_usage_error(&e, self.parser.prefix())
            }
        };
        Some(response)
    }

    pub async fn dispatch(&self, user: &str, directive: Directive) -> String {
        self.registry.session(user).await;
        debug!("{} -> {:?}", user, redacted(&directive));

        let label = directive.label().to_string();
        match self.execute(user, &directive).await {
            Ok(text) => {
                self.registry.record_operation(user, &label).await;
                text
            }
            Err(e) if e.is_warning() => format!("Warning: {}", e),
            Err(e) => {
                warn!("{} failed for {}: {}", label, user, e);
                self.render_error(&directive, &e)
            }
        }
    }

    async fn execute(&self, user: &str, directive: &Directive) -> Result<String, RelayError> {
        match directive {
            Directive::Connect {
                url,
                username,
                password,
            } => self.connect(url, username.as_deref(), password.as_deref()).await,
            Directive::Disconnect => self.disconnect().await,
            Directive::Publish { topic, message } => self.publish(topic, message).await,
            Directive::Subscribe { topic } => {
                let total = self.registry.subscribe(user, topic).await?;
                Ok(format!(
                    "Subscribed to `{}`. You follow {} topic(s).",
                    topic, total
                ))
            }
            Directive::Unsubscribe { topic } => {
                let total = self.registry.unsubscribe(user, topic).await?;
                Ok(format!(
                    "Unsubscribed from `{}`. You follow {} topic(s).",
                    topic, total
                ))
            }
            Directive::Status => Ok(self.status(user).await),
            Directive::List => Ok(self.list(user).await),
            Directive::Clear => self.clear(user).await,
            Directive::Help => Ok(help_text(self.parser.prefix())),
            Directive::Unknown(name) => Err(RelayError::InvalidArgument(format!(
                "unrecognized directive `{}`",
                name
            ))),
        }
    }

    async fn connect(
        &self,
        url: &str,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<String, RelayError> {
        let credentials = username.map(|user| Credentials::new(user, password.unwrap_or_default()));
        let connected = self.connection.connect(url, credentials).await?;
        Ok(format!(
            "Connected to {} as `{}`.",
            connected.broker_url, connected.client_id
        ))
    }

    async fn disconnect(&self) -> Result<String, RelayError> {
        let disconnected = self.connection.disconnect().await?;
        let dropped = self.registry.clear_all(disconnected.generation).await;
        info!("Disconnect dropped {} subscription(s)", dropped);
        Ok(format!(
            "Disconnected from {}. Dropped {} subscription(s).",
            disconnected.broker_url, dropped
        ))
    }

    async fn publish(&self, topic: &str, message: &str) -> Result<String, RelayError> {
        self.connection
            .publish(topic, message.as_bytes().to_vec())
            .await?;
        Ok(format!(
            "Published {} byte(s) to `{}`.",
            message.len(),
            topic
        ))
    }

    async fn status(&self, user: &str) -> String {
        let status = self.connection.status().await;
        let session = self.registry.session(user).await;

        let mut lines = Vec::new();
        if status.connected() {
            lines.push(format!(
                "Broker: connected to {} as `{}`",
                status.broker_url, status.client_id
            ));
            lines.push(format!(
                "Messages: {} received, {} published",
                status.messages_received, status.messages_sent
            ));
        } else {
            lines.push(format!(
                "Broker: not connected ({:?})",
                status.connection_state
            ));
        }
        if let Some(at) = status.last_activity {
            lines.push(format!("Last broker activity: {}", at.format("%Y-%m-%d %H:%M:%S")));
        }
        if let Some(error) = status.last_error() {
            lines.push(format!("Last error: {}", error));
        }
        lines.push(format!("Your topics: {}", session.topic_count()));
        match (session.last_operation(), session.last_operation_at()) {
            (Some(label), Some(at)) => lines.push(format!(
                "Operations: {} (last: {} at {})",
                session.operations(),
                label,
                at.format("%H:%M:%S")
            )),
            _ => lines.push(format!("Operations: {}", session.operations())),
        }
        lines.join("\n")
    }

    async fn list(&self, user: &str) -> String {
        let topics = self.registry.list_user_topics(user).await;
        if topics.is_empty() {
            return "You have no subscriptions.".to_string();
        }
        let mut text = format!("You are subscribed to {} topic(s):", topics.len());
        for topic in topics {
            text.push_str("\n- ");
            text.push_str(&topic);
        }
        text
    }

    async fn clear(&self, user: &str) -> Result<String, RelayError> {
        let held = self.registry.list_user_topics(user).await.len();
        if held == 0 {
            return Ok("You have no subscriptions to clear.".to_string());
        }
        if !self.connection.is_connected().await {
            return Err(RelayError::NotConnected);
        }
        let cleared = self.registry.clear_user(user).await;
        Ok(format!("Unsubscribed from {} of {} topic(s).", cleared, held))
    }

    fn render_error(&self, directive: &Directive, error: &RelayError) -> String {
        let prefix = self.parser.prefix();
        if let Directive::Unknown(name) = directive {
            return format!(
                "Unrecognized directive `{}`. Send `{}` for the list of directives.",
                name,
                command(prefix, "help")
            );
        }
        match error {
            RelayError::NotConnected => format!(
                "Error: {}. Connect first with `{}`.",
                error,
                command(prefix, usage_of("connect").unwrap_or("connect"))
            ),
            RelayError::AlreadyConnected(_) => format!(
                "Error: {}. Use `{}` first.",
                error,
                command(prefix, "disconnect")
            ),
            RelayError::InvalidArgument(_) | RelayError::InvalidUrl(_) => {
                match usage_of(directive.label()) {
                    Some(usage) => format!("Error: {}\nUsage: {}", error, command(prefix, usage)),
                    None => format!(
                        "Error: {}. Send `{}` for the list of directives.",
                        error,
                        command(prefix, "help")
                    ),
                }
            }
            _ => format!("Error: {}", error),
        }
    }
}

fn render_usage_error(error: &UsageError, prefix: &str) -> String {
    format!(
        "Error: {}\nUsage: {}",
        error,
        command(prefix, error.usage())
    )
}

fn command(prefix: &str, body: &str) -> String {
    if prefix.is_empty() {
        body.to_string()
    } else {
        format!("{} {}", prefix, body)
    }
}

fn help_text(prefix: &str) -> String {
    let mut text = String::from("Available directives:");
    for (_, usage, description) in USAGE {
        text.push_str(&format!("\n{} - {}", command(prefix, usage), description));
    }
    text
}

// Keeps passwords out of debug logs
/// Copy of `directive` that is safe to log
pub(super) fn redacted(directive: &Directive) -> Directive {
    match directive {
        Directive::Connect {
            url,
            username,
            password,
        } => Directive::Connect {
            url: strip_userinfo(url),
            username: username.clone(),
            password: password.as_ref().map(|_| "***".to_string()),
        },
        other => other.clone(),
    }
}

// `mqtt://user:pw@host:1883/x` -> `mqtt://host:1883/x`
fn strip_userinfo(url: &str) -> String {
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => format!("{}://{}", scheme, &rest[at + 1..]),
        None => url.to_string(),
    }
}
