use thiserror::Error;

/// A parsed user command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Directive {
    Connect {
        url: String,
        username: Option<String>,
        password: Option<String>,
    },
    Disconnect,
    Publish {
        topic: String,
        message: String,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    Status,
    List,
    Clear,
    Help,
    Unknown(String),
}

impl Directive {
    /// Label recorded on the session after the directive succeeded
    pub fn label(&self) -> &str {
        match self {
            Directive::Connect { .. } => "connect",
            Directive::Disconnect => "disconnect",
            Directive::Publish { .. } => "publish",
            Directive::Subscribe { .. } => "subscribe",
            Directive::Unsubscribe { .. } => "unsubscribe",
            Directive::Status => "status",
            Directive::List => "list",
            Directive::Clear => "clear",
            Directive::Help => "help",
            Directive::Unknown(name) => name,
        }
    }
}

/// Directive names with their argument synopsis, in help order
pub const USAGE: &[(&str, &str, &str)] = &[
    (
        "connect",
        "connect <broker_url> [username] [password]",
        "connect to an mqtt:// or mqtts:// broker",
    ),
    ("disconnect", "disconnect", "close the broker connection"),
    (
        "publish",
        "publish <topic> <message...>",
        "publish a message (QoS 0)",
    ),
    ("subscribe", "subscribe <topic>", "receive messages from a topic"),
    ("unsubscribe", "unsubscribe <topic>", "stop receiving a topic"),
    ("status", "status", "show connection and session state"),
    ("list", "list", "list your subscriptions"),
    ("clear", "clear", "unsubscribe from all your topics"),
    ("help", "help", "show this help"),
];

pub fn usage_of(name: &str) -> Option<&'static str> {
    USAGE
        .iter()
        .find(|(directive, _, _)| *directive == name)
        .map(|(_, usage, _)| *usage)
}

/// A directive with the wrong number of arguments
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("`{directive}` {reason}")]
pub struct UsageError {
    pub directive: &'static str,
    pub reason: &'static str,
}

impl UsageError {
    fn new(directive: &'static str, reason: &'static str) -> Self {
        Self { directive, reason }
    }

    pub fn usage(&self) -> &'static str {
        usage_of(self.directive).unwrap_or(self.directive)
    }
}

/// Turns free text into a [`Directive`]
#[derive(Clone, Debug)]
pub struct DirectiveParser {
    prefix: String,
}

impl DirectiveParser {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Returns `None` when the text is not addressed to the relay
    ///
    /// Keywords are case-sensitive. `publish` keeps the message text after the topic
    /// as written; every other argument is a single whitespace-separated token.
    /// The prefix alone is treated as `help`.
    pub fn parse(&self, input: &str) -> Option<Result<Directive, UsageError>> {
        let mut rest = input.trim();
        if !self.prefix.is_empty() {
            let (head, tail) = next_token(rest)?;
            if head != self.prefix {
                return None;
            }
            rest = tail;
        }

        let Some((name, args)) = next_token(rest) else {
            return Some(Ok(Directive::Help));
        };
        Some(parse_directive(name, args))
    }
}

fn parse_directive(name: &str, args: &str) -> Result<Directive, UsageError> {
    let tokens: Vec<&str> = args.split_whitespace().collect();

    let directive = match name {
        "connect" => {
            let mut tokens = tokens.into_iter();
            let url = tokens
                .next()
                .ok_or_else(|| UsageError::new("connect", "needs a broker URL"))?;
            let username = tokens.next().map(str::to_string);
            let password = tokens.next().map(str::to_string);
            if tokens.next().is_some() {
                return Err(UsageError::new("connect", "takes at most three arguments"));
            }
            Directive::Connect {
                url: url.to_string(),
                username,
                password,
            }
        }
        "publish" => {
            let (topic, message) = next_token(args)
                .ok_or_else(|| UsageError::new("publish", "needs a topic and a message"))?;
            if message.is_empty() {
                return Err(UsageError::new("publish", "needs a message after the topic"));
            }
            Directive::Publish {
                topic: topic.to_string(),
                message: message.to_string(),
            }
        }
        "subscribe" => Directive::Subscribe {
            topic: single_topic("subscribe", &tokens)?,
        },
        "unsubscribe" => Directive::Unsubscribe {
            topic: single_topic("unsubscribe", &tokens)?,
        },
        "disconnect" => Directive::Disconnect,
        "status" => Directive::Status,
        "list" => Directive::List,
        "clear" => Directive::Clear,
        "help" => Directive::Help,
        other => Directive::Unknown(other.to_string()),
    };
    Ok(directive)
}

fn single_topic(directive: &'static str, tokens: &[&str]) -> Result<String, UsageError> {
    match tokens {
        [topic] => Ok(topic.to_string()),
        [] => Err(UsageError::new(directive, "needs a topic")),
        _ => Err(UsageError::new(directive, "takes exactly one topic")),
    }
}

/// Splits off the first whitespace-delimited token; the rest is trimmed at the start
fn next_token(input: &str) -> Option<(&str, &str)> {
    let input = input.trim_start();
    if input.is_empty() {
        return None;
    }
    match input.split_once(char::is_whitespace) {
        Some((token, rest)) => Some((token, rest.trim_start())),
        None => Some((input, "")),
    }
}
