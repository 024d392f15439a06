use super::{NotifyError, Notifier};
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, Stdout};
use tokio::sync::Mutex;

/// Writes `@<user> <text>` lines to stdout, one line per text line
pub struct ConsoleNotifier {
    out: Mutex<Stdout>,
}

impl ConsoleNotifier {
    pub fn new() -> Self {
        Self {
            out: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for ConsoleNotifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Notifier for ConsoleNotifier {
    async fn notify(&self, user: &str, text: &str) -> Result<(), NotifyError> {
        let mut rendered = String::new();
        for line in text.lines() {
            rendered.push_str(&format!("@{} {}\n", user, line));
        }
        if rendered.is_empty() {
            rendered = format!("@{}\n", user);
        }

        let mut out = self.out.lock().await;
        out.write_all(rendered.as_bytes())
            .await
            .map_err(|e| NotifyError::Failed(e.to_string()))?;
        out.flush()
            .await
            .map_err(|e| NotifyError::Failed(e.to_string()))
    }
}
