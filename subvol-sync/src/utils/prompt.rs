//! Operator confirmation for batch deletions.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::warn;

#[async_trait]
pub trait Confirm: Send + Sync {
    /// Ask a yes/no question, defaulting to no
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Asks on the controlling terminal
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, prompt: &str) -> bool {
        let mut stdout = tokio::io::stdout();
        if let Err(e) = stdout.write_all(format!("{} [y/N] ", prompt).as_bytes()).await {
            warn!("could not write prompt: {}", e);
            return false;
        }
        let _ = stdout.flush().await;

        let mut line = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut line).await {
            Ok(_) => is_yes(&line),
            Err(e) => {
                warn!("could not read answer: {}", e);
                false
            }
        }
    }
}

/// Fixed answer, for non-interactive callers and tests
pub struct AutoConfirm(pub bool);

#[async_trait]
impl Confirm for AutoConfirm {
    async fn confirm(&self, _prompt: &str) -> bool {
        self.0
    }
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
