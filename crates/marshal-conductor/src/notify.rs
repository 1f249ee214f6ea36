/// Operator alert channel (manual-required outcomes, deadlock candidates,
/// integrity violations).
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, message: &str);
}

/// Prints to stderr so alerts don't mix with `--json` output.
pub struct StderrNotifier;

#[async_trait::async_trait]
impl Notifier for StderrNotifier {
    async fn notify(&self, message: &str) {
        eprintln!("[marshal] {message}");
    }
}

/// Collects messages in memory (for testing).
#[derive(Default)]
pub struct CollectNotifier {
    messages: std::sync::Mutex<Vec<String>>,
}

impl CollectNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        match self.messages.lock() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

#[async_trait::async_trait]
impl Notifier for CollectNotifier {
    async fn notify(&self, message: &str) {
        match self.messages.lock() {
            Ok(mut m) => m.push(message.to_string()),
            Err(poisoned) => poisoned.into_inner().push(message.to_string()),
        }
    }
}
