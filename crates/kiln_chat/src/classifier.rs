//! The classification collaborator seam.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ChatError, ChatResult};
use crate::types::Message;

/// Decides what a dialogue turn should do.
///
/// Called at most once per turn. Implementations may retry transport
/// failures internally; callers never retry.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, system_prompt: &str, history: &[Message]) -> ChatResult<String>;
}

/// Classifier returning canned responses in order.
///
/// Once the script runs out every call fails with [`ChatError::Llm`].
#[derive(Default)]
pub struct ScriptedClassifier {
    responses: Mutex<VecDeque<String>>,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
}

impl ScriptedClassifier {
    pub fn new<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            responses: Mutex::new(responses.into_iter().map(Into::into).collect()),
            ..Self::default()
        }
    }

    /// Queue another response.
    pub fn push(&self, response: impl Into<String>) {
        self.responses.lock().push_back(response.into());
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().last().cloned()
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, system_prompt: &str, _history: &[Message]) -> ChatResult<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().push(system_prompt.to_string());
        self.responses
            .lock()
            .pop_front()
            .ok_or_else(|| ChatError::Llm("no scripted response left".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let classifier = ScriptedClassifier::new(["first", "second"]);
        assert_eq!(classifier.classify("p", &[]).await.unwrap(), "first");
        assert_eq!(classifier.classify("p", &[]).await.unwrap(), "second");
        assert!(classifier.classify("p", &[]).await.is_err());
        assert_eq!(classifier.calls(), 3);
    }
}
