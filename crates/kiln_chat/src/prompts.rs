//! System prompt for the requirements classifier.

/// Context the classifier needs besides the message history.
#[derive(Debug, Clone, Default)]
pub struct PromptContext<'a> {
    pub requirements: Option<&'a str>,
    pub pending_question: Option<&'a str>,
}

const CLASSIFIER_PROMPT: &str = r#"You are an assistant that helps users create web applications through conversation.

Your job: read the conversation so far, decide the next action and write the reply to the user.

Rules:
- You only gather and confirm requirements. Never write code or code samples.
- Focus on understanding what the user wants the application to do.

Actions:
1. "clarify": the request is ambiguous in a way that blocks implementation. Ask exactly ONE question, the most important one.
2. "extract": the conversation holds enough information. Write the requirements as a clear structured text and ask the user whether to start building.
3. "start_gen": requirements were already extracted and the user explicitly agrees to start (for example "yes", "ok", "go ahead", "start"). Reply that building will begin.
4. "continue": more information is needed; keep the conversation going.

Decision guide:
- Requirements exist and the user confirms: use "start_gen".
- Requirements exist but the user has not confirmed: use "extract" to restate them and ask.
- Information is incomplete: use "clarify" or "continue".

Respond with ONE JSON object and nothing else:
{
  "action": "clarify" | "extract" | "start_gen" | "continue",
  "response": "reply text for the user",
  "requirements": "requirements text for extract or start_gen, otherwise null",
  "clarifying_questions": ["at most one question for clarify, otherwise empty"]
}
"#;

/// Build the classifier system prompt.
pub fn classification_prompt(ctx: &PromptContext<'_>) -> String {
    let mut prompt = String::from(CLASSIFIER_PROMPT);
    prompt.push_str("\nCurrent state:\n");

    match ctx.requirements {
        Some(requirements) => {
            prompt.push_str("- Requirements already extracted: yes\n");
            prompt.push_str(&format!("\nExtracted requirements:\n{}\n", requirements));
        }
        None => prompt.push_str("- Requirements already extracted: no\n"),
    }
    match ctx.pending_question {
        Some(question) => prompt.push_str(&format!("- Pending clarifying question: {}\n", question)),
        None => prompt.push_str("- Pending clarifying question: none\n"),
    }

    prompt
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_reflects_state() {
        let empty = classification_prompt(&PromptContext::default());
        assert!(empty.contains("Requirements already extracted: no"));

        let with_reqs = classification_prompt(&PromptContext {
            requirements: Some("A recipe site"),
            pending_question: None,
        });
        assert!(with_reqs.contains("Requirements already extracted: yes"));
        assert!(with_reqs.contains("A recipe site"));
    }
}
