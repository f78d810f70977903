//! Grounded prompt construction.

use crate::llm::{ChatMessage, ChatRequest, Role};
use crate::problem::ProblemContext;

/// Trigger used when the candidate has not said anything yet.
pub const OPENING_MESSAGE: &str = "Hello, I am ready.";

/// Build the interviewer's system instruction for one reply.
///
/// The reference solution and hints are framed as private context. The candidate's
/// latest code snapshot is included verbatim.
pub fn system_instruction(context: &ProblemContext, latest_code: &str) -> String {
    let solution = non_empty(context.reference_solution.as_deref()).unwrap_or("Not provided");
    let hints = non_empty(context.hints.as_deref()).unwrap_or("No specific hints available");
    let code = non_empty(Some(latest_code)).unwrap_or("# No code written yet");

    format!(
        r#"You are an expert Senior Staff Software Engineer conducting a mock technical interview.
The candidate is solving the problem: "{title}".

--- PROBLEM DESCRIPTION ---
{description}

--- HIDDEN SOLUTION (FOR YOUR EYES ONLY, NEVER READ IT OUT) ---
{solution}

--- INTERVIEWER HINTS (FOR YOUR EYES ONLY) ---
{hints}

--- CANDIDATE CODE ---
```python
{code}
```

--- YOUR INSTRUCTIONS ---
1. Be encouraging but rigorous.
2. Use the Socratic Method. DO NOT give the answer. Ask questions.
3. Keep your responses CONCISE (1-2 sentences max) because you are speaking.
4. If the candidate is silent or stuck, offer a small hint."#,
        title = context.title,
        description = context.description,
    )
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.trim().is_empty())
}

/// Turn session state into a provider call.
///
/// When the newest turn is the candidate's, it becomes the triggering message and is
/// removed from the history sent alongside it, so it never appears twice.
pub fn build_request(
    history: &[ChatMessage],
    latest_code: &str,
    context: &ProblemContext,
) -> ChatRequest {
    let mut turns = history.to_vec();
    let message = match turns.last() {
        Some(last) if last.role == Role::Candidate => {
            turns.pop().map(|turn| turn.text).unwrap_or_default()
        }
        _ => OPENING_MESSAGE.to_string(),
    };

    ChatRequest {
        system_instruction: system_instruction(context, latest_code),
        history: turns,
        message,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn two_sum() -> ProblemContext {
        ProblemContext {
            title: "Two Sum".to_string(),
            description: "Find two indices whose values add up to target.".to_string(),
            reference_solution: Some("def two_sum(nums, t): ...".to_string()),
            hints: Some("Think about a hash map.".to_string()),
            transcript: None,
        }
    }

    #[test]
    fn test_last_candidate_turn_becomes_message() {
        let history = vec![ChatMessage::candidate("I think O(n^2)")];
        let request = build_request(&history, "def f(): pass", &two_sum());

        assert_eq!(request.message, "I think O(n^2)");
        assert!(request.history.is_empty());
        assert!(request.system_instruction.contains("def f(): pass"));
    }

    #[test]
    fn test_empty_history_uses_opening() {
        let request = build_request(&[], "", &two_sum());
        assert_eq!(request.message, OPENING_MESSAGE);
        assert!(request.system_instruction.contains("# No code written yet"));
    }

    #[test]
    fn test_interviewer_last_keeps_history() {
        let history = vec![
            ChatMessage::candidate("Hi"),
            ChatMessage::interviewer("What is the brute force approach?"),
        ];
        let request = build_request(&history, "", &two_sum());
        assert_eq!(request.message, OPENING_MESSAGE);
        assert_eq!(request.history, history);
    }

    #[test]
    fn test_instruction_defaults_for_missing_context() {
        let mut context = two_sum();
        context.reference_solution = None;
        context.hints = Some("   ".to_string());

        let instruction = system_instruction(&context, "x = 1");
        assert!(instruction.contains("Two Sum"));
        assert!(instruction.contains("Not provided"));
        assert!(instruction.contains("No specific hints available"));
        assert!(instruction.contains("Socratic"));
    }
}
