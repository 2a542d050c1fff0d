use crate::agent_engine::state::Turn;
use crate::llm::types::ChatMessage;
use crate::protocol::ActionKind;

pub const GUIDANCE_PREFIX: &str = "[Supervisor Guidance]\n";
const SCREEN_PROMPT: &str = "Current screen. Decide next action.";

/// Builds the message list sent to the model for one turn.
pub struct PromptBuilder {
    system: String,
    tail_rounds: usize,
}

impl PromptBuilder {
    pub fn new(language: &str, tail_rounds: usize) -> Self {
        Self {
            system: system_prompt(language),
            tail_rounds,
        }
    }

    pub fn system(&self) -> &str {
        &self.system
    }

    /// `system`, the instruction, the last `tail_rounds` turns (model output followed by
    /// execution feedback), this turn's guidance and finally the screen.
    pub fn build(
        &self,
        instruction: &str,
        history: &[Turn],
        injected: &[String],
        image_url: String,
    ) -> Vec<ChatMessage> {
        let tail = &history[history.len().saturating_sub(self.tail_rounds)..];
        let mut messages = Vec::with_capacity(3 + tail.len() * 2 + injected.len());
        messages.push(ChatMessage::system(self.system.clone()));
        messages.push(ChatMessage::user(instruction));
        for turn in tail {
            messages.push(ChatMessage::assistant(turn.raw_output.clone()));
            messages.push(ChatMessage::user(feedback(turn)));
        }
        for text in injected {
            messages.push(ChatMessage::user(format!("{GUIDANCE_PREFIX}{text}")));
        }
        messages.push(ChatMessage::user_image(Some(SCREEN_PROMPT.into()), image_url));
        messages
    }
}

/// Appends a rejected reply and the correction notice so the model can try again.
pub fn push_correction(messages: &mut Vec<ChatMessage>, raw_output: &str, notice: &str) {
    messages.push(ChatMessage::assistant(raw_output));
    messages.push(ChatMessage::user(notice));
}

fn feedback(turn: &Turn) -> String {
    let status = if turn.execution.success { "succeeded" } else { "failed" };
    format!(
        "Step {} `{}` {status}: {}",
        turn.index, turn.action, turn.execution.detail
    )
}

fn system_prompt(language: &str) -> String {
    let actions: Vec<String> = ActionKind::ALL.iter().map(|k| k.signature()).collect();
    format!(
        "You are a GUI agent operating a mobile phone through its mirrored screen. \
You are given a task and your action history, with screenshots. \
You need to perform the next action to complete the task.\n\
\n\
## Output Format\n\
```\n\
Thought: ...\n\
Action: ...\n\
```\n\
\n\
## Action Space\n\
{}\n\
\n\
## Note\n\
- Coordinates are fractions of the screen (0.0-1.0) or thousandths (0-1000).\n\
- Use exactly one action per reply.\n\
- Call finished() when the task is done and failed() when it cannot be done.\n\
- Call call_user() when a human must act, e.g. to enter a passcode or solve a captcha.\n\
- Use {language} in the `Thought` part.\n\
- Write a small plan and finally summarize your next action (with its target element) in one sentence in the `Thought` part.\n",
        actions.join("\n")
    )
}
