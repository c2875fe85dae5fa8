//! Prompt text used by history compaction.

/// User turn that asks the model to produce the snapshot.
pub const SNAPSHOT_REQUEST: &str =
    "First, reason in your scratchpad. Then, generate the <state_snapshot>.";

/// Model turn inserted after the snapshot so the history keeps alternating.
pub const SNAPSHOT_ACKNOWLEDGEMENT: &str = "Got it. Thanks for the additional context!";

/// System instruction for the summarization call.
#[must_use]
pub fn compression_prompt() -> &'static str {
    COMPRESSION_PROMPT
}

const COMPRESSION_PROMPT: &str = r"You are the component that condenses a long working session into a compact state record.

The conversation so far is about to be dropped from the active context. Your output will be the only memory that survives, so it must contain everything needed to continue the work without asking the user to repeat themselves.

Start by thinking privately inside a <scratchpad> block: walk through the conversation, note the user's goal, what has been done, what failed, and what is still open. Then write the final record as a single <state_snapshot> XML block with these sections:

<state_snapshot>
    <overall_goal>
        One sentence stating the user's top-level objective.
    </overall_goal>

    <key_knowledge>
        Facts, constraints and conventions that must be remembered: build commands, configuration values, API details, user preferences. Use bullet points.
    </key_knowledge>

    <file_system_state>
        Files that were created, read, modified or deleted, with a short note on each relevant change.
    </file_system_state>

    <recent_actions>
        The last significant actions taken and their outcomes.
    </recent_actions>

    <current_plan>
        The remaining steps, each marked [DONE], [IN PROGRESS] or [TODO].
    </current_plan>
</state_snapshot>

Be dense and factual. Omit pleasantries and anything that does not help resume the task.";
