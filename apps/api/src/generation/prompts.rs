use crate::generation::tone::Tone;

/// Upper bound on tokens requested from either provider.
pub const MAX_TOKENS: u32 = 1000;

/// Sampling temperature shared by both providers.
pub const TEMPERATURE: f32 = 0.7;

pub const GENERATION_SYSTEM: &str =
    "You are a skilled sales professional writing a personalized message to a prospect.";

const GUIDELINES: &str = "\
Guidelines:
- Keep the message concise (2-3 paragraphs)
- Focus on the prospect's specific needs and challenges
- Include a clear value proposition
- End with a soft call to action";

/// Builds the user prompt for a prospect summary in the given tone.
pub fn build_message_prompt(summary: &str, tone: Tone) -> String {
    format!(
        "Prospect Summary:\n{summary}\n\nTone Instructions: {instruction}\n\n{GUIDELINES}\n\nWrite the sales message:",
        summary = summary.trim(),
        instruction = tone.instruction(),
    )
}
