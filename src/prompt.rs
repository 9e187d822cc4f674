use crate::chat::ChatMessage;
use crate::database::ScoredChunk;

/// Sentence the model must reply with when the context has no answer
pub const NOT_IN_CONTEXT: &str =
    "The Bhagavad Gita does not explicitly address this in the provided text.";

const SYSTEM_PROMPT: &str = r#"You are GeetaGPT, a spiritual AI assistant grounded strictly in the Bhagavad Gita.
Your mission is to answer questions using ONLY the following context from the Bhagavad Gita.

Context:
{context}

STRICT RULES:
1. Answer strictly based on the provided context.
2. If the answer is not in the context, YOU MUST SAY EXACTLY: "{not_in_context}"
3. Do not use outside knowledge or make assumptions.
4. Do not hallucinate verses or meanings.
5. Maintain a calm, respectful, and spiritual tone.
6. Start your answer by citing the Chapter and Verse numbers if available in the context (e.g., "In Chapter 2, Verse 47...").
7. Ensure your answer is concise and directly addresses the user's question.

Question: {input}
"#;

/// Join retrieved chunks into the text placed in `{context}`
pub fn format_context(chunks: &[ScoredChunk]) -> String {
    chunks
        .iter()
        .map(|scored| scored.chunk.text.as_str())
        .collect::<Vec<&str>>()
        .join("\n\n")
}

/// Fill both placeholders of the template.
///
/// Substitution is single-pass, so braces inside the context or the question
/// are never treated as placeholders.
pub fn render(context: &str, input: &str) -> String {
    let template = SYSTEM_PROMPT.replace("{not_in_context}", NOT_IN_CONTEXT);
    let mut rendered = String::with_capacity(template.len() + context.len() + input.len());
    let mut rest = template.as_str();

    while let Some(start) = rest.find('{') {
        rendered.push_str(&rest[..start]);
        let tail = &rest[start..];
        if let Some(after) = tail.strip_prefix("{context}") {
            rendered.push_str(context);
            rest = after;
        } else if let Some(after) = tail.strip_prefix("{input}") {
            rendered.push_str(input);
            rest = after;
        } else {
            rendered.push('{');
            rest = &tail[1..];
        }
    }
    rendered.push_str(rest);
    rendered
}

/// The chat request for a question: the rendered template as one user turn
pub fn messages(chunks: &[ScoredChunk], question: &str) -> Vec<ChatMessage> {
    vec![ChatMessage::user(render(&format_context(chunks), question))]
}
