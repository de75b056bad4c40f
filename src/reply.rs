//! Outbound reply formatting: transport-sized chunking and the tool footer.
//!
//! Limits are measured in characters, not bytes, so multi-byte text never
//! splits inside a code point.

/// Footer lines start with this marker (Discord renders it as small text).
pub const FOOTER_MARKER: &str = "-# ";

/// Default chunk limit, just under Discord's 2000-character message cap.
pub const DEFAULT_CHUNK_LIMIT: usize = 1900;

/// Split `text` into chunks of at most `limit` characters. A trailing line
/// starting with the footer marker is kept intact and terminates the final
/// chunk; the body in front of it is split at a reduced limit so the footer
/// always fits.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if text.is_empty() {
        return vec![String::new()];
    }
    if limit == 0 {
        return vec![text.to_string()];
    }

    let lines: Vec<&str> = text.lines().collect();
    let footer = lines
        .last()
        .filter(|line| line.starts_with(FOOTER_MARKER))
        .copied();

    let Some(footer) = footer else {
        return char_chunks(text, limit);
    };

    let body = lines[..lines.len() - 1].join("\n");
    let body = body.trim_end_matches('\n');
    let footer_len = footer.chars().count();

    if body.chars().count() + footer_len + 1 <= limit {
        return vec![format!("{body}\n{footer}").trim_end().to_string()];
    }

    let body_limit = limit.saturating_sub(footer_len + 1).max(1);
    let body_chunks = char_chunks(body, body_limit);
    let mut result = Vec::with_capacity(body_chunks.len());
    let last_index = body_chunks.len().saturating_sub(1);
    for (index, chunk) in body_chunks.into_iter().enumerate() {
        if index == last_index {
            result.push(format!("{chunk}\n{footer}").trim_end().to_string());
        } else {
            result.push(chunk);
        }
    }
    result
        .into_iter()
        .map(|chunk| chunk.trim_end().to_string())
        .filter(|chunk| !chunk.trim().is_empty())
        .collect()
}

fn char_chunks(text: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(limit)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

/// Machine-readable footer summarizing the turn: deduped tool invocations,
/// optional step count, optional citation count.
pub fn tool_footer(
    tool_calls: &[String],
    steps: Option<usize>,
    citations: Option<usize>,
) -> String {
    let mut seen = Vec::new();
    for call in tool_calls {
        if !seen.contains(call) {
            seen.push(call.clone());
        }
    }
    let tools_text = if seen.is_empty() { "none".to_string() } else { seen.join(", ") };
    let mut parts = vec![format!("tools: {tools_text}")];
    if let Some(steps) = steps {
        parts.push(format!("steps: {steps}"));
    }
    if let Some(citations) = citations
        && citations > 0
    {
        parts.push(format!("citations: {citations}"));
    }
    format!("{FOOTER_MARKER}{}", parts.join(" / "))
}
