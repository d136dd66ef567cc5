//! Outgoing-text shaping for Telegram.
//!
//! Three concerns: stripping `<think>…</think>` blocks end-to-end,
//! converting the minimal Markdown subset (bold, italic, inline code,
//! fenced code) to Telegram MarkdownV2, and splitting long output at the
//! 4096-character message limit.

/// Maximum characters per Telegram message (limit is 4096; 4090 for safety).
pub const CHUNK_MAX: usize = 4090;

/// Characters MarkdownV2 requires escaping outside code spans.
const MDV2_SPECIALS: &[char] = &[
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Remove every `<think>…</think>` block, including an unterminated trailing
/// one. Idempotent: the output contains no think markers, so a second pass
/// is a no-op.
pub fn strip_think(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    loop {
        match rest.find("<think>") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + "<think>".len()..];
                match after.find("</think>") {
                    Some(end) => rest = &after[end + "</think>".len()..],
                    // Unterminated block runs to the end of the text.
                    None => break,
                }
            }
        }
    }
    out
}

/// Convert the minimal Markdown subset to MarkdownV2.
///
/// `**bold**` → `*bold*`, `*italic*`/`_italic_` → `_italic_`, `` `code` ``
/// and fenced blocks pass through. Everything else is escaped per the
/// MarkdownV2 rules. The visible text (markers aside) is unchanged.
pub fn render_markdown_v2(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);

    // Fenced blocks alternate with prose on ``` boundaries.
    for (i, segment) in text.split("```").enumerate() {
        if i > 0 {
            out.push_str("```");
        }
        if i % 2 == 1 {
            // Inside a fence: only backslash and backtick need escaping.
            out.push_str(&escape_code(segment));
        } else {
            out.push_str(&render_inline(segment));
        }
    }
    out
}

fn render_inline(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut in_code = false;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '`' => {
                in_code = !in_code;
                out.push('`');
                i += 1;
            }
            _ if in_code => {
                if c == '\\' {
                    out.push('\\');
                }
                out.push(c);
                i += 1;
            }
            '*' if i + 1 < chars.len() && chars[i + 1] == '*' => {
                // Bold marker: ** becomes a single MarkdownV2 asterisk.
                out.push('*');
                i += 2;
            }
            '*' | '_' => {
                // Italic marker, either spelling, becomes an underscore.
                out.push('_');
                i += 1;
            }
            _ if MDV2_SPECIALS.contains(&c) => {
                out.push('\\');
                out.push(c);
                i += 1;
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn escape_code(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if c == '\\' || c == '`' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// Split `text` into ≤[`CHUNK_MAX`] chunks at newline boundaries, keeping
/// fenced code blocks balanced: a fence open at a chunk boundary is closed
/// and re-opened (with its language) in the next chunk.
pub fn split_chunks(text: &str) -> Vec<String> {
    if text.len() <= CHUNK_MAX {
        return vec![text.to_string()];
    }

    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut fence_lang: Option<String> = None;

    for line in text.split('\n') {
        let cost = if current.is_empty() {
            line.len()
        } else {
            1 + line.len()
        };

        if !current.is_empty() && current.len() + cost > CHUNK_MAX {
            if fence_lang.is_some() {
                current.push_str("\n```");
            }
            chunks.push(current);
            current = String::new();
            if let Some(ref lang) = fence_lang {
                current.push_str("```");
                current.push_str(lang);
                current.push('\n');
            }
        }

        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);

        let trimmed = line.trim_start();
        if let Some(after) = trimmed.strip_prefix("```") {
            fence_lang = match fence_lang {
                Some(_) => None,
                None => Some(after.trim().to_string()),
            };
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }

    // Force-split any single line longer than the cap.
    let mut result = Vec::new();
    for chunk in chunks {
        if chunk.len() <= CHUNK_MAX {
            result.push(chunk);
            continue;
        }
        let mut remaining = chunk.as_str();
        while remaining.len() > CHUNK_MAX {
            let split_at = remaining[..CHUNK_MAX]
                .rfind('\n')
                .or_else(|| remaining[..CHUNK_MAX].rfind(' '))
                .unwrap_or(CHUNK_MAX);
            result.push(remaining[..split_at].to_string());
            remaining = remaining[split_at..].trim_start();
        }
        if !remaining.is_empty() {
            result.push(remaining.to_string());
        }
    }
    result
}

/// Clamp a live-edited buffer to one message. The final reply re-sends the
/// full text in proper segments.
pub fn clamp_live(text: &str) -> &str {
    if text.len() <= CHUNK_MAX {
        return text;
    }
    let mut end = CHUNK_MAX;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    // --- think stripping ---

    #[test]
    fn strips_single_think_block() {
        assert_eq!(strip_think("a <think>secret</think>b"), "a b");
    }

    #[test]
    fn strips_multiple_blocks() {
        assert_eq!(
            strip_think("<think>x</think>one<think>y</think>two"),
            "onetwo"
        );
    }

    #[test]
    fn strips_unterminated_trailing_block() {
        assert_eq!(strip_think("visible<think>never closed"), "visible");
    }

    #[test]
    fn strip_think_is_idempotent() {
        let once = strip_think("a<think>x</think>b");
        assert_eq!(strip_think(&once), once);
    }

    #[test]
    fn no_think_block_is_untouched() {
        assert_eq!(strip_think("plain text"), "plain text");
    }

    // --- markdown conversion ---

    #[test]
    fn bold_marker_converts() {
        assert_eq!(render_markdown_v2("**hi** there"), "*hi* there");
    }

    #[test]
    fn italic_markers_convert() {
        assert_eq!(render_markdown_v2("*hi*"), "_hi_");
        assert_eq!(render_markdown_v2("_hi_"), "_hi_");
    }

    #[test]
    fn specials_outside_code_are_escaped() {
        assert_eq!(render_markdown_v2("a.b!"), "a\\.b\\!");
    }

    #[test]
    fn inline_code_passes_through() {
        assert_eq!(render_markdown_v2("run `a.b` now."), "run `a.b` now\\.");
    }

    #[test]
    fn fenced_code_keeps_content_verbatim() {
        let out = render_markdown_v2("```rust\nlet x = a.b;\n```");
        assert!(out.starts_with("```rust"));
        assert!(out.contains("let x = a.b;"));
    }

    #[test]
    fn visible_text_survives_conversion() {
        // Strip markers from input and escapes from output — same text.
        let input = "**bold** and *italic* and `code` end.";
        let rendered = render_markdown_v2(input);
        let visible_in: String = input.chars().filter(|c| !"*_`".contains(*c)).collect();
        let visible_out: String = rendered
            .chars()
            .filter(|c| !"*_`\\".contains(*c))
            .collect();
        assert_eq!(visible_in, visible_out);
    }

    // --- chunking ---

    #[test]
    fn short_text_is_single_chunk() {
        assert_eq!(split_chunks("hello"), vec!["hello"]);
    }

    #[test]
    fn long_text_splits_on_newlines_under_cap() {
        let line = "x".repeat(2000);
        let text = format!("{line}\n{line}\n{line}");
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn fence_is_closed_and_reopened_across_chunks() {
        let mut text = String::from("```python\n");
        for _ in 0..200 {
            text.push_str("print('a reasonably long line of python code here')\n");
        }
        text.push_str("```\n");
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks[1].starts_with("```python"));
    }

    #[test]
    fn single_oversize_line_is_force_split() {
        let text = "y".repeat(9000);
        let chunks = split_chunks(&text);
        assert!(chunks.len() >= 2);
        for c in &chunks {
            assert!(c.len() <= CHUNK_MAX);
        }
    }

    #[test]
    fn clamp_live_respects_char_boundaries() {
        let text = "é".repeat(CHUNK_MAX); // 2 bytes each
        let clamped = clamp_live(&text);
        assert!(clamped.len() <= CHUNK_MAX);
        assert!(text.starts_with(clamped));
    }
}
