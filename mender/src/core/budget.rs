//! Token estimation and head+tail shrinking for budgeted text blocks.
//!
//! The estimate is deliberately rough (1 token per 4 characters) and is only a
//! fallback; when the backend can count tokens exactly the assembler prefers
//! that. Shrinking always keeps both extremities of the text with a visible
//! marker in between, so dropped content is never silent.

/// Marker inserted where shrinking removed bytes. Kept short and obvious so
/// the model sees the cut.
pub const TRUNCATION_MARKER: &str = "\n[... truncated ...]\n";

/// Approximate token count for a text: ceil(chars / 4), minimum 1.
pub fn rough_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    (chars.div_ceil(4)).max(1)
}

/// Shrink `text` to at most `max_chars` characters by keeping the head and
/// tail halves around [`TRUNCATION_MARKER`]. Returns the input unchanged when
/// it already fits. Splits on character boundaries, never mid-codepoint.
pub fn shrink_to_chars(text: &str, max_chars: usize) -> String {
    let total = text.chars().count();
    if total <= max_chars {
        return text.to_string();
    }
    let half = max_chars / 2;
    let head: String = text.chars().take(half).collect();
    let tail_start = total - (max_chars - half);
    let tail: String = text.chars().skip(tail_start).collect();
    format!("{head}{TRUNCATION_MARKER}{tail}")
}

/// A named text block that budget fitting may shrink, paired with the floor
/// below which it will not be cut further.
#[derive(Debug, Clone)]
pub struct ShrinkableBlock {
    pub name: &'static str,
    pub text: String,
    pub floor_chars: usize,
}

/// Fit the given blocks into `budget_tokens` minus `margin_tokens`.
///
/// `fixed_tokens` accounts for text that cannot shrink (system instruction,
/// goal). Blocks are halved in order (context first, feedback last) until
/// the estimate fits or every block is at its floor. Returns whether the
/// final estimate fits.
pub fn fit_to_budget(
    blocks: &mut [ShrinkableBlock],
    fixed_tokens: usize,
    budget_tokens: usize,
    margin_tokens: usize,
) -> bool {
    let limit = budget_tokens.saturating_sub(margin_tokens);

    loop {
        let estimate: usize = fixed_tokens
            + blocks
                .iter()
                .map(|b| rough_tokens(&b.text))
                .sum::<usize>();
        if estimate <= limit {
            return true;
        }

        let mut shrunk_any = false;
        for block in blocks.iter_mut() {
            let chars = block.text.chars().count();
            if chars <= block.floor_chars {
                continue;
            }
            let target = (chars / 2).max(block.floor_chars);
            block.text = shrink_to_chars(&block.text, target);
            shrunk_any = true;
            break;
        }
        if !shrunk_any {
            return false;
        }
    }
}
