//! Heuristic token estimation
//!
//! CJK ideographs and kana are roughly one token each; everything else
//! averages about four characters per token. JSON is denser, about 2.2
//! characters per token.

pub fn estimate_text_tokens(text: &str) -> u32 {
    if text.is_empty() {
        return 0;
    }

    let mut cjk = 0u32;
    let mut other = 0u32;
    for c in text.chars() {
        if is_cjk(c) {
            cjk += 1;
        } else {
            other += 1;
        }
    }
    cjk + (other / 4).max(1)
}

pub fn estimate_json_tokens(json: &str) -> u32 {
    if json.is_empty() {
        return 0;
    }
    ((json.chars().count() as f64 / 2.2).round() as u32).max(1)
}

/// Token cost of a summary payload, clamped to `[min, max]`.
pub fn clamp_record_tokens(json: &str, min: u32, max: u32) -> u32 {
    estimate_json_tokens(json).clamp(min, max.max(min))
}

fn is_cjk(c: char) -> bool {
    matches!(c,
        '\u{4E00}'..='\u{9FFF}' |   // CJK Unified Ideographs
        '\u{3400}'..='\u{4DBF}' |   // CJK Extension A
        '\u{F900}'..='\u{FAFF}' |   // CJK Compatibility Ideographs
        '\u{3040}'..='\u{309F}' |   // Hiragana
        '\u{30A0}'..='\u{30FF}' |   // Katakana
        '\u{31F0}'..='\u{31FF}'     // Katakana Phonetic Extensions
    )
}
