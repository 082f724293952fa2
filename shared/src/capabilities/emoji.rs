use std::collections::HashMap;

/// Shortcode <-> glyph substitution. The shell may plug in a full emoji
/// database; [`ShortcodeTable`] covers the common cases.
pub trait EmojiTransform: Send + Sync {
    /// `:fire:` -> glyph. Unknown shortcodes are left untouched.
    fn emojify(&self, text: &str) -> String;
    /// glyph -> `:fire:`.
    fn unemojify(&self, text: &str) -> String;
}

const BUILTIN_SHORTCODES: &[(&str, &str)] = &[
    ("grinning", "😀"),
    ("grin", "😁"),
    ("joy", "😂"),
    ("smile", "😄"),
    ("wink", "😉"),
    ("heart_eyes", "😍"),
    ("sunglasses", "😎"),
    ("thinking", "🤔"),
    ("cry", "😢"),
    ("angry", "😠"),
    ("rage", "😡"),
    ("heart", "\u{2764}\u{fe0f}"),
    ("thumbsup", "👍"),
    ("thumbsdown", "👎"),
    ("ok_hand", "👌"),
    ("clap", "👏"),
    ("wave", "👋"),
    ("middle_finger", "🖕"),
    ("poop", "💩"),
    ("fire", "🔥"),
    ("tada", "🎉"),
    ("rocket", "🚀"),
    ("trophy", "🏆"),
    ("dog", "🐶"),
    ("soccer", "⚽"),
];

pub struct ShortcodeTable {
    by_name: HashMap<String, String>,
    // Longest glyph first so multi-codepoint glyphs win over their prefixes.
    by_glyph: Vec<(String, String)>,
}

impl Default for ShortcodeTable {
    fn default() -> Self {
        Self::new(BUILTIN_SHORTCODES.iter().copied())
    }
}

impl ShortcodeTable {
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut by_name = HashMap::new();
        let mut by_glyph = Vec::new();
        for (name, glyph) in entries {
            by_name.insert(name.to_string(), glyph.to_string());
            by_glyph.push((glyph.to_string(), name.to_string()));
        }
        by_glyph.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        Self { by_name, by_glyph }
    }
}

fn is_shortcode_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-'))
}

impl EmojiTransform for ShortcodeTable {
    fn emojify(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;

        while let Some(start) = rest.find(':') {
            out.push_str(&rest[..start]);
            let after = &rest[start + 1..];
            let glyph = after
                .find(':')
                .map(|end| &after[..end])
                .filter(|name| is_shortcode_name(name))
                .and_then(|name| self.by_name.get(name).map(|glyph| (name.len(), glyph)));

            match glyph {
                Some((name_len, glyph)) => {
                    out.push_str(glyph);
                    rest = &after[name_len + 1..];
                }
                None => {
                    out.push(':');
                    rest = after;
                }
            }
        }

        out.push_str(rest);
        out
    }

    fn unemojify(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (glyph, name) in &self.by_glyph {
            if out.contains(glyph.as_str()) {
                out = out.replace(glyph.as_str(), &format!(":{name}:"));
            }
        }
        out
    }
}

// Code point ranges accepted as emoji: emoticons, pictographs, transport,
// regional indicators, supplemental symbols, misc symbols, dingbats, assorted
// arrows and geometric shapes, VS16, ZWJ, skin tones and tag characters.
const EMOJI_RANGES: &[(u32, u32)] = &[
    (0x1F600, 0x1F64F),
    (0x1F300, 0x1FA82),
    (0x1F680, 0x1F6FF),
    (0x1F1E0, 0x1F1FF),
    (0x1F900, 0x1F9FF),
    (0x2600, 0x26FF),
    (0x2700, 0x27BF),
    (0x1F018, 0x1F270),
    (0x238C, 0x238C),
    (0x2194, 0x2199),
    (0x21A9, 0x21AA),
    (0x231A, 0x231B),
    (0x2328, 0x2328),
    (0x23CF, 0x23CF),
    (0x23E9, 0x23F3),
    (0x23F8, 0x23FA),
    (0x24C2, 0x24C2),
    (0x25AA, 0x25AB),
    (0x25B6, 0x25B6),
    (0x25C0, 0x25C0),
    (0x25FB, 0x25FE),
    (0x2B05, 0x2B07),
    (0x2B1B, 0x2B1C),
    (0x2B50, 0x2B50),
    (0x2B55, 0x2B55),
    (0x3030, 0x3030),
    (0x303D, 0x303D),
    (0x3297, 0x3297),
    (0x3299, 0x3299),
    (0xFE0F, 0xFE0F),
    (0x200D, 0x200D),
    (0x1F3FB, 0x1F3FF),
    (0xE0020, 0xE007F),
];

fn is_emoji_char(c: char) -> bool {
    let cp = u32::from(c);
    EMOJI_RANGES.iter().any(|&(lo, hi)| (lo..=hi).contains(&cp))
}

/// True when the trimmed text is non-empty and made only of emoji.
#[must_use]
pub fn is_emoji(text: &str) -> bool {
    let trimmed = text.trim();
    !trimmed.is_empty() && trimmed.chars().all(is_emoji_char)
}
