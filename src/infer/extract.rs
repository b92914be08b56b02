//! Assistant-reply extraction.
//!
//! Decoded generation output still contains the rendered prompt. The reply
//! is recovered with an ordered list of (marker, rule) pairs evaluated in a
//! single pass: the first marker present in the text wins, and its rule
//! takes everything after the marker's last occurrence. Precedence is data,
//! not control flow.

/// One extraction rule: cut after the last occurrence of the marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Marker {
    pub pattern: &'static str,
    pub case_insensitive: bool,
}

/// Markers in precedence order: template closing tag, plain-text section
/// header, then the bare role token.
pub const REPLY_MARKERS: &[Marker] = &[
    Marker {
        pattern: "[/INST]",
        case_insensitive: false,
    },
    Marker {
        pattern: "### Respuesta:",
        case_insensitive: false,
    },
    Marker {
        pattern: "assistant",
        case_insensitive: true,
    },
];

/// Extract the reply from decoded model output. Without any marker the full
/// text is returned unchanged.
pub fn extract_reply(text: &str) -> String {
    for marker in REPLY_MARKERS {
        if let Some(idx) = marker.rfind(text) {
            return text[idx + marker.pattern.len()..].trim().to_string();
        }
    }
    text.to_string()
}

impl Marker {
    fn rfind(&self, text: &str) -> Option<usize> {
        if self.case_insensitive {
            rfind_ignore_ascii_case(text, self.pattern)
        } else {
            text.rfind(self.pattern)
        }
    }
}

fn rfind_ignore_ascii_case(text: &str, pattern: &str) -> Option<usize> {
    let text = text.as_bytes();
    let pattern = pattern.as_bytes();
    if pattern.is_empty() || pattern.len() > text.len() {
        return None;
    }
    (0..=text.len() - pattern.len())
        .rev()
        .find(|&i| text[i..i + pattern.len()].eq_ignore_ascii_case(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_header_rule() {
        let text = "### Instrucción:\nhola\n\n### Respuesta:\nEl fine-tuning ajusta un modelo.";
        assert_eq!(extract_reply(text), "El fine-tuning ajusta un modelo.");
    }

    #[test]
    fn closing_tag_beats_plain_header() {
        let text = "[INST] pregunta [/INST] la respuesta ### Respuesta: ignorada";
        assert_eq!(extract_reply(text), "la respuesta ### Respuesta: ignorada");
    }

    #[test]
    fn plain_header_beats_assistant_token() {
        // Both markers present, in differing case for the role token: the
        // section-header rule must win.
        let text = "chatty Assistant preamble\n### Respuesta:\nthe actual reply";
        assert_eq!(extract_reply(text), "the actual reply");
    }

    #[test]
    fn assistant_token_is_case_insensitive() {
        let text = "<|im_start|>ASSISTANT\nhere it is";
        assert_eq!(extract_reply(text), "here it is");
        let text = "user says hi assistant says hello";
        assert_eq!(extract_reply(text), "says hello");
    }

    #[test]
    fn last_occurrence_wins() {
        let text = "### Respuesta:\nfirst\n### Respuesta:\nsecond";
        assert_eq!(extract_reply(text), "second");
    }

    #[test]
    fn no_marker_returns_full_text() {
        let text = "just some decoded text";
        assert_eq!(extract_reply(text), text);
    }
}
