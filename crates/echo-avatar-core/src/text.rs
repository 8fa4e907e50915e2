pub fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    let len = s.len();
    if index >= len {
        return len;
    }

    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }

    index
}

/// Cut `text` to at most `max_len` bytes on a char boundary, appending `...` when shortened.
pub fn snippet(text: &str, max_len: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max_len {
        return trimmed.to_string();
    }
    let boundary = floor_char_boundary(trimmed, max_len);
    format!("{}...", &trimmed[..boundary])
}

/// Split a command tail into its first word and the untouched remainder.
pub fn split_first_word(text: &str) -> (&str, &str) {
    let text = text.trim_start();
    match text.find(char::is_whitespace) {
        Some(idx) => (&text[..idx], text[idx..].trim()),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_char_boundary_multibyte() {
        let s = "你好";
        assert_eq!(floor_char_boundary(s, 1), 0);
        assert_eq!(floor_char_boundary(s, 3), 3);
        assert_eq!(floor_char_boundary(s, 99), s.len());
    }

    #[test]
    fn test_snippet() {
        assert_eq!(snippet("  short  ", 10), "short");
        assert_eq!(snippet("abcdefgh", 4), "abcd...");
        assert_eq!(snippet("你好世界", 4), "你...");
    }

    #[test]
    fn test_split_first_word() {
        assert_eq!(split_first_word("123 hello  world"), ("123", "hello  world"));
        assert_eq!(split_first_word("  123"), ("123", ""));
        assert_eq!(split_first_word(""), ("", ""));
    }
}
