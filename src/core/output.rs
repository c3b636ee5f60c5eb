use crate::constants::TRIMMED_BANNER;

const RULE_WIDTH: usize = 80;

/// Delimited banner separating harness text from program output.
pub fn output_header(title: &str) -> String {
    let rule = "#".repeat(RULE_WIDTH);
    format!("\n{rule}\n{title}\n{rule}\n")
}

/// Appends `extra` to `output`, inserting a newline when one is missing.
pub fn append_output(output: &mut String, extra: &str) {
    if extra.is_empty() {
        return;
    }
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(extra);
}

/// Keeps the first and last `max_size / 2` bytes of an oversized output.
/// A `max_size` of zero disables trimming.
pub fn trim_output(output: String, max_size: usize) -> String {
    if max_size == 0 || output.len() <= max_size {
        return output;
    }

    let half = max_size / 2;
    let mut head_end = half;
    while !output.is_char_boundary(head_end) {
        head_end -= 1;
    }
    let mut tail_start = output.len() - half;
    while !output.is_char_boundary(tail_start) {
        tail_start += 1;
    }

    let mut trimmed = String::with_capacity(max_size + RULE_WIDTH * 3);
    trimmed.push_str(&output[..head_end]);
    trimmed.push_str(&output_header(TRIMMED_BANNER));
    trimmed.push_str(&output[tail_start..]);
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_output_untouched() {
        assert_eq!(trim_output("hello".to_string(), 100), "hello");
        assert_eq!(trim_output("hello".to_string(), 0), "hello");
    }

    #[test]
    fn test_long_output_keeps_head_and_tail() {
        let output = format!("{}{}{}", "a".repeat(50), "b".repeat(100), "c".repeat(50));
        let trimmed = trim_output(output, 100);
        assert!(trimmed.starts_with(&"a".repeat(50)));
        assert!(trimmed.ends_with(&"c".repeat(50)));
        assert!(trimmed.contains(TRIMMED_BANNER));
        assert!(!trimmed.contains('b'));
    }

    #[test]
    fn test_trim_respects_char_boundaries() {
        let output = "é".repeat(100);
        let trimmed = trim_output(output, 51);
        assert!(trimmed.contains(TRIMMED_BANNER));
    }

    #[test]
    fn test_append_adds_missing_newline() {
        let mut output = "partial".to_string();
        append_output(&mut output, "banner\n");
        assert_eq!(output, "partial\nbanner\n");

        let mut empty = String::new();
        append_output(&mut empty, "x");
        assert_eq!(empty, "x");
    }
}
