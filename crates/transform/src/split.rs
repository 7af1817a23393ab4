/// Split `text` into parts of at most `max_len` characters.
///
/// Splits on line boundaries first; a line that is itself too long is split
/// on spaces. A single word longer than `max_len` is kept whole.
#[must_use]
pub fn split_long_message(text: &str, max_len: usize) -> Vec<String> {
    let max_len = max_len.max(1);
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut parts = Vec::new();
    let mut current = Chunk::default();

    for line in text.split('\n') {
        let line_len = line.chars().count();
        if line_len <= max_len {
            if !current.fits(line_len, max_len) {
                current.flush_into(&mut parts);
            }
            current.push(line, '\n');
            continue;
        }

        current.flush_into(&mut parts);
        for word in line.split(' ') {
            if !current.fits(word.chars().count(), max_len) {
                current.flush_into(&mut parts);
            }
            current.push(word, ' ');
        }
    }
    current.flush_into(&mut parts);
    parts
}

#[derive(Default)]
struct Chunk {
    text: String,
    chars: usize,
    started: bool,
}

impl Chunk {
    fn fits(&self, piece_len: usize, max_len: usize) -> bool {
        !self.started || self.chars + 1 + piece_len <= max_len
    }

    fn push(&mut self, piece: &str, sep: char) {
        if self.started {
            self.text.push(sep);
            self.chars += 1;
        }
        self.text.push_str(piece);
        self.chars += piece.chars().count();
        self.started = true;
    }

    fn flush_into(&mut self, parts: &mut Vec<String>) {
        if self.started && !self.text.is_empty() {
            parts.push(std::mem::take(&mut self.text));
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_unchanged() {
        assert_eq!(split_long_message("hello", 10), vec!["hello"]);
        assert_eq!(split_long_message("", 10), vec![""]);
    }

    #[test]
    fn splits_on_lines() {
        let parts = split_long_message("aaaa\nbbbb\ncccc", 9);
        assert_eq!(parts, vec!["aaaa\nbbbb", "cccc"]);
    }

    #[test]
    fn long_line_split_on_words() {
        let parts = split_long_message("one two three four", 9);
        assert_eq!(parts, vec!["one two", "three", "four"]);
        assert!(parts.iter().all(|p| p.chars().count() <= 9));
    }

    #[test]
    fn oversized_word_kept_whole() {
        let parts = split_long_message("tiny enormousword", 8);
        assert_eq!(parts, vec!["tiny", "enormousword"]);
    }

    #[test]
    fn counts_characters_not_bytes() {
        let text = "ффф\nююю";
        assert_eq!(split_long_message(text, 7), vec![text]);
        assert_eq!(split_long_message(text, 6), vec!["ффф", "ююю"]);
    }

    #[test]
    fn nothing_lost_at_default_limit() {
        let line = "x".repeat(100);
        let text = vec![line.as_str(); 100].join("\n");
        let parts = split_long_message(&text, 4096);
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.chars().count() <= 4096));
        assert_eq!(parts.join("\n"), text);
    }
}
