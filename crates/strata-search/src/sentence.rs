//! Domain-neutral sentence splitting.
//!
//! Splits on terminal punctuation followed by whitespace, holding back
//! splits after common abbreviations so "Dr. Smith" and "e.g. this" stay
//! inside one sentence. Handles CJK full-width terminators, which are not
//! followed by whitespace.

/// Abbreviations that end with a period but do not end a sentence.
/// Compared case-insensitively against the token preceding the period.
const ABBREVIATIONS: &[&str] = &[
    "mr", "mrs", "ms", "dr", "prof", "sr", "jr", "st", "no", "vs", "etc", "inc", "ltd", "co",
    "corp", "dept", "fig", "al", "approx", "e.g", "i.e", "u.s", "u.k",
];

/// Split text into sentences. Whitespace-only fragments are dropped;
/// surviving sentences are trimmed.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.trim().chars().peekable();

    while let Some(ch) = chars.next() {
        current.push(ch);
        let boundary = match ch {
            // CJK terminators end a sentence with or without whitespace.
            '。' | '！' | '？' => true,
            '.' | '!' | '?' => {
                let next_is_break = match chars.peek() {
                    None => true,
                    Some(c) => c.is_whitespace(),
                };
                next_is_break && !(ch == '.' && ends_with_abbreviation(&current))
            }
            _ => false,
        };
        if boundary {
            push_trimmed(&mut sentences, &mut current);
        }
    }
    push_trimmed(&mut sentences, &mut current);
    sentences
}

fn push_trimmed(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

/// Whether the accumulated text ends in "<abbreviation>." .
fn ends_with_abbreviation(text: &str) -> bool {
    let without_dot = match text.strip_suffix('.') {
        Some(t) => t,
        None => return false,
    };
    let last_token = without_dot
        .rsplit(|c: char| c.is_whitespace())
        .next()
        .unwrap_or("");
    if last_token.is_empty() {
        return false;
    }
    let lowered = last_token.to_lowercase();
    ABBREVIATIONS.contains(&lowered.as_str())
        // Single letters read as initials ("J. Smith").
        || lowered.chars().count() == 1 && lowered.chars().all(|c| c.is_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_and_whitespace() {
        assert!(split_sentences("").is_empty());
        assert!(split_sentences("   \n\t ").is_empty());
    }

    #[test]
    fn test_single_sentence_without_terminator() {
        assert_eq!(split_sentences("no terminator here"), vec!["no terminator here"]);
    }

    #[test]
    fn test_basic_split() {
        let sentences = split_sentences("First sentence. Second sentence! Third sentence?");
        assert_eq!(
            sentences,
            vec!["First sentence.", "Second sentence!", "Third sentence?"]
        );
    }

    #[test]
    fn test_abbreviations_do_not_split() {
        let sentences = split_sentences("Dr. Smith approved the policy. It takes effect Monday.");
        assert_eq!(sentences.len(), 2);
        assert_eq!(sentences[0], "Dr. Smith approved the policy.");
    }

    #[test]
    fn test_latin_abbreviations_do_not_split() {
        let sentences =
            split_sentences("Records include contracts, invoices, etc. and are retained 7 years.");
        assert_eq!(sentences.len(), 1);
        let sentences = split_sentences("Use a shredder, e.g. the one in the mailroom. Then log it.");
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn test_initials_do_not_split() {
        let sentences = split_sentences("Signed by J. Smith on Friday. Filed the same day.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("J. Smith"));
    }

    #[test]
    fn test_decimal_numbers_do_not_split() {
        let sentences = split_sentences("The fee is 3.5 percent of the total. Payment is monthly.");
        assert_eq!(sentences.len(), 2);
        assert!(sentences[0].contains("3.5 percent"));
    }

    #[test]
    fn test_cjk_terminators_split_without_whitespace() {
        let sentences = split_sentences("これは文です。これも文です。");
        assert_eq!(sentences.len(), 2);
    }

    #[test]
    fn test_trailing_text_without_terminator_kept() {
        let sentences = split_sentences("Complete sentence. Trailing fragment");
        assert_eq!(sentences, vec!["Complete sentence.", "Trailing fragment"]);
    }

    #[test]
    fn test_multiple_spaces_between_sentences() {
        let sentences = split_sentences("One.   Two.\n\nThree.");
        assert_eq!(sentences, vec!["One.", "Two.", "Three."]);
    }
}
