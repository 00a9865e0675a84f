//! Regex-based grammar acceptance and rejection.

use pie_grammar::Grammar;

use crate::common::accepts;

fn regex_accepts(pattern: &str, input: &str) -> bool {
    accepts(&Grammar::from_regex(pattern).unwrap(), input)
}

#[test]
fn test_bounded_repetition() {
    for input in ["aa", "aaa", "aaaa"] {
        assert!(regex_accepts("a{2,4}", input), "{}", input);
    }
    for input in ["", "a", "aaaaa"] {
        assert!(!regex_accepts("a{2,4}", input), "{}", input);
    }
}

#[test]
fn test_alternation_and_groups() {
    assert!(regex_accepts("(cat|dog)s?", "cats"));
    assert!(regex_accepts("(cat|dog)s?", "dog"));
    assert!(!regex_accepts("(cat|dog)s?", "cow"));
    assert!(regex_accepts("(?:ab)+c", "ababc"));
    assert!(!regex_accepts("(?:ab)+c", "abac"));
}

#[test]
fn test_classes_and_escapes() {
    assert!(regex_accepts("\\d{3}-\\d{4}", "555-1234"));
    assert!(!regex_accepts("\\d{3}-\\d{4}", "55-1234"));
    assert!(regex_accepts("[^\\s]+", "no_spaces"));
    assert!(!regex_accepts("[^\\s]+", "has space"));
    assert!(regex_accepts("\\w+\\.txt", "notes_1.txt"));
    assert!(!regex_accepts("\\w+\\.txt", "notes_1xtxt"));
}

#[test]
fn test_dot_excludes_newline() {
    assert!(regex_accepts("a.c", "abc"));
    assert!(regex_accepts("a.c", "aéc"));
    assert!(!regex_accepts("a.c", "a\nc"));
}

#[test]
fn test_email_like_pattern() {
    let pattern = "^[a-z0-9._]+@[a-z]+\\.(com|org)$";
    assert!(regex_accepts(pattern, "jane.doe@example.com"));
    assert!(!regex_accepts(pattern, "jane@example.net"));
    assert!(!regex_accepts(pattern, "@example.com"));
}
