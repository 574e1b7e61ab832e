/// Natural, case-insensitive ordering for script names and versions
///
/// Keys are split into alternating text and digit runs. Digit runs compare by
/// numeric value and text runs compare case-insensitively, so `V1.2.9` sorts
/// before `V1.2.10`.
use std::cmp::Ordering;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyToken {
    Text(String),
    /// Digit run with leading zeros stripped. Compared by length, then
    /// lexically, so arbitrarily long runs never overflow.
    Number(String),
}

impl Ord for KeyToken {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyToken::Number(a), KeyToken::Number(b)) => a.len().cmp(&b.len()).then_with(|| a.cmp(b)),
            (KeyToken::Text(a), KeyToken::Text(b)) => a.cmp(b),
            // Tokens alternate starting with text, so mixed pairs only show up
            // when callers build keys by hand
            (KeyToken::Number(_), KeyToken::Text(_)) => Ordering::Less,
            (KeyToken::Text(_), KeyToken::Number(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for KeyToken {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct NaturalKey(Vec<KeyToken>);

impl NaturalKey {
    pub fn tokens(&self) -> &[KeyToken] {
        &self.0
    }
}

/// Build the natural sort key for `s`.
///
/// The key always starts with a (possibly empty) text token and alternates
/// from there, which keeps comparisons positionally type-aligned.
///
/// ```
/// use schemashift::sort::natural_key;
///
/// assert!(natural_key("V1.2.9") < natural_key("V1.2.10"));
/// assert_eq!(natural_key("R__Seed"), natural_key("r__seed"));
/// ```
pub fn natural_key(s: &str) -> NaturalKey {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut digits = String::new();

    for c in s.chars() {
        if c.is_ascii_digit() {
            if digits.is_empty() {
                tokens.push(KeyToken::Text(std::mem::take(&mut text).to_lowercase()));
            }
            digits.push(c);
        } else {
            if !digits.is_empty() {
                tokens.push(number_token(&std::mem::take(&mut digits)));
            }
            text.push(c);
        }
    }

    if !digits.is_empty() {
        tokens.push(number_token(&digits));
    }
    tokens.push(KeyToken::Text(text.to_lowercase()));

    NaturalKey(tokens)
}

fn number_token(digits: &str) -> KeyToken {
    let trimmed = digits.trim_start_matches('0');
    KeyToken::Number(if trimmed.is_empty() { "0".to_owned() } else { trimmed.to_owned() })
}

/// Compare two strings using natural, case-insensitive ordering.
pub fn compare_natural(a: &str, b: &str) -> Ordering {
    natural_key(a).cmp(&natural_key(b))
}
