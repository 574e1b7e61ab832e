use std::borrow::Cow;

use serde_json::Value as JsonValue;

use crate::template::Variables;

const MASK: &str = "*****";

/// Secret values that must never reach a log line.
///
/// Built from the template variables: any string whose key contains
/// `secret` (any case), and every string nested under a `secrets` key.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|s| !s.is_empty())
            .collect();
        // longest first so a secret containing another is masked whole
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Redactor { secrets }
    }

    pub fn from_variables(vars: &Variables) -> Self {
        let mut found = Vec::new();
        for (key, value) in vars {
            collect_secrets(key, value, false, &mut found);
        }
        Redactor::new(found)
    }

    pub fn len(&self) -> usize {
        self.secrets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn redact<'a>(&self, text: &'a str) -> Cow<'a, str> {
        if !self.secrets.iter().any(|s| text.contains(s.as_str())) {
            return Cow::Borrowed(text);
        }
        let mut out = text.to_owned();
        for secret in &self.secrets {
            out = out.replace(secret.as_str(), MASK);
        }
        Cow::Owned(out)
    }
}

fn collect_secrets(key: &str, value: &JsonValue, under_secrets: bool, found: &mut Vec<String>) {
    let key = key.to_ascii_lowercase();
    let is_secret = under_secrets || key.contains("secret");
    match value {
        JsonValue::String(s) if is_secret => found.push(s.clone()),
        JsonValue::Object(map) => {
            let nested = under_secrets || key == "secrets";
            for (k, v) in map {
                collect_secrets(k, v, nested, found);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: JsonValue) -> Variables {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_collects_named_and_nested_secrets() {
        let redactor = Redactor::from_variables(&vars(json!({
            "db_secret": "hunter2",
            "region": "us-east-1",
            "secrets": { "api": "tok-123", "deep": { "key": "k-9" } },
            "nested": { "Client_SECRET": "shh", "plain": "visible" }
        })));

        assert_eq!(redactor.len(), 4);
        let text = "GRANT hunter2 tok-123 k-9 shh us-east-1 visible";
        assert_eq!(redactor.redact(text), "GRANT ***** ***** ***** ***** us-east-1 visible");
    }

    #[test]
    fn test_no_secrets_borrows() {
        let redactor = Redactor::from_variables(&vars(json!({ "a": "b" })));
        assert!(redactor.is_empty());
        assert!(matches!(redactor.redact("SELECT b"), Cow::Borrowed(_)));
    }

    #[test]
    fn test_longest_secret_wins() {
        let redactor = Redactor::new(["abc", "abcdef"]);
        assert_eq!(redactor.redact("x abcdef y abc"), "x ***** y *****");
    }

    #[test]
    fn test_empty_secret_ignored() {
        let redactor = Redactor::new([""]);
        assert!(redactor.is_empty());
    }
}
