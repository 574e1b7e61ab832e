/// Statement splitting for rendered change scripts
///
/// This is not a SQL parser. It tracks just enough lexical state to find the
/// statement terminators that matter: semicolons inside dollar-quoted bodies,
/// string literals and comments never split a statement.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Statement {
    /// 1-based position within the script
    pub index: usize,
    /// 1-based line where the statement's code begins
    pub line_number: usize,
    /// Trimmed statement text including comments, without the terminator
    pub sql: String,
    pub sql_without_comments: String,
    /// PUT/GET stage transfer
    pub is_transfer: bool,
}

impl Statement {
    /// An empty statement has no code, only whitespace and comments. It
    /// succeeds without reaching the warehouse.
    pub fn is_empty(&self) -> bool {
        self.sql_without_comments.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Normal,
    DollarQuote(String),
    SingleQuote,
    DoubleQuote,
    LineComment,
    BlockComment,
}

struct Builder {
    raw: String,
    code: String,
    start_line: usize,
    code_line: Option<usize>,
}

impl Builder {
    fn new(line: usize) -> Self {
        Builder {
            raw: String::new(),
            code: String::new(),
            start_line: line,
            code_line: None,
        }
    }

    fn push_code(&mut self, c: char, line: usize) {
        if self.code_line.is_none() && !c.is_whitespace() {
            self.code_line = Some(line);
        }
        self.raw.push(c);
        self.code.push(c);
    }

    fn push_code_str(&mut self, s: &str, line: usize) {
        for c in s.chars() {
            self.push_code(c, line);
        }
    }

    fn push_comment(&mut self, c: char) {
        self.raw.push(c);
    }

    fn finish(self, index: usize) -> Statement {
        let sql_without_comments = self.code.trim().to_owned();
        Statement {
            index,
            line_number: self.code_line.unwrap_or(self.start_line),
            sql: self.raw.trim().to_owned(),
            is_transfer: is_transfer(&sql_without_comments),
            sql_without_comments,
        }
    }
}

/// Split rendered script text into statements.
///
/// The text after the last terminator is always returned as the final
/// statement, so a script ending in `;` yields a trailing empty statement.
pub fn split_statements(text: &str) -> Vec<Statement> {
    let chars: Vec<char> = text.chars().collect();
    let mut statements = Vec::new();
    let mut state = State::Normal;
    let mut line = 1;
    let mut current = Builder::new(line);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();

        match &state {
            State::Normal => match c {
                ';' => {
                    let finished = std::mem::replace(&mut current, Builder::new(line));
                    statements.push(finished.finish(statements.len() + 1));
                }
                '-' if next == Some('-') => {
                    current.push_comment(c);
                    state = State::LineComment;
                }
                '/' if next == Some('*') => {
                    current.push_comment(c);
                    current.push_comment('*');
                    // keep tokens on either side of the comment apart
                    current.code.push(' ');
                    i += 1;
                    state = State::BlockComment;
                }
                '\'' => {
                    current.push_code(c, line);
                    state = State::SingleQuote;
                }
                '"' => {
                    current.push_code(c, line);
                    state = State::DoubleQuote;
                }
                '$' => match dollar_tag(&chars, i).filter(|tag| tag == "$$" || !follows_identifier(&chars, i)) {
                    Some(tag) => {
                        current.push_code_str(&tag, line);
                        i += tag.chars().count() - 1;
                        state = State::DollarQuote(tag);
                    }
                    None => current.push_code(c, line),
                },
                _ => current.push_code(c, line),
            },
            State::DollarQuote(tag) => {
                if c == '$' && starts_with_at(&chars, i, tag) {
                    let tag = tag.clone();
                    current.push_code_str(&tag, line);
                    i += tag.chars().count() - 1;
                    state = State::Normal;
                } else {
                    current.push_code(c, line);
                }
            }
            State::SingleQuote => {
                current.push_code(c, line);
                if c == '\'' {
                    if next == Some('\'') {
                        current.push_code('\'', line);
                        i += 1;
                    } else {
                        state = State::Normal;
                    }
                } else if c == '\\' {
                    if let Some(escaped) = next {
                        current.push_code(escaped, line);
                        if escaped == '\n' {
                            line += 1;
                        }
                        i += 1;
                    }
                }
            }
            State::DoubleQuote => {
                current.push_code(c, line);
                if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    current.push_code(c, line);
                    state = State::Normal;
                } else {
                    current.push_comment(c);
                }
            }
            State::BlockComment => {
                current.push_comment(c);
                if c == '*' && next == Some('/') {
                    current.push_comment('/');
                    i += 1;
                    state = State::Normal;
                }
            }
        }

        if c == '\n' {
            line += 1;
        }
        i += 1;
    }

    statements.push(current.finish(statements.len() + 1));
    statements
}

/// True when the text holds nothing but whitespace, comments and
/// terminators.
pub fn is_blank_or_comment_only(text: &str) -> bool {
    split_statements(text).iter().all(Statement::is_empty)
}

/// `$$` or `$tag$` opening at `i`.
fn dollar_tag(chars: &[char], i: usize) -> Option<String> {
    let mut j = i + 1;
    while j < chars.len() {
        let c = chars[j];
        if c == '$' {
            return Some(chars[i..=j].iter().collect());
        }
        let valid = if j == i + 1 {
            c.is_ascii_alphabetic() || c == '_'
        } else {
            c.is_ascii_alphanumeric() || c == '_'
        };
        if !valid {
            return None;
        }
        j += 1;
    }
    None
}

/// `$` may appear inside unquoted identifiers, so `a$b$c` opens no tag.
fn follows_identifier(chars: &[char], i: usize) -> bool {
    i > 0 && {
        let prev = chars[i - 1];
        prev.is_ascii_alphanumeric() || prev == '_' || prev == '$'
    }
}

fn starts_with_at(chars: &[char], i: usize, tag: &str) -> bool {
    let mut j = i;
    for t in tag.chars() {
        if chars.get(j) != Some(&t) {
            return false;
        }
        j += 1;
    }
    true
}

fn is_transfer(code: &str) -> bool {
    let mut words = code.splitn(2, char::is_whitespace);
    let first = words.next().unwrap_or_default();
    let has_argument = words.next().is_some_and(|rest| !rest.trim().is_empty());
    has_argument && (first.eq_ignore_ascii_case("PUT") || first.eq_ignore_ascii_case("GET"))
}
