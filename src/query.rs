//! Translation of user-typed queries into retrieval expressions.
//!
//! The grammar is deliberately small:
//!
//! - whitespace separates terms, which are combined with AND
//! - `"exact phrase"` matches adjacent words
//! - `-term` excludes documents containing the term
//! - `from:`, `to:`, `cc:`, `subject:` and `folder:` scope a term (or a
//!   quoted phrase) to one attribute
//! - an uppercase `OR` joins only the two clauses on either side of it
//!
//! The result is a typed [`Expression`], never a query string, so nothing a
//! user types can change the structure of the query sent to the index.
//!
//! ```
//! use maildex::query::{self, Field};
//!
//! let expr = query::parse("subject:\"hello world\" -draft").unwrap();
//! assert_eq!(expr.to_string(), "+subject:\"hello world\" -\"draft\"");
//! assert_eq!(expr.groups()[0].clauses()[0].field, Some(Field::Subject));
//! ```

use crate::error::{Error, Result};

/// Attributes a clause can be scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    From,
    To,
    Cc,
    Subject,
    Folder,
}

impl Field {
    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix.to_ascii_lowercase().as_str() {
            "from" => Some(Field::From),
            "to" => Some(Field::To),
            "cc" => Some(Field::Cc),
            "subject" => Some(Field::Subject),
            "folder" => Some(Field::Folder),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::From => "from",
            Field::To => "to",
            Field::Cc => "cc",
            Field::Subject => "subject",
            Field::Folder => "folder",
        }
    }
}

/// A single match condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Clause {
    /// `None` means the default text fields.
    pub field: Option<Field>,
    pub text: String,
    /// Whether the words must appear adjacent and in order.
    pub phrase: bool,
    pub negated: bool,
}

/// Clauses joined by AND at the top level. `Any` is an OR run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Group {
    One(Clause),
    Any(Vec<Clause>),
}

impl Group {
    pub fn clauses(&self) -> &[Clause] {
        match self {
            Group::One(clause) => std::slice::from_ref(clause),
            Group::Any(clauses) => clauses,
        }
    }

    /// A group contributes a required match unless it is a lone negation.
    pub fn is_positive(&self) -> bool {
        match self {
            Group::One(clause) => !clause.negated,
            Group::Any(_) => true,
        }
    }
}

/// A validated retrieval expression: every group must hold, and at least
/// one group is positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    groups: Vec<Group>,
}

impl Expression {
    /// Build an expression from groups, rejecting shapes the index cannot
    /// answer (nothing at all, or only exclusions).
    pub fn new(groups: Vec<Group>) -> Result<Self> {
        if groups.is_empty() {
            return Err(Error::InvalidQuery("query is empty".into()));
        }
        if let Some(bad) = groups.iter().find(|g| match g {
            Group::Any(clauses) => {
                clauses.len() < 2 || clauses.iter().any(|c| c.negated)
            }
            Group::One(_) => false,
        }) {
            return Err(Error::InvalidQuery(format!(
                "malformed OR group: {bad:?}"
            )));
        }
        if !groups.iter().any(Group::is_positive) {
            return Err(Error::InvalidQuery(
                "query must contain at least one term that is not negated"
                    .into(),
            ));
        }
        Ok(Self { groups })
    }

    pub fn groups(&self) -> &[Group] {
        &self.groups
    }

    /// Words of the positive clauses, in query order, for highlighting.
    /// Folder scopes are left out since they never occur in body text.
    pub fn highlight_terms(&self) -> Vec<String> {
        let mut terms: Vec<String> = Vec::new();
        for clause in self.groups.iter().flat_map(Group::clauses) {
            if clause.negated || clause.field == Some(Field::Folder) {
                continue;
            }
            for word in clause.text.split_whitespace() {
                if !terms.iter().any(|t| t.eq_ignore_ascii_case(word)) {
                    terms.push(word.to_string());
                }
            }
        }
        terms
    }
}

impl std::fmt::Display for Expression {
    /// Canonical query-language rendering. Every value is quoted, so the
    /// output is stable and safe to log or hand to a query parser.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match group {
                Group::One(clause) => {
                    f.write_str(if clause.negated { "-" } else { "+" })?;
                    write_atom(f, clause)?;
                }
                Group::Any(clauses) => {
                    f.write_str("+(")?;
                    for (j, clause) in clauses.iter().enumerate() {
                        if j > 0 {
                            f.write_str(" ")?;
                        }
                        write_atom(f, clause)?;
                    }
                    f.write_str(")")?;
                }
            }
        }
        Ok(())
    }
}

fn write_atom(
    f: &mut std::fmt::Formatter<'_>,
    clause: &Clause,
) -> std::fmt::Result {
    if let Some(field) = clause.field {
        write!(f, "{}:", field.name())?;
    }
    f.write_str("\"")?;
    for c in clause.text.chars() {
        if c == '"' || c == '\\' {
            f.write_str("\\")?;
        }
        write!(f, "{c}")?;
    }
    f.write_str("\"")
}

/// Lexer output: a clause or the `OR` keyword.
#[derive(Debug)]
enum Token {
    Clause(Clause),
    Or,
}

/// Parse a user query. Pure: the same input always yields the same
/// expression.
pub fn parse(raw: &str) -> Result<Expression> {
    let tokens = tokenize(raw);

    let mut groups: Vec<Group> = Vec::new();
    let mut pending_or = false;
    for token in tokens {
        match token {
            Token::Or => {
                pending_or = groups.last().is_some_and(|g| match g {
                    Group::One(clause) => !clause.negated,
                    Group::Any(_) => true,
                });
            }
            Token::Clause(clause) => {
                if pending_or && !clause.negated {
                    join_last(&mut groups, clause);
                } else {
                    groups.push(Group::One(clause));
                }
                pending_or = false;
            }
        }
    }

    Expression::new(groups)
}

fn join_last(groups: &mut Vec<Group>, clause: Clause) {
    match groups.pop() {
        Some(Group::One(previous)) => {
            groups.push(Group::Any(vec![previous, clause]));
        }
        Some(Group::Any(mut clauses)) => {
            clauses.push(clause);
            groups.push(Group::Any(clauses));
        }
        None => groups.push(Group::One(clause)),
    }
}

fn tokenize(raw: &str) -> Vec<Token> {
    let chars: Vec<char> = raw.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i].is_whitespace() {
            i += 1;
            continue;
        }

        let mut negated = false;
        if chars[i] == '-' {
            negated = true;
            i += 1;
            if i >= chars.len() || chars[i].is_whitespace() {
                continue;
            }
        }

        if chars[i] == '"' {
            let (text, next) = read_quoted(&chars, i + 1);
            i = next;
            push_clause(&mut tokens, None, text, true, negated);
            continue;
        }

        let start = i;
        while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '"'
        {
            i += 1;
        }
        let word: String = chars[start..i].iter().collect();

        if !negated && word == "OR" {
            tokens.push(Token::Or);
            continue;
        }

        let scoped = word
            .split_once(':')
            .and_then(|(prefix, rest)| Some((Field::from_prefix(prefix)?, rest)));
        match scoped {
            Some((field, "")) if i < chars.len() && chars[i] == '"' => {
                let (text, next) = read_quoted(&chars, i + 1);
                i = next;
                push_clause(&mut tokens, Some(field), text, true, negated);
            }
            Some((field, rest)) if !rest.is_empty() => {
                push_clause(
                    &mut tokens,
                    Some(field),
                    rest.to_string(),
                    false,
                    negated,
                );
            }
            Some((field, _)) => {
                // `from:` with nothing after it searches for the word itself.
                push_clause(
                    &mut tokens,
                    None,
                    field.name().to_string(),
                    false,
                    negated,
                );
            }
            None => push_clause(&mut tokens, None, word, false, negated),
        }
    }

    tokens
}

/// Read up to the closing quote (or end of input). Returns the phrase and
/// the index just past it.
fn read_quoted(chars: &[char], start: usize) -> (String, usize) {
    let mut end = start;
    while end < chars.len() && chars[end] != '"' {
        end += 1;
    }
    let text: String = chars[start..end].iter().collect();
    let next = if end < chars.len() { end + 1 } else { end };
    (text, next)
}

fn push_clause(
    tokens: &mut Vec<Token>,
    field: Option<Field>,
    text: String,
    phrase: bool,
    negated: bool,
) {
    let text = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.is_empty() {
        return;
    }
    tokens.push(Token::Clause(Clause {
        field,
        text,
        phrase,
        negated,
    }));
}
