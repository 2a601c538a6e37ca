//! Placeholder substitution for target templates.
//!
//! Two syntaxes are in use:
//!
//! - [`Syntax::Shell`]: `${name}` inside script bodies. Nothing else in the
//!   body is touched, so `$name`, `$(...)`, `\$4`, `${var:-x}` and awk braces
//!   reach the interpreter unchanged. Names the script assigns itself are
//!   shell locals and are left for the interpreter.
//! - [`Syntax::Identifier`]: `{name}` inside short strings such as process
//!   names and argument prefixes. `{{` and `}}` produce literal braces.
//!
//! Rendering is textual substitution only. Values are inserted verbatim.

use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use strum::{Display, EnumString};
use thiserror::Error;

use crate::env_schema::ResolvedEnv;

static SHELL_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

// Assignments in command position (line start, after `;` `&&` `||` `|` `(`
// or `then`/`do`/`else`, optionally after `local`/`export`/`readonly`/`declare`)
// and `for name in` loop variables. `name=` inside an argument is not one.
static SHELL_ASSIGNMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?m)(?:(?:^|;|&&|\|\||\||\(|\b(?:then|do|else)\b)[ \t]*",
        r"(?:(?:local|export|readonly|declare)[ \t]+)?([A-Za-z_][A-Za-z0-9_]*)=",
        r"|\bfor[ \t]+([A-Za-z_][A-Za-z0-9_]*)[ \t]+in\b)",
    ))
    .expect("valid regex")
});

static IDENTIFIER_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{|\}\}|\{([^{}]*)\}|[{}]").expect("valid regex"));

static IDENTIFIER_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"));

/// Errors raised while rendering a template
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    /// A placeholder names a variable absent from the environment
    #[error("placeholder '{name}' has no value in the environment")]
    UnknownVariable { name: String },

    /// `{` without a matching `}`
    #[error("unclosed '{{' at byte {position}")]
    UnclosedPlaceholder { position: usize },

    /// `}` without a preceding `{`
    #[error("unmatched '}}' at byte {position}")]
    UnmatchedBrace { position: usize },

    /// `{}` or `{not a name}`
    #[error("invalid placeholder '{{{name}}}'")]
    InvalidPlaceholder { name: String },
}

/// Placeholder syntax of a template
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Syntax {
    Shell,
    Identifier,
}

/// A template string together with its placeholder syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    syntax: Syntax,
}

impl Template {
    pub fn shell(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            syntax: Syntax::Shell,
        }
    }

    pub fn identifier(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            syntax: Syntax::Identifier,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn syntax(&self) -> Syntax {
        self.syntax
    }

    /// Render against `env`.
    pub fn render(&self, env: &ResolvedEnv) -> Result<String, TemplateError> {
        match self.syntax {
            Syntax::Shell => render_shell(&self.source, env),
            Syntax::Identifier => render_identifier(&self.source, env),
        }
    }

    /// Names this template needs from the environment.
    ///
    /// Shell locals are excluded. Fails only for malformed identifier
    /// templates.
    pub fn placeholders(&self) -> Result<BTreeSet<String>, TemplateError> {
        match self.syntax {
            Syntax::Shell => {
                let locals = shell_locals(&self.source);
                Ok(SHELL_PLACEHOLDER
                    .captures_iter(&self.source)
                    .filter_map(|caps| {
                        let whole = caps.get(0)?;
                        let name = &caps[1];
                        (!is_local(&locals, name, whole.start())).then(|| name.to_string())
                    })
                    .collect())
            }
            Syntax::Identifier => {
                let mut names = BTreeSet::new();
                for token in identifier_tokens(&self.source)? {
                    if let IdentifierToken::Placeholder(name) = token {
                        names.insert(name.to_string());
                    }
                }
                Ok(names)
            }
        }
    }
}

fn render_shell(source: &str, env: &ResolvedEnv) -> Result<String, TemplateError> {
    let locals = shell_locals(source);
    let mut out = String::with_capacity(source.len());
    let mut last = 0;

    for caps in SHELL_PLACEHOLDER.captures_iter(source) {
        let Some(whole) = caps.get(0) else { continue };
        let name = &caps[1];
        out.push_str(&source[last..whole.start()]);
        match env.get(name) {
            Some(value) => out.push_str(value),
            None if is_local(&locals, name, whole.start()) => out.push_str(whole.as_str()),
            None => {
                return Err(TemplateError::UnknownVariable {
                    name: name.to_string(),
                });
            }
        }
        last = whole.end();
    }
    out.push_str(&source[last..]);

    Ok(out)
}

/// Variables a script body assigns for itself, with the byte offset where
/// the first assignment ends.
fn shell_locals(source: &str) -> BTreeMap<String, usize> {
    let mut locals = BTreeMap::new();
    for caps in SHELL_ASSIGNMENT.captures_iter(source) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1).or_else(|| caps.get(2))) else {
            continue;
        };
        locals.entry(name.as_str().to_string()).or_insert(whole.end());
    }
    locals
}

/// A use at `position` refers to a shell local only once it has been assigned.
fn is_local(locals: &BTreeMap<String, usize>, name: &str, position: usize) -> bool {
    locals.get(name).is_some_and(|&assigned| assigned <= position)
}

enum IdentifierToken<'a> {
    Literal(&'a str),
    Placeholder(&'a str),
}

fn identifier_tokens(source: &str) -> Result<Vec<IdentifierToken<'_>>, TemplateError> {
    let mut tokens = Vec::new();
    let mut last = 0;

    for caps in IDENTIFIER_TOKEN.captures_iter(source) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > last {
            tokens.push(IdentifierToken::Literal(&source[last..whole.start()]));
        }
        match whole.as_str() {
            "{{" => tokens.push(IdentifierToken::Literal("{")),
            "}}" => tokens.push(IdentifierToken::Literal("}")),
            "{" => {
                return Err(TemplateError::UnclosedPlaceholder {
                    position: whole.start(),
                });
            }
            "}" => {
                return Err(TemplateError::UnmatchedBrace {
                    position: whole.start(),
                });
            }
            _ => {
                let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                if !IDENTIFIER_NAME.is_match(name) {
                    return Err(TemplateError::InvalidPlaceholder {
                        name: name.to_string(),
                    });
                }
                tokens.push(IdentifierToken::Placeholder(name));
            }
        }
        last = whole.end();
    }
    if last < source.len() {
        tokens.push(IdentifierToken::Literal(&source[last..]));
    }

    Ok(tokens)
}

fn render_identifier(source: &str, env: &ResolvedEnv) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(source.len());
    for token in identifier_tokens(source)? {
        match token {
            IdentifierToken::Literal(text) => out.push_str(text),
            IdentifierToken::Placeholder(name) => match env.get(name) {
                Some(value) => out.push_str(value),
                None => {
                    return Err(TemplateError::UnknownVariable {
                        name: name.to_string(),
                    });
                }
            },
        }
    }
    Ok(out)
}
