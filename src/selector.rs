//! Method selectors and argument expressions.
//!
//! A selector names the methods a tracer should match: a bare `name`
//! (instance and class methods alike), `Class#method`, `Class.method`,
//! `Class#` (every instance method), or `Class.` (every class method). A
//! parenthesized suffix lists argument expressions to sample on each call;
//! each becomes an `addexpr` on the same tracer.

use crate::error::{Error, Result};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Selector {
    /// The method pattern sent with the `add` command.
    pub query: String,
    /// Argument expressions, sent as `addexpr` follow-ups.
    pub expressions: Vec<String>,
}

impl Selector {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();

        let Some(open) = input.find('(') else {
            return Ok(Self {
                query: input.to_string(),
                expressions: Vec::new(),
            });
        };

        let query = input[..open].trim().to_string();
        let inner = input[open + 1..]
            .strip_suffix(')')
            .ok_or_else(|| Error::InvalidExpression {
                expr: input.to_string(),
                reason: "unterminated argument list",
            })?;

        let mut expressions = Vec::new();
        for part in inner.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let expr = normalize_expression(part);
            validate_expression(&expr)?;
            expressions.push(expr);
        }

        Ok(Self { query, expressions })
    }
}

/// A bare `@name` read is sent as-is; anything else that merely starts with
/// the instance-variable sigil gets a leading space so the target parses it
/// as an expression rather than a variable lookup.
fn normalize_expression(expr: &str) -> String {
    if expr.starts_with('@') && !is_plain_instance_variable(expr) {
        format!(" {expr}")
    } else {
        expr.to_string()
    }
}

fn is_plain_instance_variable(expr: &str) -> bool {
    let name = &expr[1..];
    !name.is_empty()
        && !name.starts_with(|c: char| c.is_ascii_digit())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Lexical pre-validation of an expression before it is sent to the target.
///
/// Rejects text whose bracket or quote structure cannot parse anywhere.
/// Anything balanced is accepted optimistically; deeper errors surface
/// through the target's own reporting.
pub fn validate_expression(expr: &str) -> Result<()> {
    let fail = |reason| {
        Err(Error::InvalidExpression {
            expr: expr.to_string(),
            reason,
        })
    };

    if expr.trim().is_empty() {
        return fail("empty expression");
    }

    let mut brackets = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for c in expr.chars() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }

        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => brackets.push(c),
            ')' | ']' | '}' => {
                let open = brackets.pop();
                let ok = matches!(
                    (open, c),
                    (Some('('), ')') | (Some('['), ']') | (Some('{'), '}')
                );
                if !ok {
                    return fail("unbalanced brackets");
                }
            }
            _ => {}
        }
    }

    if quote.is_some() {
        return fail("unterminated string literal");
    }
    if !brackets.is_empty() {
        return fail("unbalanced brackets");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(input: &str) -> Selector {
        Selector::parse(input).unwrap()
    }

    #[test]
    fn test_selector_forms_pass_through() {
        for query in ["gsub", "String#gsub", "String.now", "String#", "String."] {
            let selector = parse(query);
            assert_eq!(selector.query, query);
            assert!(selector.expressions.is_empty());
        }
    }

    #[test]
    fn test_argument_expressions_split_on_commas() {
        let selector = parse("Foo#bar(x, y.to_s, 1 + 2)");
        assert_eq!(selector.query, "Foo#bar");
        assert_eq!(selector.expressions, vec!["x", "y.to_s", "1 + 2"]);
    }

    #[test]
    fn test_plain_instance_variable_is_untouched() {
        let selector = parse("Foo#bar(@name)");
        assert_eq!(selector.expressions, vec!["@name"]);
    }

    #[test]
    fn test_instance_variable_expression_gets_a_leading_space() {
        let selector = parse("Foo#bar(@name.size)");
        assert_eq!(selector.expressions, vec![" @name.size"]);
    }

    #[test]
    fn test_unterminated_argument_list_is_rejected() {
        let err = Selector::parse("Foo#bar(x").unwrap_err();
        assert!(matches!(err, Error::InvalidExpression { .. }));
    }

    #[test]
    fn test_validation_accepts_balanced_text() {
        validate_expression("args.map { |a| a.to_s }.join(\", \")").unwrap();
        validate_expression("h[:key]").unwrap();
        validate_expression("'it''s'").unwrap();
    }

    #[test]
    fn test_validation_rejects_lexical_garbage() {
        for bad in ["", "   ", "(a", "a)", "[a}", "\"oops", "'\\'"] {
            let err = validate_expression(bad).unwrap_err();
            assert!(
                matches!(err, Error::InvalidExpression { .. }),
                "expected rejection for {bad:?}"
            );
        }
    }
}
