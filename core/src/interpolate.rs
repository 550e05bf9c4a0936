//! String interpolation (§4.6): turns a template plus positional arguments
//! into the final dialogue string for `PushInterpolatedString` et al.
//!
//! The template is transformed in two passes. First, `${expr}` becomes
//! `{expr}` and escaped `\${expr}` becomes the literal text `${expr}` (the
//! backslash is consumed, the `$` survives). Any `{...}` that was never
//! preceded by a `$` is left untouched by this pass. Second, each `{i}` left
//! standing is replaced by the `Display` rendering (§3) of `args[i]`.

use crate::value::Value;
use crate::{String, Vec};

/// Pass 1: resolve the `${...}` / `\${...}` escaping convention.
fn resolve_markers(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((_, c)) = chars.next() {
        if c == '\\' {
            // `\${...}`: drop the backslash, keep the rest (including `$`)
            // literally, so the following `${...}` is NOT treated as a
            // substitution marker by pass 2.
            if let Some((_, '$')) = chars.peek() {
                chars.next();
                out.push('$');
                continue;
            }
            out.push('\\');
            continue;
        }
        if c == '$' {
            if let Some((_, '{')) = chars.peek() {
                // Drop the `$`; the `{` (and matching `}`) fall through
                // unchanged into pass 2's substitution.
                continue;
            }
        }
        out.push(c);
    }

    out
}

/// Pass 2: positional substitution of `{i}` with `args[i]`'s rendering.
///
/// A `{i}` immediately preceded by `$` is left untouched: that `$` can only
/// have survived pass 1 by way of the `\${expr}` escape (unescaped
/// `${expr}` markers are consumed and stripped by pass 1), so the pair is a
/// literal the author asked to keep, not a substitution target.
fn substitute_positional(template: &str, args: &[Value]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    let bytes = template.as_bytes();

    while let Some((idx, c)) = chars.next() {
        if c == '{' && !(idx > 0 && bytes[idx - 1] == b'$') {
            if let Some(end) = template[idx + 1..].find('}') {
                let inner = &template[idx + 1..idx + 1 + end];
                if !inner.is_empty() && inner.bytes().all(|b| b.is_ascii_digit()) {
                    if let Ok(i) = inner.parse::<usize>() {
                        if let Some(value) = args.get(i) {
                            out.push_str(&crate::format!("{value}"));
                        }
                        // Skip past the consumed `{i}` in the char iterator.
                        let skip_to = idx + 1 + end + 1;
                        while let Some(&(next_idx, _)) = chars.peek() {
                            if next_idx >= skip_to {
                                break;
                            }
                            chars.next();
                        }
                        if skip_to >= bytes.len() {
                            break;
                        }
                        continue;
                    }
                }
            }
        }
        out.push(c);
    }

    out
}

/// Full interpolation: pass 1 then pass 2. `args[0]` is the first value
/// popped off the stack by `PushInterpolatedString` (§4.6).
pub fn interpolate(template: &str, args: &[Value]) -> String {
    let resolved = resolve_markers(template);
    substitute_positional(&resolved, args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vec;

    #[test]
    fn idempotent_on_plain_text() {
        assert_eq!(interpolate("hello world", &[]), "hello world");
    }

    #[test]
    fn dollar_brace_becomes_positional() {
        assert_eq!(interpolate("sum: ${0}", &[Value::Int(7)]), "sum: 7");
    }

    #[test]
    fn escaped_dollar_brace_is_preserved_literally() {
        assert_eq!(interpolate(r"price: \${0}", &[Value::Int(7)]), "price: ${0}");
    }

    #[test]
    fn bare_brace_without_dollar_is_still_substituted_by_pass_two() {
        // Pass 1 leaves `{0}` untouched since it was never preceded by `$`;
        // pass 2 still substitutes it, matching the spec's positional rule.
        assert_eq!(interpolate("{0}", &[Value::string("x")]), "x");
    }

    #[test]
    fn multiple_positional_args_in_order() {
        let args = vec![Value::string("Alex"), Value::Int(3)];
        assert_eq!(interpolate("${0} has ${1} coins", &args), "Alex has 3 coins");
    }

    #[test]
    fn array_argument_renders_as_sequence() {
        let args = vec![Value::array(vec![Value::Int(1), Value::Int(2)])];
        assert_eq!(interpolate("${0}", &args), "[1, 2]");
    }

    #[test]
    fn undefined_argument_renders_empty() {
        assert_eq!(interpolate("[${0}]", &[Value::Undefined]), "[]");
    }
}
