//! `{placeholder}` expansion for API endpoints and script arguments

use crate::error::{EngineError, Result};
use crate::models::EventContext;
use std::borrow::Cow;

/// Expand every `{name}` token in `template` from `ctx`, values verbatim
///
/// `{{` and `}}` produce literal braces. The first placeholder absent from
/// the context aborts expansion with [`EngineError::Template`].
pub fn expand(template: &str, ctx: &EventContext) -> Result<String> {
    expand_with(template, ctx, |_, value| Ok(Cow::Borrowed(value)))
}

/// Expand an endpoint path, keeping each value inside its path segment
///
/// Values are percent-encoded (`/`, `?`, `#` and `%` included). A value
/// that is itself a dot segment is rejected, since URL parsing would
/// resolve it even when encoded.
pub fn expand_endpoint(template: &str, ctx: &EventContext) -> Result<String> {
    expand_with(template, ctx, encode_path_segment)
}

fn encode_path_segment<'a>(placeholder: &str, value: &'a str) -> Result<Cow<'a, str>> {
    if value == "." || value == ".." {
        return Err(EngineError::UnsafeTemplateValue {
            placeholder: placeholder.to_string(),
            value: value.to_string(),
        });
    }
    Ok(urlencoding::encode(value))
}

/// Expand with `encode` applied to every substituted value
pub fn expand_with<F>(template: &str, ctx: &EventContext, encode: F) -> Result<String>
where
    F: for<'a> Fn(&str, &'a str) -> Result<Cow<'a, str>>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        match c {
            '{' if matches!(chars.peek(), Some((_, '{'))) => {
                chars.next();
                out.push('{');
            }
            '}' if matches!(chars.peek(), Some((_, '}'))) => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let rest = &template[i + 1..];
                let Some(end) = rest.find('}') else {
                    // Unclosed brace is kept verbatim
                    out.push_str(&template[i..]);
                    break;
                };
                let name = rest[..end].trim();
                let value = ctx.get(name).ok_or_else(|| EngineError::Template {
                    placeholder: name.to_string(),
                    template: template.to_string(),
                })?;
                out.push_str(&encode(name, value)?);
                // Skip past the closing brace
                while let Some((j, _)) = chars.next() {
                    if j == i + 1 + end {
                        break;
                    }
                }
            }
            _ => out.push(c),
        }
    }

    Ok(out)
}

/// Whether `s` contains at least one `{placeholder}` token
pub fn is_template(s: &str) -> bool {
    placeholders(s).next().is_some()
}

/// Names of the placeholders referenced by `template`, in order
pub fn placeholders(template: &str) -> impl Iterator<Item = &str> {
    let mut rest = template;
    std::iter::from_fn(move || loop {
        let start = rest.find('{')?;
        if rest[start + 1..].starts_with('{') {
            rest = &rest[start + 2..];
            continue;
        }
        let end = rest[start..].find('}')? + start;
        let name = rest[start + 1..end].trim();
        rest = &rest[end + 1..];
        if !name.is_empty() {
            return Some(name);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(pairs: &[(&str, &str)]) -> EventContext {
        EventContext::builder()
            .layer(pairs.iter().map(|(k, v)| (*k, *v)))
            .build()
    }

    #[test]
    fn test_expand_endpoint() {
        let c = ctx(&[("vm_id", "vm-7"), ("user", "bob")]);
        let path = expand("/api/vms/{vm_id}/users/{user}", &c).unwrap();
        assert_eq!(path, "/api/vms/vm-7/users/bob");
    }

    #[test]
    fn test_missing_placeholder() {
        let c = ctx(&[("vm_id", "vm-7")]);
        let err = expand("/api/vms/{vm_id}/users/{user}", &c).unwrap_err();
        match err {
            EngineError::Template { placeholder, .. } => assert_eq!(placeholder, "user"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_escaped_and_unclosed_braces() {
        let c = ctx(&[("x", "1")]);
        assert_eq!(expand("{{literal}} {x}", &c).unwrap(), "{literal} 1");
        assert_eq!(expand("value {x} {open", &c).unwrap(), "value 1 {open");
        assert_eq!(expand("no tokens", &c).unwrap(), "no tokens");
    }

    #[test]
    fn test_multibyte_values() {
        let c = ctx(&[("name", "Zoë")]);
        assert_eq!(expand("héllo {name}!", &c).unwrap(), "héllo Zoë!");
    }

    #[test]
    fn test_endpoint_values_stay_in_their_segment() {
        let c = ctx(&[("vm_id", "vm-7"), ("user", "../../../admin/keys")]);
        let path = expand_endpoint("/api/vms/{vm_id}/users/{user}", &c).unwrap();
        assert_eq!(path, "/api/vms/vm-7/users/..%2F..%2F..%2Fadmin%2Fkeys");

        let c = ctx(&[("q", "a b?x=1#frag%")]);
        assert_eq!(
            expand_endpoint("/search/{q}", &c).unwrap(),
            "/search/a%20b%3Fx%3D1%23frag%25"
        );

        // Raw expansion is untouched for script arguments
        let c = ctx(&[("user", "../x")]);
        assert_eq!(expand("{user}", &c).unwrap(), "../x");
    }

    #[test]
    fn test_endpoint_rejects_dot_segments() {
        for value in [".", ".."] {
            let c = ctx(&[("user", value)]);
            let err = expand_endpoint("/api/users/{user}", &c).unwrap_err();
            assert_eq!(err.kind(), "template_error");
            assert!(matches!(err, EngineError::UnsafeTemplateValue { .. }));
        }
        // Dots inside a longer value are harmless
        let c = ctx(&[("user", "bob.smith")]);
        assert_eq!(
            expand_endpoint("/api/users/{user}", &c).unwrap(),
            "/api/users/bob.smith"
        );
    }

    #[test]
    fn test_placeholders() {
        let names: Vec<_> = placeholders("/a/{vm_id}/{{skip}}/{ user }").collect();
        assert_eq!(names, vec!["vm_id", "user"]);
        assert!(is_template("{x}"));
        assert!(!is_template("plain_key"));
        assert!(!is_template("{{escaped}}"));
    }
}
