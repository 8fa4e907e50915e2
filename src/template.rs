//! Minimal `{name}` template renderer.
//!
//! Templates are parsed once; substituted values are copied verbatim and never parsed,
//! so braces inside stored user text cannot reach template syntax. `{{` and `}}` write
//! literal braces in the template itself.

use std::collections::HashMap;

use crate::error::EchoAvatarError;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(String),
    Placeholder(&'a str),
}

#[derive(Debug, Clone)]
pub struct Template<'a> {
    segments: Vec<Segment<'a>>,
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

impl<'a> Template<'a> {
    pub fn parse(source: &'a str) -> Result<Self, EchoAvatarError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut rest = source;

        while let Some(idx) = rest.find(['{', '}']) {
            literal.push_str(&rest[..idx]);
            let tail = &rest[idx..];
            if let Some(after) = tail.strip_prefix("{{") {
                literal.push('{');
                rest = after;
            } else if let Some(after) = tail.strip_prefix("}}") {
                literal.push('}');
                rest = after;
            } else if tail.starts_with('}') {
                return Err(EchoAvatarError::Template(format!(
                    "unmatched '}}' at byte {}",
                    source.len() - tail.len()
                )));
            } else {
                let body = &tail[1..];
                let end = body.find('}').ok_or_else(|| {
                    EchoAvatarError::Template(format!(
                        "unclosed '{{' at byte {}",
                        source.len() - tail.len()
                    ))
                })?;
                let name = &body[..end];
                if name.is_empty() || !name.chars().all(is_name_char) {
                    return Err(EchoAvatarError::Template(format!(
                        "invalid placeholder '{{{name}}}'"
                    )));
                }
                if !literal.is_empty() {
                    segments.push(Segment::Literal(std::mem::take(&mut literal)));
                }
                segments.push(Segment::Placeholder(name));
                rest = &body[end + 1..];
            }
        }
        literal.push_str(rest);
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Template { segments })
    }

    pub fn render(&self, vars: &HashMap<&str, String>) -> Result<String, EchoAvatarError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    let value = vars.get(name).ok_or_else(|| {
                        EchoAvatarError::Template(format!("missing value for '{name}'"))
                    })?;
                    out.push_str(value);
                }
            }
        }
        Ok(out)
    }
}

pub fn render(source: &str, vars: &HashMap<&str, String>) -> Result<String, EchoAvatarError> {
    Template::parse(source)?.render(vars)
}

pub fn escape_html(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn test_render_substitutes_placeholders() {
        let out = render("Hi {name}, you are {name}!", &vars(&[("name", "Kai")])).unwrap();
        assert_eq!(out, "Hi Kai, you are Kai!");
    }

    #[test]
    fn test_literal_braces_in_template() {
        let out = render("{{ {x} }}", &vars(&[("x", "1")])).unwrap();
        assert_eq!(out, "{ 1 }");
    }

    #[test]
    fn test_values_are_not_reinterpreted() {
        let out = render(
            "A: {a}\nB: {b}",
            &vars(&[("a", "{b} and {{x}} and }"), ("b", "second")]),
        )
        .unwrap();
        assert_eq!(out, "A: {b} and {{x}} and }\nB: second");
    }

    #[test]
    fn test_missing_value_is_error() {
        let err = render("{missing}", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("missing"));
    }

    #[test]
    fn test_malformed_templates() {
        assert!(Template::parse("open { brace").is_err());
        assert!(Template::parse("stray } brace").is_err());
        assert!(Template::parse("bad {na-me}").is_err());
        assert!(Template::parse("empty {}").is_err());
    }

    #[test]
    fn test_escape_html() {
        assert_eq!(
            escape_html(r#"<b>"Tom" & 'Jerry'</b>"#),
            "&lt;b&gt;&quot;Tom&quot; &amp; &#39;Jerry&#39;&lt;/b&gt;"
        );
    }
}
