//! Typed manifest renderer.
//!
//! Kubernetes manifests reference entry parameters with `{{ name }}`
//! placeholders. A [`Template`] is parsed once, its placeholder set is checked
//! against the known parameter names when the plan is built, and rendering
//! only ever substitutes scalar values that cannot break out of the YAML line
//! they are placed on.

use std::collections::BTreeSet;

use crate::plan::Params;

/// Errors produced while parsing or rendering a template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    /// A `{{` without a matching `}}`.
    #[error("unclosed placeholder at byte {0}")]
    Unclosed(usize),

    /// A placeholder whose name is not a plain identifier.
    #[error("invalid placeholder name '{0}'")]
    InvalidName(String),

    /// A placeholder that no parameter provides.
    #[error("unknown placeholder '{0}'")]
    Unknown(String),

    /// A parameter value that cannot be substituted.
    #[error("value for '{name}' cannot be rendered: {reason}")]
    InvalidValue { name: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Text(String),
    Placeholder(String),
}

/// A parsed manifest template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Splits `source` into literal text and `{{ name }}` placeholders.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut rest = source;
        let mut offset = 0;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Text(rest[..start].to_string()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find("}}")
                .ok_or(TemplateError::Unclosed(offset + start))?;

            let name = after[..end].trim();
            if !is_identifier(name) {
                return Err(TemplateError::InvalidName(name.to_string()));
            }
            segments.push(Segment::Placeholder(name.to_string()));

            let consumed = start + 2 + end + 2;
            offset += consumed;
            rest = &rest[consumed..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Text(rest.to_string()));
        }

        Ok(Self { segments })
    }

    /// Names referenced by the template.
    pub fn placeholders(&self) -> BTreeSet<&str> {
        self.segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder(name) => Some(name.as_str()),
                Segment::Text(_) => None,
            })
            .collect()
    }

    /// Fails on the first placeholder not in `known`.
    pub fn check<'a, I>(&self, known: I) -> Result<(), TemplateError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let known: BTreeSet<&str> = known.into_iter().collect();
        match self.placeholders().into_iter().find(|p| !known.contains(p)) {
            Some(unknown) => Err(TemplateError::Unknown(unknown.to_string())),
            None => Ok(()),
        }
    }

    /// Substitutes every placeholder from `params`.
    pub fn render(&self, params: &Params) -> Result<String, TemplateError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Placeholder(name) => {
                    if !params.contains(name) {
                        return Err(TemplateError::Unknown(name.clone()));
                    }
                    let value = params.render(name).ok_or_else(|| TemplateError::InvalidValue {
                        name: name.clone(),
                        reason: "not a scalar".to_string(),
                    })?;
                    if value.contains('\n') || value.contains('\r') {
                        return Err(TemplateError::InvalidValue {
                            name: name.clone(),
                            reason: "contains a line break".to_string(),
                        });
                    }
                    out.push_str(&value);
                }
            }
        }
        Ok(out)
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
