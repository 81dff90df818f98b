//! Variables bound from extracted facts, and `{var}` templating

use std::collections::BTreeMap;

use crate::common::{Error, Result};

/// Name -> value map filled in as a scenario runs
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: BTreeMap<String, String>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Like [`Self::get`] but unbound is an error
    pub fn require(&self, name: &str) -> Result<&str> {
        self.get(name)
            .ok_or_else(|| Error::UnboundVariable(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Substitute every `{var}` in `template`
    ///
    /// Braces that don't enclose a variable name are left as they are.
    pub fn render(&self, template: &str) -> Result<String> {
        let mut out = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            match variable_at(after) {
                Some(name) => {
                    out.push_str(self.require(name)?);
                    rest = &after[name.len() + 1..];
                }
                None => {
                    out.push('{');
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Variable names referenced by `template`, in order of appearance
pub fn variables(template: &str) -> Vec<&str> {
    let mut names = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match variable_at(after) {
            Some(name) => {
                names.push(name);
                rest = &after[name.len() + 1..];
            }
            None => rest = after,
        }
    }
    names
}

/// If `s` starts with `name}`, return `name`
fn variable_at(s: &str) -> Option<&str> {
    let close = s.find('}')?;
    let name = &s[..close];
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    valid.then_some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bindings() -> Bindings {
        let mut b = Bindings::new();
        b.bind("full_space_id", "ab".repeat(32));
        b.bind("invite", "Xy12");
        b.bind("bob.user_id", "cd".repeat(32));
        b
    }

    #[test]
    fn test_render_substitutes_variables() {
        let b = bindings();
        assert_eq!(
            b.render("join {full_space_id} {invite}").unwrap(),
            format!("join {} Xy12", "ab".repeat(32))
        );
        assert_eq!(
            b.render("kick {bob.user_id}").unwrap(),
            format!("kick {}", "cd".repeat(32))
        );
    }

    #[test]
    fn test_unbound_variable_is_an_error() {
        let err = bindings().render("kick {carol.user_id}").unwrap_err();
        assert!(matches!(err, Error::UnboundVariable(name) if name == "carol.user_id"));
    }

    #[test]
    fn test_non_variable_braces_are_literal() {
        let b = bindings();
        assert_eq!(b.render("send {} and { x }").unwrap(), "send {} and { x }");
        assert_eq!(b.render("send {unclosed").unwrap(), "send {unclosed");
        assert_eq!(b.render("{{invite}").unwrap(), "{Xy12");
    }

    #[test]
    fn test_variables_lists_references() {
        assert_eq!(
            variables("connect /ip4/127.0.0.1/tcp/{alice.port}/p2p/{peer_id} {}"),
            vec!["alice.port", "peer_id"]
        );
        assert!(variables("send Hello Bob!").is_empty());
    }
}
