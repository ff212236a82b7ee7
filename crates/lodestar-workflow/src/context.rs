//! Per-execution variable store and `${name}` substitution.

use std::collections::HashMap;

/// Mutable key/value bag scoped to one workflow execution.
///
/// Seeded from the execution's variables and updated as tasks complete.
/// Substitution replaces every `${name}` occurrence whose key is present;
/// unknown placeholders are left literal, which makes substitution
/// idempotent on fully resolved strings.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    variables: HashMap<String, String>,
}

impl ExecutionContext {
    /// Creates an empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context seeded from existing variables.
    pub fn from_variables(variables: HashMap<String, String>) -> Self {
        Self { variables }
    }

    /// Gets a variable value.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    /// Sets a variable value.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.variables.insert(key.into(), value.into());
    }

    /// Merges a map of values into the context, overwriting existing keys.
    pub fn merge(&mut self, values: &HashMap<String, String>) {
        for (key, value) in values {
            self.variables.insert(key.clone(), value.clone());
        }
    }

    /// Read access to the underlying variables.
    pub fn variables(&self) -> &HashMap<String, String> {
        &self.variables
    }

    /// Consumes the context, returning the variables.
    pub fn into_variables(self) -> HashMap<String, String> {
        self.variables
    }

    /// Replaces every `${name}` in `input` with the context value for
    /// `name`, leaving unknown placeholders untouched.
    pub fn substitute(&self, input: &str) -> String {
        let mut result = String::with_capacity(input.len());
        let mut rest = input;

        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let after = &rest[start + 2..];

            match after.find('}') {
                Some(end) => {
                    let key = &after[..end];
                    match self.variables.get(key) {
                        Some(value) => result.push_str(value),
                        None => {
                            result.push_str("${");
                            result.push_str(key);
                            result.push('}');
                        }
                    }
                    rest = &after[end + 1..];
                }
                None => {
                    // Unterminated placeholder, keep the remainder literal
                    result.push_str(&rest[start..]);
                    rest = "";
                }
            }
        }

        result.push_str(rest);
        result
    }

    /// Applies [`substitute`](Self::substitute) to every value of a map.
    pub fn substitute_map(&self, map: &HashMap<String, String>) -> HashMap<String, String> {
        map.iter()
            .map(|(key, value)| (key.clone(), self.substitute(value)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ExecutionContext {
        let mut ctx = ExecutionContext::new();
        ctx.set("host", "db.internal");
        ctx.set("port", "5432");
        ctx
    }

    #[test]
    fn test_substitute_known_placeholders() {
        let ctx = context();
        assert_eq!(
            ctx.substitute("postgres://${host}:${port}/app"),
            "postgres://db.internal:5432/app"
        );
    }

    #[test]
    fn test_unknown_placeholder_left_literal() {
        let ctx = context();
        assert_eq!(ctx.substitute("${host}/${missing}"), "db.internal/${missing}");
    }

    #[test]
    fn test_substitution_is_idempotent() {
        let ctx = context();
        let once = ctx.substitute("http://${host}:${port}");
        let twice = ctx.substitute(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_unterminated_placeholder() {
        let ctx = context();
        assert_eq!(ctx.substitute("${host}:${port"), "db.internal:${port");
    }

    #[test]
    fn test_no_placeholders() {
        let ctx = context();
        assert_eq!(ctx.substitute("plain text"), "plain text");
        assert_eq!(ctx.substitute(""), "");
    }

    #[test]
    fn test_substitute_map() {
        let ctx = context();
        let mut config = HashMap::new();
        config.insert("url".to_string(), "https://${host}/health".to_string());
        config.insert("timeout".to_string(), "30".to_string());

        let resolved = ctx.substitute_map(&config);
        assert_eq!(resolved["url"], "https://db.internal/health");
        assert_eq!(resolved["timeout"], "30");
    }

    #[test]
    fn test_merge_overwrites() {
        let mut ctx = context();
        let mut outputs = HashMap::new();
        outputs.insert("port".to_string(), "6432".to_string());
        outputs.insert("replica".to_string(), "db-ro.internal".to_string());

        ctx.merge(&outputs);
        assert_eq!(ctx.get("port"), Some("6432"));
        assert_eq!(ctx.get("replica"), Some("db-ro.internal"));
    }
}
