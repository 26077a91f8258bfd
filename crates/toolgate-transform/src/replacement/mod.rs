//! Rule-driven regex substitution over outgoing text, with the completion-side pass
//! that maps backend output back.

pub mod settings;

use std::collections::HashMap;
use std::sync::Arc;

use regex::Regex;
use toolgate_protocol::openai::create_chat_completions::ChatMessage;

use crate::error::SettingsError;
pub use settings::{RuleSettings, load_pipeline, load_rules};

/// Role of the legacy single-prompt form.
pub const PROMPT_ROLE: &str = "prompt";
/// Role of rules run over backend output.
pub const COMPLETION_ROLE: &str = "completion";

const ROLES: &[&str] = &[
    "system",
    "developer",
    "user",
    "assistant",
    "tool",
    "function",
    PROMPT_ROLE,
    COMPLETION_ROLE,
];

/// Stands in for `{name}` placeholders when a templated pattern is checked at load.
const PROBE: &str = "probe";

/// Named groups captured per role.
type Captures = HashMap<String, HashMap<String, String>>;

#[derive(Debug, Clone)]
enum Pattern {
    Fixed(Regex),
    /// Contains `{name}` placeholders filled from captured values at request time.
    Templated(String),
}

#[derive(Debug, Clone)]
pub struct ReplacementRule {
    name: String,
    role: String,
    trigger: Option<String>,
    pattern: Pattern,
    /// `None` for capture rules.
    replace: Option<String>,
    refs: Vec<String>,
}

impl ReplacementRule {
    pub fn new(settings: RuleSettings, position: usize) -> Result<Self, SettingsError> {
        let name = settings.name.unwrap_or_else(|| format!("#{position}"));
        if !ROLES.contains(&settings.role.as_str()) {
            return Err(SettingsError::UnknownRole { rule: name, role: settings.role });
        }
        let pattern = if settings.refs.is_empty() {
            let regex = Regex::new(&settings.pattern)
                .map_err(|source| SettingsError::InvalidPattern { rule: name.clone(), source })?;
            Pattern::Fixed(regex)
        } else {
            Regex::new(&fill_placeholders(&settings.pattern, &|_| Some(PROBE.to_string())))
                .map_err(|source| SettingsError::InvalidPattern { rule: name.clone(), source })?;
            Pattern::Templated(settings.pattern)
        };
        Ok(Self {
            name,
            role: settings.role,
            trigger: settings.trigger,
            pattern,
            replace: settings.replace,
            refs: settings.refs,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> &str {
        &self.role
    }

    fn apply(&self, text: &str, captures: &mut Captures) -> String {
        if let Some(trigger) = &self.trigger {
            if !captures.values().any(|values| values.contains_key(trigger)) {
                return text.to_string();
            }
        }
        let referenced: HashMap<String, String> = self
            .refs
            .iter()
            .filter_map(|role| captures.get(role))
            .flat_map(|values| values.iter().map(|(key, value)| (key.clone(), value.clone())))
            .collect();
        if !self.refs.is_empty() && referenced.is_empty() {
            return text.to_string();
        }

        let regex = match &self.pattern {
            Pattern::Fixed(regex) => regex.clone(),
            Pattern::Templated(template) => {
                let source = fill_placeholders(template, &|key| referenced.get(key).map(|value| regex::escape(value)));
                match Regex::new(&source) {
                    Ok(regex) => regex,
                    Err(err) => {
                        tracing::warn!(event = "replacement_skipped", rule = %self.name, error = %err);
                        return text.to_string();
                    }
                }
            }
        };

        let Some(replace) = &self.replace else {
            if let Some(found) = regex.captures(text) {
                let values = captures.entry(self.role.clone()).or_default();
                for group in regex.capture_names().flatten() {
                    if let Some(value) = found.name(group) {
                        values.insert(group.to_string(), value.as_str().to_string());
                    }
                }
            }
            return text.to_string();
        };
        let template = if self.refs.is_empty() {
            replace.clone()
        } else {
            fill_placeholders(replace, &|key| referenced.get(key).map(|value| value.replace('$', "$$")))
        };
        regex.replace_all(text, translate_template(&template).as_str()).into_owned()
    }
}

/// Substitutes `{name}` placeholders via `lookup`; `{{` and `}}` are literal braces,
/// and placeholders `lookup` does not know are kept as written.
fn fill_placeholders(template: &str, lookup: &dyn Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(pos) = rest.find(['{', '}']) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos..];
        if rest.starts_with("{{") || rest.starts_with("}}") {
            out.push_str(&rest[..1]);
            rest = &rest[2..];
            continue;
        }
        if rest.starts_with('{') {
            if let Some(end) = rest.find('}') {
                let key = &rest[1..end];
                let is_name = !key.is_empty() && key.chars().all(|c| c.is_alphanumeric() || c == '_');
                if let Some(value) = is_name.then(|| lookup(key)).flatten() {
                    out.push_str(&value);
                    rest = &rest[end + 1..];
                    continue;
                }
            }
        }
        out.push_str(&rest[..1]);
        rest = &rest[1..];
    }
    out.push_str(rest);
    out
}

/// Backslash group references (`\1`, `\g<name>`) and escapes to the `regex` crate's
/// `${1}` / `${name}` syntax.
fn translate_template(template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some(digit) if digit.is_ascii_digit() => {
                let mut group = String::new();
                while let Some(digit) = chars.peek().copied().filter(char::is_ascii_digit) {
                    group.push(digit);
                    chars.next();
                }
                out.push_str(&format!("${{{group}}}"));
            }
            Some('g') => {
                chars.next();
                if chars.peek() == Some(&'<') {
                    chars.next();
                    let group: String = chars.by_ref().take_while(|c| *c != '>').collect();
                    out.push_str(&format!("${{{group}}}"));
                } else {
                    out.push_str("\\g");
                }
            }
            Some('n') => {
                chars.next();
                out.push('\n');
            }
            Some('t') => {
                chars.next();
                out.push('\t');
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            _ => out.push('\\'),
        }
    }
    out
}

fn apply_rules(rules: &[ReplacementRule], text: &str, captures: &mut Captures, role: &str) -> String {
    rules
        .iter()
        .filter(|rule| rule.role == role)
        .fold(text.to_string(), |text, rule| rule.apply(&text, captures))
}

/// Process-wide rule set, shared read-only by every request.
#[derive(Debug, Clone, Default)]
pub struct ReplacementPipeline {
    rules: Arc<[ReplacementRule]>,
}

impl ReplacementPipeline {
    pub fn new(rules: Vec<ReplacementRule>) -> Self {
        Self { rules: rules.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[ReplacementRule] {
        &self.rules
    }

    /// Rewrites message texts in order. Captures of a role are reset whenever a message
    /// of that role is reached, so the latest message of each role wins.
    pub fn apply_outbound_messages(&self, messages: &mut [ChatMessage]) -> CompletionTransform {
        let mut captures = Captures::new();
        for message in messages.iter_mut() {
            let role = message.role.as_str();
            captures.remove(role);
            if let Some(content) = message.content.as_mut() {
                content.map_text(|text| apply_rules(&self.rules, text, &mut captures, role));
            }
        }
        self.completion_transform(captures)
    }

    pub fn apply_outbound_prompt(&self, prompt: &str) -> (String, CompletionTransform) {
        let mut captures = Captures::new();
        let prompt = apply_rules(&self.rules, prompt, &mut captures, PROMPT_ROLE);
        (prompt, self.completion_transform(captures))
    }

    /// Batch prompts are rewritten one by one; like messages of one role, the last
    /// prompt's captures are the ones the completion side sees.
    pub fn apply_outbound_prompts(&self, prompts: &[String]) -> (Vec<String>, CompletionTransform) {
        let mut captures = Captures::new();
        let prompts = prompts
            .iter()
            .map(|prompt| {
                captures.remove(PROMPT_ROLE);
                apply_rules(&self.rules, prompt, &mut captures, PROMPT_ROLE)
            })
            .collect();
        (prompts, self.completion_transform(captures))
    }

    fn completion_transform(&self, captures: Captures) -> CompletionTransform {
        CompletionTransform {
            rules: self.rules.clone(),
            captures,
        }
    }
}

/// Completion-side pass bound to the captures of one outgoing request.
#[derive(Debug, Clone, Default)]
pub struct CompletionTransform {
    rules: Arc<[ReplacementRule]>,
    captures: Captures,
}

impl CompletionTransform {
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, text: &str) -> String {
        if self.rules.is_empty() {
            return text.to_string();
        }
        apply_rules(&self.rules, text, &mut self.captures, COMPLETION_ROLE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use toolgate_protocol::openai::create_chat_completions::Role;

    fn rule(value: serde_json::Value) -> ReplacementRule {
        ReplacementRule::new(serde_json::from_value(value).expect("settings"), 0).expect("rule")
    }

    #[test]
    fn rules_apply_in_order_per_role() {
        let pipeline = ReplacementPipeline::new(vec![
            rule(json!({ "role": "user", "pattern": "cat", "replace": "dog" })),
            rule(json!({ "role": "user", "pattern": "dog", "replace": "wolf" })),
            rule(json!({ "role": "system", "pattern": "cat", "replace": "lion" })),
        ]);
        let mut messages = vec![ChatMessage::new(Role::System, "cat"), ChatMessage::new(Role::User, "a cat")];
        pipeline.apply_outbound_messages(&mut messages);
        assert_eq!(messages[0].text().as_deref(), Some("lion"));
        assert_eq!(messages[1].text().as_deref(), Some("a wolf"));
    }

    #[test]
    fn captured_values_drive_the_completion_mapping() {
        let pipeline = ReplacementPipeline::new(vec![
            rule(json!({ "role": "system", "pattern": "user is (?P<real>\\w+)" })),
            rule(json!({ "role": "system", "pattern": "{real}", "replace": "ANON", "ref": ["system"] })),
            rule(json!({ "role": "completion", "pattern": "ANON", "replace": "{real}", "ref": ["system"] })),
        ]);
        let mut messages = vec![ChatMessage::new(Role::System, "The user is alice. Greet alice.")];
        let mut transform = pipeline.apply_outbound_messages(&mut messages);
        assert_eq!(messages[0].text().as_deref(), Some("The user is ANON. Greet ANON."));
        assert_eq!(transform.apply("Hello ANON!"), "Hello alice!");
    }

    #[test]
    fn later_message_of_a_role_replaces_its_captures() {
        let pipeline = ReplacementPipeline::new(vec![
            rule(json!({ "role": "user", "pattern": "id=(?P<id>\\d+)" })),
            rule(json!({ "role": "completion", "pattern": "ID", "replace": "{id}", "ref": ["user"] })),
        ]);
        let mut messages = vec![ChatMessage::new(Role::User, "id=1"), ChatMessage::new(Role::User, "no id here")];
        let mut transform = pipeline.apply_outbound_messages(&mut messages);
        assert_eq!(transform.apply("ID"), "ID");
    }

    #[test]
    fn trigger_gates_a_rule() {
        let pipeline = ReplacementPipeline::new(vec![
            rule(json!({ "role": "prompt", "pattern": "(?P<mode>secret)" })),
            rule(json!({ "role": "completion", "trigger": "mode", "pattern": "x", "replace": "y" })),
            rule(json!({ "role": "completion", "trigger": "other", "pattern": "y", "replace": "z" })),
        ]);
        let (prompt, mut transform) = pipeline.apply_outbound_prompt("a secret prompt");
        assert_eq!(prompt, "a secret prompt");
        assert_eq!(transform.apply("xx"), "yy");
    }

    #[test]
    fn backslash_templates_are_translated() {
        let pipeline = ReplacementPipeline::new(vec![rule(json!({
            "role": "prompt",
            "pattern": "(?P<first>\\w+) (\\w+)",
            "replace": "\\2 \\g<first>"
        }))]);
        let (prompt, _) = pipeline.apply_outbound_prompt("hello world");
        assert_eq!(prompt, "world hello");
        assert_eq!(translate_template("a\\nb$1"), "a\nb$1");
    }

    #[test]
    fn invalid_patterns_and_roles_are_rejected() {
        let settings: RuleSettings = serde_json::from_value(json!({ "role": "user", "pattern": "(" })).expect("settings");
        assert!(matches!(ReplacementRule::new(settings, 3), Err(SettingsError::InvalidPattern { rule, .. }) if rule == "#3"));
        let settings: RuleSettings = serde_json::from_value(json!({ "role": "robot", "pattern": "a" })).expect("settings");
        assert!(matches!(ReplacementRule::new(settings, 0), Err(SettingsError::UnknownRole { .. })));
        let settings: RuleSettings =
            serde_json::from_value(json!({ "role": "user", "pattern": "{v}(", "ref": ["user"] })).expect("settings");
        assert!(ReplacementRule::new(settings, 0).is_err());
    }

    #[test]
    fn placeholders_keep_unknown_and_escaped_braces() {
        let filled = fill_placeholders("{a} {{b}} {c} x{2,3}", &|key| (key == "a").then(|| "A".to_string()));
        assert_eq!(filled, "A {b} {c} x{2,3}");
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let (prompt, mut transform) = ReplacementPipeline::default().apply_outbound_prompt("same");
        assert_eq!(prompt, "same");
        assert_eq!(transform.apply("text"), "text");
    }
}
