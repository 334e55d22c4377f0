use std::collections::HashMap;
use std::sync::RwLock;

use crate::error::{NotifyError, Result};
use crate::models::Priority;

/// A named notification template. Patterns use `{{ path.to.key }}`
/// substitution over a JSON context; missing keys render as empty so a
/// producer forgetting a field can never crash the pipeline.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub title: String,
    pub body_html: String,
    pub body_text: String,
    pub action_url: Option<String>,
    pub action_text: Option<String>,
    pub priority: Priority,
    pub expiry_minutes: i64,
}

#[derive(Debug, Clone)]
pub struct Rendered {
    pub title: String,
    pub body_html: String,
    pub body_text: String,
    pub action_url: Option<String>,
    pub action_text: Option<String>,
    pub priority: Priority,
    pub expiry_minutes: i64,
}

pub struct TemplateRegistry {
    templates: RwLock<HashMap<String, Template>>,
}

impl TemplateRegistry {
    pub fn new() -> Self {
        Self {
            templates: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-loaded with the bootstrap template set.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        for template in builtin_templates() {
            registry.register(template);
        }
        registry
    }

    pub fn register(&self, template: Template) {
        self.templates
            .write()
            .expect("template registry lock poisoned")
            .insert(template.name.clone(), template);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.templates
            .read()
            .expect("template registry lock poisoned")
            .contains_key(name)
    }

    pub fn render(&self, name: &str, context: &serde_json::Value) -> Result<Rendered> {
        let templates = self
            .templates
            .read()
            .expect("template registry lock poisoned");
        let template = templates
            .get(name)
            .ok_or_else(|| NotifyError::TemplateMissing(name.to_string()))?;

        let action_url = template
            .action_url
            .as_deref()
            .map(|p| render_pattern(p, context))
            .filter(|u| !u.is_empty());

        Ok(Rendered {
            title: render_pattern(&template.title, context),
            body_html: render_pattern(&template.body_html, context),
            body_text: render_pattern(&template.body_text, context),
            action_url,
            action_text: template.action_text.clone(),
            priority: template.priority,
            expiry_minutes: template.expiry_minutes,
        })
    }
}

impl Default for TemplateRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Substitute `{{ path.to.key }}` and `{{ key | default:"text" }}`
/// references. Undefined values render as the default, or empty.
/// Anything that is not a well-formed reference passes through verbatim.
pub fn render_pattern(pattern: &str, context: &serde_json::Value) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut rest = pattern;

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        match after.find("}}") {
            Some(close) => {
                out.push_str(&render_reference(&after[..close], context));
                rest = &after[close + 2..];
            }
            None => {
                // Unterminated reference; emit literally
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

fn render_reference(reference: &str, context: &serde_json::Value) -> String {
    let (path, default) = match reference.split_once('|') {
        Some((path, filter)) => (path.trim(), parse_default(filter)),
        None => (reference.trim(), None),
    };

    lookup(context, path)
        .map(value_to_string)
        .filter(|s| !s.is_empty())
        .or(default)
        .unwrap_or_default()
}

/// Parse a `default:"text"` filter; anything else yields no default.
fn parse_default(filter: &str) -> Option<String> {
    let rest = filter.trim().strip_prefix("default:")?.trim();
    let rest = rest.strip_prefix('"')?;
    let end = rest.rfind('"')?;
    Some(rest[..end].to_string())
}

fn lookup<'a>(context: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = context;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

fn template(
    name: &str,
    title: &str,
    body: &str,
    action_url: Option<&str>,
    action_text: Option<&str>,
    priority: Priority,
) -> Template {
    Template {
        name: name.to_string(),
        title: title.to_string(),
        body_html: format!("<p>{}</p>", body),
        body_text: body.to_string(),
        action_url: action_url.map(str::to_string),
        action_text: action_text.map(str::to_string),
        priority,
        expiry_minutes: 1440,
    }
}

/// Bootstrap template set, one per event binding plus the digest shell.
pub fn builtin_templates() -> Vec<Template> {
    vec![
        template(
            "welcome",
            "Welcome to TuneDrop, {{ user.first_name | default:\"there\" }}!",
            "Hi {{ user.first_name | default:\"there\" }}, your account is ready. \
             Upload your first song and start distributing.",
            Some("/dashboard"),
            Some("Go to dashboard"),
            Priority::Normal,
        ),
        template(
            "admin-new-user",
            "New user signup: {{ user.email }}",
            "A new user ({{ user.email }}) just joined the platform.",
            Some("/admin/users/{{ user.id }}"),
            Some("View user"),
            Priority::Normal,
        ),
        template(
            "song-submitted",
            "\"{{ song.title | default:\"Your song\" }}\" was submitted for review",
            "We received \"{{ song.title | default:\"your song\" }}\" and our team \
             will review it shortly.",
            Some("/songs/{{ song.id }}"),
            Some("View song"),
            Priority::Normal,
        ),
        template(
            "song-approved",
            "\"{{ song.title | default:\"Your song\" }}\" was approved",
            "Good news! \"{{ song.title | default:\"your song\" }}\" passed review \
             and is queued for distribution.",
            Some("/songs/{{ song.id }}"),
            Some("View song"),
            Priority::High,
        ),
        template(
            "song-rejected",
            "\"{{ song.title | default:\"Your song\" }}\" needs changes",
            "\"{{ song.title | default:\"Your song\" }}\" was not approved: \
             {{ song.rejection_reason | default:\"see the review notes\" }}.",
            Some("/songs/{{ song.id }}"),
            Some("View feedback"),
            Priority::High,
        ),
        template(
            "song-distributed",
            "\"{{ song.title | default:\"Your song\" }}\" is live",
            "\"{{ song.title | default:\"Your song\" }}\" has been distributed to \
             stores and is now live.",
            Some("/songs/{{ song.id }}"),
            Some("View song"),
            Priority::High,
        ),
        template(
            "payment-received",
            "Payment received",
            "We received your payment of {{ payment.amount }} {{ payment.currency | default:\"NGN\" }} \
             for the {{ payment.tier | default:\"standard\" }} plan. Thank you!",
            Some("/billing"),
            Some("View billing"),
            Priority::High,
        ),
        template(
            "payment-failed",
            "Payment failed",
            "Your payment of {{ payment.amount }} {{ payment.currency | default:\"NGN\" }} \
             could not be processed: {{ payment.failure_reason | default:\"please try again\" }}.",
            Some("/billing"),
            Some("Retry payment"),
            Priority::Urgent,
        ),
        template(
            "contact-received",
            "New contact message from {{ contact.name | default:\"a visitor\" }}",
            "{{ contact.name | default:\"A visitor\" }} ({{ contact.email }}) wrote: \
             {{ contact.message }}",
            Some("/admin/contacts/{{ contact.id }}"),
            Some("View message"),
            Priority::Normal,
        ),
        template(
            "contact-replied",
            "We replied to your message",
            "Our team responded to your message \
             \"{{ contact.subject | default:\"(no subject)\" }}\". Check your inbox.",
            None,
            None,
            Priority::Normal,
        ),
        template(
            "referral-credit",
            "You earned a free upload credit!",
            "{{ referral.paid_count }} of your referrals have gone paid. \
             A free upload credit was added to your account.",
            Some("/referrals"),
            Some("View referrals"),
            Priority::Normal,
        ),
        template(
            "digest",
            "Your {{ digest.frequency }} TuneDrop update ({{ digest.count }} notifications)",
            "Here is what happened since your last update:\n{{ digest.items }}",
            Some("/notifications"),
            Some("Open notifications"),
            Priority::Low,
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn substitutes_nested_paths() {
        let ctx = json!({"user": {"first_name": "Ada", "stats": {"songs": 3}}});
        assert_eq!(
            render_pattern("Hello {{ user.first_name }}, {{ user.stats.songs }} songs", &ctx),
            "Hello Ada, 3 songs"
        );
    }

    #[test]
    fn missing_keys_render_empty_and_never_fail() {
        let ctx = json!({});
        assert_eq!(render_pattern("a {{ nope.deep.path }} b", &ctx), "a  b");
        assert_eq!(render_pattern("{{ also_missing }}", &ctx), "");
    }

    #[test]
    fn default_filter_applies_on_missing_or_empty() {
        let ctx = json!({"name": "", "real": "x"});
        assert_eq!(
            render_pattern("hi {{ name | default:\"friend\" }}", &ctx),
            "hi friend"
        );
        assert_eq!(
            render_pattern("hi {{ missing | default:\"friend\" }}", &ctx),
            "hi friend"
        );
        assert_eq!(render_pattern("hi {{ real | default:\"friend\" }}", &ctx), "hi x");
    }

    #[test]
    fn unterminated_reference_passes_through() {
        let ctx = json!({});
        assert_eq!(render_pattern("broken {{ ref", &ctx), "broken {{ ref");
    }

    #[test]
    fn render_missing_template_errors() {
        let registry = TemplateRegistry::with_builtins();
        let err = registry.render("no-such-template", &json!({})).unwrap_err();
        assert!(matches!(err, NotifyError::TemplateMissing(_)));
    }

    #[test]
    fn builtins_survive_empty_context() {
        // every builtin must produce non-empty title and body with no context
        let registry = TemplateRegistry::with_builtins();
        for t in builtin_templates() {
            let rendered = registry.render(&t.name, &json!({})).unwrap();
            assert!(!rendered.title.trim().is_empty(), "empty title for {}", t.name);
            assert!(!rendered.body_text.trim().is_empty(), "empty body for {}", t.name);
        }
    }

    #[test]
    fn welcome_title_mentions_user() {
        let registry = TemplateRegistry::with_builtins();
        let rendered = registry
            .render("welcome", &json!({"user": {"first_name": "Ada"}}))
            .unwrap();
        assert!(rendered.title.contains("Ada"));
        assert!(rendered.title.contains("Welcome"));
        assert_eq!(rendered.priority, Priority::Normal);
    }
}
