//! Touch content rendering — `{{variable}}` substitution against the
//! enrollment context.

/// Render a content template against an enrollment context object.
///
/// Placeholders use `{{key}}` syntax and resolve against top-level string
/// (or stringifiable scalar) keys of the context. Unknown placeholders are
/// replaced with the empty string so a partially filled context never leaks
/// raw template syntax to a contact.
pub fn render(template: &str, context: &serde_json::Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                if let Some(value) = lookup(context, key) {
                    result.push_str(&value);
                }
                rest = &after[end + 2..];
            }
            None => {
                // Unterminated placeholder, emit as-is.
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn lookup(context: &serde_json::Value, key: &str) -> Option<String> {
    let value = context.as_object()?.get(key)?;
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Merge `extra` over `base`, returning a new context object. Non-object
/// inputs fall back to whichever side is an object.
pub fn merge_context(base: &serde_json::Value, extra: &serde_json::Value) -> serde_json::Value {
    match (base.as_object(), extra.as_object()) {
        (Some(b), Some(e)) => {
            let mut merged = b.clone();
            for (k, v) in e {
                merged.insert(k.clone(), v.clone());
            }
            serde_json::Value::Object(merged)
        }
        (Some(_), None) => base.clone(),
        (None, Some(_)) => extra.clone(),
        (None, None) => serde_json::json!({}),
    }
}
