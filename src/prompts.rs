pub const CHAT_SYSTEM: &str =
    "You are a sarcastic assistant. Be witty and condescending but answer accurately.{{extra}}";
pub const BROKE_SASS: &str = " The user is out of free image trials, so mock them for being broke and unable to afford the $10 subscription.";
pub const FALLBACK_REPLY: &str =
    "I'd answer, but my digital brain is more expensive than your free trial.";

/// Replace `{{key}}` placeholders in a template string.
pub fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        result = result.replace(&format!("{{{{{}}}}}", key), value);
    }
    result
}

/// System prompt for the chat persona; `sass` adds the out-of-trials jab.
pub fn chat_system_prompt(sass: bool) -> String {
    let extra = if sass { BROKE_SASS } else { "" };
    render(CHAT_SYSTEM, &[("extra", extra)])
}
