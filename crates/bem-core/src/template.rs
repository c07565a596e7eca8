//! `{placeholder}` substitution for field mappings and notifier arguments.

/// Render `template`, replacing each `{key}` with `lookup(key)`.
/// Unknown keys render empty; `{{` and `}}` produce literal braces.
pub fn render<F>(template: &str, lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut key = String::new();
                let mut closed = false;
                for k in chars.by_ref() {
                    if k == '}' {
                        closed = true;
                        break;
                    }
                    key.push(k);
                }
                if closed {
                    if let Some(value) = lookup(key.trim()) {
                        out.push_str(&value);
                    }
                } else {
                    // Unterminated placeholder stays literal
                    out.push('{');
                    out.push_str(&key);
                }
            }
            _ => out.push(c),
        }
    }
    out
}
