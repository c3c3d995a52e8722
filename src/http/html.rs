//! HTML for pages the proxy generates itself.

use http::StatusCode;

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
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

/// Full page around an already-escaped HTML body
pub fn page(status: StatusCode, title: &str, body_html: &str) -> String {
    let title = escape_html(title);
    format!(
        "<!DOCTYPE html>\n<html>\n<head><meta charset=\"utf-8\"><title>{code} {title}</title></head>\n\
         <body>\n<h1>{title}</h1>\n{body}\n<hr>\n<address>{name}/{version}</address>\n</body>\n</html>\n",
        code = status.as_u16(),
        title = title,
        body = body_html,
        name = crate::NAME,
        version = crate::VERSION,
    )
}

/// Page with a single escaped paragraph
pub fn message_page(status: StatusCode, title: &str, message: &str) -> String {
    page(status, title, &format!("<p>{}</p>", escape_html(message)))
}
