use std::borrow::Cow;

const QUERY_KEYS: [&str; 4] = ["token=", "access=", "refresh=", "password="];
const JSON_KEYS: [&str; 3] = ["\"access\"", "\"refresh\"", "\"password\""];

/// Masks credential-bearing query parameters (`?token=...`) in URLs and
/// error strings.
pub fn redact_query_tokens(input: &str) -> Cow<'_, str> {
    let mut redacted = input.to_string();

    for key in QUERY_KEYS {
        if find_ascii_case_insensitive(&redacted, key).is_none() {
            continue;
        }
        let mut out = String::with_capacity(redacted.len());
        let mut rest = redacted.as_str();
        while let Some(idx) = find_ascii_case_insensitive(rest, key) {
            let end = idx + key.len();
            out.push_str(&rest[..end]);
            rest = &rest[end..];

            // Only whole parameter names: `access_token=` is caught by `token=`
            // but `mytoken=` inside a path segment is not a parameter.
            let start = out.len() - key.len();
            let boundary =
                start == 0 || matches!(out.as_bytes()[start - 1], b'?' | b'&' | b' ' | b'_');
            if !boundary {
                continue;
            }

            let mut consumed = 0;
            for ch in rest.chars() {
                if ch == '&' || ch == '#' || ch == '"' || ch.is_whitespace() {
                    break;
                }
                consumed += ch.len_utf8();
            }
            if consumed > 0 {
                out.push_str("REDACTED");
            }
            rest = &rest[consumed..];
        }
        out.push_str(rest);
        redacted = out;
    }

    if redacted == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(redacted)
    }
}

/// Masks the string value of `"access"`, `"refresh"` and `"password"` keys in
/// JSON text such as echoed request bodies.
fn redact_json_fields(text: String) -> String {
    let mut text = text;
    for key in JSON_KEYS {
        if !text.contains(key) {
            continue;
        }
        let mut out = String::with_capacity(text.len());
        let mut rest = text.as_str();
        while let Some(idx) = rest.find(key) {
            let end = idx + key.len();
            out.push_str(&rest[..end]);
            rest = &rest[end..];

            let trimmed = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
            let Some(value) = trimmed.strip_prefix('"') else {
                continue;
            };
            let Some(close) = value.find('"') else {
                continue;
            };
            out.push_str(&rest[..rest.len() - trimmed.len()]);
            out.push_str("\"REDACTED\"");
            rest = &value[close + 1..];
        }
        out.push_str(rest);
        text = out;
    }
    text
}

fn find_ascii_case_insensitive(haystack: &str, needle: &str) -> Option<usize> {
    let hay = haystack.as_bytes();
    let nee = needle.as_bytes();
    if nee.is_empty() {
        return Some(0);
    }
    if nee.len() > hay.len() {
        return None;
    }

    (0..=hay.len() - nee.len()).find(|&i| hay[i..i + nee.len()].eq_ignore_ascii_case(nee))
}

fn redact_header_value(text: String, header: &str, replacement: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text.as_str();
    loop {
        let Some(idx) = find_ascii_case_insensitive(rest, header) else {
            out.push_str(rest);
            break;
        };
        out.push_str(&rest[..idx]);
        rest = &rest[idx..];

        out.push_str(&rest[..header.len()]);
        rest = &rest[header.len()..];

        if let Some(first) = rest.chars().next() {
            if first == ' ' {
                out.push(' ');
                rest = &rest[first.len_utf8()..];
            }
        }

        // Consume until end-of-line.
        let mut consumed = 0;
        for ch in rest.chars() {
            if ch == '\n' || ch == '\r' {
                break;
            }
            consumed += ch.len_utf8();
        }
        out.push_str(replacement);
        rest = &rest[consumed..];
    }
    out
}

pub fn redact_secrets(input: &str) -> Cow<'_, str> {
    let mut value = redact_query_tokens(input).into_owned();

    value = redact_header_value(value, "Authorization: Bearer", "REDACTED");
    value = redact_json_fields(value);

    if value == input {
        Cow::Borrowed(input)
    } else {
        Cow::Owned(value)
    }
}
