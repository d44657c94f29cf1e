//! `key='value'` tags from SQL comments (`/* controller='users' */`).
//!
//! Block comments and `--` line comments are scanned; text inside string
//! literals and quoted identifiers is skipped. Words without `=` are ignored,
//! so `/* Sleep controller='test' */` yields just `controller`.

use std::collections::BTreeMap;

/// Extracts tags from every comment of `query`. Later keys overwrite earlier ones.
pub fn parse_comments(query: &str) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    for body in comment_bodies(query) {
        parse_tags(body, &mut tags);
    }
    tags
}

fn comment_bodies(query: &str) -> Vec<&str> {
    let bytes = query.as_bytes();
    let mut bodies = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            q @ (b'\'' | b'"' | b'`') => {
                i += 1;
                while i < bytes.len() && bytes[i] != q {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let start = i + 2;
                let end = query[start..]
                    .find("*/")
                    .map_or(query.len(), |off| start + off);
                bodies.push(&query[start..end]);
                i = end + 2;
            }
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let start = i + 2;
                let end = query[start..]
                    .find('\n')
                    .map_or(query.len(), |off| start + off);
                bodies.push(&query[start..end]);
                i = end + 1;
            }
            _ => i += 1,
        }
    }

    bodies
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

fn parse_tags(body: &str, tags: &mut BTreeMap<String, String>) {
    let chars: Vec<char> = body.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        if !is_key_char(chars[i]) {
            i += 1;
            continue;
        }
        let key_start = i;
        while i < chars.len() && is_key_char(chars[i]) {
            i += 1;
        }
        let key: String = chars[key_start..i].iter().collect();

        let mut j = i;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }
        if chars.get(j) != Some(&'=') {
            continue;
        }
        j += 1;
        while j < chars.len() && chars[j].is_whitespace() {
            j += 1;
        }

        let mut value = String::new();
        match chars.get(j) {
            Some(&q @ ('\'' | '"')) => {
                j += 1;
                while j < chars.len() && chars[j] != q {
                    if chars[j] == '\\' && j + 1 < chars.len() {
                        j += 1;
                    }
                    value.push(chars[j]);
                    j += 1;
                }
                j += 1;
            }
            _ => {
                while j < chars.len() && !chars[j].is_whitespace() && chars[j] != ',' {
                    value.push(chars[j]);
                    j += 1;
                }
            }
        }

        tags.insert(key, value);
        i = j;
    }
}
