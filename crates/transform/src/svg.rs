//! SVG sanitation and compatibility rewrites
//!
//! Sanitation walks the document token by token and rebuilds every kept
//! element; the `feDropShadow` rewrite works on the text with pre-compiled
//! patterns.

use crate::TransformError;
use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::sync::LazyLock;

static RE_DROP_SHADOW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<feDropShadow\b([^>]*?)/>|<feDropShadow\b([^>]*)>\s*</feDropShadow\s*>")
        .expect("valid feDropShadow regex")
});
static RE_ATTR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_:][-A-Za-z0-9_:.]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).expect("valid attr regex")
});

fn as_text(data: &[u8]) -> Result<&str, TransformError> {
    std::str::from_utf8(data).map_err(|_| TransformError::InvalidSvg)
}

fn malformed(err: quick_xml::Error) -> TransformError {
    TransformError::MalformedSvg(err.to_string())
}

fn is_name_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '-')
}

/// Leading run of name characters.
///
/// The tokenizer ends a tag name at whitespace only, so `<svg/onload=x>`
/// arrives as a single name; browsers read it as `svg` plus an attribute.
fn element_name(raw: &[u8]) -> Result<&str, TransformError> {
    let raw = std::str::from_utf8(raw).map_err(|_| TransformError::InvalidSvg)?;
    let end = raw.find(|c| !is_name_char(c)).unwrap_or(raw.len());
    Ok(&raw[..end])
}

fn local_part(name: &str) -> &str {
    name.rsplit(':').next().unwrap_or(name)
}

fn is_active_element(name: &str) -> bool {
    let local = local_part(name);
    name.is_empty()
        || local.eq_ignore_ascii_case("script")
        || local.eq_ignore_ascii_case("foreignObject")
}

/// `javascript:` after entity decoding, ignoring embedded whitespace and control characters
fn is_script_url(value: &str) -> bool {
    let scheme: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .take("javascript:".len())
        .collect();
    scheme.eq_ignore_ascii_case("javascript:")
}

fn clean_element(e: &BytesStart<'_>, name: &str) -> BytesStart<'static> {
    let mut clean = BytesStart::new(name.to_string());

    for attr in e.html_attributes().map_while(Result::ok) {
        let Ok(key) = std::str::from_utf8(attr.key.as_ref()) else {
            continue;
        };
        if key.is_empty() || !key.chars().all(is_name_char) {
            continue;
        }

        let local = local_part(key);
        if local.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("on")) {
            continue;
        }

        // Undecodable values are dropped along with script links
        let Ok(value) = attr.unescape_value() else {
            continue;
        };
        if local.eq_ignore_ascii_case("href") && is_script_url(&value) {
            continue;
        }

        clean.push_attribute((key, value.as_ref()));
    }

    clean
}

fn emit(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> Result<(), TransformError> {
    writer.write_event(event).map_err(malformed)
}

/// Remove scripts, `foreignObject` subtrees, event handler attributes,
/// `javascript:` links and DTDs
pub fn sanitize(data: &[u8]) -> Result<Vec<u8>, TransformError> {
    let text = as_text(data)?;

    let mut reader = Reader::from_str(text);
    reader.check_end_names(false);
    let mut writer = Writer::new(Vec::with_capacity(text.len()));

    // Open elements inside a dropped subtree
    let mut skip_depth = 0usize;

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Eof => break,
            Event::Start(e) => {
                let name = element_name(e.name().into_inner())?;
                if skip_depth > 0 || is_active_element(name) {
                    skip_depth += 1;
                    continue;
                }
                emit(&mut writer, Event::Start(clean_element(&e, name)))?;
            }
            Event::Empty(e) => {
                let name = element_name(e.name().into_inner())?;
                if skip_depth > 0 || is_active_element(name) {
                    continue;
                }
                emit(&mut writer, Event::Empty(clean_element(&e, name)))?;
            }
            Event::End(e) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                    continue;
                }
                let name = element_name(e.name().into_inner())?;
                if !name.is_empty() {
                    emit(&mut writer, Event::End(BytesEnd::new(name.to_string())))?;
                }
            }
            // Internal entities can expand into markup
            Event::DocType(_) => {}
            event => {
                if skip_depth == 0 {
                    emit(&mut writer, event)?;
                }
            }
        }
    }

    Ok(writer.into_inner())
}

fn parse_attrs(raw: &str) -> HashMap<String, String> {
    RE_ATTR
        .captures_iter(raw)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_string(), value.to_string())
        })
        .collect()
}

/// Expand `feDropShadow` (unsupported by most rasterizers) into the
/// equivalent blur/offset/flood/composite/merge chain.
///
/// Returns `None` when the document has nothing to rewrite.
pub fn fix_unsupported(data: &[u8]) -> Result<Option<Vec<u8>>, TransformError> {
    let text = as_text(data)?;
    if !RE_DROP_SHADOW.is_match(text) {
        return Ok(None);
    }

    let mut n = 0usize;
    let fixed = RE_DROP_SHADOW.replace_all(text, |caps: &Captures<'_>| {
        n += 1;
        let raw = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        let attrs = parse_attrs(raw);
        let attr = |name: &str, default: &str| {
            attrs.get(name).cloned().unwrap_or_else(|| default.to_string())
        };

        let input = attr("in", "SourceGraphic");
        let result = attrs
            .get("result")
            .map(|r| format!(r#" result="{r}""#))
            .unwrap_or_default();

        format!(
            concat!(
                r#"<feGaussianBlur in="{input}" stdDeviation="{std}" result="dsBlur{n}"/>"#,
                r#"<feOffset in="dsBlur{n}" dx="{dx}" dy="{dy}" result="dsOffset{n}"/>"#,
                r#"<feFlood flood-color="{color}" flood-opacity="{opacity}" result="dsFlood{n}"/>"#,
                r#"<feComposite in="dsFlood{n}" in2="dsOffset{n}" operator="in" result="dsShadow{n}"/>"#,
                r#"<feMerge{result}><feMergeNode in="dsShadow{n}"/><feMergeNode in="{input}"/></feMerge>"#,
            ),
            input = input,
            std = attr("stdDeviation", "2"),
            dx = attr("dx", "2"),
            dy = attr("dy", "2"),
            color = attr("flood-color", "black"),
            opacity = attr("flood-opacity", "1"),
            result = result,
            n = n,
        )
    });

    Ok(Some(fixed.into_owned().into_bytes()))
}
