///! XML encoding for the generic `json::JsonValue` universe used
///! elsewhere for JSON, including the `classified::ClassifiedJson`
///! `{__c, __p}` wrapper that carries a registered class hint.
///!
///! Hand-rolled writer and reader: no XML-serialization crate exists
///! anywhere in the dependency graph (`roxmltree` is parse-only).  The
///! tag grammar mirrors the original implementation's `net_obj.py`
///! `to_xml()`: `null`, `string`, `number`, `boolean value="..."`,
///! `array`, and `object` (with `element key="..."` children), either
///! of the latter two optionally carrying a `class_hint` attribute.
use super::classified::ClassifiedJson;

/// Serializes a JsonValue -- plain or class-hinted -- to the OpenSRF
/// XML tag grammar.
pub fn to_xml(value: &json::JsonValue) -> String {
    let mut buf = String::new();
    write_value(value, &mut buf);
    buf
}

fn write_value(value: &json::JsonValue, buf: &mut String) {
    if let Some(wrapper) = ClassifiedJson::declassify(value) {
        write_classified(wrapper.class(), wrapper.json(), buf);
        return;
    }

    match value {
        json::JsonValue::Null => buf.push_str("<null/>"),
        json::JsonValue::Boolean(b) => {
            buf.push_str(&format!("<boolean value=\"{}\"/>", b));
        }
        json::JsonValue::Short(_) | json::JsonValue::String(_) => {
            buf.push_str("<string>");
            buf.push_str(&quote_plus(value.as_str().unwrap_or("")));
            buf.push_str("</string>");
        }
        json::JsonValue::Number(_) => {
            buf.push_str("<number>");
            buf.push_str(&value.dump());
            buf.push_str("</number>");
        }
        json::JsonValue::Array(arr) => {
            buf.push_str("<array>");
            for item in arr {
                write_value(item, buf);
            }
            buf.push_str("</array>");
        }
        json::JsonValue::Object(_) => {
            buf.push_str("<object>");
            for (key, val) in value.entries() {
                buf.push_str(&format!("<element key=\"{}\">", escape_attr(key)));
                write_value(val, buf);
                buf.push_str("</element>");
            }
            buf.push_str("</object>");
        }
    }
}

fn write_classified(hint: &str, payload: &json::JsonValue, buf: &mut String) {
    match payload {
        json::JsonValue::Array(arr) => {
            buf.push_str(&format!("<array class_hint=\"{}\">", escape_attr(hint)));
            for item in arr {
                write_value(item, buf);
            }
            buf.push_str("</array>");
        }
        json::JsonValue::Object(_) => {
            buf.push_str(&format!("<object class_hint=\"{}\">", escape_attr(hint)));
            for (key, val) in payload.entries() {
                buf.push_str(&format!("<element key=\"{}\">", escape_attr(key)));
                write_value(val, buf);
                buf.push_str("</element>");
            }
            buf.push_str("</object>");
        }
        // A classified payload is always a hash or array per the
        // registry protocol; fall back to plain encoding for
        // anything else rather than lose the value.
        other => write_value(other, buf),
    }
}

/// Parses a single OpenSRF XML-encoded value back into a JsonValue,
/// re-wrapping any `class_hint`-bearing element as a `{__c, __p}`
/// classified value so callers (`Message::from_json_value`, etc.) can
/// treat XML- and JSON-sourced messages identically.
pub fn from_xml(xml: &str) -> Result<json::JsonValue, String> {
    let doc =
        roxmltree::Document::parse(xml).or_else(|e| Err(format!("Error parsing XML: {e}")))?;

    let root = doc.root_element();
    Ok(node_to_value(&root))
}

fn node_to_value(node: &roxmltree::Node) -> json::JsonValue {
    match node.tag_name().name() {
        "null" => json::JsonValue::Null,

        "string" => match node.text() {
            Some(t) if !t.is_empty() => json::from(unquote_plus(t)),
            _ => json::JsonValue::Null,
        },

        "number" => match node.text() {
            Some(t) if !t.is_empty() => parse_number(t),
            _ => json::JsonValue::Null,
        },

        "boolean" => {
            let is_true = node.attribute("value").map(|v| v == "true").unwrap_or(false);
            json::JsonValue::Boolean(is_true)
        }

        "array" => {
            let mut arr = json::JsonValue::new_array();
            for child in node.children().filter(|c| c.is_element()) {
                arr.push(node_to_value(&child)).ok();
            }

            match node.attribute("class_hint") {
                Some(hint) => ClassifiedJson::classify(&arr, hint),
                None => arr,
            }
        }

        "object" => {
            let mut obj = json::JsonValue::new_object();
            for elem in node.children().filter(|c| c.has_tag_name("element")) {
                let key = match elem.attribute("key") {
                    Some(k) => k,
                    None => continue,
                };

                let value = match elem.children().filter(|c| c.is_element()).next() {
                    Some(child) => node_to_value(&child),
                    None => json::JsonValue::Null,
                };

                obj.insert(key, value).ok();
            }

            match node.attribute("class_hint") {
                Some(hint) => ClassifiedJson::classify(&obj, hint),
                None => obj,
            }
        }

        _ => json::JsonValue::Null,
    }
}

fn parse_number(text: &str) -> json::JsonValue {
    if let Ok(i) = text.parse::<i64>() {
        return json::from(i);
    }
    match text.parse::<f64>() {
        Ok(f) => json::from(f),
        Err(_) => json::JsonValue::Null,
    }
}

/// Minimal attribute escaper for the handful of characters that would
/// otherwise break a double-quoted XML attribute.
fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// application/x-www-form-urlencoded "quote_plus": spaces become `+`,
/// everything outside the unreserved set is percent-encoded.
pub fn quote_plus(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Inverse of `quote_plus`: `+` becomes a space, `%XX` sequences
/// decode to their byte value.
pub fn unquote_plus(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out: Vec<u8> = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classified::Protocol;

    #[test]
    fn round_trips_plain_values() {
        let value = json::object! {
            name: "hi there",
            count: 3,
            tags: ["a", "b"],
            active: true,
            missing: json::JsonValue::Null,
        };

        let xml = to_xml(&value);
        let back = from_xml(&xml).unwrap();

        assert_eq!(back["name"], "hi there");
        assert_eq!(back["count"], 3);
        assert_eq!(back["tags"][0], "a");
        assert_eq!(back["active"], true);
        assert!(back["missing"].is_null());
    }

    #[test]
    fn round_trips_classified_hash() {
        let obj = json::object! { status: "OK", statusCode: 200 };
        let wire = ClassifiedJson::classify(&obj, "osrfResult");

        let xml = to_xml(&wire);
        assert!(xml.contains("class_hint=\"osrfResult\""));

        let back = from_xml(&xml).unwrap();
        let wrapper = ClassifiedJson::declassify(&back).unwrap();
        assert_eq!(wrapper.class(), "osrfResult");
        assert_eq!(wrapper.json()["status"], "OK");
        assert_eq!(wrapper.json()["statusCode"], 200);
    }

    #[test]
    fn round_trips_classified_array_positionally() {
        let mut reg = crate::classified::Registry::new();
        reg.register_hint("aou", vec!["id", "name"], Protocol::Array);

        let fields = json::object! { id: 7, name: "Branch" };
        let wire = reg.encode_array("aou", &fields);

        let xml = to_xml(&wire);
        let back = from_xml(&xml).unwrap();

        let (hint, decoded) = reg.decode(&back).unwrap();
        assert_eq!(hint, "aou");
        assert_eq!(decoded["id"], 7);
        assert_eq!(decoded["name"], "Branch");
    }
}
