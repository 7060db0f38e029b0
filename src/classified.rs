/// Encode / Decode JSON values with class names, plus a process-wide
/// registry mapping class hints to their declared key order and wire
/// protocol (hash vs array).

use std::collections::HashMap;

const JSON_CLASS_KEY: &str = "__c";
const JSON_PAYLOAD_KEY: &str = "__p";

/// Unregistered class hints fall back to this bucket: an opaque hash
/// with no declared keys, which preserves fields without losing
/// round-trip fidelity.
const UNKNOWN_HINT: &str = "__unknown";

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    Hash,
    Array,
}

/// One registered class: its wire hint, the ordered list of field
/// names it carries, and whether those fields travel as a keyed
/// object or a positional array.
#[derive(Debug, Clone)]
pub struct ClassHint {
    hint: String,
    keys: Vec<String>,
    protocol: Protocol,
}

impl ClassHint {
    pub fn new(hint: &str, keys: Vec<&str>, protocol: Protocol) -> Self {
        ClassHint {
            hint: hint.to_string(),
            keys: keys.into_iter().map(|k| k.to_string()).collect(),
            protocol,
        }
    }

    pub fn hint(&self) -> &str {
        &self.hint
    }

    pub fn keys(&self) -> &Vec<String> {
        &self.keys
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }
}

/// Process-wide table of registered class hints.
///
/// Mirrors the dynamic `register_hint()` registry in the Python/C
/// implementations, but is built once at startup and threaded through
/// explicitly rather than held as a global mutable singleton.
#[derive(Debug, Clone)]
pub struct Registry {
    hints: HashMap<String, ClassHint>,
}

impl Registry {
    pub fn new() -> Self {
        let mut hints = HashMap::new();
        hints.insert(
            UNKNOWN_HINT.to_string(),
            ClassHint::new(UNKNOWN_HINT, vec![], Protocol::Hash),
        );
        Registry { hints }
    }

    pub fn register_hint(&mut self, hint: &str, keys: Vec<&str>, protocol: Protocol) {
        self.hints
            .insert(hint.to_string(), ClassHint::new(hint, keys, protocol));
    }

    pub fn get(&self, hint: &str) -> Option<&ClassHint> {
        self.hints.get(hint)
    }

    pub fn is_registered(&self, hint: &str) -> bool {
        self.hints.contains_key(hint) && hint != UNKNOWN_HINT
    }

    /// Encode a hash-protocol payload (object keyed by field name) into
    /// a classified JsonValue.
    pub fn encode_hash(&self, hint: &str, fields: &json::JsonValue) -> json::JsonValue {
        ClassifiedJson::classify(fields, hint)
    }

    /// Encode an array-protocol payload: positions follow the class's
    /// declared key order; a field missing from `fields` encodes as null.
    pub fn encode_array(&self, hint: &str, fields: &json::JsonValue) -> json::JsonValue {
        let mut arr = json::JsonValue::new_array();

        if let Some(class) = self.get(hint) {
            for key in class.keys() {
                arr.push(fields[key.as_str()].clone()).ok();
            }
        }

        ClassifiedJson::classify(&arr, hint)
    }

    /// Decode a classified JsonValue back into a hash keyed by the
    /// class's declared fields, regardless of whether the wire payload
    /// was hash- or array-protocol.
    ///
    /// Unregistered hints decode to an opaque hash whose fields are
    /// whatever the payload happened to contain (hash protocol) or an
    /// empty hash (array protocol, since there are no declared keys to
    /// map positions onto).
    pub fn decode(&self, obj: &json::JsonValue) -> Option<(String, json::JsonValue)> {
        let wrapper = ClassifiedJson::declassify(obj)?;
        let hint = wrapper.class().to_string();
        let payload = wrapper.json();

        match self.get(&hint) {
            Some(class) if class.protocol() == Protocol::Array => {
                let mut hash = json::JsonValue::new_object();
                if let json::JsonValue::Array(arr) = payload {
                    for (idx, key) in class.keys().iter().enumerate() {
                        let value = arr.get(idx).cloned().unwrap_or(json::JsonValue::Null);
                        hash.insert(key, value).ok();
                    }
                }
                Some((hint, hash))
            }
            _ => Some((hint, payload.clone())),
        }
    }
}

pub struct ClassifiedJson {
    json: json::JsonValue,
    class: String,
}

impl ClassifiedJson {
    pub fn json(&self) -> &json::JsonValue {
        &self.json
    }

    /// Returns the JSON value stored in the ClassifiedJson struct,
    /// replacing the value with JsonValue::Null;
    pub fn take_json(&mut self) -> json::JsonValue {
        std::mem::replace(&mut self.json, json::JsonValue::Null)
    }

    /// Returns the class name / hint value for the classified object.
    pub fn class(&self) -> &str {
        &self.class
    }

    /// Wraps a json value in class and payload keys.
    ///
    /// Non-recursive.
    ///
    /// ```
    /// let obj = json::array![1,2,3];
    /// let obj = opensrf::classified::ClassifiedJson::classify(&obj, "abc");
    /// assert_eq!(obj["__c"].as_str().unwrap(), "abc");
    /// assert_eq!(obj["__p"][1].as_u8().unwrap(), 2u8);
    /// ```
    ///
    pub fn classify(json: &json::JsonValue, class: &str) -> json::JsonValue {
        let mut hash = json::JsonValue::new_object();
        hash.insert(JSON_CLASS_KEY, class).ok();
        hash.insert(JSON_PAYLOAD_KEY, json.clone()).ok();

        hash
    }

    pub fn can_declassify(obj: &json::JsonValue) -> bool {
        obj.is_object()
            && obj.has_key(JSON_CLASS_KEY)
            && obj.has_key(JSON_PAYLOAD_KEY)
            && obj[JSON_CLASS_KEY].is_string()
    }

    /// Turns a json value into a ClassifiedJson if it's a hash
    /// with the needed class and payload keys.
    ///
    /// Non-recursive.
    ///
    /// ```
    /// let obj = json::object! {__c: "abc", __p: [1,2,3]};
    /// let value_op = opensrf::classified::ClassifiedJson::declassify(&obj);
    /// assert!(value_op.is_some());
    /// let value = value_op.unwrap();
    /// assert_eq!(value.class(), "abc");
    /// assert_eq!(value.json()[1].as_u8().unwrap(), 2u8);
    /// ```
    pub fn declassify(obj: &json::JsonValue) -> Option<ClassifiedJson> {
        if ClassifiedJson::can_declassify(obj) {
            Some(ClassifiedJson {
                class: obj[JSON_CLASS_KEY].as_str().unwrap().to_string(),
                json: obj[JSON_PAYLOAD_KEY].clone(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn array_protocol_round_trip() {
        let mut reg = Registry::new();
        reg.register_hint("aou", vec!["id", "name"], Protocol::Array);

        let fields = json::object! { id: 1, name: "Example Branch" };
        let wire = reg.encode_array("aou", &fields);

        assert_eq!(wire["__p"][0], 1);
        assert_eq!(wire["__p"][1], "Example Branch");

        let (hint, decoded) = reg.decode(&wire).unwrap();
        assert_eq!(hint, "aou");
        assert_eq!(decoded["id"], 1);
        assert_eq!(decoded["name"], "Example Branch");
    }

    #[test]
    fn unknown_hint_round_trip() {
        let reg = Registry::new();
        let wire = json::object! {__c: "mystery", __p: {"a": 1}};
        let (hint, decoded) = reg.decode(&wire).unwrap();
        assert_eq!(hint, "mystery");
        assert_eq!(decoded["a"], 1);
    }
}
