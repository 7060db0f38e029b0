use super::app;
use super::message;
use super::session;
use std::fmt;

pub type MethodHandler = fn(
    &mut Box<dyn app::ApplicationWorker>,
    &mut session::ServerSession,
    &message::Method,
) -> Result<(), String>;

#[derive(Debug, Copy, Clone)]
pub enum ParamCount {
    Any,
    Zero,
    Exactly(u8),
    AtLeast(u8),
    Range(u8, u8), // Inclusive
}

impl ParamCount {
    /// Returns true if the number of params provided matches the
    /// number specified by the ParamCount enum.
    ///
    /// ```
    /// use opensrf::method::ParamCount;
    /// assert!(ParamCount::matches(&ParamCount::Any, 0));
    /// assert!(!ParamCount::matches(&ParamCount::Exactly(1), 10));
    /// assert!(ParamCount::matches(&ParamCount::AtLeast(10), 20));
    /// assert!(!ParamCount::matches(&ParamCount::AtLeast(20), 10));
    /// assert!(ParamCount::matches(&ParamCount::Range(4, 6), 5));
    /// ```
    pub fn matches(pc: &ParamCount, count: u8) -> bool {
        match *pc {
            ParamCount::Any => {
                return true;
            }
            ParamCount::Zero => {
                return count == 0;
            }
            ParamCount::Exactly(c) => {
                return count == c;
            }
            ParamCount::AtLeast(c) => {
                return count >= c;
            }
            ParamCount::Range(s, e) => {
                return s <= count && e >= count;
            }
        }
    }
}

impl fmt::Display for ParamCount {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ParamCount::Any => write!(f, "Any"),
            ParamCount::Zero => write!(f, "Zero"),
            ParamCount::Exactly(c) => write!(f, "Exactly {}", c),
            ParamCount::AtLeast(c) => write!(f, "AtLeast {}", c),
            ParamCount::Range(s, e) => write!(f, "Between {}..{}", s, e),
        }
    }
}

/// A variation of a Method that can be used when creating static
/// method definitions.
pub struct MethodDef {
    pub name: &'static str,
    pub param_count: ParamCount,
    pub handler: MethodHandler,
}

impl MethodDef {
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn param_count(&self) -> &ParamCount {
        &self.param_count
    }
    pub fn handler(&self) -> &MethodHandler {
        &self.handler
    }
}

/// Data type advertised for a single method parameter, used only by
/// `opensrf.system.introspect` to describe a method's calling
/// convention to remote callers.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ParamDataType {
    String,
    Number,
    Bool,
    Object,
    Array,
    Mixed,
}

impl fmt::Display for ParamDataType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let s = match self {
            ParamDataType::String => "string",
            ParamDataType::Number => "number",
            ParamDataType::Bool => "bool",
            ParamDataType::Object => "object",
            ParamDataType::Array => "array",
            ParamDataType::Mixed => "mixed",
        };
        write!(f, "{s}")
    }
}

/// Describes a single named parameter for introspection purposes.
#[derive(Debug, Clone)]
pub struct Param {
    pub required: bool,
    pub name: String,
    pub datatype: ParamDataType,
    pub desc: Option<String>,
}

impl Param {
    pub fn new(name: &str, datatype: ParamDataType, desc: Option<&str>) -> Param {
        Param {
            required: true,
            name: name.to_string(),
            datatype,
            desc: desc.map(|d| d.to_string()),
        }
    }

    pub fn to_json_value(&self) -> json::JsonValue {
        json::object! {
            name: json::from(self.name.clone()),
            type: json::from(self.datatype.to_string()),
            desc: match &self.desc {
                Some(d) => json::from(d.clone()),
                None => json::JsonValue::Null,
            },
        }
    }
}

/// Runtime method registration: the type both the worker's dispatch
/// table and the server's registry hold. Unlike MethodDef, its name
/// and streaming/atomic flags are per-instance, so a single definition
/// can be cloned into a dynamically-named `.atomic` streaming twin.
#[derive(Clone)]
pub struct Method {
    pub name: String,
    pub param_count: ParamCount,
    pub handler: MethodHandler,
    pub stream: bool,
    pub atomic: bool,
    pub desc: String,
    pub params: Vec<Param>,
}

impl Method {
    pub fn new(name: &str, param_count: ParamCount, handler: MethodHandler) -> Method {
        Method {
            handler,
            param_count,
            name: name.to_string(),
            stream: false,
            atomic: false,
            desc: String::new(),
            params: Vec::new(),
        }
    }

    /// Builds a runtime Method from a static MethodDef.
    pub fn from_def(def: &MethodDef) -> Method {
        Method::new(def.name(), *def.param_count(), *def.handler())
    }

    pub fn param_count(&self) -> &ParamCount {
        &self.param_count
    }

    pub fn handler(&self) -> MethodHandler {
        self.handler
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &str) {
        self.name = name.to_string();
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    pub fn set_stream(&mut self, stream: bool) {
        self.stream = stream;
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic
    }

    pub fn set_atomic(&mut self, atomic: bool) {
        self.atomic = atomic;
    }

    pub fn desc(&self) -> &str {
        &self.desc
    }

    pub fn set_desc(&mut self, desc: &str) {
        self.desc = desc.to_string();
    }

    pub fn params(&self) -> &Vec<Param> {
        &self.params
    }

    pub fn add_param(&mut self, param: Param) {
        self.params.push(param);
    }

    /// Renders this method's signature for `opensrf.system.introspect`.
    pub fn to_json_value(&self) -> json::JsonValue {
        let params: Vec<json::JsonValue> = self.params.iter().map(|p| p.to_json_value()).collect();

        json::object! {
            api_name: json::from(self.name.clone()),
            desc: json::from(self.desc.clone()),
            stream: self.stream,
            atomic: self.atomic,
            params: params,
        }
    }
}
