use json;
use rand::Rng;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Width, in bytes, of the ASCII-digit length prefix a controller uses
/// when framing a dispatched request onto a child's data socket, and a
/// child uses in turn to report its pid on the shared status socket.
/// Fixed-width so peers never need to scan for a delimiter.
pub const SIZE_PAD: usize = 12;

/// Right-justifies `value` into a SIZE_PAD-byte, space-padded ASCII
/// string.  Used for both frame-size prefixes and status-socket pid
/// reports.
pub fn format_size_pad(value: usize) -> String {
    format!("{:>width$}", value, width = SIZE_PAD)
}

/// Returns a string of random numbers of the requested length
pub fn random_number(size: usize) -> String {
    let mut rng = rand::thread_rng();
    let num: u64 = rng.gen_range(100_000_000_000..1_000_000_000_000);
    format!("{:0width$}", num, width = size)[0..size].to_string()
}

/// Seconds since the Unix epoch, as an f64 (matches OpenSRF's use of
/// fractional-second timestamps for things like registration times).
pub fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("SystemTime before UNIX EPOCH!")
        .as_secs_f64()
}

/// Converts a JSON number or string to an isize if possible
pub fn json_isize(value: &json::JsonValue) -> Option<isize> {
    if let Some(i) = value.as_isize() {
        return Some(i);
    } else if let Some(s) = value.as_str() {
        if let Ok(i2) = s.parse::<isize>() {
            return Some(i2);
        }
    };

    None
}

/// Converts a JSON number or string to an usize if possible
pub fn json_usize(value: &json::JsonValue) -> Option<usize> {
    if let Some(i) = value.as_usize() {
        return Some(i);
    } else if let Some(s) = value.as_str() {
        if let Ok(i2) = s.parse::<usize>() {
            return Some(i2);
        }
    };

    None
}

/// Renders API call params as a log-friendly string, replacing any
/// value whose param position matches a `log_protect` pattern
/// configured for this API name with "***".
///
/// Protect patterns are dot-separated API name prefixes (e.g.
/// `"opensrf.auth.login"`); a pattern matches when `api_name` starts
/// with it, mirroring the `<log_protect><match_string>` semantics in
/// `opensrf_core.xml`.
pub fn stringify_params(api_name: &str, params: &Vec<json::JsonValue>, log_protect: &Vec<String>) -> String {
    let protected = log_protect.iter().any(|pattern| api_name.starts_with(pattern.as_str()));

    if protected {
        return "**params-removed**".to_string();
    }

    params
        .iter()
        .map(|p| p.dump())
        .collect::<Vec<String>>()
        .join(", ")
}

pub struct Timer {
    /// Duration of this timer in seconds.
    /// Timer is "done" once this many seconds have passed
    /// since start_time.
    duration: i32,

    /// Moment this timer starts.
    start_time: Instant,
}

impl Timer {
    pub fn new(duration: i32) -> Timer {
        Timer {
            duration,
            start_time: Instant::now(),
        }
    }

    pub fn reset(&mut self) {
        self.start_time = Instant::now();
    }

    pub fn remaining(&self) -> i32 {
        self.duration - self.start_time.elapsed().as_secs() as i32
    }

    pub fn done(&self) -> bool {
        self.remaining() <= 0
    }
}
