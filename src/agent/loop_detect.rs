//! Repeated tool-call detection.

use serde_json::Value;
use std::collections::{HashSet, VecDeque};

/// Argument keys that vary between otherwise identical calls.
const VOLATILE_KEYS: &[&str] = &[
    "reason",
    "explanation",
    "comment",
    "request_id",
    "timestamp",
    "nonce",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVerdict {
    Ok,
    /// First time a fingerprint reaches the warn threshold.
    Warn { repeats: usize },
    Stop { repeats: usize },
}

/// Sliding window over recent call fingerprints.
#[derive(Debug)]
pub struct LoopDetector {
    window: usize,
    warn_at: usize,
    stop_at: usize,
    recent: VecDeque<String>,
    warned: HashSet<String>,
}

impl LoopDetector {
    pub fn new(window: usize, warn_at: usize, stop_at: usize) -> Self {
        Self {
            window: window.max(1),
            warn_at,
            stop_at,
            recent: VecDeque::with_capacity(window),
            warned: HashSet::new(),
        }
    }

    pub fn observe(&mut self, tool: &str, args: &Value) -> LoopVerdict {
        let print = fingerprint(tool, args);
        if self.recent.len() == self.window {
            self.recent.pop_front();
        }
        self.recent.push_back(print.clone());

        let repeats = self.recent.iter().filter(|p| **p == print).count();
        if repeats >= self.stop_at {
            LoopVerdict::Stop { repeats }
        } else if repeats >= self.warn_at && self.warned.insert(print) {
            LoopVerdict::Warn { repeats }
        } else {
            LoopVerdict::Ok
        }
    }
}

/// Tool name plus canonical arguments. `write_text_file` is keyed by its path alone so rewrites
/// of one file with shifting content still count as repeats.
pub fn fingerprint(tool: &str, args: &Value) -> String {
    let keyed = if tool == "write_text_file" {
        args.get("path").cloned().unwrap_or(Value::Null)
    } else {
        strip_volatile(args)
    };
    let mut hasher = blake3::Hasher::new();
    hasher.update(tool.as_bytes());
    hasher.update(&[0]);
    hasher.update(canonical(&keyed).as_bytes());
    hasher.finalize().to_hex().to_string()
}

fn strip_volatile(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(k, _)| !VOLATILE_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), strip_volatile(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(strip_volatile).collect()),
        other => other.clone(),
    }
}

/// JSON with object keys sorted at every level.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_ignores_order_and_volatile_fields() {
        let a = fingerprint("read_file", &json!({"path": "a.md", "max_chars": 10, "reason": "x"}));
        let b = fingerprint("read_file", &json!({"max_chars": 10, "path": "a.md", "reason": "y"}));
        assert_eq!(a, b);
        assert_ne!(a, fingerprint("read_file", &json!({"path": "b.md", "max_chars": 10})));
        assert_ne!(a, fingerprint("get_file_info", &json!({"path": "a.md", "max_chars": 10})));
    }

    #[test]
    fn test_write_text_keyed_by_path() {
        assert_eq!(
            fingerprint("write_text_file", &json!({"path": "a.md", "content": "1"})),
            fingerprint("write_text_file", &json!({"path": "a.md", "content": "2"}))
        );
    }

    #[test]
    fn test_warn_once_then_stop() {
        let mut detector = LoopDetector::new(10, 3, 5);
        let args = json!({"path": "a.md"});
        assert_eq!(detector.observe("read_file", &args), LoopVerdict::Ok);
        assert_eq!(detector.observe("read_file", &args), LoopVerdict::Ok);
        assert_eq!(
            detector.observe("read_file", &args),
            LoopVerdict::Warn { repeats: 3 }
        );
        assert_eq!(detector.observe("read_file", &args), LoopVerdict::Ok);
        assert_eq!(
            detector.observe("read_file", &args),
            LoopVerdict::Stop { repeats: 5 }
        );
    }

    #[test]
    fn test_window_forgets_old_calls() {
        let mut detector = LoopDetector::new(3, 3, 5);
        let args = json!({});
        detector.observe("list_files", &args);
        detector.observe("list_files", &args);
        detector.observe("read_file", &json!({"path": "a"}));
        detector.observe("read_file", &json!({"path": "b"}));
        assert_eq!(detector.observe("list_files", &args), LoopVerdict::Ok);
    }
}
