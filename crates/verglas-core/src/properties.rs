use std::collections::BTreeMap;

use parking_lot::Mutex;

/// String-keyed configuration, read once at startup and occasionally
/// consulted afterwards.
///
/// Recognized keys (others are kept but unused):
///
/// | key | effect |
/// |---|---|
/// | `ThreadPool.Size` | minimum thread count (default 1) |
/// | `ThreadPool.SizeMax` | elastic ceiling; `-1` selects the CPU count |
/// | `ThreadPool.SizeWarn` | busy count that logs a warning (0 disables) |
/// | `ThreadPool.ThreadIdleTime` | seconds before surplus threads exit |
/// | `ThreadPool.StackSize` | per-thread stack bytes |
/// | `ThreadPool.Serialize` | serialize per-handler callbacks |
/// | `MessageSizeMax` | max inbound frame, in KiB (default 1024) |
/// | `BatchAutoFlushSize` | batch buffer flush threshold, in KiB |
/// | `ClassGraphDepthMax` | unmarshal nesting bound (default 100) |
/// | `ACM.Timeout` | idle close and heartbeat cadence, seconds |
/// | `RetryIntervals` | retry delays in ms; `-1` disables retry |
/// | `IPv4`, `IPv6`, `PreferIPv6Address` | protocol family gating |
/// | `Default.EncodingVersion` | default proxy encoding |
/// | `Default.Host` | host for endpoints that omit `-h` |
/// | `ToStringMode` | `Unicode`, `ASCII` or `Compat` |
#[derive(Default)]
pub struct Properties {
    values: Mutex<BTreeMap<String, String>>,
}

impl Properties {
    pub fn new() -> Self {
        Properties::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let props = Properties::new();
        for (k, v) in pairs {
            props.set(k, v);
        }
        props
    }

    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values.lock().insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    pub fn get_with_default(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    pub fn get_int(&self, key: &str) -> Option<i64> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn get_int_with_default(&self, key: &str, default: i64) -> i64 {
        self.get_int(key).unwrap_or(default)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get_int_with_default(key, 0) > 0
    }

    /// Whitespace- or comma-separated list.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|v| {
                v.split(|c: char| c.is_whitespace() || c == ',')
                    .filter(|s| !s.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// All keys under `prefix.`, with the prefix stripped.
    pub fn with_prefix(&self, prefix: &str) -> Vec<(String, String)> {
        let full = format!("{prefix}.");
        self.values
            .lock()
            .iter()
            .filter(|(k, _)| k.starts_with(&full))
            .map(|(k, v)| (k[full.len()..].to_string(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_parsing_with_default() {
        let props = Properties::from_pairs([("A", "5"), ("B", "x")]);
        assert_eq!(props.get_int_with_default("A", 1), 5);
        assert_eq!(props.get_int_with_default("B", 1), 1);
        assert_eq!(props.get_int_with_default("C", 7), 7);
    }

    #[test]
    fn list_splits_on_whitespace_and_commas() {
        let props = Properties::from_pairs([("RetryIntervals", "0, 100  250")]);
        assert_eq!(props.get_list("RetryIntervals"), vec!["0", "100", "250"]);
    }

    #[test]
    fn prefix_filtering() {
        let props = Properties::from_pairs([
            ("ThreadPool.Size", "2"),
            ("ThreadPool.SizeMax", "4"),
            ("Other", "x"),
        ]);
        let mut sub = props.with_prefix("ThreadPool");
        sub.sort();
        assert_eq!(
            sub,
            vec![
                ("Size".to_string(), "2".to_string()),
                ("SizeMax".to_string(), "4".to_string())
            ]
        );
    }
}
