//! Update log cache.
//!
//! Holds the version logs published by the update-log service. Entries are
//! immutable and keyed by id; a fetched batch replaces whatever was cached for
//! its classification in one step.
//!
//! Wire format of one entry:
//!
//! ```json
//! {
//!     "id": 1,
//!     "platformType": 1,
//!     "cnLog": "<p>...</p>",
//!     "enLog": "<p>...</p>",
//!     "serverType": 0,
//!     "systemVersion": "1070U1",
//!     "logType": 1,
//!     "publishTime": "2022-08-06T00:00:00+08:00"
//! }
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::LogFetchError;
use crate::types::Classification;

pub const LOCALE_ZH_CN: &str = "zh_CN";
pub const LOCALE_EN_US: &str = "en_US";

/// One published version log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateLogEntry {
    pub id: i64,
    pub platform_type: i32,
    pub server_type: i32,
    pub log_type: i32,
    pub system_version: String,
    /// Log bodies keyed by locale (`zh_CN`, `en_US`)
    pub logs: BTreeMap<String, String>,
    pub publish_time: Option<DateTime<FixedOffset>>,
}

impl UpdateLogEntry {
    /// Classification whose item this log describes.
    pub fn classification(&self) -> Option<Classification> {
        match self.log_type {
            1 => Some(Classification::System),
            2 => Some(Classification::Safe),
            _ => None,
        }
    }

    /// Log body for `locale`, falling back to the same language, then English.
    pub fn localized(&self, locale: &str) -> &str {
        if let Some(body) = self.logs.get(locale) {
            return body;
        }
        let language = locale.split(|c: char| c == '_' || c == '-').next().unwrap_or(locale);
        let same_language = self
            .logs
            .iter()
            .find(|(key, _)| key.split('_').next() == Some(language))
            .map(|(_, body)| body.as_str());

        same_language
            .or_else(|| self.logs.get(LOCALE_EN_US).map(String::as_str))
            .or_else(|| self.logs.values().next().map(String::as_str))
            .unwrap_or("")
    }
}

/// Entry as published by the server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireLogItem {
    #[serde(default = "invalid_id")]
    id: i64,
    #[serde(default = "default_type")]
    platform_type: i32,
    #[serde(default)]
    server_type: i32,
    #[serde(default = "default_type")]
    log_type: i32,
    #[serde(default)]
    system_version: String,
    #[serde(default)]
    cn_log: String,
    #[serde(default)]
    en_log: String,
    #[serde(default)]
    publish_time: String,
}

fn invalid_id() -> i64 {
    -1
}

fn default_type() -> i32 {
    1
}

impl WireLogItem {
    fn is_valid(&self) -> bool {
        self.id != -1
    }

    fn into_entry(self) -> UpdateLogEntry {
        let mut logs = BTreeMap::new();
        if !self.cn_log.is_empty() {
            logs.insert(LOCALE_ZH_CN.to_string(), self.cn_log);
        }
        if !self.en_log.is_empty() {
            logs.insert(LOCALE_EN_US.to_string(), self.en_log);
        }

        UpdateLogEntry {
            id: self.id,
            platform_type: self.platform_type,
            server_type: self.server_type,
            log_type: self.log_type,
            system_version: self.system_version,
            logs,
            publish_time: DateTime::parse_from_rfc3339(&self.publish_time).ok(),
        }
    }
}

/// Parse an update-log document.
///
/// Accepts a bare array or the `{ "code": 0, "data": [...] }` envelope. Entries
/// without an id are dropped.
pub fn parse_update_logs(body: &str) -> Result<Vec<UpdateLogEntry>, LogFetchError> {
    let value: Value = serde_json::from_str(body)?;
    let items = match value {
        Value::Array(items) => Value::Array(items),
        Value::Object(mut map) => {
            let code = map.get("code").and_then(Value::as_i64).unwrap_or(0);
            if code != 0 {
                let message = map
                    .get("msg")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                return Err(LogFetchError::Server { code, message });
            }
            map.remove("data").unwrap_or(Value::Array(Vec::new()))
        }
        _ => Value::Array(Vec::new()),
    };

    let items: Vec<WireLogItem> = serde_json::from_value(items)?;
    let total = items.len();
    let entries: Vec<UpdateLogEntry> = items
        .into_iter()
        .filter(WireLogItem::is_valid)
        .map(WireLogItem::into_entry)
        .collect();

    debug!(total, valid = entries.len(), "Parsed update logs");
    Ok(entries)
}

/// Cached version logs, keyed by id.
#[derive(Debug, Default)]
pub struct UpdateLogCache {
    entries: BTreeMap<i64, UpdateLogEntry>,
}

impl UpdateLogCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace everything cached for `classification` with `batch`.
    ///
    /// Entries in the batch that belong to another classification are stored
    /// too, replacing any entry with the same id.
    pub fn replace(&mut self, classification: Classification, batch: Vec<UpdateLogEntry>) {
        self.entries
            .retain(|_, e| e.classification() != Some(classification));
        for entry in batch {
            self.entries.insert(entry.id, entry);
        }
    }

    /// Newest entry for a classification, by publish time then id.
    pub fn latest(&self, classification: Classification) -> Option<&UpdateLogEntry> {
        self.entries
            .values()
            .filter(|e| e.classification() == Some(classification))
            .max_by(|a, b| a.publish_time.cmp(&b.publish_time).then(a.id.cmp(&b.id)))
    }

    /// Entries for a classification, newest first.
    pub fn entries_for(&self, classification: Classification) -> Vec<&UpdateLogEntry> {
        let mut out: Vec<_> = self
            .entries
            .values()
            .filter(|e| e.classification() == Some(classification))
            .collect();
        out.sort_by(|a, b| b.publish_time.cmp(&a.publish_time).then(b.id.cmp(&a.id)));
        out
    }

    pub fn get(&self, id: i64) -> Option<&UpdateLogEntry> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "code": 0,
        "data": [
            {
                "id": 1,
                "platformType": 1,
                "cnLog": "<p>中文日志</p>",
                "enLog": "<p>English log</p>",
                "serverType": 0,
                "systemVersion": "1070U1",
                "logType": 1,
                "publishTime": "2022-08-06T00:00:00+08:00"
            },
            {
                "id": 2,
                "enLog": "<p>Newer</p>",
                "systemVersion": "1070U2",
                "logType": 1,
                "publishTime": "2022-09-06T00:00:00+08:00"
            },
            {
                "id": 3,
                "enLog": "<p>Security fixes</p>",
                "logType": 2,
                "publishTime": "2022-09-01T00:00:00+08:00"
            },
            { "systemVersion": "broken" }
        ]
    }"#;

    #[test]
    fn test_parse_envelope_drops_invalid_entries() {
        let entries = parse_update_logs(SAMPLE).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].system_version, "1070U1");
        assert_eq!(entries[0].logs.len(), 2);
        assert!(entries[0].publish_time.is_some());
        assert_eq!(entries[2].classification(), Some(Classification::Safe));
    }

    #[test]
    fn test_parse_server_error() {
        let err = parse_update_logs(r#"{"code": 7, "msg": "bad platform"}"#).unwrap_err();
        assert!(matches!(err, LogFetchError::Server { code: 7, .. }));
        assert!(parse_update_logs("not json").is_err());
        assert!(parse_update_logs("[]").unwrap().is_empty());
    }

    #[test]
    fn test_localized_fallback() {
        let entries = parse_update_logs(SAMPLE).unwrap();
        assert_eq!(entries[0].localized("zh_CN"), "<p>中文日志</p>");
        assert_eq!(entries[0].localized("zh_TW"), "<p>中文日志</p>");
        assert_eq!(entries[0].localized("de_DE"), "<p>English log</p>");
        assert_eq!(entries[1].localized("zh_CN"), "<p>Newer</p>");
    }

    #[test]
    fn test_cache_replace_and_latest() {
        let mut cache = UpdateLogCache::new();
        let entries = parse_update_logs(SAMPLE).unwrap();
        cache.replace(Classification::System, entries.clone());
        assert_eq!(cache.len(), 3);
        assert_eq!(cache.latest(Classification::System).unwrap().id, 2);
        assert_eq!(cache.latest(Classification::Safe).unwrap().id, 3);
        assert!(cache.latest(Classification::Unknown).is_none());

        // A new system batch drops the old system entries only.
        let newer: Vec<_> = entries.into_iter().filter(|e| e.id == 1).collect();
        cache.replace(Classification::System, newer);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.latest(Classification::System).unwrap().id, 1);
        assert!(cache.get(3).is_some());
    }
}
