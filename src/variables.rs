/// Named variables and parameter inheritance
///
/// Every job and pipeline run owns a set of string variables. A nested run starts
/// from a copy of its caller's variables and then applies the parameters its
/// definition declares. `${NAME}` references in plugin configuration are replaced
/// before the plugin is created; unknown references are left as they are.

use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Variables visible to one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Variables {
    values: BTreeMap<String, String>,
}

impl Variables {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.values.insert(name.into(), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Variables of a nested run
    ///
    /// Copies `parent`, then gives every declared parameter the value passed in
    /// `values`, else the parent's value, else its declared default. Passed values
    /// for names the definition does not declare are set as plain variables.
    /// Passed values may reference the parent's variables.
    pub fn inherit(
        parent: &Variables,
        declared: &HashMap<String, String>,
        values: &HashMap<String, String>,
    ) -> Self {
        let mut variables = parent.clone();
        for (name, default) in declared {
            if !values.contains_key(name) && parent.get(name).is_none() {
                variables.set(name, parent.resolve(default));
            }
        }
        for (name, value) in values {
            variables.set(name, parent.resolve(value));
        }
        variables
    }

    /// Replace every `${NAME}` with the value of the variable
    pub fn resolve(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(open) = rest.find("${") {
            out.push_str(&rest[..open]);
            let after = &rest[open + 2..];
            match after.find('}') {
                Some(close) => {
                    let name = &after[..close];
                    match self.get(name) {
                        Some(value) => out.push_str(value),
                        None => out.push_str(&rest[open..open + 2 + close + 1]),
                    }
                    rest = &after[close + 1..];
                }
                None => {
                    out.push_str(&rest[open..]);
                    rest = "";
                }
            }
        }
        out.push_str(rest);
        out
    }

    /// Resolve every string inside a JSON configuration
    pub fn resolve_json(&self, value: &Value) -> Value {
        if self.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(s) => Value::String(self.resolve(s)),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.resolve_json(v)).collect()),
            Value::Object(map) => Value::Object(map.iter().map(|(k, v)| (k.clone(), self.resolve_json(v))).collect()),
            other => other.clone(),
        }
    }
}

impl FromIterator<(String, String)> for Variables {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(pairs: &[(&str, &str)]) -> Variables {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn resolve_replaces_known_and_keeps_unknown() {
        let v = vars(&[("TABLE", "orders"), ("DIR", "/data")]);
        assert_eq!(v.resolve("${DIR}/${TABLE}.csv"), "/data/orders.csv");
        assert_eq!(v.resolve("${MISSING}-${TABLE}"), "${MISSING}-orders");
        assert_eq!(v.resolve("cost: $5 ${TABLE"), "cost: $5 ${TABLE");
        assert_eq!(v.resolve("plain"), "plain");
    }

    #[test]
    fn passed_value_beats_parent_beats_default() {
        let parent = vars(&[("REGION", "eu"), ("TABLE", "orders")]);
        let declared = map(&[("REGION", "apac"), ("LIMIT", "10"), ("TABLE", "x")]);

        let child = Variables::inherit(&parent, &declared, &map(&[("REGION", "us-${TABLE}")]));
        assert_eq!(child.get("REGION"), Some("us-orders"));
        assert_eq!(child.get("TABLE"), Some("orders"));
        assert_eq!(child.get("LIMIT"), Some("10"));

        let top = Variables::inherit(&Variables::new(), &declared, &HashMap::new());
        assert_eq!(top.get("REGION"), Some("apac"));
        assert_eq!(top.len(), 3);
    }

    #[test]
    fn resolve_json_walks_nested_values() {
        let v = vars(&[("N", "3")]);
        let resolved = v.resolve_json(&json!({ "rows": [["${N}", 1]], "label": "n=${N}", "flag": true }));
        assert_eq!(resolved, json!({ "rows": [["3", 1]], "label": "n=3", "flag": true }));
    }
}
