use std::{
    collections::HashMap,
    sync::{Arc, LazyLock},
};

use regex::{Captures, Regex};
use serde_json::Value;

/// Body key listing the dot paths of string fields to template.
pub const VAR_SUB_KEY: &str = "BROKER_VAR_SUB";

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("valid regex"));

/// Values for `${NAME}` placeholders. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Variables {
    values: Arc<HashMap<String, String>>,
}

impl Variables {
    pub fn new(values: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            values: Arc::new(values.into_iter().collect()),
        }
    }

    /// Snapshot of the process environment.
    pub fn from_env() -> Self {
        Self::new(std::env::vars())
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// Replaces every `${NAME}` with its value. Undefined names stay literal.
    pub fn substitute(&self, input: &str) -> String {
        PLACEHOLDER
            .replace_all(input, |caps: &Captures<'_>| match self.get(&caps[1]) {
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            })
            .into_owned()
    }

    /// Templates the string fields named by the body's [`VAR_SUB_KEY`] list.
    ///
    /// Returns `false` if the body carries no substitution list, in which case
    /// it is left untouched.
    pub fn substitute_body(&self, body: &mut Value) -> bool {
        let Some(paths) = body.get(VAR_SUB_KEY).and_then(Value::as_array) else {
            return false;
        };
        let paths: Vec<String> = paths
            .iter()
            .filter_map(Value::as_str)
            .map(ToOwned::to_owned)
            .collect();
        for path in paths {
            if let Some(Value::String(field)) = lookup_mut(body, &path) {
                *field = self.substitute(field);
            }
        }
        true
    }
}

fn lookup_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    path.split('.').try_fold(value, |current, key| match current {
        Value::Object(map) => map.get_mut(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get_mut(i)),
        _ => None,
    })
}
