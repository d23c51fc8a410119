//! Startup environment snapshot.
//!
//! The inherited `PATH` is captured once when the process starts and that
//! frozen value is used for every child Valet spawns. Tool-supplied
//! environments can never override it.

use std::collections::HashMap;

/// Environment captured at process start.
#[derive(Debug, Clone)]
pub struct StartupEnv {
    path: String,
    vars: HashMap<String, String>,
}

impl StartupEnv {
    /// Snapshot the current process environment. Call once, from `main`.
    pub fn capture() -> Self {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let path = vars.get("PATH").cloned().unwrap_or_default();
        Self { path, vars }
    }

    /// Build a snapshot from explicit parts (fixtures, embedding hosts).
    pub fn from_parts(
        path: impl Into<String>,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Self {
        Self {
            path: path.into(),
            vars: vars.into_iter().collect(),
        }
    }

    /// The frozen `PATH` value.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Look up a variable from the startup snapshot.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    /// Build a child environment: the startup snapshot plus `extra`,
    /// with `PATH` pinned to the frozen value regardless of what the
    /// snapshot or `extra` contain.
    pub fn child_env<'a>(
        &self,
        extra: impl IntoIterator<Item = (&'a str, &'a str)>,
    ) -> Vec<(String, String)> {
        let mut env = self.vars.clone();
        for (k, v) in extra {
            env.insert(k.to_string(), v.to_string());
        }
        env.insert("PATH".into(), self.path.clone());
        env.into_iter().collect()
    }
}
