// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Log setup: per-target levels, configurable with `name=level` directives.

use ordermap::OrderMap;
use std::str::FromStr;
use tracing_subscriber::filter::{Directive, LevelFilter};
use tracing_subscriber::{EnvFilter, prelude::*};

#[derive(Debug, thiserror::Error, PartialEq)]
pub(crate) enum LoggingError {
    #[error("invalid syntax '{0}': expected name=level")]
    Syntax(String),
    #[error("invalid level '{0}'")]
    Level(String),
    #[error("invalid directive '{0}'")]
    Directive(String),
    #[error("failed to initialize tracing subscriber: {0}")]
    Init(String),
}

/// Short names accepted in directives, with the tracing target they stand for.
const TARGETS: [(&str, &str, LevelFilter); 3] = [
    ("portmap", "portmap", LevelFilter::INFO),
    ("mapper", "portmap_mapper", LevelFilter::INFO),
    ("portalloc", "portmap_portalloc", LevelFilter::WARN),
];

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LogTargets {
    pub(crate) level: LevelFilter,
    pub(crate) targets: OrderMap<String, LevelFilter>,
}

impl Default for LogTargets {
    fn default() -> Self {
        Self {
            level: LevelFilter::WARN,
            targets: TARGETS
                .iter()
                .map(|(_, target, level)| ((*target).to_string(), *level))
                .collect(),
        }
    }
}

impl LogTargets {
    fn resolve(name: &str) -> &str {
        TARGETS
            .iter()
            .find(|(short, _, _)| *short == name)
            .map_or(name, |(_, target, _)| *target)
    }

    /// Apply comma-separated `name=level` directives. `default=level` (or a bare `level`) sets the
    /// level of targets not listed, `all=level` sets every known target. Names may be short (`mapper`) or full
    /// tracing targets (`portmap_mapper::relay`).
    pub(crate) fn apply(&mut self, input: &str) -> Result<(), LoggingError> {
        let mut parsed = OrderMap::new();
        for item in input.split(',').map(str::trim).filter(|i| !i.is_empty()) {
            let Some((name, level)) = item.split_once('=') else {
                // a bare level is the default level
                let level = LevelFilter::from_str(item)
                    .map_err(|_| LoggingError::Syntax(item.to_string()))?;
                parsed.insert("default".to_string(), level);
                continue;
            };
            let level = LevelFilter::from_str(level.trim())
                .map_err(|_| LoggingError::Level(level.trim().to_string()))?;
            parsed.insert(name.trim().to_string(), level);
        }

        if let Some(level) = parsed.get("default") {
            self.level = *level;
        }
        if let Some(level) = parsed.get("all") {
            self.targets.values_mut().for_each(|l| *l = *level);
        }
        for (name, level) in parsed {
            if name != "default" && name != "all" {
                self.targets.insert(Self::resolve(&name).to_string(), level);
            }
        }
        Ok(())
    }

    pub(crate) fn env_filter(&self) -> Result<EnvFilter, LoggingError> {
        let mut filter = EnvFilter::new(self.level.to_string());
        for (target, level) in &self.targets {
            let directive = format!("{target}={level}");
            let parsed = Directive::from_str(&directive)
                .map_err(|_| LoggingError::Directive(directive.clone()))?;
            filter = filter.add_directive(parsed);
        }
        Ok(filter)
    }
}

/// Install the global subscriber. `RUST_LOG` is applied first, then `directives`.
pub(crate) fn init(directives: Option<&str>) -> Result<(), LoggingError> {
    let mut targets = LogTargets::default();
    if let Ok(env) = std::env::var("RUST_LOG") {
        targets.apply(&env)?;
    }
    if let Some(directives) = directives {
        targets.apply(directives)?;
    }

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_line_number(true)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(true)
        .with_level(true);

    tracing_subscriber::registry()
        .with(targets.env_filter()?)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let targets = LogTargets::default();
        assert_eq!(targets.level, LevelFilter::WARN);
        assert_eq!(targets.targets["portmap_mapper"], LevelFilter::INFO);
        assert_eq!(targets.targets["portmap_portalloc"], LevelFilter::WARN);
        assert!(targets.env_filter().is_ok());
    }

    #[test]
    fn test_apply() {
        let mut targets = LogTargets::default();
        targets
            .apply("default=error, all=off, mapper=debug,portmap_mapper::relay=trace")
            .unwrap();
        assert_eq!(targets.level, LevelFilter::ERROR);
        assert_eq!(targets.targets["portmap"], LevelFilter::OFF);
        assert_eq!(targets.targets["portmap_portalloc"], LevelFilter::OFF);
        assert_eq!(targets.targets["portmap_mapper"], LevelFilter::DEBUG);
        assert_eq!(targets.targets["portmap_mapper::relay"], LevelFilter::TRACE);
        assert!(!targets.targets.contains_key("all"));
        assert!(targets.env_filter().is_ok());

        targets.apply("debug").unwrap();
        assert_eq!(targets.level, LevelFilter::DEBUG);
        assert_eq!(targets.targets["portmap_mapper"], LevelFilter::DEBUG);
    }

    #[test]
    fn test_apply_errors() {
        let mut targets = LogTargets::default();
        assert_eq!(
            targets.apply("mapper=loud"),
            Err(LoggingError::Level("loud".to_string()))
        );
        assert_eq!(
            targets.apply("mapper=info,bogus"),
            Err(LoggingError::Syntax("bogus".to_string()))
        );
        assert_eq!(targets, LogTargets::default());
    }
}
