// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Tracing runtime control.

use ordermap::{OrderMap, OrderSet};
use std::fmt::Display;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, Registry, prelude::*, reload};

use crate::LevelFilter;
use crate::targets::TRACING_TARGETS;
use crate::trace_target;

trace_target!("tracectl", LevelFilter::INFO, &[]);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TraceCtlError {
    #[error("invalid level '{level}' for '{tag}'")]
    InvalidLevel { tag: String, level: String },
    #[error("invalid syntax '{0}': expected tag=level")]
    Syntax(String),
}

#[derive(Debug, Clone)]
pub struct TargetCfg {
    pub target: &'static str,
    pub name: &'static str,
    pub level: LevelFilter,
    pub tags: Vec<&'static str>,
}

impl Display for TargetCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:>40} │ {:>6} │ {}",
            self.target,
            self.level,
            self.tags.join(",")
        )
    }
}

#[derive(Debug)]
struct TargetDb {
    default: LevelFilter,
    targets: OrderMap<&'static str, TargetCfg>,
    tags: OrderMap<&'static str, OrderSet<&'static str>>,
}

impl TargetDb {
    fn load(default: LevelFilter) -> Self {
        let mut db = Self {
            default,
            targets: OrderMap::new(),
            tags: OrderMap::new(),
        };
        for t in TRACING_TARGETS {
            db.register(t.target, t.name, t.level, t.tags);
        }
        db
    }

    fn register(
        &mut self,
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) {
        let mut all_tags = tags.to_vec();
        if !all_tags.contains(&name) {
            all_tags.push(name);
        }
        for tag in &all_tags {
            self.tags.entry(tag).or_default().insert(target);
        }
        let cfg = TargetCfg {
            target,
            name,
            level,
            tags: all_tags,
        };
        if self.targets.insert(target, cfg).is_some() {
            warn!("Tracing target {target} declared more than once");
        }
    }

    fn tagged_mut(&mut self, tag: &str) -> Vec<&mut TargetCfg> {
        let Some(members) = self.tags.get(tag) else {
            return vec![];
        };
        self.targets
            .values_mut()
            .filter(|t| members.contains(t.target))
            .collect()
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter = EnvFilter::new(self.default.to_string());
        for t in self.targets.values() {
            match format!("{}={}", t.target, t.level).parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => error!("Bad tracing directive for {}: {e}", t.target),
            }
        }
        filter
    }
}

impl Display for TargetDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{:>40} │ {:>6} │ TAGS", "TARGET", "LEVEL")?;
        for t in self.targets.values() {
            writeln!(f, "{t}")?;
        }
        write!(f, "{:>40} │ {:>6} │ --", "(default)", self.default)
    }
}

/// Handle over the process-wide tracing subscriber and its per-target levels.
#[derive(Debug)]
pub struct TracingControl {
    db: Mutex<TargetDb>,
    reload: Option<reload::Handle<EnvFilter, Registry>>,
}

static TRACING_CTL: OnceLock<TracingControl> = OnceLock::new();

/// Get the process-wide [`TracingControl`], installing the subscriber on first use.
///
/// If another global subscriber was installed first (test harnesses do that), levels are
/// still tracked but reloading them has no effect.
pub fn get_trace_ctl() -> &'static TracingControl {
    TRACING_CTL.get_or_init(TracingControl::new)
}

impl TracingControl {
    fn new() -> Self {
        let db = TargetDb::load(LevelFilter::INFO);
        let (filter, handle) = reload::Layer::new(db.env_filter());
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_line_number(true)
            .with_target(true)
            .with_thread_names(true)
            .with_level(true);
        let reload = tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map(|()| handle)
            .ok();
        Self {
            db: Mutex::new(db),
            reload,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TargetDb> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, db: &TargetDb) {
        if let Some(handle) = &self.reload
            && let Err(e) = handle.reload(db.env_filter())
        {
            error!("Failed to reload tracing filter: {e}");
        }
    }

    pub fn init() {
        get_trace_ctl();
    }

    pub fn set_default_level(&self, level: LevelFilter) {
        let mut db = self.lock();
        if db.default != level {
            db.default = level;
            self.apply(&db);
            info!("Default log level set to {level}");
        }
    }

    #[must_use]
    pub fn default_level(&self) -> LevelFilter {
        self.lock().default
    }

    /// Set the level of every target carrying `tag`. Returns how many targets changed.
    pub fn set_tag_level(&self, tag: &str, level: LevelFilter) -> usize {
        let mut db = self.lock();
        let mut changed = 0;
        for t in db.tagged_mut(tag) {
            if t.level != level {
                t.level = level;
                changed += 1;
            }
        }
        if changed > 0 {
            self.apply(&db);
        }
        changed
    }

    pub fn set_level_all(&self, level: LevelFilter) {
        let mut db = self.lock();
        db.targets.values_mut().for_each(|t| t.level = level);
        self.apply(&db);
    }

    fn parse(input: &str) -> Result<OrderMap<String, LevelFilter>, TraceCtlError> {
        let mut out = OrderMap::new();
        for item in input.split(',').map(str::trim) {
            let Some((tag, level)) = item.split_once('=') else {
                return Err(TraceCtlError::Syntax(item.to_string()));
            };
            let parsed =
                LevelFilter::from_str(level.trim()).map_err(|_| TraceCtlError::InvalidLevel {
                    tag: tag.trim().to_string(),
                    level: level.trim().to_string(),
                })?;
            out.insert(tag.trim().to_string(), parsed);
        }
        Ok(out)
    }

    /// Configure levels from a string like `default=warn,all=info,flow-table=debug`.
    ///
    /// `default` sets the fallback level, `all` sets every target; any other key is a tag.
    ///
    /// # Errors
    ///
    /// Fails without changing anything if any item is malformed.
    pub fn setup_from_string(&self, input: &str) -> Result<(), TraceCtlError> {
        let config = Self::parse(input)?;
        if let Some(level) = config.get("default") {
            self.set_default_level(*level);
        }
        if let Some(level) = config.get("all") {
            self.set_level_all(*level);
        }
        for (tag, level) in &config {
            if tag != "default" && tag != "all" {
                self.set_tag_level(tag, *level);
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn target(&self, target: &str) -> Option<TargetCfg> {
        self.lock().targets.get(target).cloned()
    }

    #[must_use]
    pub fn targets_by_tag(&self, tag: &str) -> Vec<TargetCfg> {
        let mut db = self.lock();
        db.tagged_mut(tag).into_iter().map(|t| t.clone()).collect()
    }

    pub fn dump(&self) {
        let db = self.lock();
        info!("\n{db}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::custom_target;
    use serial_test::serial;

    custom_target!("tctl-test-a", LevelFilter::DEBUG, &["tctl-test"]);
    custom_target!("tctl-test-b", LevelFilter::ERROR, &["tctl-test"]);

    #[test]
    #[serial]
    fn targets_are_registered_at_link_time() {
        let tctl = get_trace_ctl();
        assert!(tctl.target("tctl-test-a").is_some());
        assert!(tctl.target("vragent_tracectl::control").is_some());
        let tagged: Vec<_> = tctl
            .targets_by_tag("tctl-test")
            .into_iter()
            .map(|t| t.target)
            .collect();
        assert!(tagged.contains(&"tctl-test-a"));
        assert!(tagged.contains(&"tctl-test-b"));
    }

    #[test]
    #[serial]
    fn tag_level_changes_all_members() {
        let tctl = get_trace_ctl();
        tctl.set_tag_level("tctl-test", LevelFilter::WARN);
        assert_eq!(tctl.set_tag_level("tctl-test", LevelFilter::OFF), 2);
        for t in tctl.targets_by_tag("tctl-test") {
            assert_eq!(t.level, LevelFilter::OFF);
        }
        assert_eq!(tctl.set_tag_level("no-such-tag", LevelFilter::OFF), 0);
    }

    #[test]
    #[serial]
    fn setup_from_string() {
        let tctl = get_trace_ctl();
        tctl.setup_from_string("default=warn, tctl-test-a=trace").unwrap();
        assert_eq!(tctl.default_level(), LevelFilter::WARN);
        assert_eq!(
            tctl.target("tctl-test-a").unwrap().level,
            LevelFilter::TRACE
        );

        assert_eq!(
            tctl.setup_from_string("tctl-test=loud"),
            Err(TraceCtlError::InvalidLevel {
                tag: "tctl-test".to_string(),
                level: "loud".to_string()
            })
        );
        assert!(matches!(
            tctl.setup_from_string("tctl-test=info, oops"),
            Err(TraceCtlError::Syntax(_))
        ));
        tctl.set_default_level(LevelFilter::INFO);
    }
}
