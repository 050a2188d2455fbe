// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Link-time registry of tracing targets across all linked crates

use crate::LevelFilter;
use linkme::distributed_slice;

/// A tracing target as declared by one of the registration macros.
#[derive(Debug)]
pub struct StaticTarget {
    pub(crate) target: &'static str,
    pub(crate) name: &'static str,
    pub(crate) level: LevelFilter,
    pub(crate) tags: &'static [&'static str],
}

impl StaticTarget {
    #[must_use]
    pub const fn new(
        target: &'static str,
        name: &'static str,
        level: LevelFilter,
        tags: &'static [&'static str],
    ) -> Self {
        Self {
            target,
            name,
            level,
            tags,
        }
    }
}

#[distributed_slice]
pub static TRACING_TARGETS: [StaticTarget];

#[doc(hidden)]
#[macro_export]
macro_rules! trace_target_deps {
    () => {
        use linkme::distributed_slice;
        use $crate::LevelFilter;
        use $crate::targets::{StaticTarget, TRACING_TARGETS};
    };
}

/// Declare the tracing target of the current module, with a name, default level and tags.
///
/// The output is wrapped in an anonymous const so that the macro may be invoked from several
/// modules of the same crate without clashing statics.
#[macro_export]
macro_rules! trace_target {
    ($name:expr, $level:expr, $tags:expr) => {
        const _: () = {
            $crate::trace_target_deps!();

            #[distributed_slice(TRACING_TARGETS)]
            static TRACE_TGT: StaticTarget =
                StaticTarget::new(module_path!(), $name, $level, $tags);
        };
    };
}

/// Declare a tracing target whose name is the target itself (e.g. a third-party crate).
#[macro_export]
macro_rules! custom_target {
    ($target:expr, $level:expr, $tags:expr) => {
        const _: () = {
            $crate::trace_target_deps!();

            #[distributed_slice(TRACING_TARGETS)]
            static TRACE_TGT: StaticTarget = StaticTarget::new($target, $target, $level, $tags);
        };
    };
}
