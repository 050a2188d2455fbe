// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Identifiers of the policy rule a flow matched.

use std::fmt::Display;
use uuid::Uuid;

/// The rule (or the sentinel standing for no rule) that decided a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolicyMatch {
    Rule(Uuid),
    ImplicitAllow,
    ImplicitDeny,
    NotEvaluated,
    LinkLocal,
    Multicast,
    #[default]
    Unknown,
}

impl PolicyMatch {
    pub const UNKNOWN_UUID: Uuid = Uuid::from_u128(0x0);
    pub const IMPLICIT_ALLOW_UUID: Uuid = Uuid::from_u128(0x1);
    pub const IMPLICIT_DENY_UUID: Uuid = Uuid::from_u128(0x2);
    pub const LINK_LOCAL_UUID: Uuid = Uuid::from_u128(0x4);
    pub const MULTICAST_UUID: Uuid = Uuid::from_u128(0x5);
    pub const NOT_EVALUATED_UUID: Uuid = Uuid::from_u128(0x10);

    #[must_use]
    pub fn uuid(&self) -> Uuid {
        match self {
            PolicyMatch::Rule(uuid) => *uuid,
            PolicyMatch::ImplicitAllow => Self::IMPLICIT_ALLOW_UUID,
            PolicyMatch::ImplicitDeny => Self::IMPLICIT_DENY_UUID,
            PolicyMatch::NotEvaluated => Self::NOT_EVALUATED_UUID,
            PolicyMatch::LinkLocal => Self::LINK_LOCAL_UUID,
            PolicyMatch::Multicast => Self::MULTICAST_UUID,
            PolicyMatch::Unknown => Self::UNKNOWN_UUID,
        }
    }

    #[must_use]
    pub fn is_rule(&self) -> bool {
        matches!(self, PolicyMatch::Rule(_))
    }
}

impl Display for PolicyMatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.uuid())
    }
}
