// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Numeric identifiers of the objects a flow depends on.

use std::fmt::Display;

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u32);

        impl $name {
            #[must_use]
            pub const fn new(id: u32) -> Self {
                Self(id)
            }
            #[must_use]
            pub const fn get(self) -> u32 {
                self.0
            }
        }

        impl From<u32> for $name {
            fn from(id: u32) -> Self {
                Self(id)
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}{}", $prefix, self.0)
            }
        }
    };
}

numeric_id!(
    /// A virtual routing and forwarding domain.
    VrfId,
    "vrf-"
);
numeric_id!(
    /// A virtual network.
    VnId,
    "vn-"
);
numeric_id!(
    /// A (virtual machine or fabric) interface.
    InterfaceId,
    "if-"
);
numeric_id!(
    /// A next hop. Flow keys are scoped by the next hop the packet came in on.
    NhId,
    "nh-"
);
numeric_id!(AclId, "acl-");
numeric_id!(SgId, "sg-");
