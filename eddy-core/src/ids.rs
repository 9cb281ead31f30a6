use std::fmt;

use serde::{Deserialize, Serialize};

macro_rules! arena_id {
    ($name:ident, $prefix:literal) => {
        #[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub usize);

        impl $name {
            pub const fn index(self) -> usize {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

arena_id!(StepId, "s");
arena_id!(CollectionId, "pc");
arena_id!(ViewId, "view");
arena_id!(BundleId, "b");
