//! Identifier newtypes for registry entities.
//!
//! Every id wraps a [`Uuid`]. Events derived from source records during
//! replays get name-based ids so that re-running a job produces the same id
//! and the store can recognise it.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for name-based event ids. Must never change, or replayed jobs
/// would stop recognising the events they wrote before.
const EVENT_NAMESPACE: Uuid = Uuid::from_bytes([
    0x6f, 0x1c, 0x2b, 0x9e, 0x4d, 0x73, 0x5a, 0x10, 0x9b, 0x41, 0x0e, 0xc2, 0x7d, 0x58, 0x36, 0xa4,
]);

/// Returned when a string is not a valid id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseIdError {
    pub id_type: &'static str,
    pub message: String,
}

impl Display for ParseIdError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid {}: {}", self.id_type, self.message)
    }
}

impl std::error::Error for ParseIdError {}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Random (v4) id.
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            #[must_use]
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }

            #[must_use]
            pub fn into_uuid(self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self).map_err(|e| ParseIdError {
                    id_type: stringify!($name),
                    message: e.to_string(),
                })
            }
        }
    };
}

define_id!(
    /// Identifies a teacher record in the local registry.
    PersonId
);

define_id!(
    /// Identifies one immutable event.
    EventId
);

define_id!(
    /// Identifies a process grouping one or more events.
    ProcessId
);

define_id!(
    /// Identifies whoever raised an event: a user, or the system itself.
    ActorId
);

define_id!(
    /// Identifies a background job in the durable queue.
    JobId
);

impl EventId {
    /// Name-based id derived from the `(entity, event type, source record)`
    /// key. The same key always yields the same id.
    ///
    /// ```
    /// use rollcall_core::EventId;
    ///
    /// let a = EventId::deterministic("contact:42", "PersonUpdated", "audit:7");
    /// let b = EventId::deterministic("contact:42", "PersonUpdated", "audit:7");
    /// assert_eq!(a, b);
    /// ```
    #[must_use]
    pub fn deterministic(entity: &str, event_type: &str, source_record_id: &str) -> Self {
        // Components are length-prefixed so ("a:b", "c") and ("a", "b:c") differ.
        let name = format!(
            "{}:{}|{}:{}|{}:{}",
            entity.len(),
            entity,
            event_type.len(),
            event_type,
            source_record_id.len(),
            source_record_id
        );
        Self(Uuid::new_v5(&EVENT_NAMESPACE, name.as_bytes()))
    }
}

impl ActorId {
    /// The fixed actor used by background jobs.
    pub const SYSTEM: ActorId = ActorId::from_uuid(Uuid::from_bytes([
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x40, 0x00, 0x80, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x01,
    ]));

    #[must_use]
    pub fn system() -> Self {
        Self::SYSTEM
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        *self == Self::SYSTEM
    }
}
