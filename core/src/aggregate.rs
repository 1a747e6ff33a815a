//! Aggregate identification types.
//!
//! An aggregate is the consistency boundary of the event log: its events are
//! totally ordered by their aggregate sequence. It is identified by
//! `(type, id, instance, resource owner, version)`.
//!
//! All identifiers are newtypes around `String`:
//!
//! - `FromStr::from_str()` validates input (rejects empty strings)
//! - `From::from()` and `new()` do not validate (trusted, application-controlled input)

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when parsing an empty identifier.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid {kind}: {reason}")]
pub struct ParseIdError {
    kind: &'static str,
    reason: String,
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Create a new ", $kind, " from a string.")]
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            #[doc = concat!("Get the ", $kind, " as a string slice.")]
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[doc = concat!("Convert the ", $kind, " into its inner `String`.")]
            #[must_use]
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Whether the identifier is empty.
            #[must_use]
            pub fn is_empty(&self) -> bool {
                self.0.is_empty()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = ParseIdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.is_empty() {
                    return Err(ParseIdError {
                        kind: $kind,
                        reason: "cannot be empty".to_string(),
                    });
                }
                Ok(Self(s.to_string()))
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Type of an aggregate, e.g. `user` or `org`.
    AggregateType,
    "aggregate type"
);
string_id!(
    /// Identifier of one aggregate within its type and instance.
    AggregateId,
    "aggregate id"
);
string_id!(
    /// Tenant partition. Most entities, cursors and locks are scoped per instance.
    InstanceId,
    "instance id"
);
string_id!(
    /// Organisation owning the aggregate.
    ResourceOwner,
    "resource owner"
);
string_id!(
    /// Schema version of an aggregate's events, e.g. `v1`.
    Version,
    "version"
);
string_id!(
    /// Type of an event, e.g. `user.added`.
    EventType,
    "event type"
);

/// Identity of the aggregate an event belongs to.
///
/// # Examples
///
/// ```
/// use warden_core::aggregate::Aggregate;
///
/// let user = Aggregate::new("user", "u-1", "inst-1", "org-1", "v1");
/// assert_eq!(user.aggregate_type.as_str(), "user");
/// assert_eq!(user.to_string(), "inst-1/user/u-1");
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Aggregate {
    /// Aggregate type.
    pub aggregate_type: AggregateType,
    /// Aggregate id.
    pub id: AggregateId,
    /// Tenant instance.
    pub instance_id: InstanceId,
    /// Owning organisation.
    pub resource_owner: ResourceOwner,
    /// Event schema version.
    pub version: Version,
}

impl Aggregate {
    /// Create a new aggregate identity.
    #[must_use]
    pub fn new(
        aggregate_type: impl Into<AggregateType>,
        id: impl Into<AggregateId>,
        instance_id: impl Into<InstanceId>,
        resource_owner: impl Into<ResourceOwner>,
        version: impl Into<Version>,
    ) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
            id: id.into(),
            instance_id: instance_id.into(),
            resource_owner: resource_owner.into(),
            version: version.into(),
        }
    }

    /// Returns the first empty identity field, if any.
    #[must_use]
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.aggregate_type.is_empty() {
            Some("aggregate type")
        } else if self.id.is_empty() {
            Some("aggregate id")
        } else if self.instance_id.is_empty() {
            Some("instance id")
        } else if self.resource_owner.is_empty() {
            Some("resource owner")
        } else if self.version.is_empty() {
            Some("version")
        } else {
            None
        }
    }
}

impl fmt::Display for Aggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.instance_id, self.aggregate_type, self.id)
    }
}
