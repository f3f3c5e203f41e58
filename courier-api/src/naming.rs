//! Discoverable accessor names.
//!
//! Every endpoint is reachable under its own name plus a set of derived,
//! capitalized accessor names:
//!
//! | Kind | Endpoint | Accessors |
//! |------|----------|-----------|
//! | query | `getThings` | `useGetThings` |
//! | mutation | `setThing` | `useSetThing` |
//! | event | `thingChanged` | `subscribeToThingChanged`, `useCurrentThingChanged`, `resetThingChanged` |

use courier_core::EndpointKind;

/// What an accessor name does with its endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessorRole {
    /// The endpoint object itself.
    Endpoint,
    /// Subscribable reader of a query, or reactive variant of a mutation.
    Use,
    /// Register an event handler.
    Subscribe,
    /// One-shot read of the latest event payload.
    Current,
    /// Clear the latest event payload.
    Reset,
}

/// One resolvable accessor name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessor {
    pub name: String,
    pub endpoint: String,
    pub kind: EndpointKind,
    pub role: AccessorRole,
}

/// Upper-case the first character of `name`.
pub fn capitalize(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// All accessor names an endpoint exposes, its own name first.
pub fn accessors(kind: EndpointKind, endpoint: &str) -> Vec<Accessor> {
    let capitalized = capitalize(endpoint);
    let derived: Vec<(String, AccessorRole)> = match kind {
        EndpointKind::Query | EndpointKind::Mutation => {
            vec![(format!("use{capitalized}"), AccessorRole::Use)]
        }
        EndpointKind::Event => vec![
            (format!("subscribeTo{capitalized}"), AccessorRole::Subscribe),
            (format!("useCurrent{capitalized}"), AccessorRole::Current),
            (format!("reset{capitalized}"), AccessorRole::Reset),
        ],
    };

    std::iter::once((endpoint.to_string(), AccessorRole::Endpoint))
        .chain(derived)
        .map(|(name, role)| Accessor {
            name,
            endpoint: endpoint.to_string(),
            kind,
            role,
        })
        .collect()
}
