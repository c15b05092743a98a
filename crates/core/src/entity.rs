//! Entity trait: identity + continuity across state changes.

/// Entity marker + minimal interface.
///
/// Products are identified by their sku; production events and reservations
/// by the idempotency key of the request that created them.
pub trait Entity {
    /// Strongly-typed entity identifier.
    type Id: Clone + Eq + core::hash::Hash + core::fmt::Debug;

    /// Returns the entity identifier.
    fn id(&self) -> &Self::Id;
}
