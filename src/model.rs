use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, the only time type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
///
/// Construction does not validate; the engine rejects empty and inverted
/// spans before they reach a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A committed reservation. Immutable once committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub resource: String,
    pub span: Span,
    /// Authenticated principal the reservation was made for.
    pub owner: String,
    pub created_at: Ms,
}

/// Committed reservations of one resource.
#[derive(Debug, Clone)]
pub struct ResourceLedger {
    pub resource: String,
    /// Sorted by `span.start`. Spans are pairwise disjoint, so `span.end`
    /// is sorted as well.
    reservations: Vec<Reservation>,
}

impl ResourceLedger {
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            reservations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reservations.is_empty()
    }

    pub fn reservations(&self) -> &[Reservation] {
        &self.reservations
    }

    /// Insert maintaining sort order by span.start. The caller must have
    /// checked that the span is free.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.span.start <= reservation.span.start);
        self.reservations.insert(pos, reservation);
    }

    /// Reservations whose span overlaps `query`, in start order.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        // Both bounds rely on ends being sorted, which disjointness gives us.
        let left = self.reservations.partition_point(|r| r.span.end <= query.start);
        let right = self.reservations.partition_point(|r| r.span.start < query.end);
        self.reservations[left..right.max(left)]
            .iter()
            .filter(move |r| r.span.overlaps(query))
    }

    pub fn first_overlap(&self, query: &Span) -> Option<&Reservation> {
        self.overlapping(query).next()
    }
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    Reserved(Reservation),
}
