/// Fixed 16-byte internal key used by every `OrderedStore` implementation.
///
/// The bit layout is owned by `giga-meta` (spec §4.3); this crate only
/// needs to know keys are fixed-width and totally ordered by their raw
/// byte representation so prefix scans enumerate a single partition in
/// ascending hash order (P5).
pub type Key = [u8; 16];
