/// In-crate test doubles for the venue seam.

pub mod mock;

pub use mock::{MockVenue, MockVenueBuilder, OrderScript, PlacementKind, PlacementRecord};
