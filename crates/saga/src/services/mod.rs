//! Collaborators of the saga outside the order store.

pub mod popularity;

pub use popularity::{InMemoryPopularityCounter, PopularityCounter};
