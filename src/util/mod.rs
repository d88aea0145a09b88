mod slab;

pub use slab::{Index, Slab};
