pub mod face;
pub mod media;
