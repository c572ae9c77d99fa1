pub mod geometry;
pub mod mesh;
pub mod quadric;
mod simplify;

pub use mesh::Trimesh;
pub use simplify::{LosslessOptions, SimplifyOptions};
