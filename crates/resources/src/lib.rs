//! Asset loading.
//!
//! This crate turns files on disk into CPU-side data ready for upload:
//! - glTF meshes into [`Vertex`](renderer_rhi::vertex::Vertex) and `u32` index lists
//! - Images into tightly packed RGBA8 pixels
//! - Procedural stand-ins (a cube, a checkerboard) when an asset is missing

mod error;

pub mod mesh;
pub mod texture;

pub use error::{ResourceError, ResourceResult};
pub use mesh::MeshData;
pub use texture::TextureData;
