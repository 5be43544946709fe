//! Scene state shared by both render back ends.
//!
//! This crate provides:
//! - The orbit camera
//! - The point light

pub mod camera;
pub mod light;

pub use camera::Camera;
pub use light::PointLight;
