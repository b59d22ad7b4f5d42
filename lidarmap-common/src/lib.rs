#![deny(unused_must_use)]

pub mod color;
pub mod geometry;
pub mod las;
pub mod map;
pub mod pipeline;
pub mod registration;

pub use nalgebra;
