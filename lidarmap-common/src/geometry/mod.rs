pub mod points;
pub mod pose;
