//! Small serde helpers shared by configuration types.

pub mod seconds;
