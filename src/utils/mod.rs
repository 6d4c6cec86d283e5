// src/utils/mod.rs

pub mod compression;
pub mod logbook;     // dsjson lines for joined events
pub mod timestamp;
