//! Subsystem implementations for the governance plane.

pub mod agents;
pub mod calibration;
pub mod dialectic;
pub mod dynamics;
pub mod govern;
pub mod jobs;
pub mod policy;
