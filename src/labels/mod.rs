//! Node scheduling labels

pub mod constants;
pub mod deriver;

pub use deriver::{LabelDeriver, NodeLabel, NodeLabelSet, NodePool, StorageTier, ZoneTable};
