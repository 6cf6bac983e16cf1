pub mod whitelist;

pub use whitelist::{EntityFilter, TrackedEntity, parse_labeled_keys};
