//! Serialisable events for observers (host UI, logs, tests).

pub mod events;
