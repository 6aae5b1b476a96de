// Application layer - Connection supervision and history buffering
pub mod connection_manager;
pub mod history_engine;
pub mod listeners;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub mod test_support;
