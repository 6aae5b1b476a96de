// Domain layer - Channels, samples, series and connection state
pub mod channel;
pub mod event;
pub mod status;
pub mod telemetry;
