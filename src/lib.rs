// FanCast server library
// Live-video fan-out relay: one RTMP ingest, many RTMP/RTMPS destinations

pub mod ingest;
pub mod models;
pub mod services;
