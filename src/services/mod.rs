pub mod cache;
pub mod copywriter;
pub mod dedup;
pub mod email_queue;
pub mod email_renderer;
pub mod email_transport;
pub mod import;
pub mod matching;
pub mod metrics;
pub mod phase_runner;
pub mod scheduler;
pub mod scoring;
pub mod sections;
pub mod supplement;
